use anyhow::Result;
use clap::{Parser, Subcommand};

use scdl_desktop::app::{self, App, StopReport};
use scdl_desktop::config::{AppPaths, ShellConfig, BUILD_VERSION};
use scdl_desktop::{logging, platform};
use scdl_desktop_updater_lib::{scheduler, UpdatePipeline};

#[derive(Debug, Parser)]
#[command(name = "scdl-desktop", version = BUILD_VERSION, about = "scdl-web desktop shell")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 데스크톱 셸 실행 (기본)
    Run,
    /// 창 없이 서버로 실행
    Serve,
    /// 실행 중인 서버 정지
    Stop,
    /// 업데이트 확인 결과를 JSON 으로 출력 (종료 코드 0 = 업데이트, 2 = 없음)
    CheckUpdate,
    /// 버전 출력
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    if matches!(command, Command::Version) {
        println!("scdl-desktop {}", BUILD_VERSION);
        return Ok(());
    }

    let paths = AppPaths::resolve()?;
    let log_dir = matches!(command, Command::Run | Command::Serve).then(|| paths.log_dir());
    logging::init(log_dir.as_deref())?;
    let config = ShellConfig::load(&paths);

    let code = match command {
        Command::Run => App::new(paths, config, platform::native()).run().await?.exit_code(),
        Command::Serve => App::new(paths, config, platform::native()).serve().await?.exit_code(),
        Command::Stop => match app::stop_server(&paths).await? {
            StopReport::NotRunning => {
                println!("scdl-web server is not running");
                0
            }
            StopReport::Stopped(outcome) => {
                println!("scdl-web server stopped ({:?})", outcome);
                0
            }
        },
        Command::CheckUpdate => {
            let pipeline = UpdatePipeline::new(config.update_config())?;
            let result = scheduler::check_once(&pipeline).await;
            println!("{}", scheduler::result_to_json(&result));
            scheduler::exit_code(&result)
        }
        Command::Version => 0,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
