//! OS 별 차이를 한곳에 모은 인터페이스
//!
//! 워커 런타임 디렉터리 이름, PATH 키 비교 방식, 콘솔 창 숨김, 정상 종료 요청,
//! 업데이트 설치 전략이 OS 마다 다르다.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::{Child, Command};

use scdl_desktop_updater_lib::InstallStrategy;

pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    /// venv 안에서 실행 파일이 놓이는 디렉터리
    fn runtime_bin_dir(&self, venv: &Path) -> PathBuf;

    /// 실행 파일 확장자 (Windows `.exe`, 그 외 빈 문자열)
    fn executable_suffix(&self) -> &'static str;

    /// `dir/base` 에 실행 파일 확장자를 붙인다
    fn executable(&self, dir: &Path, base: &str) -> PathBuf {
        dir.join(format!("{}{}", base, self.executable_suffix()))
    }

    /// 환경 변수 키가 PATH 인지 (Windows 는 대소문자 무시)
    fn is_path_var(&self, key: &OsStr) -> bool;

    /// 자식 프로세스의 콘솔 창을 띄우지 않게 한다
    fn hide_console(&self, cmd: &mut Command);

    /// 자식에게 정상 종료를 요청한다 (Unix: SIGTERM, Windows: 즉시 종료)
    fn stop_child(&self, child: &mut Child) -> io::Result<()>;

    fn install_strategy(&self) -> InstallStrategy;
}

pub struct NativePlatform;

static NATIVE: NativePlatform = NativePlatform;

pub fn native() -> &'static dyn Platform {
    &NATIVE
}

impl Platform for NativePlatform {
    fn name(&self) -> &'static str {
        std::env::consts::OS
    }

    fn runtime_bin_dir(&self, venv: &Path) -> PathBuf {
        if cfg!(windows) {
            venv.join("Scripts")
        } else {
            venv.join("bin")
        }
    }

    fn executable_suffix(&self) -> &'static str {
        std::env::consts::EXE_SUFFIX
    }

    fn is_path_var(&self, key: &OsStr) -> bool {
        if cfg!(windows) {
            key.to_string_lossy().eq_ignore_ascii_case("PATH")
        } else {
            key == "PATH"
        }
    }

    #[cfg(windows)]
    fn hide_console(&self, cmd: &mut Command) {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    #[cfg(not(windows))]
    fn hide_console(&self, _cmd: &mut Command) {}

    #[cfg(unix)]
    fn stop_child(&self, child: &mut Child) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match child.id() {
            Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn stop_child(&self, child: &mut Child) -> io::Result<()> {
        child.start_kill()
    }

    fn install_strategy(&self) -> InstallStrategy {
        InstallStrategy::for_current_platform()
    }
}
