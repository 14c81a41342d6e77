//! 데스크톱 셸 조립과 수명 관리
//!
//! ## 데스크톱 (`run`)
//! 인스턴스 중재 → 셸 서버 바인드 → 준비(setup) → 워커 시작 → 준비 대기(30초)
//! → 크래시 감시 + 주기 업데이트 체크 → 종료 요청까지 대기.
//!
//! 셸 서버는 준비 단계보다 먼저 뜬다. 시작 실패 설명은 `dialog:alert` 알림과
//! `/shell/status` 로 UI 에 전달된다.
//!
//! ## 종료
//! 재실행 요청, 업데이트 설치 완료, Ctrl+C → 중계 세션 취소 → 워커 정지 → 서버 종료.
//! 워커 크래시는 `worker:crashed` 알림과 경고 후 서버를 내린다.
//!
//! ## 서버 (`serve`)
//! PID 파일, 설치 없는 준비 검사, 15초 유예 후 강제 종료. 창 없이 로그만 남긴다.

use anyhow::Context;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use scdl_desktop_updater_lib::{scheduler, AssetSelector, SchedulerConfig, UpdateInfo, UpdatePipeline};

use crate::config::{env_file, AppPaths, ShellConfig, BUILD_VERSION, LINUX_ASSET_NAME};
use crate::ipc::{self, ProxyTarget, ShellState, UpdateState};
use crate::notify::{EventBus, Notifier, TOPIC_UPDATE_AVAILABLE, TOPIC_WORKER_CRASHED};
use crate::platform::Platform;
use crate::prompt::{AlertLevel, Prompter, UiPrompter};
use crate::relay::RelayBridge;
use crate::setup::{self, SetupError, SetupOptions};
use crate::single_instance::{self, ArbiterConfig, Arbitration, Holder};
use crate::supervisor::{
    output, process, ProcessSupervisor, SupervisorError, WorkerExit, WorkerSpec, SERVER_STOP_GRACE,
};

/// 사용자 확인 창 응답 대기 시간
const PROMPT_TIMEOUT: Duration = Duration::from_secs(55);
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const CRASH_OUTPUT_LINES: usize = 20;

// ── 시작 오류 ──────────────────────────────────────────

/// 시작을 막는 오류. 각각 창 제목과 설명으로 바뀐다.
#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Start(SupervisorError),

    #[error("backend did not become ready within {}s", .0.as_secs())]
    ReadinessTimeout(Duration),
}

impl StartupError {
    pub fn title(&self) -> &'static str {
        match self {
            StartupError::Setup(SetupError::PythonNotFound) => "Python Not Found",
            StartupError::Setup(SetupError::PipInstall(_) | SetupError::DependenciesMissing) => "Dependency Error",
            StartupError::Setup(_) => "Setup Failed",
            StartupError::Start(_) => "Backend Error",
            StartupError::ReadinessTimeout(_) => "Backend Timeout",
        }
    }

    pub fn message(&self) -> String {
        match self {
            StartupError::Setup(SetupError::PythonNotFound) => format!(
                "Python {}.{}+ is required but was not found.\n\nPlease install Python {}.{} or later and restart the application.",
                setup::MIN_PYTHON.0,
                setup::MIN_PYTHON.1,
                setup::MIN_PYTHON.0,
                setup::MIN_PYTHON.1
            ),
            StartupError::Setup(SetupError::DependenciesMissing) => {
                "Python dependencies could not be installed.\nPlease check your internet connection and try again.".to_string()
            }
            StartupError::Setup(e @ SetupError::PipInstall(_)) => {
                format!("Failed to install Python dependencies:\n\n{}", e)
            }
            StartupError::Setup(e) => format!("Failed to set up scdl-web:\n\n{}", e),
            StartupError::Start(e) => format!("Failed to start the backend:\n\n{}", e),
            StartupError::ReadinessTimeout(t) => {
                format!("The backend failed to start within {} seconds.", t.as_secs())
            }
        }
    }
}

// ── 알림 페이로드 ──────────────────────────────────────

#[derive(Serialize)]
struct CrashPayload<'a> {
    code: Option<i32>,
    description: &'a str,
    output: String,
}

/// 앱 종료 사유
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// 다른 인스턴스가 계속 실행
    AnotherInstance,
    /// 정상 종료 (사용자, 재실행 요청, 업데이트)
    Quit,
    StartupFailed,
    WorkerCrashed,
}

impl ExitReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::AnotherInstance | ExitReason::Quit => 0,
            ExitReason::StartupFailed | ExitReason::WorkerCrashed => 1,
        }
    }
}

// ── 앱 ────────────────────────────────────────────────

pub struct App {
    paths: AppPaths,
    config: ShellConfig,
    platform: &'static dyn Platform,
    bus: EventBus,
    prompter: Arc<UiPrompter>,
    worker: Arc<ProcessSupervisor>,
    relay: Arc<RelayBridge>,
    pipeline: Option<Arc<UpdatePipeline>>,
    startup_error: Arc<RwLock<Option<String>>>,
    /// 앱 종료 요청
    quit: CancellationToken,
    /// 셸 서버 종료
    server_shutdown: CancellationToken,
}

impl App {
    pub fn new(paths: AppPaths, config: ShellConfig, platform: &'static dyn Platform) -> Self {
        let bus = EventBus::default();
        let notifier: Arc<dyn Notifier> = Arc::new(bus.clone());
        let worker = ProcessSupervisor::new(
            WorkerSpec::uvicorn(&paths, &config, platform),
            config.health_url(),
            platform,
        );
        let pipeline = match UpdatePipeline::new(config.update_config()) {
            Ok(p) => {
                let selector = AssetSelector::for_current_platform(LINUX_ASSET_NAME);
                Some(Arc::new(p.with_strategy(platform.install_strategy(), selector)))
            }
            Err(e) => {
                tracing::warn!("[Updater] Update pipeline unavailable: {}", e);
                None
            }
        };

        Self {
            relay: Arc::new(RelayBridge::new(config.worker_ws_base(), notifier)),
            prompter: Arc::new(UiPrompter::new(bus.clone(), PROMPT_TIMEOUT)),
            worker: Arc::new(worker),
            pipeline,
            startup_error: Arc::new(RwLock::new(None)),
            quit: CancellationToken::new(),
            server_shutdown: CancellationToken::new(),
            bus,
            paths,
            config,
            platform,
        }
    }

    /// 서버 모드: 정지 시 유예 후 강제 종료
    fn into_server_mode(mut self) -> Self {
        let worker = ProcessSupervisor::new(
            WorkerSpec::uvicorn(&self.paths, &self.config, self.platform),
            self.config.health_url(),
            self.platform,
        )
        .with_stop_grace(SERVER_STOP_GRACE);
        self.worker = Arc::new(worker);
        self
    }

    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    fn shell_state(&self) -> anyhow::Result<ShellState> {
        let worker_addr: SocketAddr = self
            .config
            .worker_addr()
            .parse()
            .with_context(|| format!("invalid worker address {}", self.config.worker_addr()))?;
        Ok(ShellState {
            version: BUILD_VERSION,
            bus: self.bus.clone(),
            relay: self.relay.clone(),
            prompter: self.prompter.clone(),
            worker: self.worker.clone(),
            worker_addr,
            proxy: ProxyTarget::new(self.config.worker_base_url())?,
            updates: self.pipeline.clone().map(|pipeline| UpdateState {
                pipeline,
                bus: self.bus.clone(),
                quit: self.quit.clone(),
            }),
            startup_error: self.startup_error.clone(),
            shutdown: self.server_shutdown.clone(),
        })
    }

    async fn spawn_server(&self) -> anyhow::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("cannot bind shell server on {}", self.config.listen_addr))?;
        let state = self.shell_state()?;
        Ok(tokio::spawn(async move {
            if let Err(e) = ipc::serve(listener, state).await {
                tracing::error!("[Shell] Server error: {}", e);
            }
        }))
    }

    /// 준비 → 시작 → 준비 대기. 실패하면 워커는 남지 않는다.
    async fn bring_up(&self, opts: SetupOptions) -> Result<(), StartupError> {
        let report = setup::run(&self.paths, self.platform, opts).await?;
        if !report.ffmpeg_available {
            self.prompter.alert(
                AlertLevel::Warning,
                "FFmpeg Not Found",
                "FFmpeg is not installed. Audio conversion features may not work.\n\nPlease install FFmpeg for full functionality.",
            );
        }

        let env = env_file::read(&self.paths.env_file());
        tracing::info!("[Supervisor] Starting backend");
        self.worker.start(&env).map_err(StartupError::Start)?;

        let timeout = self.config.startup_timeout();
        if !self.worker.wait_ready(timeout).await {
            let tail = output::tail_text(self.worker.output(), CRASH_OUTPUT_LINES);
            if !tail.is_empty() {
                tracing::error!("[Supervisor] Recent worker output:\n{}", tail);
            }
            if let Err(e) = self.worker.stop().await {
                tracing::warn!("[Supervisor] {}", e);
            }
            return Err(StartupError::ReadinessTimeout(timeout));
        }
        tracing::info!("[Supervisor] Backend is ready");
        Ok(())
    }

    async fn report_startup_error(&self, err: &StartupError) {
        tracing::error!("[App] Startup failed: {}", err);
        *self.startup_error.write().await = Some(format!("{}: {}", err.title(), err.message()));
        self.prompter.alert(AlertLevel::Error, err.title(), &err.message());
    }

    /// 워커 종료를 감시한다. 요청 없는 종료면 알리고 서버를 내린다.
    fn spawn_crash_watcher(&self) -> JoinHandle<bool> {
        let worker = self.worker.clone();
        let bus = self.bus.clone();
        let prompter = self.prompter.clone();
        let server_shutdown = self.server_shutdown.clone();
        tokio::spawn(async move {
            match worker.supervise().await {
                WorkerExit::Unexpected(info) => {
                    let output = output::tail_text(worker.output(), CRASH_OUTPUT_LINES);
                    bus.publish_json(
                        TOPIC_WORKER_CRASHED,
                        &CrashPayload { code: info.code, description: &info.description, output },
                    );
                    prompter.alert(
                        AlertLevel::Error,
                        "Backend Stopped",
                        &format!("The backend process exited unexpectedly ({}).", info.description),
                    );
                    server_shutdown.cancel();
                    true
                }
                WorkerExit::Requested(_) | WorkerExit::NotRunning => false,
            }
        })
    }

    fn spawn_update_checks(&self) {
        let Some(pipeline) = self.pipeline.clone() else {
            return;
        };
        let config = SchedulerConfig {
            interval_hours: self.config.update_check_interval_hours,
            ..SchedulerConfig::default()
        };
        let bus = self.bus.clone();
        scheduler::spawn_periodic(pipeline, config, self.quit.clone(), move |info: UpdateInfo| {
            bus.publish_json(TOPIC_UPDATE_AVAILABLE, &info);
        });
    }

    /// 데스크톱 셸 실행
    pub async fn run(self) -> anyhow::Result<ExitReason> {
        tracing::info!("[App] scdl-web desktop {} starting", BUILD_VERSION);

        let addr: SocketAddr = self
            .config
            .instance_addr
            .parse()
            .with_context(|| format!("invalid instance address {}", self.config.instance_addr))?;
        let arbiter = ArbiterConfig::with_addr(addr);
        // 워커가 내려간 뒤에 포트를 놓아야 다음 인스턴스가 워커 포트와 충돌하지 않는다
        let lock_release = CancellationToken::new();
        let lock_task = match single_instance::arbitrate(&arbiter).await {
            Arbitration::Exit => return Ok(ExitReason::AnotherInstance),
            Arbitration::Unguarded => None,
            Arbitration::Primary(lock) => {
                let quit = self.quit.clone();
                let prompter: Arc<dyn Prompter> = self.prompter.clone();
                let holder = Holder::new(&arbiter, prompter, move || quit.cancel())
                    .with_quit_signal(self.quit.clone());
                let holder = Arc::new(holder);
                Some(lock.serve(holder, lock_release.clone()))
            }
        };

        let server = self.spawn_server().await?;

        let (reason, server) = match self.bring_up(SetupOptions { install_missing: true }).await {
            Ok(()) => {
                let crash_watcher = self.spawn_crash_watcher();
                self.spawn_update_checks();
                self.wait_for_quit(server, crash_watcher).await
            }
            Err(e) => {
                self.report_startup_error(&e).await;
                // 설명을 본 사용자가 창을 닫을 때까지 서버는 남는다
                wait_for_signal(&self.quit).await;
                (ExitReason::StartupFailed, Some(server))
            }
        };

        self.shutdown(server).await;
        lock_release.cancel();
        if let Some(task) = lock_task {
            let _ = task.await;
        }
        Ok(reason)
    }

    /// 종료 신호나 서버 종료를 기다린다. 서버가 아직 돌고 있으면 핸들을 돌려준다.
    async fn wait_for_quit(
        &self,
        mut server: JoinHandle<()>,
        crash_watcher: JoinHandle<bool>,
    ) -> (ExitReason, Option<JoinHandle<()>>) {
        let server_ended = tokio::select! {
            _ = wait_for_signal(&self.quit) => false,
            _ = &mut server => true,
        };
        if !server_ended {
            return (ExitReason::Quit, Some(server));
        }
        let crashed = crash_watcher.await.unwrap_or(false);
        let reason = if crashed { ExitReason::WorkerCrashed } else { ExitReason::Quit };
        (reason, None)
    }

    async fn shutdown(&self, server: Option<JoinHandle<()>>) {
        tracing::info!("[App] Shutting down");
        self.relay.stop_all();
        if let Err(e) = self.worker.stop().await {
            tracing::warn!("[Supervisor] {}", e);
        }
        self.server_shutdown.cancel();
        let Some(server) = server else {
            return;
        };
        let abort = server.abort_handle();
        if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, server).await.is_err() {
            tracing::warn!(
                "[Shell] Server did not drain within {}s, aborting",
                SERVER_DRAIN_TIMEOUT.as_secs()
            );
            abort.abort();
        }
    }

    /// 서버 호스팅 모드
    pub async fn serve(self) -> anyhow::Result<ExitReason> {
        let app = self.into_server_mode();
        let pid_file = app.paths.pid_file();
        process::write_pid_file(&pid_file, std::process::id())?;
        tracing::info!("[App] scdl-web server {} starting (pid {})", BUILD_VERSION, std::process::id());

        let (reason, server) = match app.bring_up(SetupOptions { install_missing: false }).await {
            Ok(()) => match app.spawn_server().await {
                Ok(server) => {
                    let crash_watcher = app.spawn_crash_watcher();
                    app.spawn_update_checks();
                    app.wait_for_quit(server, crash_watcher).await
                }
                Err(e) => {
                    tracing::error!("[App] {}", e);
                    (ExitReason::StartupFailed, None)
                }
            },
            Err(e) => {
                tracing::error!("[App] {}: {}", e.title(), e.message());
                (ExitReason::StartupFailed, None)
            }
        };

        app.quit.cancel();
        let drain = app.shutdown(server);
        if tokio::time::timeout(SERVER_STOP_GRACE + SERVER_DRAIN_TIMEOUT * 2, drain).await.is_err() {
            tracing::warn!("[App] Shutdown did not finish in time");
        }
        process::remove_pid_file(&pid_file);
        Ok(reason)
    }
}

/// 종료 토큰, Ctrl+C, (Unix) SIGTERM 중 먼저 오는 것
async fn wait_for_signal(quit: &CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("[App] Cannot install SIGTERM handler: {}", e);
                tokio::select! {
                    _ = quit.cancelled() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
                return;
            }
        };
        tokio::select! {
            _ = quit.cancelled() => {}
            _ = tokio::signal::ctrl_c() => tracing::info!("[App] Interrupt received"),
            _ = term.recv() => tracing::info!("[App] Terminate signal received"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = quit.cancelled() => {}
            _ = tokio::signal::ctrl_c() => tracing::info!("[App] Interrupt received"),
        }
    }
}

// ── 서버 정지 (`stop` 명령) ────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReport {
    NotRunning,
    Stopped(process::StopOutcome),
}

/// PID 파일의 서버를 멈춘다. 파일이 없거나 오래됐으면 NotRunning.
pub async fn stop_server(paths: &AppPaths) -> anyhow::Result<StopReport> {
    let pid_file = paths.pid_file();
    let Some(pid) = process::read_pid_file(&pid_file)? else {
        return Ok(StopReport::NotRunning);
    };
    if !process::is_running(pid) {
        process::remove_pid_file(&pid_file);
        return Ok(StopReport::NotRunning);
    }

    tracing::info!("[App] Stopping server (pid {})", pid);
    let outcome = process::stop_pid_with_grace(pid, SERVER_STOP_GRACE, crate::supervisor::HEALTH_POLL_INTERVAL).await?;
    process::remove_pid_file(&pid_file);
    Ok(StopReport::Stopped(outcome))
}
