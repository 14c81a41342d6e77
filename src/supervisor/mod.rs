//! 워커(uvicorn) 프로세스 감독
//!
//! ## 수명
//! `start` → `wait_ready` → `supervise` (별도 태스크) → `stop`
//!
//! 자식 프로세스는 대기 태스크 하나가 소유한다. 정지 요청은 채널로 그 태스크에 보내고,
//! 종료 상태는 `watch` 채널로 돌아온다. `stop` 이 먼저 불리지 않은 종료는 크래시다.

pub mod error;
pub mod output;
pub mod process;
pub mod state_machine;

use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use crate::config::{AppPaths, ShellConfig};
use crate::platform::Platform;

pub use error::SupervisorError;
pub use output::{OutputBuffer, SharedOutput};
pub use state_machine::{StateMachine, WorkerState};

pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// 서버 모드에서 강제 종료로 넘어가기 전 유예 시간
pub const SERVER_STOP_GRACE: Duration = Duration::from_secs(15);

/// 워커 실행 정보
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// PATH 맨 앞에 붙는 격리 런타임의 실행 파일 디렉터리
    pub runtime_bin_dir: PathBuf,
}

impl WorkerSpec {
    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<String>>,
        working_dir: impl Into<PathBuf>,
        runtime_bin_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: working_dir.into(),
            runtime_bin_dir: runtime_bin_dir.into(),
        }
    }

    /// `uvicorn app.main:app --host <host> --port <port>` (작업 디렉터리: backend)
    pub fn uvicorn(paths: &AppPaths, config: &ShellConfig, platform: &dyn Platform) -> Self {
        let bin = platform.runtime_bin_dir(&paths.venv_dir());
        Self::new(
            platform.executable(&bin, "uvicorn"),
            [
                "app.main:app".to_string(),
                "--host".to_string(),
                config.worker_host.clone(),
                "--port".to_string(),
                config.worker_port.to_string(),
            ],
            paths.backend_dir(),
            bin,
        )
    }
}

/// 관찰된 프로세스 종료
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub description: String,
}

impl ExitInfo {
    fn from_wait(result: std::io::Result<std::process::ExitStatus>) -> Self {
        match result {
            Ok(status) => Self { code: status.code(), description: status.to_string() },
            Err(e) => Self { code: None, description: format!("wait failed: {}", e) },
        }
    }
}

/// `supervise` 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// `stop` 으로 요청된 종료
    Requested(ExitInfo),
    /// 요청 없는 종료. 워커에 기대는 기능은 모두 내려야 한다.
    Unexpected(ExitInfo),
    /// 감독할 프로세스가 없음
    NotRunning,
}

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Graceful,
    Force,
}

struct WorkerHandle {
    pid: Option<u32>,
    stop_tx: mpsc::UnboundedSender<StopSignal>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl WorkerHandle {
    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

pub struct ProcessSupervisor {
    spec: WorkerSpec,
    health_url: String,
    platform: &'static dyn Platform,
    /// None 이면 정상 종료를 끝까지 기다린다 (데스크톱)
    stop_grace: Option<Duration>,
    state: Mutex<StateMachine>,
    handle: Mutex<Option<WorkerHandle>>,
    stop_requested: AtomicBool,
    output: SharedOutput,
}

impl ProcessSupervisor {
    pub fn new(spec: WorkerSpec, health_url: impl Into<String>, platform: &'static dyn Platform) -> Self {
        Self {
            spec,
            health_url: health_url.into(),
            platform,
            stop_grace: None,
            state: Mutex::new(StateMachine::new()),
            handle: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            output: Arc::new(Mutex::new(OutputBuffer::default())),
        }
    }

    /// 정지 시 유예 시간 후 강제 종료 (서버 모드)
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = Some(grace);
        self
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn state(&self) -> WorkerState {
        self.state.lock().map(|sm| sm.state()).unwrap_or(WorkerState::Crashed)
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.lock().ok()?.as_ref().and_then(|h| h.pid)
    }

    pub fn output(&self) -> &SharedOutput {
        &self.output
    }

    fn transition(&self, to: WorkerState) -> Result<(), SupervisorError> {
        let mut sm = self
            .state
            .lock()
            .map_err(|_| SupervisorError::Crashed("state lock poisoned".into()))?;
        sm.transition(to).map_err(SupervisorError::from)
    }

    fn exit_receiver(&self) -> Option<watch::Receiver<Option<ExitInfo>>> {
        self.handle.lock().ok()?.as_ref().map(|h| h.exit_rx.clone())
    }

    /// 워커를 띄운다. `env_overrides` 는 PATH 재작성 뒤에 덧붙는다.
    pub fn start(&self, env_overrides: &[(String, String)]) -> Result<(), SupervisorError> {
        if !self.spec.program.is_file() {
            return Err(SupervisorError::ExecutableNotFound(self.spec.program.clone()));
        }

        let mut slot = self
            .handle
            .lock()
            .map_err(|_| SupervisorError::Crashed("handle lock poisoned".into()))?;
        if slot.as_ref().is_some_and(|h| !h.has_exited()) {
            return Err(SupervisorError::AlreadyRunning);
        }

        self.transition(WorkerState::Starting)?;

        let env = build_child_env(
            std::env::vars_os(),
            &self.spec.runtime_bin_dir,
            env_overrides,
            self.platform,
        );

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args)
            .current_dir(&self.spec.working_dir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.platform.hide_console(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let _ = self.transition(WorkerState::Stopped);
                return Err(SupervisorError::Spawn { program: self.spec.program.clone(), source });
            }
        };

        if let Ok(mut buf) = self.output.lock() {
            buf.clear();
        }
        if let Some(stdout) = child.stdout.take() {
            output::spawn_reader(stdout, output::OutputSource::Stdout, self.output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            output::spawn_reader(stderr, output::OutputSource::Stderr, self.output.clone());
        }

        let pid = child.id();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(wait_child(child, stop_rx, exit_tx, self.platform));

        self.stop_requested.store(false, Ordering::SeqCst);
        *slot = Some(WorkerHandle { pid, stop_tx, exit_rx });

        tracing::info!(
            "[Supervisor] Worker started: {} (pid {:?})",
            self.spec.program.display(),
            pid
        );
        Ok(())
    }

    /// 헬스 엔드포인트가 200 을 줄 때까지 폴링. 성공하면 `Ready`.
    /// false 를 받은 호출 측이 `stop` 을 불러야 한다.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let Some(exit_rx) = self.exit_receiver() else {
            return false;
        };

        let ready = poll_health(&self.health_url, timeout, HEALTH_POLL_INTERVAL, Some(exit_rx)).await;
        if ready {
            if let Err(e) = self.transition(WorkerState::Ready) {
                tracing::warn!("[Supervisor] {}", e);
                return false;
            }
        } else {
            tracing::warn!(
                "[Supervisor] Worker not ready after {}s",
                timeout.as_secs_f32()
            );
        }
        ready
    }

    /// 프로세스가 끝날 때까지 기다린다. `stop` 없이 끝났으면 `Crashed`.
    pub async fn supervise(&self) -> WorkerExit {
        let Some(mut exit_rx) = self.exit_receiver() else {
            return WorkerExit::NotRunning;
        };

        if self.state() == WorkerState::Ready {
            let _ = self.transition(WorkerState::Running);
        }

        let info = wait_exit(&mut exit_rx).await;
        if self.stop_requested.load(Ordering::SeqCst) {
            return WorkerExit::Requested(info);
        }

        tracing::error!("[Supervisor] Worker exited unexpectedly: {}", info.description);
        if self.state() == WorkerState::Running {
            let _ = self.transition(WorkerState::Crashed);
        }
        WorkerExit::Unexpected(info)
    }

    /// 정지. 시작한 적이 없거나 이미 멈췄으면 아무것도 하지 않는다.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let handle = match self.handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        self.stop_requested.store(true, Ordering::SeqCst);
        let mut exit_rx = handle.exit_rx.clone();

        if !handle.has_exited() {
            tracing::info!("[Supervisor] Stopping worker (pid {:?})", handle.pid);
            let _ = handle.stop_tx.send(StopSignal::Graceful);

            match self.stop_grace {
                None => {
                    wait_exit(&mut exit_rx).await;
                }
                Some(grace) => {
                    if tokio::time::timeout(grace, wait_exit(&mut exit_rx)).await.is_err() {
                        tracing::warn!(
                            "[Supervisor] Worker still alive after {}s, forcing termination",
                            grace.as_secs()
                        );
                        let _ = handle.stop_tx.send(StopSignal::Force);
                        wait_exit(&mut exit_rx).await;
                    }
                }
            }
        }

        match self.state() {
            WorkerState::Starting | WorkerState::Ready | WorkerState::Running => {
                self.transition(WorkerState::Stopped)?;
            }
            _ => {}
        }
        Ok(())
    }
}

async fn wait_child(
    mut child: Child,
    mut stop_rx: mpsc::UnboundedReceiver<StopSignal>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    platform: &'static dyn Platform,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = stop_rx.recv() => {
                let sent = match signal {
                    StopSignal::Graceful => platform.stop_child(&mut child),
                    StopSignal::Force => child.start_kill(),
                };
                if let Err(e) = sent {
                    tracing::warn!("[Supervisor] Failed to signal worker ({:?}): {}", signal, e);
                }
            }
        }
    };

    let info = ExitInfo::from_wait(status);
    tracing::info!("[Supervisor] Worker exited: {}", info.description);
    let _ = exit_tx.send(Some(info));
}

async fn wait_exit(rx: &mut watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    let res = rx.wait_for(|v| v.is_some()).await.map(|v| v.clone());
    match res {
        Ok(v) => v.unwrap_or_else(unknown_exit),
        Err(_) => rx.borrow().clone().unwrap_or_else(unknown_exit),
    }
}

fn unknown_exit() -> ExitInfo {
    ExitInfo { code: None, description: "exit status unknown".into() }
}

/// `url` 이 200 을 줄 때까지 `interval` 간격으로 폴링. 요청 하나는 2초 제한.
pub async fn wait_for_health(url: &str, timeout: Duration, interval: Duration) -> bool {
    poll_health(url, timeout, interval, None).await
}

async fn poll_health(
    url: &str,
    timeout: Duration,
    interval: Duration,
    exited: Option<watch::Receiver<Option<ExitInfo>>>,
) -> bool {
    let client = match reqwest::Client::builder().timeout(HEALTH_REQUEST_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("[Supervisor] Cannot build health client: {}", e);
            return false;
        }
    };

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Some(rx) = &exited {
            if let Some(info) = rx.borrow().as_ref() {
                tracing::warn!("[Supervisor] Worker exited before becoming ready: {}", info.description);
                return false;
            }
        }
        if let Ok(resp) = client.get(url).send().await {
            if resp.status() == reqwest::StatusCode::OK {
                return true;
            }
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// 자식 환경 변수: 상속 환경에서 PATH 계열 키를 모두 빼고,
/// `runtime_bin` 을 맨 앞에 둔 PATH 를 넣은 뒤 `overrides` 를 덧붙인다.
pub fn build_child_env<I>(
    inherited: I,
    runtime_bin: &Path,
    overrides: &[(String, String)],
    platform: &dyn Platform,
) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut old_path: Option<OsString> = None;
    let mut env: Vec<(OsString, OsString)> = Vec::new();
    for (key, value) in inherited {
        if platform.is_path_var(&key) {
            if old_path.is_none() {
                old_path = Some(value);
            }
            continue;
        }
        env.push((key, value));
    }

    let separator = if cfg!(windows) { ";" } else { ":" };
    let mut path = runtime_bin.as_os_str().to_os_string();
    if let Some(old) = old_path.filter(|p| !p.is_empty()) {
        path.push(separator);
        path.push(old);
    }
    env.push((OsString::from("PATH"), path));

    env.extend(
        overrides
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v))),
    );
    env
}
