//! PID 기반 프로세스 헬퍼 (서버 모드의 `stop` 명령이 사용)
//!
//! `serve` 로 떠 있는 셸은 이 프로세스의 자식이 아니므로 PID 파일과 시그널로만 다룬다.

use std::path::Path;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, System};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
    #[error("invalid pid file {path}: {reason}")]
    InvalidPidFile { path: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 정지 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// 살아 있는 프로세스가 없었다
    NotRunning,
    /// 유예 시간 안에 스스로 종료
    Exited,
    /// 유예 시간이 지나 강제 종료
    Killed,
}

/// 프로세스 테이블에 살아 있는지 (좀비는 죽은 것으로 본다)
pub fn is_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    match sys.process(Pid::from_u32(pid)) {
        Some(p) => !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// `is_running`의 비동기 래퍼
pub async fn is_running_async(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || is_running(pid))
        .await
        .unwrap_or(false)
}

/// 정상 종료 요청 (Unix: SIGINT, Windows: 강제 종료)
pub fn interrupt_pid(pid: u32) -> Result<(), ProcessError> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as NixPid;
        kill(NixPid::from_raw(pid as i32), Signal::SIGINT)
            .map_err(|e| ProcessError::SignalFailed { pid, reason: e.to_string() })
    }
    #[cfg(not(unix))]
    {
        force_kill_pid(pid)
    }
}

/// Force-kill a process by PID. Cross-platform helper.
pub fn force_kill_pid(pid: u32) -> Result<(), ProcessError> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as NixPid;
        kill(NixPid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|e| ProcessError::SignalFailed { pid, reason: e.to_string() })
    }
    #[cfg(windows)]
    {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
        use winapi::um::winnt::PROCESS_TERMINATE;

        // SAFETY: 핸들은 여기서 열고 여기서 닫는다
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(ProcessError::SignalFailed {
                    pid,
                    reason: std::io::Error::last_os_error().to_string(),
                });
            }
            let ok = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if ok == 0 {
                return Err(ProcessError::SignalFailed {
                    pid,
                    reason: std::io::Error::last_os_error().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// 정상 종료를 요청하고 `poll` 간격으로 `grace` 동안 기다린다. 그래도 살아 있으면 강제 종료.
pub async fn stop_pid_with_grace(
    pid: u32,
    grace: Duration,
    poll: Duration,
) -> Result<StopOutcome, ProcessError> {
    if !is_running_async(pid).await {
        return Ok(StopOutcome::NotRunning);
    }

    tracing::info!("[Supervisor] Sending stop signal to PID {}", pid);
    interrupt_pid(pid)?;

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(poll).await;
        if !is_running_async(pid).await {
            return Ok(StopOutcome::Exited);
        }
    }

    tracing::warn!(
        "[Supervisor] PID {} still alive after {}s, forcing termination",
        pid,
        grace.as_secs()
    );
    force_kill_pid(pid)?;
    Ok(StopOutcome::Killed)
}

// ── PID 파일 ─────────────────────────────────────────────

pub fn write_pid_file(path: &Path, pid: u32) -> Result<(), ProcessError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, pid.to_string())?;
    Ok(())
}

/// PID 파일이 없으면 None
pub fn read_pid_file(path: &Path) -> Result<Option<u32>, ProcessError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    content
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|e| ProcessError::InvalidPidFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("[Supervisor] Cannot remove {}: {}", path.display(), e);
        }
    }
}
