//! tracing 초기화와 로그 파일 회전
//!
//! stderr 와 `<install_dir>/logs/shell.log` 양쪽에 같은 이벤트를 쓴다.
//! 필터는 `RUST_LOG` (기본 `info`). 로그 파일은 시작 시점에 한 번만 크기를 보고 회전한다.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_FILE_NAME: &str = "shell.log";
pub const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;

/// 전역 subscriber 설치. 로그 파일을 열 수 없으면 stderr 만 쓴다.
pub fn init(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let file_layer = log_dir.and_then(|dir| match open_log_file(dir) {
        Ok(file) => Some(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true),
        ),
        Err(e) => {
            eprintln!("[Logging] cannot open log file in {}: {}", dir.display(), e);
            None
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

fn open_log_file(dir: &Path) -> std::io::Result<fs::File> {
    fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE_NAME);
    rotate_if_needed(&path, MAX_LOG_BYTES);
    OpenOptions::new().create(true).append(true).open(path)
}

/// `path` 가 `max_bytes` 이상이면 `path.1` 로 옮긴다 (백업은 하나만 유지)
pub fn rotate_if_needed(path: &Path, max_bytes: u64) -> bool {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return false,
    };
    if len < max_bytes {
        return false;
    }

    let backup = rotated_path(path);
    let _ = fs::remove_file(&backup);
    match fs::rename(path, &backup) {
        Ok(()) => true,
        Err(e) => {
            eprintln!(
                "[Logging] failed to rotate {} to {}: {}",
                path.display(),
                backup.display(),
                e
            );
            false
        }
    }
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut value = path.as_os_str().to_os_string();
    value.push(".1");
    PathBuf::from(value)
}
