//! 설치 디렉터리 레이아웃
//!
//! ```text
//! <install_dir>/            Windows: %LOCALAPPDATA%\scdl-web
//!   backend/                macOS:   ~/Library/Application Support/scdl-web
//!   venv/                   Linux:   ~/.local/share/scdl-web
//!   data/{db,music,archives}
//!   logs/shell.log
//!   .env  .env.example  shell.toml  scdl-web.pid
//! ```

use std::path::{Path, PathBuf};

pub const APP_DIR_NAME: &str = "scdl-web";
pub const INSTALL_DIR_ENV: &str = "SCDL_INSTALL_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    install_dir: PathBuf,
}

impl AppPaths {
    /// `SCDL_INSTALL_DIR` 가 있으면 그 경로, 없으면 OS 별 로컬 데이터 디렉터리
    pub fn resolve() -> anyhow::Result<Self> {
        if let Some(dir) = std::env::var_os(INSTALL_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::with_root(PathBuf::from(dir)));
        }
        let base = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("cannot determine the local data directory"))?;
        Ok(Self::with_root(base.join(APP_DIR_NAME)))
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self { install_dir: root.as_ref().to_path_buf() }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn data_dir(&self) -> PathBuf {
        self.install_dir.join("data")
    }

    pub fn backend_dir(&self) -> PathBuf {
        self.install_dir.join("backend")
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.install_dir.join("venv")
    }

    pub fn env_file(&self) -> PathBuf {
        self.install_dir.join(".env")
    }

    pub fn env_example(&self) -> PathBuf {
        self.install_dir.join(".env.example")
    }

    pub fn requirements_file(&self) -> PathBuf {
        self.backend_dir().join("requirements.txt")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.install_dir.join("scdl-web.pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.install_dir.join("logs")
    }

    pub fn config_file(&self) -> PathBuf {
        self.install_dir.join("shell.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_relative_to_root() {
        let p = AppPaths::with_root("/opt/scdl");
        assert_eq!(p.backend_dir(), PathBuf::from("/opt/scdl/backend"));
        assert_eq!(p.venv_dir(), PathBuf::from("/opt/scdl/venv"));
        assert_eq!(p.env_file(), PathBuf::from("/opt/scdl/.env"));
        assert_eq!(p.requirements_file(), PathBuf::from("/opt/scdl/backend/requirements.txt"));
        assert_eq!(p.log_dir(), PathBuf::from("/opt/scdl/logs"));
    }
}
