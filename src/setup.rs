//! 첫 실행 준비 — 워커가 돌 수 있는 Python 환경과 데이터 디렉터리
//!
//! ## 흐름
//! 1. venv 가 없으면: 시스템 Python ≥ 3.10 탐지 → `python -m venv` → `pip install -r`
//! 2. `.env` 생성 (`.env.example` 의 컨테이너 경로를 호스트 경로로 치환), 데이터 디렉터리 생성
//! 3. 워커 의존성 import 확인. 빠진 게 있으면 pip 설치 후 한 번 더 확인
//! 4. 시스템 Python 재확인, ffmpeg 확인 (없으면 경고만)
//!
//! 서버 모드는 설치 단계(venv 생성, pip)를 건너뛰고 검사만 한다.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::config::{env_file, AppPaths};
use crate::platform::Platform;

/// 최소 요구 Python 버전
pub const MIN_PYTHON: (u32, u32) = (3, 10);

const PYTHON_CANDIDATES: &[&str] = &["python3", "python"];

/// 워커가 import 할 수 있어야 하는 모듈
pub const REQUIRED_MODULES: &[&str] = &[
    "fastapi",
    "uvicorn",
    "sqlalchemy",
    "aiosqlite",
    "alembic",
    "pydantic",
    "pydantic_settings",
    "scdl",
];

const CONTAINER_DB_URL: &str = "sqlite+aiosqlite:////data/db/scdl-web.db";
const CONTAINER_MUSIC_ROOT: &str = "/data/music";
const CONTAINER_ARCHIVES_ROOT: &str = "/data/archives";
const DB_FILE_NAME: &str = "scdl-web.db";

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("Python {}.{}+ is required but was not found", MIN_PYTHON.0, MIN_PYTHON.1)]
    PythonNotFound,

    #[error("failed to create virtual environment: {0}")]
    Venv(String),

    #[error("failed to install Python dependencies: {0}")]
    PipInstall(String),

    #[error("Python dependencies could not be installed")]
    DependenciesMissing,

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct SetupOptions {
    /// venv 생성과 pip 설치를 허용 (데스크톱 = true, 서버 = false)
    pub install_missing: bool,
}

/// 준비 결과. 치명적이지 않은 문제만 담는다.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupReport {
    pub created_venv: bool,
    pub installed_dependencies: bool,
    pub created_env_file: bool,
    pub ffmpeg_available: bool,
}

/// 전체 준비 절차
pub async fn run(paths: &AppPaths, platform: &dyn Platform, opts: SetupOptions) -> Result<SetupReport, SetupError> {
    let mut report = SetupReport::default();

    if !is_setup_complete(paths, platform) {
        if !opts.install_missing {
            return Err(SetupError::Venv(format!(
                "{} does not exist; run the desktop app once to install",
                paths.venv_dir().display()
            )));
        }
        tracing::info!("[Setup] First run detected, preparing Python environment");
        let python = detect_system_python(platform).await.ok_or(SetupError::PythonNotFound)?;
        create_venv(&python, &paths.venv_dir(), platform).await?;
        pip_install(paths, platform).await?;
        report.created_venv = true;
        report.installed_dependencies = true;
    }

    report.created_env_file = ensure_env_file(paths)?;
    create_data_dirs(paths);

    let python = venv_python(paths, platform);
    if !dependencies_present(&python, platform).await {
        if !opts.install_missing {
            return Err(SetupError::DependenciesMissing);
        }
        tracing::info!("[Setup] Dependencies missing, running pip install");
        pip_install(paths, platform).await?;
        if !dependencies_present(&python, platform).await {
            return Err(SetupError::DependenciesMissing);
        }
        report.installed_dependencies = true;
    }

    if detect_system_python(platform).await.is_none() {
        return Err(SetupError::PythonNotFound);
    }

    report.ffmpeg_available = find_on_path("ffmpeg", platform).is_some();
    if !report.ffmpeg_available {
        tracing::warn!("[Setup] ffmpeg not found on PATH");
    }
    Ok(report)
}

/// venv 의 bin(Scripts) 디렉터리가 있으면 설치된 것으로 본다
pub fn is_setup_complete(paths: &AppPaths, platform: &dyn Platform) -> bool {
    platform.runtime_bin_dir(&paths.venv_dir()).is_dir()
}

pub fn venv_python(paths: &AppPaths, platform: &dyn Platform) -> PathBuf {
    let bin = platform.runtime_bin_dir(&paths.venv_dir());
    platform.executable(&bin, "python")
}

// ── Python 탐지 ──────────────────────────────────────────

/// `Python 3.11.4` → `(3, 11)`
pub fn parse_python_version(output: &str) -> Option<(u32, u32)> {
    let version = output.split_whitespace().nth(1)?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// PATH 에서 실행 파일을 찾는다
pub fn find_on_path(name: &str, platform: &dyn Platform) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| platform.executable(&dir, name))
        .find(|candidate| candidate.is_file())
}

/// PATH 의 `python3`, `python` 중 3.10 이상인 첫 번째
pub async fn detect_system_python(platform: &dyn Platform) -> Option<PathBuf> {
    for name in PYTHON_CANDIDATES {
        let Some(path) = find_on_path(name, platform) else {
            continue;
        };

        let mut cmd = Command::new(&path);
        cmd.arg("--version").stdin(Stdio::null());
        platform.hide_console(&mut cmd);
        let Ok(output) = cmd.output().await else {
            continue;
        };
        // 오래된 Python 은 버전을 stderr 로 찍는다
        let text = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr).into_owned()
        } else {
            String::from_utf8_lossy(&output.stdout).into_owned()
        };

        match parse_python_version(&text) {
            Some((major, minor)) if major == MIN_PYTHON.0 && minor >= MIN_PYTHON.1 => {
                tracing::info!("[Setup] Found {} ({})", path.display(), text.trim());
                return Some(path);
            }
            Some((major, minor)) => {
                tracing::debug!("[Setup] Skipping {} ({}.{})", path.display(), major, minor);
            }
            None => {}
        }
    }
    None
}

// ── venv / pip ───────────────────────────────────────────

async fn run_logged(mut cmd: Command, platform: &dyn Platform) -> Result<(), String> {
    platform.hide_console(&mut cmd);
    cmd.stdin(Stdio::null());
    let output = cmd.output().await.map_err(|e| e.to_string())?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        tracing::debug!(target: "setup", "{}", line);
    }
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!("{} ({})", stderr.trim(), output.status))
    }
}

pub async fn create_venv(python: &Path, venv_dir: &Path, platform: &dyn Platform) -> Result<(), SetupError> {
    tracing::info!("[Setup] Creating Python virtual environment at {}", venv_dir.display());
    if let Some(parent) = venv_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut cmd = Command::new(python);
    cmd.arg("-m").arg("venv").arg(venv_dir);
    run_logged(cmd, platform).await.map_err(SetupError::Venv)?;
    tracing::info!("[Setup] Python venv created");
    Ok(())
}

pub async fn pip_install(paths: &AppPaths, platform: &dyn Platform) -> Result<(), SetupError> {
    let requirements = paths.requirements_file();
    tracing::info!("[Setup] Installing Python dependencies from {}", requirements.display());
    let bin = platform.runtime_bin_dir(&paths.venv_dir());
    let mut cmd = Command::new(platform.executable(&bin, "pip"));
    cmd.arg("install").arg("-r").arg(&requirements);
    run_logged(cmd, platform).await.map_err(SetupError::PipInstall)?;
    tracing::info!("[Setup] Python dependencies installed");
    Ok(())
}

/// venv 인터프리터로 필요한 모듈을 모두 import 해본다
pub async fn dependencies_present(python: &Path, platform: &dyn Platform) -> bool {
    if !python.is_file() {
        return false;
    }
    let script = REQUIRED_MODULES
        .iter()
        .map(|m| format!("import {}", m))
        .collect::<Vec<_>>()
        .join("; ");
    let mut cmd = Command::new(python);
    cmd.arg("-c").arg(script);
    match run_logged(cmd, platform).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("[Setup] Dependency check failed: {}", e);
            false
        }
    }
}

// ── .env / 데이터 디렉터리 ─────────────────────────────────

/// 컨테이너용 경로를 `data_dir` 아래 호스트 경로로 바꾼다.
/// 경로는 모두 `/` 구분자로 쓴다. 따옴표 없는 `\` 는 `.env` 에서 이스케이프로 읽힌다.
/// 모든 경로는 `/` 구분자로 쓴다. `.env` 파서가 따옴표 없는 `\` 를 이스케이프로 읽기 때문.
pub fn render_env_template(template: &str, data_dir: &Path) -> String {
    let db_path = slash_path(&data_dir.join("db").join(DB_FILE_NAME));
    template
        .replace(CONTAINER_DB_URL, &format!("sqlite+aiosqlite:///{}", db_path))
        .replace(CONTAINER_MUSIC_ROOT, &slash_path(&data_dir.join("music")))
        .replace(CONTAINER_ARCHIVES_ROOT, &slash_path(&data_dir.join("archives")))
}

fn slash_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// `.env` 가 없으면 템플릿에서 만든다. 새로 만들었으면 true.
pub fn ensure_env_file(paths: &AppPaths) -> Result<bool, SetupError> {
    let env_path = paths.env_file();
    if env_path.exists() {
        tracing::debug!("[Setup] .env already exists, preserving");
        return Ok(false);
    }
    let template = match std::fs::read_to_string(paths.env_example()) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!("[Setup] Cannot read {}: {}", paths.env_example().display(), e);
            return Ok(false);
        }
    };
    std::fs::write(&env_path, render_env_template(&template, &paths.data_dir()))?;
    tracing::info!("[Setup] Created .env with data dir {}", paths.data_dir().display());
    Ok(true)
}

/// db, 음악, 아카이브 디렉터리. 음악/아카이브는 `.env` 의 `MUSIC_ROOT`/`ARCHIVES_ROOT` 우선.
pub fn create_data_dirs(paths: &AppPaths) -> Vec<PathBuf> {
    let data = paths.data_dir();
    let entries = env_file::read(&paths.env_file());
    let music = env_file::lookup(&entries, "MUSIC_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| data.join("music"));
    let archives = env_file::lookup(&entries, "ARCHIVES_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| data.join("archives"));

    let dirs = vec![data.join("db"), music, archives];
    for dir in &dirs {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!("[Setup] Cannot create {}: {}", dir.display(), e);
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform;

    #[test]
    fn python_version_parsing() {
        assert_eq!(parse_python_version("Python 3.11.4\n"), Some((3, 11)));
        assert_eq!(parse_python_version("Python 3.10"), Some((3, 10)));
        assert_eq!(parse_python_version("Python"), None);
        assert_eq!(parse_python_version("Python x.y"), None);
    }

    #[test]
    fn env_template_paths_are_rewritten() {
        let data = Path::new("/home/u/scdl-web/data");
        let template = "DATABASE_URL=sqlite+aiosqlite:////data/db/scdl-web.db\n\
                        MUSIC_ROOT=/data/music\n\
                        ARCHIVES_ROOT=/data/archives\n\
                        LOG_LEVEL=info\n";
        let out = render_env_template(template, data);
        assert!(out.contains("DATABASE_URL=sqlite+aiosqlite:////home/u/scdl-web/data/db/scdl-web.db\n"));
        assert!(out.contains("MUSIC_ROOT=/home/u/scdl-web/data/music\n"));
        assert!(out.contains("ARCHIVES_ROOT=/home/u/scdl-web/data/archives\n"));
        assert!(out.contains("LOG_LEVEL=info"));
    }

    #[test]
    fn rendered_env_reads_back_host_paths() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::with_root(dir.path());
        std::fs::write(
            paths.env_example(),
            "MUSIC_ROOT=/data/music\nARCHIVES_ROOT=/data/archives\n",
        )
        .unwrap();
        assert!(ensure_env_file(&paths).unwrap());

        let entries = env_file::read(&paths.env_file());
        let music = env_file::lookup(&entries, "MUSIC_ROOT").unwrap();
        assert_eq!(PathBuf::from(music), paths.data_dir().join("music"));
    }

    #[test]
    fn env_file_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::with_root(dir.path());
        std::fs::write(paths.env_example(), "MUSIC_ROOT=/data/music\n").unwrap();

        assert!(ensure_env_file(&paths).unwrap());
        let first = std::fs::read_to_string(paths.env_file()).unwrap();
        assert!(!first.contains("=/data/music"));

        std::fs::write(paths.env_file(), "MUSIC_ROOT=/custom\n").unwrap();
        assert!(!ensure_env_file(&paths).unwrap());
        assert_eq!(std::fs::read_to_string(paths.env_file()).unwrap(), "MUSIC_ROOT=/custom\n");
    }

    #[test]
    fn missing_template_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::with_root(dir.path());
        assert!(!ensure_env_file(&paths).unwrap());
        assert!(!paths.env_file().exists());
    }

    #[test]
    fn data_dirs_honor_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::with_root(dir.path());
        let music = dir.path().join("elsewhere/music");
        std::fs::write(paths.env_file(), format!("MUSIC_ROOT={}\n", slash_path(&music))).unwrap();

        let created = create_data_dirs(&paths);

        assert_eq!(created[0], paths.data_dir().join("db"));
        assert_eq!(created[1], music);
        assert_eq!(created[2], paths.data_dir().join("archives"));
        assert!(created.iter().all(|d| d.is_dir()));
    }

    #[tokio::test]
    async fn server_mode_refuses_to_install() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::with_root(dir.path());

        let err = run(&paths, platform::native(), SetupOptions { install_missing: false })
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::Venv(_)));
        assert!(!is_setup_complete(&paths, platform::native()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dependency_check_uses_venv_interpreter() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::with_root(dir.path());
        let p = platform::native();
        let python = venv_python(&paths, p);
        std::fs::create_dir_all(python.parent().unwrap()).unwrap();

        std::fs::write(&python, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(dependencies_present(&python, p).await);

        std::fs::write(&python, "#!/bin/sh\necho 'No module named scdl' >&2\nexit 1\n").unwrap();
        assert!(!dependencies_present(&python, p).await);
    }
}
