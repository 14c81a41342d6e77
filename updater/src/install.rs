//! 설치 전략
//!
//! ## 플랫폼별 동작
//! - **InstallerLaunch** (Windows): 받은 설치 프로그램을 `/S` 로 실행하고 앱은 종료한다.
//!   권한 상승이 필요하면 (`ERROR_ELEVATION_REQUIRED`) PowerShell `Start-Process -Verb RunAs` 로 재시도.
//! - **SelfReplace** (Linux 등): 실행 중인 바이너리 경로를 새 파일로 교체한다.
//!   새 파일에 먼저 0755 권한을 준 뒤 rename → 같은 디렉터리에 임시 복사 후 rename →
//!   `pkexec install -m 0755` 순서로 시도하고, 같은 인자로 재실행한다.
//!   교체 전에 실패하면 기존 실행 파일은 그대로 남는다.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::error::UpdateError;

pub const INSTALLER_SCRATCH_NAME: &str = "scdl-web-update-installer.exe";
pub const REPLACE_SCRATCH_NAME: &str = ".scdl-web.update";

#[cfg(windows)]
const ERROR_ELEVATION_REQUIRED: i32 = 740;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStrategy {
    InstallerLaunch,
    /// `target` 이 없으면 실행 중인 바이너리 ([`current_executable`])
    SelfReplace { target: Option<PathBuf> },
}

/// 설치 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// 설치 프로그램이 떴다. 호출 측은 곧바로 종료해야 한다.
    InstallerLaunched,
    /// 실행 파일을 교체했다
    Replaced { executable: PathBuf, method: ReplaceMethod },
}

/// 실행 파일 교체에 성공한 방법
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMethod {
    Rename,
    CopyThenRename,
    Elevated,
}

impl InstallStrategy {
    pub fn for_current_platform() -> Self {
        if cfg!(windows) {
            InstallStrategy::InstallerLaunch
        } else {
            InstallStrategy::SelfReplace { target: None }
        }
    }

    /// 교체할 실행 파일
    pub fn replace_target(&self) -> std::io::Result<PathBuf> {
        match self {
            InstallStrategy::SelfReplace { target: Some(target) } => Ok(target.clone()),
            _ => current_executable(),
        }
    }

    /// 다운로드 파일을 둘 임시 경로
    pub fn scratch_path(&self) -> Result<PathBuf, UpdateError> {
        match self {
            InstallStrategy::InstallerLaunch => Ok(std::env::temp_dir().join(INSTALLER_SCRATCH_NAME)),
            InstallStrategy::SelfReplace { .. } => {
                // 교체 대상과 같은 파일시스템이어야 rename 이 성공한다
                let exe = self
                    .replace_target()
                    .map_err(|e| UpdateError::Download(format!("cannot locate executable: {}", e)))?;
                let dir = exe
                    .parent()
                    .ok_or_else(|| UpdateError::Download("executable has no parent directory".into()))?;
                Ok(dir.join(REPLACE_SCRATCH_NAME))
            }
        }
    }

    pub async fn install(&self, downloaded: &Path) -> Result<InstallOutcome, UpdateError> {
        match self {
            InstallStrategy::InstallerLaunch => {
                launch_installer(downloaded).await.map_err(|e| UpdateError::Install(format!("{:#}", e)))?;
                Ok(InstallOutcome::InstallerLaunched)
            }
            InstallStrategy::SelfReplace { .. } => {
                let exe = self.replace_target().map_err(|e| UpdateError::Install(e.to_string()))?;
                let method = replace_executable(downloaded, &exe)
                    .await
                    .map_err(|e| UpdateError::Install(format!("{:#}", e)))?;
                Ok(InstallOutcome::Replaced { executable: exe, method })
            }
        }
    }
}

/// 교체 대상 실행 파일 경로 (심볼릭 링크 해소)
///
/// AppImage 로 실행 중이면 마운트된 내부 바이너리가 아니라 `$APPIMAGE` 가 대상이다.
pub fn current_executable() -> std::io::Result<PathBuf> {
    if let Some(appimage) = std::env::var_os("APPIMAGE").filter(|v| !v.is_empty()) {
        let path = PathBuf::from(appimage);
        if path.is_file() {
            return std::fs::canonicalize(path);
        }
    }
    let exe = std::env::current_exe()?;
    std::fs::canonicalize(&exe).or(Ok(exe))
}

async fn launch_installer(installer: &Path) -> anyhow::Result<()> {
    tracing::info!("[Updater] Launching installer {}", installer.display());

    let spawned = std::process::Command::new(installer)
        .arg("/S")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    match spawned {
        Ok(_) => Ok(()),
        #[cfg(windows)]
        Err(e) if e.raw_os_error() == Some(ERROR_ELEVATION_REQUIRED) => {
            tracing::info!("[Updater] Installer requires elevation, retrying through RunAs");
            let script = format!(
                "Start-Process -FilePath '{}' -ArgumentList '/S' -Verb RunAs",
                installer.display().to_string().replace('\'', "''")
            );
            let status = tokio::process::Command::new("powershell")
                .args(["-NoProfile", "-NonInteractive", "-Command", &script])
                .stdin(Stdio::null())
                .status()
                .await
                .context("failed to run powershell")?;
            anyhow::ensure!(status.success(), "elevated installer launch was declined ({})", status);
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("failed to start {}", installer.display())),
    }
}

/// `target` 을 `source` 로 교체한다. 교체된 파일은 0755.
pub async fn replace_executable(source: &Path, target: &Path) -> anyhow::Result<ReplaceMethod> {
    // 권한은 교체 전에 준다. 교체 뒤에는 대상이 root 소유일 수 있다.
    mark_executable(source).await?;

    let method = match tokio::fs::rename(source, target).await {
        Ok(()) => ReplaceMethod::Rename,
        Err(rename_err) => {
            tracing::warn!(
                "[Updater] rename {} -> {} failed: {}",
                source.display(),
                target.display(),
                rename_err
            );
            match copy_then_rename(source, target).await {
                Ok(()) => ReplaceMethod::CopyThenRename,
                Err(copy_err) => {
                    tracing::warn!("[Updater] copy-then-rename failed: {:#}", copy_err);
                    elevated_copy(source, target)
                        .await
                        .with_context(|| format!("cannot replace {}", target.display()))?;
                    ReplaceMethod::Elevated
                }
            }
        }
    };

    if method != ReplaceMethod::Rename {
        let _ = tokio::fs::remove_file(source).await;
    }
    tracing::info!("[Updater] Replaced {} ({:?})", target.display(), method);
    Ok(method)
}

/// 대상 디렉터리에 임시 파일로 복사한 뒤 rename (다른 파일시스템 간 이동용)
async fn copy_then_rename(source: &Path, target: &Path) -> anyhow::Result<()> {
    let source = source.to_path_buf();
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let dir = target.parent().context("target has no parent directory")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("cannot create temp file in {}", dir.display()))?;
        let mut src = std::fs::File::open(&source)
            .with_context(|| format!("cannot open {}", source.display()))?;
        std::io::copy(&mut src, tmp.as_file_mut()).context("copy failed")?;
        tmp.as_file().set_permissions(src.metadata()?.permissions())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .context("copy task panicked")?
}

/// 권한 상승 도우미 명령. 복사와 0755 지정을 한 번의 상승 호출 안에서 끝낸다.
#[cfg(unix)]
fn elevated_command(source: &Path, target: &Path) -> (String, Vec<String>) {
    if cfg!(target_os = "macos") {
        let dst = shell_quote(target);
        let shell = format!("cp -f {} {} && chmod 755 {}", shell_quote(source), dst, dst);
        let script = format!(
            "do shell script \"{}\" with administrator privileges",
            shell.replace('\\', "\\\\").replace('"', "\\\"")
        );
        ("osascript".into(), vec!["-e".into(), script])
    } else {
        let args = vec![
            "install".into(),
            "-m".into(),
            "0755".into(),
            source.to_string_lossy().into_owned(),
            target.to_string_lossy().into_owned(),
        ];
        ("pkexec".into(), args)
    }
}

#[cfg(unix)]
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

#[cfg(unix)]
async fn elevated_copy(source: &Path, target: &Path) -> anyhow::Result<()> {
    let (program, args) = elevated_command(source, target);
    let mut cmd = tokio::process::Command::new(&program);
    cmd.args(&args);

    tracing::info!("[Updater] Requesting elevated copy to {}", target.display());
    let status = cmd.stdin(Stdio::null()).status().await.context("failed to run elevation helper")?;
    anyhow::ensure!(status.success(), "elevation helper exited with {}", status);
    Ok(())
}

#[cfg(not(unix))]
async fn elevated_copy(_source: &Path, target: &Path) -> anyhow::Result<()> {
    anyhow::bail!("no elevation helper for {}", target.display())
}

#[cfg(unix)]
async fn mark_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("chmod 0755 {}", path.display()))
}

#[cfg(not(unix))]
async fn mark_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

/// 교체된 실행 파일을 현재 프로세스의 인자 그대로 다시 띄운다
pub fn relaunch(executable: &Path) -> Result<u32, UpdateError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let child = std::process::Command::new(executable)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| UpdateError::Relaunch(e.to_string()))?;
    tracing::info!("[Updater] Relaunched {} (pid {})", executable.display(), child.id());
    Ok(child.id())
}
