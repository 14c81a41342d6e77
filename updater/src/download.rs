//! 스트리밍 다운로드
//!
//! 32 KiB 단위로 복사하면서 진행률(%)이 바뀔 때만 콜백을 부른다.
//! 전체 크기를 모르면 진행률 콜백은 한 번도 불리지 않는다.

use futures_util::TryStreamExt;
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;

use crate::error::UpdateError;

pub const CHUNK_SIZE: usize = 32 * 1024;

/// 누적 바이트 → 정수 퍼센트. 같은 값은 두 번 내보내지 않는다.
#[derive(Debug)]
pub struct PercentTracker {
    total: u64,
    received: u64,
    last: Option<u8>,
}

impl PercentTracker {
    pub fn new(total: u64) -> Self {
        Self { total, received: 0, last: None }
    }

    /// n 바이트를 더 받았을 때 새 퍼센트 값이 생기면 Some
    pub fn advance(&mut self, n: u64) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        self.received = self.received.saturating_add(n);
        let pct = (self.received.saturating_mul(100) / self.total).min(100) as u8;
        if self.last == Some(pct) {
            return None;
        }
        self.last = Some(pct);
        Some(pct)
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

/// reader 를 끝까지 writer 로 복사. 반환값은 복사한 바이트 수.
pub async fn copy_with_progress<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    total: Option<u64>,
    mut on_progress: F,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u8),
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut tracker = PercentTracker::new(total.unwrap_or(0));
    let mut copied = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
        if let Some(pct) = tracker.advance(n as u64) {
            on_progress(pct);
        }
    }

    writer.flush().await?;
    Ok(copied)
}

/// url 을 dest 로 내려받는다. dest 의 상위 디렉터리는 미리 만든다.
pub async fn download_to_file<F>(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
    on_progress: F,
) -> Result<u64, UpdateError>
where
    F: FnMut(u8),
{
    tracing::info!("[Updater] Downloading {} -> {}", url, dest.display());

    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| UpdateError::Download(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(UpdateError::Download(format!("HTTP {}", status.as_u16())));
    }
    let total = response.content_length().filter(|len| *len > 0);

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| UpdateError::Download(format!("{}: {}", parent.display(), e)))?;
    }
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| UpdateError::Download(format!("{}: {}", dest.display(), e)))?;

    let stream = response
        .bytes_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let mut reader = StreamReader::new(stream);

    let copied = copy_with_progress(&mut reader, &mut file, total, on_progress)
        .await
        .map_err(|e| UpdateError::Download(e.to_string()))?;
    file.sync_all()
        .await
        .map_err(|e| UpdateError::Download(e.to_string()))?;

    if let Some(expected) = total {
        if copied < expected {
            return Err(UpdateError::Download(format!(
                "incomplete download: {} of {} bytes",
                copied, expected
            )));
        }
    }

    tracing::info!("[Updater] Downloaded {} bytes", copied);
    Ok(copied)
}
