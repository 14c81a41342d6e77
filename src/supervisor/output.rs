//! 워커 stdout/stderr 캡처
//!
//! 각 줄은 `worker` 타깃으로 tracing 에 다시 찍히고, 최근 줄만 링 버퍼에 남는다.
//! 시작 실패를 설명할 때 버퍼의 마지막 줄들을 붙인다.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

pub const DEFAULT_OUTPUT_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub source: OutputSource,
    pub content: String,
}

/// 최근 출력 링 버퍼
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    max_size: usize,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_OUTPUT_LINES)
    }
}

impl OutputBuffer {
    pub fn with_capacity(max_size: usize) -> Self {
        Self { lines: VecDeque::with_capacity(max_size), max_size: max_size.max(1) }
    }

    pub fn push(&mut self, source: OutputSource, content: String) {
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(OutputLine { source, content });
    }

    /// 가장 최근 `count` 줄 (오래된 것부터)
    pub fn recent(&self, count: usize) -> Vec<OutputLine> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

pub type SharedOutput = Arc<Mutex<OutputBuffer>>;

/// 스트림을 줄 단위로 읽어 버퍼와 로그에 넣는 태스크
pub fn spawn_reader<R>(stream: R, source: OutputSource, buffer: SharedOutput)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match source {
                OutputSource::Stdout => tracing::info!(target: "worker", "{}", line),
                OutputSource::Stderr => tracing::warn!(target: "worker", "{}", line),
            }
            if let Ok(mut buf) = buffer.lock() {
                buf.push(source, line);
            }
        }
    });
}

/// 시작 실패 메시지에 덧붙일 최근 출력
pub fn tail_text(buffer: &SharedOutput, count: usize) -> String {
    buffer
        .lock()
        .map(|buf| {
            buf.recent(count)
                .into_iter()
                .map(|l| l.content)
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}
