//! 단일 인스턴스 중재
//!
//! 첫 번째 프로세스(보유자)가 `127.0.0.1:47200` 을 점유하고 접속을 기다린다.
//! 두 번째 프로세스는 포트를 잡지 못하면 보유자에게 접속해서 다음을 주고받는다:
//!
//! ```text
//! client → scdl-web:show\n
//! holder → scdl-web:ack\n        (5초 안에 magic 이 와야 함)
//! holder → continue\n | relaunch\n   (사용자 확인 후)
//! ```
//!
//! `continue` 면 두 번째 프로세스가 종료하고, `relaunch` 면 보유자가 내려간 뒤
//! 포트를 이어받는다. 상대가 프로토콜을 모르면 세 번 재시도 후 보호 없이 진행한다.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::prompt::Prompter;

pub const INSTANCE_ADDR: &str = "127.0.0.1:47200";
pub const MAGIC: &str = "scdl-web:show";
pub const ACK: &str = "scdl-web:ack";
pub const DECISION_CONTINUE: &str = "continue";
pub const DECISION_RELAUNCH: &str = "relaunch";

const MAX_LINE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Relaunch,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Continue => DECISION_CONTINUE,
            Decision::Relaunch => DECISION_RELAUNCH,
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            DECISION_CONTINUE => Some(Decision::Continue),
            DECISION_RELAUNCH => Some(Decision::Relaunch),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("handshake I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake deadline exceeded")]
    DeadlineExceeded,
    #[error("unexpected acknowledgement {0:?}")]
    InvalidAck(String),
    #[error("unknown decision {0:?}")]
    UnknownDecision(String),
    #[error("connection closed during handshake")]
    Closed,
}

/// 타이밍 설정
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    pub addr: SocketAddr,
    pub connect_timeout: Duration,
    /// 클라이언트 측 전체 교환 제한 (보유자의 사용자 확인 시간 포함)
    pub handshake_deadline: Duration,
    /// 보유자가 magic 줄을 기다리는 시간
    pub holder_read_deadline: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub relaunch_wait: Duration,
    pub relaunch_poll: Duration,
    /// 보유자 측 사용자 확인 제한. 넘기면 `continue`.
    pub prompt_timeout: Duration,
    /// `relaunch` 응답 후 종료 콜백까지의 지연
    pub shutdown_delay: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 47200)),
            connect_timeout: Duration::from_secs(2),
            handshake_deadline: Duration::from_secs(60),
            holder_read_deadline: Duration::from_secs(5),
            retries: 3,
            retry_backoff: Duration::from_millis(500),
            relaunch_wait: Duration::from_secs(10),
            relaunch_poll: Duration::from_millis(250),
            prompt_timeout: Duration::from_secs(55),
            shutdown_delay: Duration::from_millis(200),
        }
    }
}

impl ArbiterConfig {
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self { addr, ..Default::default() }
    }
}

/// 점유한 인스턴스 포트
#[derive(Debug)]
pub struct InstanceLock {
    listener: TcpListener,
}

impl InstanceLock {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 보유자 accept 루프를 띄운다. `cancel` 이 취소되면 리스너를 닫고 끝난다.
    pub fn serve(self, holder: Arc<Holder>, cancel: CancellationToken) -> JoinHandle<()> {
        let listener = self.listener;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!("[Instance] Connection from {}", peer);
                            let holder = holder.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = cancel.cancelled() => {}
                                    _ = holder.handle_peer(stream) => {}
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("[Instance] Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            tracing::info!("[Instance] Instance lock released");
        })
    }
}

/// 중재 결과
#[derive(Debug)]
pub enum Arbitration {
    /// 이 프로세스가 보유자
    Primary(InstanceLock),
    /// 기존 인스턴스가 계속 실행. 이 프로세스는 종료해야 한다.
    Exit,
    /// 알 수 없는 프로세스가 포트를 점유. 보호 없이 실행.
    Unguarded,
}

/// 포트를 바로 바인드한다 (Unix 에서는 SO_REUSEADDR 로 TIME_WAIT 포트 재사용)
pub fn try_bind(addr: SocketAddr) -> io::Result<InstanceLock> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(16)?;
    socket.set_nonblocking(true)?;
    let listener = TcpListener::from_std(socket.into())?;
    Ok(InstanceLock { listener })
}

/// 인스턴스 중재. 이 함수는 실패하지 않는다.
pub async fn arbitrate(cfg: &ArbiterConfig) -> Arbitration {
    match try_bind(cfg.addr) {
        Ok(lock) => {
            tracing::info!("[Instance] Acquired instance lock on {}", cfg.addr);
            return Arbitration::Primary(lock);
        }
        Err(e) => tracing::info!("[Instance] {} is busy ({}), contacting holder", cfg.addr, e),
    }

    for attempt in 1..=cfg.retries {
        match signal_existing(cfg).await {
            Ok(Decision::Continue) => {
                tracing::info!("[Instance] Existing instance continues; exiting");
                return Arbitration::Exit;
            }
            Ok(Decision::Relaunch) => {
                tracing::info!("[Instance] Existing instance is shutting down; waiting for port");
                return match wait_for_port(cfg).await {
                    Some(lock) => Arbitration::Primary(lock),
                    None => {
                        tracing::warn!("[Instance] Holder did not release {} in time", cfg.addr);
                        Arbitration::Exit
                    }
                };
            }
            Err(e) => {
                tracing::warn!("[Instance] Handshake attempt {}/{} failed: {}", attempt, cfg.retries, e);
                tokio::time::sleep(cfg.retry_backoff).await;
                if let Ok(lock) = try_bind(cfg.addr) {
                    tracing::info!("[Instance] Acquired instance lock on {} after retry", cfg.addr);
                    return Arbitration::Primary(lock);
                }
            }
        }
    }

    tracing::warn!(
        "[Instance] Port {} occupied by unknown process, starting without single-instance guard",
        cfg.addr.port()
    );
    Arbitration::Unguarded
}

/// 보유자에게 신호를 보내고 결정을 받는다
pub async fn signal_existing(cfg: &ArbiterConfig) -> Result<Decision, HandshakeError> {
    let stream = tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(cfg.addr))
        .await
        .map_err(|_| HandshakeError::ConnectTimeout)?
        .map_err(HandshakeError::Connect)?;

    // 타임아웃으로 future 가 버려지면 스트림도 닫힌다
    tokio::time::timeout(cfg.handshake_deadline, exchange(stream))
        .await
        .map_err(|_| HandshakeError::DeadlineExceeded)?
}

async fn exchange(stream: TcpStream) -> Result<Decision, HandshakeError> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    write.write_all(format!("{}\n", MAGIC).as_bytes()).await?;
    write.flush().await?;

    let ack = read_line(&mut reader).await?;
    if ack != ACK {
        return Err(HandshakeError::InvalidAck(ack));
    }

    let decision = read_line(&mut reader).await?;
    Decision::parse(&decision).ok_or(HandshakeError::UnknownDecision(decision))
}

async fn read_line<R>(reader: &mut BufReader<R>) -> Result<String, HandshakeError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader).take(MAX_LINE as u64).read_line(&mut line).await?;
    if n == 0 {
        return Err(HandshakeError::Closed);
    }
    Ok(line.trim().to_string())
}

/// 보유자가 포트를 놓을 때까지 바인드를 재시도
async fn wait_for_port(cfg: &ArbiterConfig) -> Option<InstanceLock> {
    let deadline = tokio::time::Instant::now() + cfg.relaunch_wait;
    while tokio::time::Instant::now() < deadline {
        if let Ok(lock) = try_bind(cfg.addr) {
            tracing::info!("[Instance] Took over instance lock on {}", cfg.addr);
            return Some(lock);
        }
        tokio::time::sleep(cfg.relaunch_poll).await;
    }
    None
}

// ── 보유자 측 ──────────────────────────────────────────

/// 보유자 측 처리: 사용자에게 묻고, `relaunch` 면 종료 콜백을 부른다
///
/// 이미 종료 중이면 (업데이트 후 재실행 등) 묻지 않고 `relaunch` 로 답한다.
pub struct Holder {
    prompter: Arc<dyn Prompter>,
    on_relaunch: Box<dyn Fn() + Send + Sync>,
    quitting: CancellationToken,
    read_deadline: Duration,
    prompt_timeout: Duration,
    shutdown_delay: Duration,
}

impl Holder {
    pub fn new(
        cfg: &ArbiterConfig,
        prompter: Arc<dyn Prompter>,
        on_relaunch: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            prompter,
            on_relaunch: Box::new(on_relaunch),
            quitting: CancellationToken::new(),
            read_deadline: cfg.holder_read_deadline,
            prompt_timeout: cfg.prompt_timeout,
            shutdown_delay: cfg.shutdown_delay,
        }
    }

    /// 이 토큰이 취소되어 있으면 새 인스턴스에게 자리를 넘긴다
    pub fn with_quit_signal(mut self, quitting: CancellationToken) -> Self {
        self.quitting = quitting;
        self
    }

    async fn handle_peer(&self, stream: TcpStream) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let magic = match tokio::time::timeout(self.read_deadline, read_line(&mut reader)).await {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                tracing::debug!("[Instance] Peer handshake failed: {}", e);
                return;
            }
            Err(_) => {
                tracing::debug!("[Instance] Peer sent nothing within {}s", self.read_deadline.as_secs());
                return;
            }
        };
        if magic != MAGIC {
            tracing::debug!("[Instance] Ignoring non-participant ({:?})", magic);
            return;
        }

        if let Err(e) = write.write_all(format!("{}\n", ACK).as_bytes()).await {
            tracing::debug!("[Instance] Cannot acknowledge peer: {}", e);
            return;
        }

        let decision = if self.quitting.is_cancelled() {
            tracing::info!("[Instance] Already shutting down, handing over without asking");
            Decision::Relaunch
        } else {
            tokio::select! {
                decision = self.ask_user() => decision,
                _ = self.quitting.cancelled() => Decision::Relaunch,
            }
        };
        tracing::info!("[Instance] Second launch detected, answering {:?}", decision);
        if let Err(e) = write.write_all(format!("{}\n", decision.as_str()).as_bytes()).await {
            tracing::warn!("[Instance] Cannot send decision: {}", e);
            return;
        }
        let _ = write.flush().await;

        if decision == Decision::Relaunch {
            tokio::time::sleep(self.shutdown_delay).await;
            (self.on_relaunch)();
        }
    }

    async fn ask_user(&self) -> Decision {
        let prompter = self.prompter.clone();
        let asking = tokio::task::spawn_blocking(move || {
            prompter.confirm(
                "scdl-web is already running",
                "scdl-web is already running. Restart it?",
            )
        });

        match tokio::time::timeout(self.prompt_timeout, asking).await {
            Ok(Ok(Ok(true))) => Decision::Relaunch,
            Ok(Ok(Ok(false))) => Decision::Continue,
            Ok(Ok(Err(e))) => {
                tracing::warn!("[Instance] Prompt failed ({}), keeping current instance", e);
                Decision::Continue
            }
            Ok(Err(e)) => {
                tracing::warn!("[Instance] Prompt task failed ({}), keeping current instance", e);
                Decision::Continue
            }
            Err(_) => {
                tracing::warn!("[Instance] Prompt timed out, keeping current instance");
                Decision::Continue
            }
        }
    }
}
