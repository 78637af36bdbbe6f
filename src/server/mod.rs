//! TCP server: one session per accepted connection.
//!
//! A connection must send a handshake and authenticate before anything
//! else is answered; earlier requests get `NotAuthenticated`.

pub mod auth;
pub mod responder;

pub use auth::{LoginGuard, LoginVerdict};
pub use responder::ContentResponder;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerSettings;
use crate::error::Result;
use crate::protocol::{
    AuthenticateRequest, AuthenticateResponse, Message, ResponseError, ResponseHeader,
    PROTOCOL_VERSION,
};
use crate::session::{self, MessageHandler, SessionConfig, SessionHandle, SessionState};
use crate::wire::Scrambler;

/// Per-connection handler. Holds what the handshake told us.
struct ConnectionHandler {
    ip: IpAddr,
    session_no: u64,
    guard: Arc<LoginGuard>,
    responder: Arc<ContentResponder>,
    client_name: Mutex<Option<String>>,
}

impl ConnectionHandler {
    async fn authenticate(&self, session: &SessionHandle, r: AuthenticateRequest) -> anyhow::Result<()> {
        let verdict = self.guard.login(self.ip, &r.user, &r.password);
        let header = ResponseHeader::reply_to(&r.header);

        let error = match verdict {
            LoginVerdict::Accepted => {
                let name = self
                    .client_name
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .unwrap_or_else(|| r.header.client_id.clone());
                let session_name = format!("{}#{}", name, self.session_no);
                session.set_state(SessionState::Ready);
                info!(peer = %session.peer(), user = %r.user, %session_name, "Client authenticated");
                session
                    .send(AuthenticateResponse {
                        header,
                        session_name,
                    })
                    .await?;
                return Ok(());
            }
            LoginVerdict::Rejected => ResponseError::AuthenticationFailed,
            LoginVerdict::LockedOut => ResponseError::TooManyAttempts,
        };

        warn!(peer = %session.peer(), user = %r.user, ?error, "Login refused");
        let sent = session
            .send(AuthenticateResponse {
                header: header.with_error(error),
                session_name: String::new(),
            })
            .await;
        session.close();
        sent?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ConnectionHandler {
    async fn on_message(&self, session: &SessionHandle, message: Message) -> anyhow::Result<()> {
        match (session.state(), message) {
            (SessionState::Closed, _) => {}
            (SessionState::Connected, Message::Handshake(h)) => {
                if h.version != PROTOCOL_VERSION {
                    warn!(
                        peer = %session.peer(),
                        version = h.version,
                        expected = PROTOCOL_VERSION,
                        "Protocol version differs"
                    );
                }
                debug!(peer = %session.peer(), client = %h.client_name, "Handshake");
                *self.client_name.lock().unwrap_or_else(|e| e.into_inner()) = Some(h.client_name);
                session.set_state(SessionState::Authenticating);
            }
            (SessionState::Connected | SessionState::Authenticating, Message::AuthenticateRequest(r)) => {
                self.authenticate(session, r).await?;
            }
            (SessionState::Ready, Message::AuthenticateRequest(r)) => {
                // already logged in; answer without re-checking
                session
                    .send(AuthenticateResponse {
                        header: ResponseHeader::reply_to(&r.header),
                        session_name: format!("#{}", self.session_no),
                    })
                    .await?;
            }
            (SessionState::Ready, message) => {
                self.responder.respond(session, message).await?;
            }
            (_, message) => {
                if let Some(refusal) = responder::refuse(&message, ResponseError::NotAuthenticated) {
                    debug!(peer = %session.peer(), kind = ?message.kind(), "Request before login");
                    session.send(refusal).await?;
                }
            }
        }
        Ok(())
    }

    fn on_closed(&self, session: &SessionHandle) {
        let stats = session.stats();
        info!(
            peer = %session.peer(),
            received = stats.messages_received,
            sent = stats.messages_sent,
            "Client disconnected"
        );
    }
}

pub struct Server {
    listener: TcpListener,
    settings: Arc<ServerSettings>,
    guard: Arc<LoginGuard>,
    responder: Arc<ContentResponder>,
    next_session: AtomicU64,
}

impl Server {
    /// Validate settings, make sure the root exists and bind the listener.
    pub async fn bind(settings: ServerSettings) -> Result<Self> {
        settings.validate()?;
        if !settings.root.exists() {
            tokio::fs::create_dir_all(&settings.root).await?;
        }
        let listener = TcpListener::bind(settings.address()).await?;

        let guard = Arc::new(LoginGuard::new(
            settings.users.clone(),
            settings.max_failed_logins,
            settings.lockout(),
        ));
        let responder = Arc::new(ContentResponder::new(
            settings.root.clone(),
            settings.chunk_size,
        ));
        Ok(Self {
            listener,
            settings: Arc::new(settings),
            guard,
            responder,
            next_session: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Accept connections until `shutdown` fires, then close every session.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            addr = %self.local_addr()?,
            root = %self.settings.root.display(),
            scrambled = self.settings.secret.is_some(),
            "Serving"
        );

        let config = SessionConfig {
            scrambler: Scrambler::from_secret(self.settings.secret.as_deref()),
            slice_size: self.settings.slice_size,
            ..Default::default()
        };
        let mut sessions: Vec<SessionHandle> = Vec::new();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(a) => a,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay failed for {}: {}", peer, e);
            }

            let session_no = self.next_session.fetch_add(1, Ordering::Relaxed);
            let handler = Arc::new(ConnectionHandler {
                ip: peer.ip(),
                session_no,
                guard: self.guard.clone(),
                responder: self.responder.clone(),
                client_name: Mutex::new(None),
            });
            let (reader, writer) = stream.into_split();
            info!(%peer, session_no, "Client connected");

            sessions.retain(|s| !s.is_closed());
            sessions.push(session::spawn(
                reader,
                writer,
                peer.to_string(),
                config.clone(),
                handler,
            ));
        }

        info!(open = sessions.len(), "Shutting down");
        for s in &sessions {
            s.close();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.listener.local_addr().ok())
            .field("root", &self.settings.root)
            .finish()
    }
}
