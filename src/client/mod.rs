//! Client facade: connect, log in, run the sync schedule, browse folders.
//!
//! Everything observable is reported as a [`ClientEvent`] on the receiver
//! returned by [`SyncClient::new`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ClientSettings;
use crate::error::{Result, SyncError};
use crate::protocol::{
    AuthenticateRequest, FolderListRequest, Handshake, Message, RequestHeader,
};
use crate::session::{self, MessageHandler, SessionConfig, SessionHandle, SessionState};
use crate::sync::{Scheduler, SyncEngine};
use crate::wire::Scrambler;

/// How long `connect` waits for the login answer.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Login { session_name: String },
    LoginFailed { reason: String },
    Disconnected,
    FolderList { path: String, folders: Vec<String> },
    Information(String),
    Error(String),
    FileSynced { folder: String, path: String, size: i64 },
    CycleComplete { folder: String },
}

struct ClientHandler {
    engine: Arc<SyncEngine>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientHandler {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MessageHandler for ClientHandler {
    async fn on_message(&self, session: &SessionHandle, message: Message) -> anyhow::Result<()> {
        match message {
            Message::AuthenticateResponse(m) => {
                if m.header.error.is_ok() {
                    session.set_state(SessionState::Ready);
                    info!(session_name = %m.session_name, "Logged in");
                    self.emit(ClientEvent::Login {
                        session_name: m.session_name,
                    });
                } else {
                    warn!(error = ?m.header.error, "Login rejected");
                    self.emit(ClientEvent::LoginFailed {
                        reason: format!("{:?}", m.header.error),
                    });
                    session.close();
                }
            }
            Message::FolderListResponse(m) => {
                if !m.header.error.is_ok() {
                    self.emit(ClientEvent::Error(format!(
                        "folder list for '{}' failed: {:?}",
                        m.path, m.header.error
                    )));
                    return Ok(());
                }
                let folders = m.folder_names().into_iter().map(str::to_string).collect();
                self.emit(ClientEvent::FolderList {
                    path: m.path,
                    folders,
                });
            }
            other => {
                let kind = other.kind();
                if !self.engine.handle(session, other).await? {
                    debug!(?kind, "Ignoring unexpected message");
                }
            }
        }
        Ok(())
    }

    fn on_error(&self, _session: &SessionHandle, error: &SyncError) {
        self.emit(ClientEvent::Error(error.to_string()));
    }

    fn on_closed(&self, _session: &SessionHandle) {
        self.engine.reset();
        self.emit(ClientEvent::Disconnected);
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SyncClient {
    settings: Arc<ClientSettings>,
    engine: Arc<SyncEngine>,
    events: mpsc::UnboundedSender<ClientEvent>,
    session: Mutex<Option<SessionHandle>>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl SyncClient {
    pub fn new(settings: ClientSettings) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(SyncEngine::new(&settings, events.clone()));
        let client = Self {
            settings: Arc::new(settings),
            engine,
            events,
            session: Mutex::new(None),
            scheduler: Mutex::new(None),
        };
        (client, rx)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn session(&self) -> Option<SessionHandle> {
        locked(&self.session).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some_and(|s| s.state() == SessionState::Ready)
    }

    /// Open the connection, send the handshake and credentials, and wait
    /// for the login answer.
    pub async fn connect(&self) -> Result<()> {
        if let Some(old) = locked(&self.session).take() {
            old.close();
        }

        let address = self.settings.address();
        let stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let config = SessionConfig {
            scrambler: Scrambler::from_secret(self.settings.secret.as_deref()),
            ..Default::default()
        };
        let handler = Arc::new(ClientHandler {
            engine: self.engine.clone(),
            events: self.events.clone(),
        });
        let session = session::spawn(reader, writer, address.clone(), config, handler);
        *locked(&self.session) = Some(session.clone());
        info!(%address, "Connected");

        let mut state = session.subscribe();
        session
            .send(Handshake::new(
                self.settings.client_id.clone(),
                self.settings.client_id.clone(),
            ))
            .await?;
        session.set_state(SessionState::Authenticating);
        session
            .send(AuthenticateRequest {
                header: RequestHeader::new(
                    self.settings.client_id.clone(),
                    self.engine.next_request_id(),
                ),
                user: self.settings.user.clone(),
                password: self.settings.password.clone(),
            })
            .await?;

        let answered = tokio::time::timeout(
            LOGIN_TIMEOUT,
            state.wait_for(|s| matches!(s, SessionState::Ready | SessionState::Closed)),
        )
        .await;

        match answered {
            Ok(Ok(s)) if *s == SessionState::Ready => Ok(()),
            Ok(_) => Err(SyncError::Authentication(
                "server closed the session during login".to_string(),
            )),
            Err(_) => {
                session.close();
                Err(SyncError::Authentication("login timed out".to_string()))
            }
        }
    }

    /// Begin periodic sync of every configured target.
    pub fn start(&self) -> Result<()> {
        let session = self.session().ok_or(SyncError::SessionClosed)?;
        if session.is_closed() {
            return Err(SyncError::SessionClosed);
        }
        let mut scheduler = locked(&self.scheduler);
        if scheduler.as_ref().is_some_and(Scheduler::is_running) {
            return Ok(());
        }
        *scheduler = Some(Scheduler::spawn(
            self.engine.clone(),
            session,
            self.settings.interval(),
        ));
        info!(
            targets = self.engine.target_count(),
            interval_secs = self.settings.interval_secs,
            "Sync started"
        );
        Ok(())
    }

    /// Stop scheduling new cycles. Transfers already in flight finish.
    pub fn pause(&self) {
        if let Some(scheduler) = locked(&self.scheduler).take() {
            scheduler.stop();
            info!("Sync paused");
        }
    }

    pub fn disconnect(&self) {
        self.pause();
        if let Some(session) = locked(&self.session).take() {
            session.close();
        }
    }

    /// Ask for the child folders of `path`. The answer arrives as
    /// [`ClientEvent::FolderList`].
    pub async fn query_folders(&self, path: &str) -> Result<i64> {
        let session = self.session().ok_or(SyncError::SessionClosed)?;
        let id = self.engine.next_request_id();
        session
            .send(FolderListRequest {
                header: RequestHeader::new(self.settings.client_id.clone(), id),
                path: path.to_string(),
            })
            .await?;
        Ok(id)
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
