//! Client sync engine.
//!
//! A cycle for one target:
//!
//! ```text
//! FileListRequest(L)            ledger[L] = 1
//! <- FileListInfoResponse(L)    ledger[L] += count - 1
//! <- FileListDetailResponse(L)  per file: decide, maybe
//!      FileContentInfoRequest(T)  ledger[T] = 1
//!                               ledger[L] -= 1 (removed on `latest`)
//! <- FileContentInfoResponse(T)
//!      FileContentDetailRequest(T, pos) ... until the final chunk
//! <- FileContentDetailResponse(T) resolved: ledger[T] removed
//! ```
//!
//! The cycle is over when the target's ledger is empty again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::retention::purge_older_than;
use super::sidecar::{self, sidecar_path};
use super::{filetime_from_millis, unix_millis};
use crate::client::ClientEvent;
use crate::config::{ClientSettings, TargetSettings};
use crate::ledger::FlowLedger;
use crate::paths::resolve_under;
use crate::protocol::{
    ContentKind, FileContentDetailRequest, FileContentDetailResponse, FileContentInfoRequest,
    FileContentInfoResponse, FileListDetailResponse, FileListInfoResponse, FileListRequest,
    Message, RequestHeader, ResponseError,
};
use crate::session::{SessionHandle, SessionState};
use crate::wire::checksum;

/// Request id source. Seeded from the wall clock in microseconds so ids
/// keep increasing across reconnects and restarts.
#[derive(Debug)]
pub struct RequestIds(AtomicI64);

impl Default for RequestIds {
    fn default() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(1);
        Self::starting_at(micros)
    }
}

impl RequestIds {
    pub fn starting_at(first: i64) -> Self {
        Self(AtomicI64::new(first))
    }

    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// What to do about one listed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPlan {
    UpToDate,
    /// Download starting at `position`; `checksum` is the CRC32 of the
    /// bytes already held (0 for a fresh download)
    Fetch { position: i64, checksum: u32 },
}

impl TransferPlan {
    const FRESH: TransferPlan = TransferPlan::Fetch {
        position: 0,
        checksum: 0,
    };
}

/// Compare a listed file against the local copy and its sidecar.
pub async fn plan_transfer(local: &Path, sidecar: &Path, length: i64, modify_time: i64) -> TransferPlan {
    match fs::metadata(local).await {
        Ok(meta) if meta.is_file() => {
            let mtime = meta.modified().map(unix_millis).ok();
            if meta.len() as i64 == length && mtime == Some(modify_time) {
                TransferPlan::UpToDate
            } else {
                TransferPlan::FRESH
            }
        }
        Ok(_) => TransferPlan::FRESH,
        Err(_) => {
            if fs::metadata(sidecar).await.is_err() {
                return TransferPlan::FRESH;
            }
            match sidecar::resume_point(sidecar).await {
                Ok(Some((position, checksum))) => TransferPlan::Fetch { position, checksum },
                Ok(None) => {
                    warn!("No valid resume marker in {}, restarting", sidecar.display());
                    TransferPlan::FRESH
                }
                Err(e) => {
                    warn!("Cannot read {}: {:#}, restarting", sidecar.display(), e);
                    TransferPlan::FRESH
                }
            }
        }
    }
}

/// Result of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Started { request_id: i64 },
    OutsideWindow,
    /// Previous cycle still has outstanding responses
    Busy,
    NotReady,
}

/// Path of a listed file relative to the target's remote folder.
fn strip_folder<'a>(folder: &str, path: &'a str) -> &'a str {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        return path;
    }
    path.strip_prefix(folder)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(path)
}

struct Target {
    settings: TargetSettings,
    ledger: Arc<FlowLedger>,
    /// A cycle was started and has not been reported complete
    active: AtomicBool,
}

#[derive(Debug, Clone)]
struct Transfer {
    target: usize,
    remote_path: String,
    local: PathBuf,
    sidecar: PathBuf,
    requested_position: i64,
    retries: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub cycles_started: u64,
    pub files_synced: u64,
    pub files_failed: u64,
    pub bytes_received: u64,
}

pub struct SyncEngine {
    client_id: String,
    targets: Vec<Target>,
    pending: Mutex<HashMap<i64, Transfer>>,
    listings: Mutex<HashMap<i64, usize>>,
    ids: RequestIds,
    chunk_retry_limit: u32,
    events: mpsc::UnboundedSender<ClientEvent>,
    cycles_started: AtomicU64,
    files_synced: AtomicU64,
    files_failed: AtomicU64,
    bytes_received: AtomicU64,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SyncEngine {
    pub fn new(settings: &ClientSettings, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        let ttl = settings.ledger_ttl();
        let targets = settings
            .targets
            .iter()
            .cloned()
            .map(|settings| Target {
                settings,
                ledger: Arc::new(FlowLedger::new(ttl)),
                active: AtomicBool::new(false),
            })
            .collect();

        Self {
            client_id: settings.client_id.clone(),
            targets,
            pending: Mutex::new(HashMap::new()),
            listings: Mutex::new(HashMap::new()),
            ids: RequestIds::default(),
            chunk_retry_limit: settings.chunk_retry_limit,
            events,
            cycles_started: AtomicU64::new(0),
            files_synced: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn next_request_id(&self) -> i64 {
        self.ids.next()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn target(&self, index: usize) -> Option<&TargetSettings> {
        self.targets.get(index).map(|t| &t.settings)
    }

    pub fn ledger(&self, index: usize) -> Option<Arc<FlowLedger>> {
        self.targets.get(index).map(|t| t.ledger.clone())
    }

    pub fn pending_transfers(&self) -> usize {
        locked(&self.pending).len()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            cycles_started: self.cycles_started.load(Ordering::Relaxed),
            files_synced: self.files_synced.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Forget all in-flight work. Called when the session goes away; the
    /// sidecars stay on disk and the next cycle resumes from them.
    pub fn reset(&self) {
        locked(&self.pending).clear();
        locked(&self.listings).clear();
        for target in &self.targets {
            target.ledger.clear();
            target.active.store(false, Ordering::Release);
        }
    }

    fn emit(&self, event: ClientEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Cycle start
    // =========================================================================

    pub async fn try_cycle(&self, session: &SessionHandle, index: usize) -> Result<CycleOutcome> {
        self.try_cycle_at(session, index, chrono::Local::now().naive_local())
            .await
    }

    /// Gate on window, session state and ledger; then purge and list.
    pub async fn try_cycle_at(
        &self,
        session: &SessionHandle,
        index: usize,
        now: NaiveDateTime,
    ) -> Result<CycleOutcome> {
        let target = self
            .targets
            .get(index)
            .with_context(|| format!("No sync target #{}", index))?;

        if !target.settings.window.contains(now) {
            return Ok(CycleOutcome::OutsideWindow);
        }
        if session.state() != SessionState::Ready {
            return Ok(CycleOutcome::NotReady);
        }
        if !target.ledger.is_empty() {
            debug!(
                folder = %target.settings.remote_folder,
                outstanding = target.ledger.len(),
                "Previous cycle still running, skipping tick"
            );
            return Ok(CycleOutcome::Busy);
        }

        if let Some(days) = target.settings.retention_days {
            self.run_retention(&target.settings, days).await;
        }

        let id = self.ids.next();
        target.active.store(true, Ordering::Release);
        locked(&self.listings).insert(id, index);
        target.ledger.increase(id, 1);

        let request = FileListRequest {
            header: RequestHeader::new(self.client_id.clone(), id),
            folder: target.settings.remote_folder.clone(),
            days_before: target.settings.days_before,
        };
        if let Err(e) = session.send(request).await {
            locked(&self.listings).remove(&id);
            target.ledger.remove(id);
            target.active.store(false, Ordering::Release);
            return Err(e).context("Failed to send file list request");
        }

        self.cycles_started.fetch_add(1, Ordering::Relaxed);
        info!(folder = %target.settings.remote_folder, request_id = id, "Sync cycle started");
        Ok(CycleOutcome::Started { request_id: id })
    }

    async fn run_retention(&self, target: &TargetSettings, days: u32) {
        let root = target.local_root.clone();
        let purged =
            tokio::task::spawn_blocking(move || purge_older_than(&root, days, SystemTime::now()))
                .await;
        match purged {
            Ok(Ok(stats)) if stats.files_removed > 0 || stats.dirs_removed > 0 => {
                info!(
                    root = %target.local_root.display(),
                    files = stats.files_removed,
                    dirs = stats.dirs_removed,
                    bytes = stats.bytes_freed,
                    "Retention purge"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Retention failed for {}: {:#}", target.local_root.display(), e),
            Err(e) => warn!("Retention task failed: {}", e),
        }
    }

    fn check_cycle_complete(&self, index: usize) {
        let Some(target) = self.targets.get(index) else {
            return;
        };
        if target.ledger.is_empty() && target.active.swap(false, Ordering::AcqRel) {
            info!(folder = %target.settings.remote_folder, "Sync cycle complete");
            self.emit(ClientEvent::CycleComplete {
                folder: target.settings.remote_folder.clone(),
            });
        }
    }

    // =========================================================================
    // Responses
    // =========================================================================

    /// Route a sync response. Returns false for messages this engine does
    /// not handle.
    pub async fn handle(&self, session: &SessionHandle, message: Message) -> Result<bool> {
        match message {
            Message::FileListInfoResponse(m) => self.on_list_info(m),
            Message::FileListDetailResponse(m) => self.on_list_detail(session, m).await?,
            Message::FileContentInfoResponse(m) => self.on_content_info(session, m).await?,
            Message::FileContentDetailResponse(m) => self.on_content_detail(session, m).await?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn listing_target(&self, id: i64) -> Option<usize> {
        locked(&self.listings).get(&id).copied()
    }

    fn end_listing(&self, id: i64, index: usize) {
        locked(&self.listings).remove(&id);
        self.targets[index].ledger.remove(id);
        self.check_cycle_complete(index);
    }

    fn on_list_info(&self, m: FileListInfoResponse) {
        let id = m.header.request_id;
        let Some(index) = self.listing_target(id) else {
            debug!(request_id = id, "Listing info for unknown request");
            return;
        };

        if !m.header.error.is_ok() {
            warn!(folder = %m.folder, error = ?m.header.error, "Server refused listing");
            self.emit(ClientEvent::Error(format!(
                "listing {} failed: {:?}",
                m.folder, m.header.error
            )));
            self.end_listing(id, index);
            return;
        }

        info!(folder = %m.folder, count = m.count, total_size = m.total_size, "Listing received");
        let ledger = &self.targets[index].ledger;
        ledger.increase(id, m.count);
        ledger.decrease(id, 1);
        if m.count <= 0 || m.header.latest {
            self.end_listing(id, index);
        }
    }

    async fn on_list_detail(&self, session: &SessionHandle, m: FileListDetailResponse) -> Result<()> {
        let id = m.header.request_id;
        let Some(index) = self.listing_target(id) else {
            debug!(request_id = id, "Listing detail for unknown request");
            return Ok(());
        };

        let sent = if m.header.error.is_ok() {
            self.start_transfer(session, index, &m).await
        } else {
            warn!(path = %m.path, error = ?m.header.error, "Listing detail carries an error");
            Ok(())
        };

        self.targets[index].ledger.decrease(id, 1);
        if m.header.latest {
            self.end_listing(id, index);
        } else {
            self.check_cycle_complete(index);
        }
        sent
    }

    async fn start_transfer(
        &self,
        session: &SessionHandle,
        index: usize,
        m: &FileListDetailResponse,
    ) -> Result<()> {
        let target = &self.targets[index];
        let relative = strip_folder(&target.settings.remote_folder, &m.path);
        let local = match resolve_under(&target.settings.local_root, relative, false) {
            Ok(p) => p,
            Err(e) => {
                warn!("Skipping unsafe path from server: {}", e);
                self.emit(ClientEvent::Error(e.to_string()));
                return Ok(());
            }
        };
        let sidecar = sidecar_path(&local);

        let (position, checksum) =
            match plan_transfer(&local, &sidecar, m.length, m.modify_time).await {
                TransferPlan::UpToDate => {
                    debug!(path = %m.path, "Up to date");
                    return Ok(());
                }
                TransferPlan::Fetch { position, checksum } => (position, checksum),
            };

        let tid = self.ids.next();
        locked(&self.pending).insert(
            tid,
            Transfer {
                target: index,
                remote_path: m.path.clone(),
                local,
                sidecar,
                requested_position: position,
                retries: 0,
            },
        );
        target.ledger.increase(tid, 1);

        if position > 0 {
            info!(path = %m.path, position, "Resuming download");
        } else {
            debug!(path = %m.path, length = m.length, "Downloading");
        }

        let request = FileContentInfoRequest {
            header: RequestHeader::new(self.client_id.clone(), tid),
            path: m.path.clone(),
            position,
            checksum,
        };
        // Posted: this runs on the dispatcher while the server may still be
        // streaming the listing at us.
        if let Err(e) = session.post(request) {
            locked(&self.pending).remove(&tid);
            target.ledger.remove(tid);
            return Err(e).context("Failed to send content info request");
        }
        Ok(())
    }

    fn transfer(&self, id: i64) -> Option<Transfer> {
        locked(&self.pending).get(&id).cloned()
    }

    fn request_chunk(&self, session: &SessionHandle, id: i64, path: &str, position: i64) -> Result<()> {
        let request = FileContentDetailRequest {
            header: RequestHeader::new(self.client_id.clone(), id),
            path: path.to_string(),
            position,
        };
        session
            .post(request)
            .context("Failed to send content detail request")
    }

    async fn on_content_info(&self, session: &SessionHandle, m: FileContentInfoResponse) -> Result<()> {
        let id = m.header.request_id;
        let Some(transfer) = self.transfer(id) else {
            debug!(request_id = id, "Content info for unknown transfer");
            return Ok(());
        };
        self.targets[transfer.target].ledger.touch(id);

        match m.kind {
            ContentKind::Content if m.header.error.is_ok() => {
                if m.position == 0 {
                    if transfer.requested_position > 0 {
                        info!(path = %m.path, "Resume rejected by server, restarting");
                    }
                    if let Err(e) = sidecar::discard(&transfer.sidecar).await {
                        warn!("{:#}", e);
                    }
                }
                debug!(
                    path = %m.path,
                    position = m.position,
                    total_size = m.total_size,
                    chunks = m.chunk_count,
                    "Transfer negotiated"
                );
                self.request_chunk(session, id, &transfer.remote_path, m.position)
            }
            kind => {
                self.apply_terminal(id, &transfer, kind, m.header.error, m.modify_time)
                    .await;
                Ok(())
            }
        }
    }

    async fn on_content_detail(
        &self,
        session: &SessionHandle,
        m: FileContentDetailResponse,
    ) -> Result<()> {
        let id = m.header.request_id;
        let Some(transfer) = self.transfer(id) else {
            debug!(request_id = id, "Content chunk for unknown transfer");
            return Ok(());
        };
        // A long download stays in the ledger as long as chunks keep coming.
        self.targets[transfer.target].ledger.touch(id);

        if m.kind != ContentKind::Content || !m.header.error.is_ok() {
            self.apply_terminal(id, &transfer, m.kind, m.header.error, m.modify_time)
                .await;
            return Ok(());
        }

        match self.store_chunk(&transfer, &m).await {
            Ok(true) => {
                info!(path = %transfer.remote_path, size = m.total_size, "File synced");
                self.resolve(id, &transfer, Ok(m.total_size));
                Ok(())
            }
            Ok(false) => {
                if let Some(t) = locked(&self.pending).get_mut(&id) {
                    t.retries = 0;
                }
                let next = m.position + m.data.len() as i64;
                self.request_chunk(session, id, &transfer.remote_path, next)
            }
            Err(e) => {
                let retries = match locked(&self.pending).get_mut(&id) {
                    Some(t) => {
                        t.retries += 1;
                        t.retries
                    }
                    None => return Ok(()),
                };
                if self.chunk_retry_limit > 0 && retries > self.chunk_retry_limit {
                    warn!(path = %transfer.remote_path, retries, "Giving up: {:#}", e);
                    self.resolve(
                        id,
                        &transfer,
                        Err(format!(
                            "{}: giving up after {} retries: {:#}",
                            transfer.remote_path, self.chunk_retry_limit, e
                        )),
                    );
                    return Ok(());
                }
                // A chunk that does not continue the sidecar is asked for
                // again from where the sidecar really ends.
                let position = e
                    .downcast_ref::<sidecar::Misaligned>()
                    .map_or(m.position, |gap| gap.confirmed);
                warn!(
                    path = %transfer.remote_path,
                    position,
                    retries,
                    "Chunk rejected, requesting again: {:#}",
                    e
                );
                self.request_chunk(session, id, &transfer.remote_path, position)
            }
        }
    }

    /// Verify and write one chunk. Returns true once the file is complete.
    async fn store_chunk(&self, transfer: &Transfer, m: &FileContentDetailResponse) -> Result<bool> {
        let actual = checksum(&m.data);
        if actual != m.data_checksum {
            anyhow::bail!(
                "chunk checksum mismatch at {}: expected {:08x}, got {:08x}",
                m.position,
                m.data_checksum,
                actual
            );
        }

        let last = m.is_final();
        sidecar::write_chunk(&transfer.sidecar, m.position, &m.data, last).await?;
        self.bytes_received
            .fetch_add(m.data.len() as u64, Ordering::Relaxed);

        if last {
            sidecar::finalize(&transfer.sidecar, &transfer.local, m.total_size, m.modify_time)
                .await?;
        }
        Ok(last)
    }

    /// Content kinds that end a transfer without data.
    async fn apply_terminal(
        &self,
        id: i64,
        transfer: &Transfer,
        kind: ContentKind,
        error: ResponseError,
        modify_time: i64,
    ) {
        let outcome = match kind {
            ContentKind::Empty if error.is_ok() => {
                write_empty(&transfer.local, modify_time)
                    .await
                    .map(|()| 0)
                    .map_err(Some)
            }
            ContentKind::FileDeleted => match remove_local(&transfer.local).await {
                Ok(()) => {
                    info!(path = %transfer.remote_path, "Deleted on server");
                    self.emit(ClientEvent::Information(format!(
                        "{} no longer exists on the server",
                        transfer.remote_path
                    )));
                    Err(None)
                }
                Err(e) => Err(Some(e)),
            },
            _ => {
                warn!(path = %transfer.remote_path, ?error, "Server could not read file");
                Err(Some(anyhow::anyhow!(
                    "server could not read {}: {:?}",
                    transfer.remote_path,
                    error
                )))
            }
        };

        if let Err(e) = sidecar::discard(&transfer.sidecar).await {
            warn!("{:#}", e);
        }

        match outcome {
            Ok(size) => self.resolve(id, transfer, Ok(size)),
            // resolved without a synced file
            Err(None) => self.finish(id, transfer),
            Err(Some(e)) => self.resolve(id, transfer, Err(format!("{:#}", e))),
        }
    }

    fn resolve(&self, id: i64, transfer: &Transfer, outcome: std::result::Result<i64, String>) {
        match outcome {
            Ok(size) => {
                self.files_synced.fetch_add(1, Ordering::Relaxed);
                self.emit(ClientEvent::FileSynced {
                    folder: self.targets[transfer.target].settings.remote_folder.clone(),
                    path: transfer.remote_path.clone(),
                    size,
                });
            }
            Err(message) => {
                self.files_failed.fetch_add(1, Ordering::Relaxed);
                self.emit(ClientEvent::Error(message));
            }
        }
        self.finish(id, transfer);
    }

    fn finish(&self, id: i64, transfer: &Transfer) {
        locked(&self.pending).remove(&id);
        self.targets[transfer.target].ledger.remove(id);
        self.check_cycle_complete(transfer.target);
    }
}

async fn write_empty(local: &Path, modify_time: i64) -> Result<()> {
    if let Some(parent) = local.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::File::create(local)
        .await
        .with_context(|| format!("Failed to create {}", local.display()))?;
    filetime::set_file_mtime(local, filetime_from_millis(modify_time))
        .with_context(|| format!("Failed to set mtime on {}", local.display()))?;
    Ok(())
}

async fn remove_local(local: &Path) -> Result<()> {
    match fs::remove_file(local).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", local.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseHeader;
    use crate::session::{self, MessageHandler, SessionConfig};
    use crate::sync::sidecar::{read_marker, write_chunk};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{duplex, split};

    #[derive(Default)]
    struct Sink(std::sync::Mutex<Vec<Message>>);

    #[async_trait]
    impl MessageHandler for Sink {
        async fn on_message(&self, _s: &SessionHandle, m: Message) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(m);
            Ok(())
        }
    }

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn on_message(&self, _s: &SessionHandle, _m: Message) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        engine: SyncEngine,
        client: SessionHandle,
        _server: SessionHandle,
        sink: Arc<Sink>,
        events: mpsc::UnboundedReceiver<ClientEvent>,
    }

    impl Harness {
        fn new(targets: Vec<TargetSettings>, retry_limit: u32) -> Self {
            Self::with_settings(ClientSettings {
                client_id: "c1".to_string(),
                chunk_retry_limit: retry_limit,
                targets,
                ..Default::default()
            })
        }

        fn with_settings(settings: ClientSettings) -> Self {
            let (a, b) = duplex(1 << 20);
            let (ar, aw) = split(a);
            let (br, bw) = split(b);
            let sink = Arc::new(Sink::default());
            let client = session::spawn(ar, aw, "client", SessionConfig::default(), Arc::new(Noop));
            let server = session::spawn(br, bw, "server", SessionConfig::default(), sink.clone());

            let (tx, events) = mpsc::unbounded_channel();
            Self {
                engine: SyncEngine::new(&settings, tx),
                client,
                _server: server,
                sink,
                events,
            }
        }

        async fn requests(&self, n: usize) -> Vec<Message> {
            for _ in 0..300 {
                let got = self.sink.0.lock().unwrap().clone();
                if got.len() >= n {
                    return got;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("expected {} requests", n);
        }

        async fn feed(&self, m: impl Into<Message>) {
            assert!(self.engine.handle(&self.client, m.into()).await.unwrap());
        }

        /// Answer the content info request `tid` with `Content` from `position`.
        async fn accept(&self, tid: i64, path: &str, position: i64, total: i64) {
            self.feed(FileContentInfoResponse {
                header: reply(tid, true),
                path: path.to_string(),
                position,
                checksum: 0,
                total_size: total,
                chunk_count: 1,
                chunk_size: 3,
                modify_time: 1_650_000_000_000,
                kind: ContentKind::Content,
            })
            .await;
        }

        fn drain_events(&mut self) -> Vec<ClientEvent> {
            let mut out = Vec::new();
            while let Ok(e) = self.events.try_recv() {
                out.push(e);
            }
            out
        }

        /// Start a cycle and announce `count` files. Returns the listing id.
        async fn listing(&self, count: i64) -> i64 {
            self.client.set_state(SessionState::Ready);
            let id = match self.engine.try_cycle(&self.client, 0).await.unwrap() {
                CycleOutcome::Started { request_id } => request_id,
                other => panic!("cycle not started: {:?}", other),
            };
            self.feed(FileListInfoResponse {
                header: reply(id, count == 0),
                folder: "docs".to_string(),
                count,
                total_size: 0,
            })
            .await;
            id
        }
    }

    fn reply(id: i64, latest: bool) -> ResponseHeader {
        ResponseHeader::reply_to(&RequestHeader::new("c1", id)).with_latest(latest)
    }

    fn detail(id: i64, path: &str, length: i64, mtime: i64, latest: bool) -> FileListDetailResponse {
        FileListDetailResponse {
            header: reply(id, latest),
            folder: "docs".to_string(),
            path: path.to_string(),
            create_time: mtime,
            access_time: mtime,
            modify_time: mtime,
            length,
            checksum: 0,
        }
    }

    fn chunk(id: i64, path: &str, position: i64, data: &'static [u8], total: i64) -> FileContentDetailResponse {
        FileContentDetailResponse {
            header: reply(id, true),
            path: path.to_string(),
            position,
            data: Bytes::from_static(data),
            data_checksum: checksum(data),
            total_size: total,
            modify_time: 1_650_000_000_000,
            kind: ContentKind::Content,
        }
    }

    fn target(root: &Path) -> TargetSettings {
        TargetSettings::new("docs", root)
    }

    fn last_request_id(messages: &[Message]) -> i64 {
        messages.last().and_then(Message::request_id).unwrap()
    }

    #[test]
    fn test_strip_folder() {
        assert_eq!(strip_folder("docs", "docs/a/b.txt"), "a/b.txt");
        assert_eq!(strip_folder("/docs/", "docs/a.txt"), "a.txt");
        assert_eq!(strip_folder("", "docs/a.txt"), "docs/a.txt");
        assert_eq!(strip_folder("docs", "documents/a.txt"), "documents/a.txt");
    }

    #[test]
    fn test_request_ids_increase() {
        let ids = RequestIds::default();
        let a = ids.next();
        let b = ids.next();
        assert!(a > 0);
        assert_eq!(b, a + 1);
    }

    #[tokio::test]
    async fn test_plan_transfer_decisions() {
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("f.txt");
        let side = sidecar_path(&local);

        assert_eq!(plan_transfer(&local, &side, 5, 0).await, TransferPlan::FRESH);

        write_chunk(&side, 0, b"hello", false).await.unwrap();
        assert_eq!(
            plan_transfer(&local, &side, 50, 0).await,
            TransferPlan::Fetch {
                position: 5,
                checksum: checksum(b"hello")
            }
        );

        std::fs::write(&side, b"garbage without marker").unwrap();
        assert_eq!(plan_transfer(&local, &side, 50, 0).await, TransferPlan::FRESH);

        std::fs::write(&local, b"12345").unwrap();
        filetime::set_file_mtime(&local, filetime_from_millis(1_000_123)).unwrap();
        assert_eq!(
            plan_transfer(&local, &side, 5, 1_000_123).await,
            TransferPlan::UpToDate
        );
        assert_eq!(plan_transfer(&local, &side, 6, 1_000_123).await, TransferPlan::FRESH);
        assert_eq!(plan_transfer(&local, &side, 5, 1_000_124).await, TransferPlan::FRESH);
    }

    #[tokio::test]
    async fn test_cycle_gating() {
        let temp = TempDir::new().unwrap();
        let mut windowed = target(temp.path());
        windowed.window.start_time = chrono::NaiveTime::from_hms_opt(8, 0, 0);
        windowed.window.end_time = chrono::NaiveTime::from_hms_opt(9, 0, 0);
        let h = Harness::new(vec![target(temp.path()), windowed], 0);

        assert_eq!(
            h.engine.try_cycle(&h.client, 0).await.unwrap(),
            CycleOutcome::NotReady
        );
        h.client.set_state(SessionState::Ready);

        let noon = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(
            h.engine.try_cycle_at(&h.client, 1, noon).await.unwrap(),
            CycleOutcome::OutsideWindow
        );

        let id = match h.engine.try_cycle(&h.client, 0).await.unwrap() {
            CycleOutcome::Started { request_id } => request_id,
            other => panic!("{:?}", other),
        };
        let ledger = h.engine.ledger(0).unwrap();
        assert_eq!(ledger.count(id), Some(1));
        assert_eq!(
            h.engine.try_cycle(&h.client, 0).await.unwrap(),
            CycleOutcome::Busy
        );

        let sent = h.requests(1).await;
        match &sent[0] {
            Message::FileListRequest(r) => {
                assert_eq!(r.header.request_id, id);
                assert_eq!(r.folder, "docs");
                assert_eq!(r.days_before, 0);
            }
            other => panic!("{:?}", other),
        }
        assert!(h.engine.try_cycle(&h.client, 9).await.is_err());
    }

    #[tokio::test]
    async fn test_listing_spawns_transfers() {
        let temp = TempDir::new().unwrap();
        let h = Harness::new(vec![target(temp.path())], 0);
        std::fs::write(temp.path().join("b.txt"), b"same").unwrap();
        filetime::set_file_mtime(temp.path().join("b.txt"), filetime_from_millis(5_000)).unwrap();

        let listing = h.listing(2).await;
        let ledger = h.engine.ledger(0).unwrap();
        assert_eq!(ledger.count(listing), Some(2));

        h.feed(detail(listing, "docs/a.txt", 3, 5_000, false)).await;
        let sent = h.requests(2).await;
        match &sent[1] {
            Message::FileContentInfoRequest(r) => {
                assert_eq!(r.path, "docs/a.txt");
                assert_eq!(r.position, 0);
                assert_eq!(r.checksum, 0);
                assert_ne!(r.header.request_id, listing);
            }
            other => panic!("{:?}", other),
        }
        assert_eq!(ledger.count(listing), Some(1));

        h.feed(detail(listing, "docs/b.txt", 4, 5_000, true)).await;
        assert_eq!(ledger.count(listing), None);
        assert_eq!(ledger.len(), 1);
        assert_eq!(h.engine.pending_transfers(), 1);
    }

    #[tokio::test]
    async fn test_chunks_written_and_finalized() {
        let temp = TempDir::new().unwrap();
        let mut h = Harness::new(vec![target(temp.path())], 0);

        let listing = h.listing(1).await;
        h.feed(detail(listing, "docs/sub/f.bin", 6, 0, true)).await;
        let tid = last_request_id(&h.requests(2).await);

        h.feed(FileContentInfoResponse {
            header: reply(tid, true),
            path: "docs/sub/f.bin".to_string(),
            position: 0,
            checksum: 0,
            total_size: 6,
            chunk_count: 2,
            chunk_size: 3,
            modify_time: 1_650_000_000_000,
            kind: ContentKind::Content,
        })
        .await;
        let sent = h.requests(3).await;
        assert!(matches!(&sent[2], Message::FileContentDetailRequest(r) if r.position == 0));

        h.feed(chunk(tid, "docs/sub/f.bin", 0, b"abc", 6)).await;
        let side = temp.path().join("sub/f.bin.sync");
        assert_eq!(read_marker(&side).await.unwrap(), Some(3));
        let sent = h.requests(4).await;
        assert!(matches!(&sent[3], Message::FileContentDetailRequest(r) if r.position == 3));

        h.feed(chunk(tid, "docs/sub/f.bin", 3, b"def", 6)).await;
        let local = temp.path().join("sub/f.bin");
        assert_eq!(std::fs::read(&local).unwrap(), b"abcdef");
        assert!(!side.exists());
        assert_eq!(
            unix_millis(std::fs::metadata(&local).unwrap().modified().unwrap()),
            1_650_000_000_000
        );
        assert!(h.engine.ledger(0).unwrap().is_empty());

        let events = h.drain_events();
        assert!(events.contains(&ClientEvent::FileSynced {
            folder: "docs".to_string(),
            path: "docs/sub/f.bin".to_string(),
            size: 6,
        }));
        assert_eq!(
            events.last(),
            Some(&ClientEvent::CycleComplete {
                folder: "docs".to_string()
            })
        );
        assert_eq!(h.engine.stats().files_synced, 1);
        assert_eq!(h.engine.stats().bytes_received, 6);
    }

    #[tokio::test]
    async fn test_corrupt_chunk_retried_then_abandoned() {
        let temp = TempDir::new().unwrap();
        let mut h = Harness::new(vec![target(temp.path())], 2);

        let listing = h.listing(1).await;
        h.feed(detail(listing, "docs/x", 3, 0, true)).await;
        let tid = last_request_id(&h.requests(2).await);

        let mut bad = chunk(tid, "docs/x", 0, b"xyz", 3);
        bad.data_checksum ^= 1;

        h.feed(bad.clone()).await;
        h.feed(bad.clone()).await;
        let sent = h.requests(4).await;
        for m in &sent[2..4] {
            assert!(matches!(m, Message::FileContentDetailRequest(r) if r.position == 0));
        }
        assert_eq!(h.engine.pending_transfers(), 1);

        h.feed(bad).await;
        assert_eq!(h.engine.pending_transfers(), 0);
        assert!(h.engine.ledger(0).unwrap().is_empty());
        assert!(!temp.path().join("x").exists());
        let events = h.drain_events();
        assert!(events.iter().any(|e| matches!(e, ClientEvent::Error(m) if m.contains("giving up"))));
        assert_eq!(h.engine.stats().files_failed, 1);
    }

    fn last_detail_position(messages: &[Message]) -> i64 {
        match messages.last() {
            Some(Message::FileContentDetailRequest(r)) => r.position,
            other => panic!("expected a detail request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_accepted_resume_continues_at_offset() {
        let temp = TempDir::new().unwrap();
        let h = Harness::new(vec![target(temp.path())], 0);
        let side = temp.path().join("res.bin.sync");
        write_chunk(&side, 0, b"hello", false).await.unwrap();

        let listing = h.listing(1).await;
        h.feed(detail(listing, "docs/res.bin", 8, 0, true)).await;
        let sent = h.requests(2).await;
        let tid = match &sent[1] {
            Message::FileContentInfoRequest(r) => {
                assert_eq!(r.position, 5);
                assert_eq!(r.checksum, checksum(b"hello"));
                r.header.request_id
            }
            other => panic!("{:?}", other),
        };

        h.accept(tid, "docs/res.bin", 5, 8).await;
        assert!(side.exists());
        assert_eq!(last_detail_position(&h.requests(3).await), 5);

        h.feed(chunk(tid, "docs/res.bin", 5, b"abc", 8)).await;
        assert_eq!(std::fs::read(temp.path().join("res.bin")).unwrap(), b"helloabc");
        assert_eq!(h.engine.stats().bytes_received, 3);
    }

    #[tokio::test]
    async fn test_stale_chunk_is_requested_from_confirmed_offset() {
        let temp = TempDir::new().unwrap();
        let h = Harness::new(vec![target(temp.path())], 0);

        let listing = h.listing(1).await;
        h.feed(detail(listing, "docs/s.bin", 6, 0, true)).await;
        let tid = last_request_id(&h.requests(2).await);
        h.accept(tid, "docs/s.bin", 0, 6).await;
        assert_eq!(last_detail_position(&h.requests(3).await), 0);

        // a final chunk that skips the start must not produce a file
        h.feed(chunk(tid, "docs/s.bin", 3, b"def", 6)).await;
        assert_eq!(last_detail_position(&h.requests(4).await), 0);
        assert!(!temp.path().join("s.bin").exists());
        assert!(!temp.path().join("s.bin.sync").exists());
        assert_eq!(h.engine.pending_transfers(), 1);

        h.feed(chunk(tid, "docs/s.bin", 0, b"abc", 6)).await;
        assert_eq!(last_detail_position(&h.requests(5).await), 3);
        h.feed(chunk(tid, "docs/s.bin", 3, b"def", 6)).await;
        assert_eq!(std::fs::read(temp.path().join("s.bin")).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_slow_download_keeps_cycle_busy() {
        let temp = TempDir::new().unwrap();
        let h = Harness::with_settings(ClientSettings {
            client_id: "c1".to_string(),
            ledger_ttl_secs: 1,
            targets: vec![target(temp.path())],
            ..Default::default()
        });

        let listing = h.listing(1).await;
        h.feed(detail(listing, "docs/slow.bin", 9, 0, true)).await;
        let tid = last_request_id(&h.requests(2).await);
        h.accept(tid, "docs/slow.bin", 0, 9).await;

        h.feed(chunk(tid, "docs/slow.bin", 0, b"abc", 9)).await;
        tokio::time::sleep(Duration::from_millis(700)).await;
        h.feed(chunk(tid, "docs/slow.bin", 3, b"def", 9)).await;
        tokio::time::sleep(Duration::from_millis(700)).await;

        // started 1.4 s ago with a 1 s ttl, but chunks kept arriving
        assert_eq!(
            h.engine.try_cycle(&h.client, 0).await.unwrap(),
            CycleOutcome::Busy
        );

        h.feed(chunk(tid, "docs/slow.bin", 6, b"ghi", 9)).await;
        assert_eq!(std::fs::read(temp.path().join("slow.bin")).unwrap(), b"abcdefghi");
        assert!(h.engine.ledger(0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsafe_path_is_skipped() {
        let temp = TempDir::new().unwrap();
        let mut h = Harness::new(vec![target(&temp.path().join("mirror"))], 0);

        let listing = h.listing(1).await;
        h.feed(detail(listing, "docs/../../escape.txt", 3, 0, true)).await;

        assert_eq!(h.engine.pending_transfers(), 0);
        assert!(h.engine.ledger(0).unwrap().is_empty());
        let events = h.drain_events();
        assert!(matches!(events.first(), Some(ClientEvent::Error(_))));
        // only the listing request went out
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_and_empty_sources() {
        let temp = TempDir::new().unwrap();
        let mut h = Harness::new(vec![target(temp.path())], 0);
        std::fs::write(temp.path().join("gone.txt"), b"stale").unwrap();
        std::fs::write(temp.path().join("empty.txt"), b"not empty yet").unwrap();

        let listing = h.listing(2).await;
        h.feed(detail(listing, "docs/gone.txt", 9, 0, false)).await;
        h.feed(detail(listing, "docs/empty.txt", 0, 77_000, true)).await;
        let sent = h.requests(3).await;
        let gone_id = sent[1].request_id().unwrap();
        let empty_id = sent[2].request_id().unwrap();

        let terminal = |id: i64, path: &str, kind: ContentKind| FileContentInfoResponse {
            header: reply(id, true),
            path: path.to_string(),
            position: 0,
            checksum: 0,
            total_size: 0,
            chunk_count: 0,
            chunk_size: 0,
            modify_time: 77_000,
            kind,
        };
        h.feed(terminal(gone_id, "docs/gone.txt", ContentKind::FileDeleted)).await;
        h.feed(terminal(empty_id, "docs/empty.txt", ContentKind::Empty)).await;

        assert!(!temp.path().join("gone.txt").exists());
        let empty = temp.path().join("empty.txt");
        assert_eq!(std::fs::metadata(&empty).unwrap().len(), 0);
        assert_eq!(
            unix_millis(std::fs::metadata(&empty).unwrap().modified().unwrap()),
            77_000
        );

        let events = h.drain_events();
        assert!(events.iter().any(|e| matches!(e, ClientEvent::Information(_))));
        assert!(events.contains(&ClientEvent::CycleComplete {
            folder: "docs".to_string()
        }));
    }

    #[tokio::test]
    async fn test_reset_clears_in_flight_work() {
        let temp = TempDir::new().unwrap();
        let h = Harness::new(vec![target(temp.path())], 0);
        let listing = h.listing(3).await;
        h.feed(detail(listing, "docs/a", 1, 0, false)).await;
        assert!(!h.engine.ledger(0).unwrap().is_empty());

        h.engine.reset();
        assert!(h.engine.ledger(0).unwrap().is_empty());
        assert_eq!(h.engine.pending_transfers(), 0);
        // late responses for forgotten ids are ignored
        h.feed(detail(listing, "docs/b", 1, 0, true)).await;
        assert_eq!(h.engine.pending_transfers(), 0);
    }
}
