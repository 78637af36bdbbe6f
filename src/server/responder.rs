//! Answers listing, content and folder requests from the served root.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::paths::{plain_walk, resolve_under, to_wire_path};
use crate::protocol::{
    AuthenticateResponse, ContentKind, FileContentDetailRequest, FileContentDetailResponse,
    FileContentInfoRequest, FileContentInfoResponse, FileListDetailResponse,
    FileListInfoResponse, FileListRequest, FolderListRequest, FolderListResponse, Message,
    RequestHeader, ResponseError, ResponseHeader,
};
use crate::session::SessionHandle;
use crate::sync::sidecar::{checksum_prefix, is_sidecar};
use crate::sync::unix_millis;
use crate::wire::checksum;

/// One regular file found by a listing walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedFile {
    /// Relative to the served root, `/`-separated
    pub path: String,
    pub length: i64,
    pub create_time: i64,
    pub access_time: i64,
    pub modify_time: i64,
}

fn millis_or_zero(t: std::io::Result<SystemTime>) -> i64 {
    t.map(unix_millis).unwrap_or(0)
}

/// Blocking walk of `dir`. Sidecars are skipped; with `days_before > 0`
/// only files created (or, lacking a birth time, modified) since then.
pub fn scan_files(root: &Path, dir: &Path, days_before: i32, now: SystemTime) -> Vec<ListedFile> {
    let cutoff = (days_before > 0).then(|| {
        now.checked_sub(Duration::from_secs(days_before as u64 * 86_400))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    });

    let mut files = Vec::new();
    for entry in plain_walk(dir) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Listing walk error: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) || is_sidecar(entry.path()) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("Cannot stat {}: {}", entry.path().display(), e);
                continue;
            }
        };

        let created = meta.created().or_else(|_| meta.modified());
        if let Some(cutoff) = cutoff {
            match &created {
                Ok(t) if *t >= cutoff => {}
                _ => continue,
            }
        }

        let Some(path) = to_wire_path(root, entry.path()) else {
            continue;
        };
        files.push(ListedFile {
            path,
            length: meta.len() as i64,
            create_time: millis_or_zero(created),
            access_time: millis_or_zero(meta.accessed()),
            modify_time: millis_or_zero(meta.modified()),
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

/// Error response matching the kind of `request`, or `None` for messages
/// that are not requests.
pub fn refuse(request: &Message, error: ResponseError) -> Option<Message> {
    let header = |h: &RequestHeader| ResponseHeader::reply_to(h).with_error(error);
    let response: Message = match request {
        Message::AuthenticateRequest(r) => AuthenticateResponse {
            header: header(&r.header),
            session_name: String::new(),
        }
        .into(),
        Message::FileListRequest(r) => FileListInfoResponse {
            header: header(&r.header),
            folder: r.folder.clone(),
            count: 0,
            total_size: 0,
        }
        .into(),
        Message::FileContentInfoRequest(r) => FileContentInfoResponse {
            header: header(&r.header),
            path: r.path.clone(),
            position: 0,
            checksum: 0,
            total_size: 0,
            chunk_count: 0,
            chunk_size: 0,
            modify_time: 0,
            kind: ContentKind::FileReadError,
        }
        .into(),
        Message::FileContentDetailRequest(r) => FileContentDetailResponse {
            header: header(&r.header),
            path: r.path.clone(),
            position: r.position,
            data: Bytes::new(),
            data_checksum: 0,
            total_size: 0,
            modify_time: 0,
            kind: ContentKind::FileReadError,
        }
        .into(),
        Message::FolderListRequest(r) => FolderListResponse {
            header: header(&r.header),
            path: r.path.clone(),
            folders: String::new(),
        }
        .into(),
        _ => return None,
    };
    Some(response)
}

/// State of a requested file.
enum Source {
    Missing,
    Unreadable(ResponseError),
    File { size: i64, modify_time: i64, path: PathBuf },
}

pub struct ContentResponder {
    root: PathBuf,
    chunk_size: usize,
}

impl ContentResponder {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            root: root.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Answer one authenticated request.
    pub async fn respond(&self, session: &SessionHandle, message: Message) -> Result<()> {
        match message {
            Message::FileListRequest(r) => {
                for response in self.listing(&r).await {
                    session.send(response).await?;
                }
            }
            Message::FileContentInfoRequest(r) => {
                session.send(self.content_info(&r).await).await?;
            }
            Message::FileContentDetailRequest(r) => {
                session.send(self.content_detail(&r).await).await?;
            }
            Message::FolderListRequest(r) => {
                session.send(self.folder_list(&r).await).await?;
            }
            other => {
                if let Some(refusal) = refuse(&other, ResponseError::Unsupported) {
                    session.send(refusal).await?;
                } else {
                    debug!(kind = ?other.kind(), "Ignoring message");
                }
            }
        }
        Ok(())
    }

    /// Info response followed by one detail per file, all under the
    /// request's id.
    pub async fn listing(&self, r: &FileListRequest) -> Vec<Message> {
        let refuse_with = |error| {
            let msg: Message = FileListInfoResponse {
                header: ResponseHeader::reply_to(&r.header).with_error(error),
                folder: r.folder.clone(),
                count: 0,
                total_size: 0,
            }
            .into();
            vec![msg]
        };

        let dir = match resolve_under(&self.root, &r.folder, true) {
            Ok(d) => d,
            Err(e) => {
                warn!("Rejected listing: {}", e);
                return refuse_with(ResponseError::InvalidPath);
            }
        };
        if !fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return refuse_with(ResponseError::NotFound);
        }

        let root = self.root.clone();
        let days_before = r.days_before;
        let files = match tokio::task::spawn_blocking(move || {
            scan_files(&root, &dir, days_before, SystemTime::now())
        })
        .await
        {
            Ok(files) => files,
            Err(e) => {
                warn!("Listing task failed: {}", e);
                return refuse_with(ResponseError::ReadFailed);
            }
        };

        let count = files.len();
        let total_size: i64 = files.iter().map(|f| f.length).sum();
        debug!(folder = %r.folder, count, total_size, "Listing");

        let mut out = Vec::with_capacity(count + 1);
        out.push(
            FileListInfoResponse {
                header: ResponseHeader::reply_to(&r.header).with_latest(count == 0),
                folder: r.folder.clone(),
                count: count as i64,
                total_size,
            }
            .into(),
        );
        for (i, f) in files.into_iter().enumerate() {
            out.push(
                FileListDetailResponse {
                    header: ResponseHeader::reply_to(&r.header).with_latest(i + 1 == count),
                    folder: r.folder.clone(),
                    path: f.path,
                    create_time: f.create_time,
                    access_time: f.access_time,
                    modify_time: f.modify_time,
                    length: f.length,
                    checksum: 0,
                }
                .into(),
            );
        }
        out
    }

    async fn source(&self, relative: &str) -> Source {
        let path = match resolve_under(&self.root, relative, false) {
            Ok(p) => p,
            Err(e) => {
                warn!("Rejected content request: {}", e);
                return Source::Unreadable(ResponseError::InvalidPath);
            }
        };
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Source::File {
                size: meta.len() as i64,
                modify_time: millis_or_zero(meta.modified()),
                path,
            },
            Ok(_) => Source::Missing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Source::Missing,
            Err(e) => {
                warn!("Cannot stat {}: {}", path.display(), e);
                Source::Unreadable(ResponseError::ReadFailed)
            }
        }
    }

    /// Resume negotiation: keep the client's position only if the CRC32 of
    /// our first `position` bytes matches what the client holds.
    pub async fn content_info(&self, r: &FileContentInfoRequest) -> FileContentInfoResponse {
        let mut response = FileContentInfoResponse {
            header: ResponseHeader::reply_to(&r.header),
            path: r.path.clone(),
            position: 0,
            checksum: 0,
            total_size: 0,
            chunk_count: 0,
            chunk_size: self.chunk_size as i32,
            modify_time: 0,
            kind: ContentKind::Content,
        };

        let (size, modify_time, path) = match self.source(&r.path).await {
            Source::Missing => {
                response.kind = ContentKind::FileDeleted;
                return response;
            }
            Source::Unreadable(error) => {
                response.header = response.header.with_error(error);
                response.kind = ContentKind::FileReadError;
                return response;
            }
            Source::File {
                size,
                modify_time,
                path,
            } => (size, modify_time, path),
        };
        response.total_size = size;
        response.modify_time = modify_time;
        if size == 0 {
            response.kind = ContentKind::Empty;
            return response;
        }

        let mut position = r.position;
        if position < 0 || position > size {
            position = 0;
        }
        if position > 0 {
            match checksum_prefix(&path, position as u64).await {
                Ok(crc) if crc == r.checksum => response.checksum = crc,
                Ok(_) => {
                    debug!(path = %r.path, position, "Resume checksum mismatch");
                    position = 0;
                }
                Err(e) => {
                    warn!("{:#}", e);
                    position = 0;
                }
            }
        }

        let chunk = self.chunk_size as i64;
        response.position = position;
        response.chunk_count = (size - position + chunk - 1) / chunk;
        response
    }

    /// One chunk starting at the requested position.
    pub async fn content_detail(&self, r: &FileContentDetailRequest) -> FileContentDetailResponse {
        let mut response = FileContentDetailResponse {
            header: ResponseHeader::reply_to(&r.header),
            path: r.path.clone(),
            position: r.position,
            data: Bytes::new(),
            data_checksum: 0,
            total_size: 0,
            modify_time: 0,
            kind: ContentKind::Content,
        };

        let (size, modify_time, path) = match self.source(&r.path).await {
            Source::Missing => {
                response.kind = ContentKind::FileDeleted;
                return response;
            }
            Source::Unreadable(error) => {
                response.header = response.header.with_error(error);
                response.kind = ContentKind::FileReadError;
                return response;
            }
            Source::File {
                size,
                modify_time,
                path,
            } => (size, modify_time, path),
        };
        response.total_size = size;
        response.modify_time = modify_time;

        if size == 0 {
            response.kind = ContentKind::Empty;
            return response;
        }
        if r.position < 0 || r.position > size {
            response.header = response.header.with_error(ResponseError::PositionOutOfRange);
            response.kind = ContentKind::FileReadError;
            return response;
        }

        let want = (self.chunk_size as i64).min(size - r.position) as usize;
        match read_at(&path, r.position as u64, want).await {
            Ok(data) => {
                response.data_checksum = checksum(&data);
                response.data = data;
            }
            Err(e) => {
                warn!("{:#}", e);
                response.header = response.header.with_error(ResponseError::ReadFailed);
                response.kind = ContentKind::FileReadError;
            }
        }
        response
    }

    /// Immediate child directories of the requested path, sorted.
    pub async fn folder_list(&self, r: &FolderListRequest) -> FolderListResponse {
        let mut response = FolderListResponse {
            header: ResponseHeader::reply_to(&r.header),
            path: r.path.clone(),
            folders: String::new(),
        };

        let dir = match resolve_under(&self.root, &r.path, true) {
            Ok(d) => d,
            Err(e) => {
                warn!("Rejected folder list: {}", e);
                response.header = response.header.with_error(ResponseError::InvalidPath);
                return response;
            }
        };

        match child_dirs(&dir).await {
            Ok(names) => response.folders = FolderListResponse::join_names(&names),
            Err(e) => {
                debug!("Folder list of {} failed: {:#}", dir.display(), e);
                response.header = response.header.with_error(ResponseError::NotFound);
            }
        }
        response
    }
}

async fn read_at(path: &Path, position: u64, len: usize) -> Result<Bytes> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.seek(SeekFrom::Start(position)).await?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    // the file may shrink underneath us
    while filled < len {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

async fn child_dirs(dir: &Path) -> Result<Vec<String>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::filetime_from_millis;
    use tempfile::TempDir;

    fn req(id: i64) -> RequestHeader {
        RequestHeader::new("c1", id)
    }

    fn fixture() -> (TempDir, ContentResponder) {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("docs/nested")).unwrap();
        std::fs::create_dir_all(root.join("other")).unwrap();
        std::fs::write(root.join("docs/a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("docs/nested/b.bin"), vec![7u8; 2500]).unwrap();
        std::fs::write(root.join("docs/empty"), b"").unwrap();
        std::fs::write(root.join("docs/partial.bin.sync"), b"ignored").unwrap();
        std::fs::write(root.join("other/c.txt"), b"c").unwrap();
        filetime::set_file_mtime(root.join("docs/a.txt"), filetime_from_millis(1_234_000)).unwrap();
        let responder = ContentResponder::new(root, 1000);
        (temp, responder)
    }

    #[tokio::test]
    async fn test_listing_order_and_latest() {
        let (_temp, responder) = fixture();
        let out = responder
            .listing(&FileListRequest {
                header: req(5),
                folder: "docs".to_string(),
                days_before: 0,
            })
            .await;

        assert_eq!(out.len(), 4);
        match &out[0] {
            Message::FileListInfoResponse(info) => {
                assert_eq!(info.count, 3);
                assert_eq!(info.total_size, 2505);
                assert!(!info.header.latest);
            }
            other => panic!("{:?}", other),
        }
        let details: Vec<&FileListDetailResponse> = out[1..]
            .iter()
            .map(|m| match m {
                Message::FileListDetailResponse(d) => d,
                other => panic!("{:?}", other),
            })
            .collect();
        let paths: Vec<&str> = details.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["docs/a.txt", "docs/empty", "docs/nested/b.bin"]);
        assert!(details.iter().all(|d| d.header.request_id == 5));
        assert_eq!(
            details.iter().map(|d| d.header.latest).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(details[0].modify_time, 1_234_000);
    }

    #[tokio::test]
    async fn test_listing_root_and_missing() {
        let (_temp, responder) = fixture();
        let all = responder
            .listing(&FileListRequest {
                header: req(1),
                folder: String::new(),
                days_before: 0,
            })
            .await;
        assert_eq!(all.len(), 5);

        let missing = responder
            .listing(&FileListRequest {
                header: req(2),
                folder: "nope".to_string(),
                days_before: 0,
            })
            .await;
        assert_eq!(missing.len(), 1);
        assert_eq!(
            missing[0].response_header().unwrap().error,
            ResponseError::NotFound
        );

        let escape = responder
            .listing(&FileListRequest {
                header: req(3),
                folder: "../".to_string(),
                days_before: 0,
            })
            .await;
        assert_eq!(
            escape[0].response_header().unwrap().error,
            ResponseError::InvalidPath
        );
    }

    #[test]
    fn test_scan_days_before_filters_old_files() {
        let (temp, _responder) = fixture();
        let future = SystemTime::now() + Duration::from_secs(10 * 86_400);
        let files = scan_files(temp.path(), temp.path(), 1, future);
        assert!(files.is_empty());
        let files = scan_files(temp.path(), temp.path(), 0, future);
        assert_eq!(files.len(), 4);
    }

    #[tokio::test]
    async fn test_content_info_resume_negotiation() {
        let (_temp, responder) = fixture();
        let path = "docs/nested/b.bin".to_string();

        let fresh = responder
            .content_info(&FileContentInfoRequest {
                header: req(1),
                path: path.clone(),
                position: 0,
                checksum: 0,
            })
            .await;
        assert_eq!(fresh.kind, ContentKind::Content);
        assert_eq!(fresh.position, 0);
        assert_eq!(fresh.total_size, 2500);
        assert_eq!(fresh.chunk_count, 3);
        assert_eq!(fresh.chunk_size, 1000);

        let good = responder
            .content_info(&FileContentInfoRequest {
                header: req(2),
                path: path.clone(),
                position: 1000,
                checksum: checksum(&[7u8; 1000]),
            })
            .await;
        assert_eq!(good.position, 1000);
        assert_eq!(good.chunk_count, 2);

        let bad = responder
            .content_info(&FileContentInfoRequest {
                header: req(3),
                path: path.clone(),
                position: 1000,
                checksum: 0xDEAD,
            })
            .await;
        assert_eq!(bad.position, 0);
        assert_eq!(bad.chunk_count, 3);

        let beyond = responder
            .content_info(&FileContentInfoRequest {
                header: req(4),
                path,
                position: 9999,
                checksum: 1,
            })
            .await;
        assert_eq!(beyond.position, 0);
    }

    #[tokio::test]
    async fn test_content_info_special_kinds() {
        let (_temp, responder) = fixture();
        let info = |path: &str| FileContentInfoRequest {
            header: req(1),
            path: path.to_string(),
            position: 0,
            checksum: 0,
        };
        assert_eq!(
            responder.content_info(&info("docs/empty")).await.kind,
            ContentKind::Empty
        );
        assert_eq!(
            responder.content_info(&info("docs/gone")).await.kind,
            ContentKind::FileDeleted
        );
        let escape = responder.content_info(&info("../secret")).await;
        assert_eq!(escape.kind, ContentKind::FileReadError);
        assert_eq!(escape.header.error, ResponseError::InvalidPath);
    }

    #[tokio::test]
    async fn test_content_detail_chunks() {
        let (_temp, responder) = fixture();
        let detail = |position| FileContentDetailRequest {
            header: req(9),
            path: "docs/nested/b.bin".to_string(),
            position,
        };

        let first = responder.content_detail(&detail(0)).await;
        assert_eq!(first.data.len(), 1000);
        assert_eq!(first.data_checksum, checksum(&first.data));
        assert!(!first.is_final());

        let last = responder.content_detail(&detail(2000)).await;
        assert_eq!(last.data.len(), 500);
        assert!(last.is_final());

        let at_end = responder.content_detail(&detail(2500)).await;
        assert_eq!(at_end.kind, ContentKind::Content);
        assert!(at_end.data.is_empty());
        assert!(at_end.is_final());

        let past = responder.content_detail(&detail(2501)).await;
        assert_eq!(past.kind, ContentKind::FileReadError);
        assert_eq!(past.header.error, ResponseError::PositionOutOfRange);
    }

    #[tokio::test]
    async fn test_folder_list() {
        let (_temp, responder) = fixture();
        let root = responder
            .folder_list(&FolderListRequest {
                header: req(1),
                path: String::new(),
            })
            .await;
        assert_eq!(root.folders, "docs;other");

        let leaf = responder
            .folder_list(&FolderListRequest {
                header: req(2),
                path: "docs/nested".to_string(),
            })
            .await;
        assert!(leaf.header.error.is_ok());
        assert!(leaf.folder_names().is_empty());

        let missing = responder
            .folder_list(&FolderListRequest {
                header: req(3),
                path: "nope".to_string(),
            })
            .await;
        assert_eq!(missing.header.error, ResponseError::NotFound);
    }

    #[test]
    fn test_refuse_matches_request_kind() {
        let request: Message = FolderListRequest {
            header: req(4),
            path: "x".to_string(),
        }
        .into();
        let refusal = refuse(&request, ResponseError::NotAuthenticated).unwrap();
        assert!(matches!(refusal, Message::FolderListResponse(_)));
        assert_eq!(refusal.request_id(), Some(4));
        assert_eq!(
            refusal.response_header().unwrap().error,
            ResponseError::NotAuthenticated
        );

        let hs: Message = crate::protocol::Handshake::new("c", "n").into();
        assert!(refuse(&hs, ResponseError::NotAuthenticated).is_none());
    }
}
