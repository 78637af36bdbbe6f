//! Protocol records and their body codec.
//!
//! Body layout: `kind:u8`, then the header, then the variant's own fields in
//! declaration order. Requests carry `client_id, request_id`; responses carry
//! `client_id, request_id, flags:u8, error:u8`.

use bytes::Bytes;

use super::kind::{ContentKind, MessageKind, ResponseError, ResponseFlags, PROTOCOL_VERSION};
use crate::wire::{FrameError, WireReader, WireWriter};

type DecodeResult<T> = std::result::Result<T, FrameError>;

/// Per-variant codec. Each record knows its kind and how to write and read
/// the fields that follow the kind byte.
pub trait WireMessage: Sized {
    const KIND: MessageKind;

    fn encode_body(&self, w: &mut WireWriter);

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self>;
}

// =============================================================================
// Headers
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub client_id: String,
    /// Correlation token chosen by the caller, increasing per caller
    pub request_id: i64,
}

impl RequestHeader {
    pub fn new(client_id: impl Into<String>, request_id: i64) -> Self {
        Self {
            client_id: client_id.into(),
            request_id,
        }
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.client_id);
        w.put_i64(self.request_id);
    }

    fn decode(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            client_id: r.get_str("client_id")?,
            request_id: r.get_i64("request_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    pub client_id: String,
    pub request_id: i64,
    /// No more responses follow for `request_id`
    pub latest: bool,
    pub error: ResponseError,
}

impl ResponseHeader {
    /// Final, successful reply to `request`.
    pub fn reply_to(request: &RequestHeader) -> Self {
        Self {
            client_id: request.client_id.clone(),
            request_id: request.request_id,
            latest: true,
            error: ResponseError::None,
        }
    }

    pub fn with_error(mut self, error: ResponseError) -> Self {
        self.error = error;
        self
    }

    pub fn with_latest(mut self, latest: bool) -> Self {
        self.latest = latest;
        self
    }

    fn encode(&self, w: &mut WireWriter) {
        let mut flags = ResponseFlags::empty();
        if self.latest {
            flags |= ResponseFlags::LATEST;
        }
        w.put_str(&self.client_id);
        w.put_i64(self.request_id);
        w.put_u8(flags.bits());
        w.put_u8(self.error as u8);
    }

    fn decode(r: &mut WireReader) -> DecodeResult<Self> {
        let client_id = r.get_str("client_id")?;
        let request_id = r.get_i64("request_id")?;
        let flags = ResponseFlags::from_bits_truncate(r.get_u8("flags")?);
        let raw_error = r.get_u8("error")?;
        let error = ResponseError::from_u8(raw_error).ok_or(FrameError::InvalidValue {
            field: "error",
            value: raw_error,
        })?;
        Ok(Self {
            client_id,
            request_id,
            latest: flags.contains(ResponseFlags::LATEST),
            error,
        })
    }
}

fn get_content_kind(r: &mut WireReader) -> DecodeResult<ContentKind> {
    let raw = r.get_u8("content kind")?;
    ContentKind::from_u8(raw).ok_or(FrameError::InvalidValue {
        field: "content kind",
        value: raw,
    })
}

// =============================================================================
// HANDSHAKE (0x01)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub client_id: String,
    pub version: i32,
    pub client_name: String,
}

impl Handshake {
    pub fn new(client_id: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            version: PROTOCOL_VERSION,
            client_name: client_name.into(),
        }
    }
}

impl WireMessage for Handshake {
    const KIND: MessageKind = MessageKind::Handshake;

    fn encode_body(&self, w: &mut WireWriter) {
        w.put_str(&self.client_id);
        w.put_i32(self.version);
        w.put_str(&self.client_name);
    }

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            client_id: r.get_str("client_id")?,
            version: r.get_i32("version")?,
            client_name: r.get_str("client_name")?,
        })
    }
}

// =============================================================================
// AUTHENTICATE (0x02 / 0x03)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateRequest {
    pub header: RequestHeader,
    pub user: String,
    pub password: String,
}

impl WireMessage for AuthenticateRequest {
    const KIND: MessageKind = MessageKind::AuthenticateRequest;

    fn encode_body(&self, w: &mut WireWriter) {
        self.header.encode(w);
        w.put_str(&self.user);
        w.put_str(&self.password);
    }

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            header: RequestHeader::decode(r)?,
            user: r.get_str("user")?,
            password: r.get_str("password")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateResponse {
    pub header: ResponseHeader,
    pub session_name: String,
}

impl WireMessage for AuthenticateResponse {
    const KIND: MessageKind = MessageKind::AuthenticateResponse;

    fn encode_body(&self, w: &mut WireWriter) {
        self.header.encode(w);
        w.put_str(&self.session_name);
    }

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            header: ResponseHeader::decode(r)?,
            session_name: r.get_str("session_name")?,
        })
    }
}

// =============================================================================
// FILE_LIST (0x04 / 0x05 / 0x06)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListRequest {
    pub header: RequestHeader,
    /// Folder relative to the served root
    pub folder: String,
    /// Only list files created within this many days; `<= 0` lists everything
    pub days_before: i32,
}

impl WireMessage for FileListRequest {
    const KIND: MessageKind = MessageKind::FileListRequest;

    fn encode_body(&self, w: &mut WireWriter) {
        self.header.encode(w);
        w.put_str(&self.folder);
        w.put_i32(self.days_before);
    }

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            header: RequestHeader::decode(r)?,
            folder: r.get_str("folder")?,
            days_before: r.get_i32("days_before")?,
        })
    }
}

/// Aggregate of a listing: how many detail responses follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListInfoResponse {
    pub header: ResponseHeader,
    pub folder: String,
    pub count: i64,
    pub total_size: i64,
}

impl WireMessage for FileListInfoResponse {
    const KIND: MessageKind = MessageKind::FileListInfoResponse;

    fn encode_body(&self, w: &mut WireWriter) {
        self.header.encode(w);
        w.put_str(&self.folder);
        w.put_i64(self.count);
        w.put_i64(self.total_size);
    }

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            header: ResponseHeader::decode(r)?,
            folder: r.get_str("folder")?,
            count: r.get_i64("count")?,
            total_size: r.get_i64("total_size")?,
        })
    }
}

/// One file of a listing. Times are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListDetailResponse {
    pub header: ResponseHeader,
    pub folder: String,
    /// Path relative to the served root, `/`-separated
    pub path: String,
    pub create_time: i64,
    pub access_time: i64,
    pub modify_time: i64,
    pub length: i64,
    /// CRC32 of the whole file, 0 when the server does not compute it
    pub checksum: u32,
}

impl WireMessage for FileListDetailResponse {
    const KIND: MessageKind = MessageKind::FileListDetailResponse;

    fn encode_body(&self, w: &mut WireWriter) {
        self.header.encode(w);
        w.put_str(&self.folder);
        w.put_str(&self.path);
        w.put_i64(self.create_time);
        w.put_i64(self.access_time);
        w.put_i64(self.modify_time);
        w.put_i64(self.length);
        w.put_u32(self.checksum);
    }

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            header: ResponseHeader::decode(r)?,
            folder: r.get_str("folder")?,
            path: r.get_str("path")?,
            create_time: r.get_i64("create_time")?,
            access_time: r.get_i64("access_time")?,
            modify_time: r.get_i64("modify_time")?,
            length: r.get_i64("length")?,
            checksum: r.get_u32("checksum")?,
        })
    }
}

// =============================================================================
// FILE_CONTENT_INFO (0x07 / 0x08)
// =============================================================================

/// Resume negotiation: "I hold `position` bytes whose CRC32 is `checksum`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContentInfoRequest {
    pub header: RequestHeader,
    pub path: String,
    pub position: i64,
    pub checksum: u32,
}

impl WireMessage for FileContentInfoRequest {
    const KIND: MessageKind = MessageKind::FileContentInfoRequest;

    fn encode_body(&self, w: &mut WireWriter) {
        self.header.encode(w);
        w.put_str(&self.path);
        w.put_i64(self.position);
        w.put_u32(self.checksum);
    }

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            header: RequestHeader::decode(r)?,
            path: r.get_str("path")?,
            position: r.get_i64("position")?,
            checksum: r.get_u32("checksum")?,
        })
    }
}

/// Server's answer to a resume negotiation. `position` is where the
/// transfer starts; 0 when the client's checksum did not match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContentInfoResponse {
    pub header: ResponseHeader,
    pub path: String,
    pub position: i64,
    pub checksum: u32,
    pub total_size: i64,
    pub chunk_count: i64,
    pub chunk_size: i32,
    pub modify_time: i64,
    pub kind: ContentKind,
}

impl WireMessage for FileContentInfoResponse {
    const KIND: MessageKind = MessageKind::FileContentInfoResponse;

    fn encode_body(&self, w: &mut WireWriter) {
        self.header.encode(w);
        w.put_str(&self.path);
        w.put_i64(self.position);
        w.put_u32(self.checksum);
        w.put_i64(self.total_size);
        w.put_i64(self.chunk_count);
        w.put_i32(self.chunk_size);
        w.put_i64(self.modify_time);
        w.put_u8(self.kind as u8);
    }

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            header: ResponseHeader::decode(r)?,
            path: r.get_str("path")?,
            position: r.get_i64("position")?,
            checksum: r.get_u32("checksum")?,
            total_size: r.get_i64("total_size")?,
            chunk_count: r.get_i64("chunk_count")?,
            chunk_size: r.get_i32("chunk_size")?,
            modify_time: r.get_i64("modify_time")?,
            kind: get_content_kind(r)?,
        })
    }
}

// =============================================================================
// FILE_CONTENT_DETAIL (0x09 / 0x0A)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContentDetailRequest {
    pub header: RequestHeader,
    pub path: String,
    pub position: i64,
}

impl WireMessage for FileContentDetailRequest {
    const KIND: MessageKind = MessageKind::FileContentDetailRequest;

    fn encode_body(&self, w: &mut WireWriter) {
        self.header.encode(w);
        w.put_str(&self.path);
        w.put_i64(self.position);
    }

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            header: RequestHeader::decode(r)?,
            path: r.get_str("path")?,
            position: r.get_i64("position")?,
        })
    }
}

/// One chunk of file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContentDetailResponse {
    pub header: ResponseHeader,
    pub path: String,
    pub position: i64,
    pub data: Bytes,
    /// CRC32 of `data`
    pub data_checksum: u32,
    /// Size of the whole source file
    pub total_size: i64,
    pub modify_time: i64,
    pub kind: ContentKind,
}

impl FileContentDetailResponse {
    /// Whether this chunk completes the file.
    pub fn is_final(&self) -> bool {
        self.position + self.data.len() as i64 >= self.total_size
    }
}

impl WireMessage for FileContentDetailResponse {
    const KIND: MessageKind = MessageKind::FileContentDetailResponse;

    fn encode_body(&self, w: &mut WireWriter) {
        self.header.encode(w);
        w.put_str(&self.path);
        w.put_i64(self.position);
        w.put_blob(&self.data);
        w.put_u32(self.data_checksum);
        w.put_i64(self.total_size);
        w.put_i64(self.modify_time);
        w.put_u8(self.kind as u8);
    }

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            header: ResponseHeader::decode(r)?,
            path: r.get_str("path")?,
            position: r.get_i64("position")?,
            data: r.get_blob("data")?,
            data_checksum: r.get_u32("data_checksum")?,
            total_size: r.get_i64("total_size")?,
            modify_time: r.get_i64("modify_time")?,
            kind: get_content_kind(r)?,
        })
    }
}

// =============================================================================
// FOLDER_LIST (0x0B / 0x0C)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderListRequest {
    pub header: RequestHeader,
    pub path: String,
}

impl WireMessage for FolderListRequest {
    const KIND: MessageKind = MessageKind::FolderListRequest;

    fn encode_body(&self, w: &mut WireWriter) {
        self.header.encode(w);
        w.put_str(&self.path);
    }

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            header: RequestHeader::decode(r)?,
            path: r.get_str("path")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderListResponse {
    pub header: ResponseHeader,
    pub path: String,
    /// Child directory names joined with `;`
    pub folders: String,
}

impl FolderListResponse {
    pub const SEPARATOR: char = ';';

    pub fn join_names<S: AsRef<str>>(names: &[S]) -> String {
        names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn folder_names(&self) -> Vec<&str> {
        self.folders
            .split(Self::SEPARATOR)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl WireMessage for FolderListResponse {
    const KIND: MessageKind = MessageKind::FolderListResponse;

    fn encode_body(&self, w: &mut WireWriter) {
        self.header.encode(w);
        w.put_str(&self.path);
        w.put_str(&self.folders);
    }

    fn decode_body(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            header: ResponseHeader::decode(r)?,
            path: r.get_str("path")?,
            folders: r.get_str("folders")?,
        })
    }
}

// =============================================================================
// Message
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    AuthenticateRequest(AuthenticateRequest),
    AuthenticateResponse(AuthenticateResponse),
    FileListRequest(FileListRequest),
    FileListInfoResponse(FileListInfoResponse),
    FileListDetailResponse(FileListDetailResponse),
    FileContentInfoRequest(FileContentInfoRequest),
    FileContentInfoResponse(FileContentInfoResponse),
    FileContentDetailRequest(FileContentDetailRequest),
    FileContentDetailResponse(FileContentDetailResponse),
    FolderListRequest(FolderListRequest),
    FolderListResponse(FolderListResponse),
}

fn encode_as<T: WireMessage>(msg: &T) -> Bytes {
    let mut w = WireWriter::with_capacity(64);
    w.put_u8(T::KIND as u8);
    msg.encode_body(&mut w);
    w.freeze()
}

fn decode_as<T: WireMessage>(r: &mut WireReader) -> DecodeResult<T> {
    T::decode_body(r)
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Handshake(_) => MessageKind::Handshake,
            Message::AuthenticateRequest(_) => MessageKind::AuthenticateRequest,
            Message::AuthenticateResponse(_) => MessageKind::AuthenticateResponse,
            Message::FileListRequest(_) => MessageKind::FileListRequest,
            Message::FileListInfoResponse(_) => MessageKind::FileListInfoResponse,
            Message::FileListDetailResponse(_) => MessageKind::FileListDetailResponse,
            Message::FileContentInfoRequest(_) => MessageKind::FileContentInfoRequest,
            Message::FileContentInfoResponse(_) => MessageKind::FileContentInfoResponse,
            Message::FileContentDetailRequest(_) => MessageKind::FileContentDetailRequest,
            Message::FileContentDetailResponse(_) => MessageKind::FileContentDetailResponse,
            Message::FolderListRequest(_) => MessageKind::FolderListRequest,
            Message::FolderListResponse(_) => MessageKind::FolderListResponse,
        }
    }

    /// Serialize to the body that gets split into frames.
    pub fn encode(&self) -> Bytes {
        match self {
            Message::Handshake(m) => encode_as(m),
            Message::AuthenticateRequest(m) => encode_as(m),
            Message::AuthenticateResponse(m) => encode_as(m),
            Message::FileListRequest(m) => encode_as(m),
            Message::FileListInfoResponse(m) => encode_as(m),
            Message::FileListDetailResponse(m) => encode_as(m),
            Message::FileContentInfoRequest(m) => encode_as(m),
            Message::FileContentInfoResponse(m) => encode_as(m),
            Message::FileContentDetailRequest(m) => encode_as(m),
            Message::FileContentDetailResponse(m) => encode_as(m),
            Message::FolderListRequest(m) => encode_as(m),
            Message::FolderListResponse(m) => encode_as(m),
        }
    }

    /// Parse a reassembled body. Unknown kinds and leftover bytes are errors.
    pub fn decode(body: Bytes) -> DecodeResult<Self> {
        let mut r = WireReader::new(body);
        let raw = r.get_u8("kind")?;
        let kind = MessageKind::from_u8(raw).ok_or(FrameError::UnknownKind(raw))?;

        let msg = match kind {
            MessageKind::Handshake => Message::Handshake(decode_as(&mut r)?),
            MessageKind::AuthenticateRequest => Message::AuthenticateRequest(decode_as(&mut r)?),
            MessageKind::AuthenticateResponse => {
                Message::AuthenticateResponse(decode_as(&mut r)?)
            }
            MessageKind::FileListRequest => Message::FileListRequest(decode_as(&mut r)?),
            MessageKind::FileListInfoResponse => {
                Message::FileListInfoResponse(decode_as(&mut r)?)
            }
            MessageKind::FileListDetailResponse => {
                Message::FileListDetailResponse(decode_as(&mut r)?)
            }
            MessageKind::FileContentInfoRequest => {
                Message::FileContentInfoRequest(decode_as(&mut r)?)
            }
            MessageKind::FileContentInfoResponse => {
                Message::FileContentInfoResponse(decode_as(&mut r)?)
            }
            MessageKind::FileContentDetailRequest => {
                Message::FileContentDetailRequest(decode_as(&mut r)?)
            }
            MessageKind::FileContentDetailResponse => {
                Message::FileContentDetailResponse(decode_as(&mut r)?)
            }
            MessageKind::FolderListRequest => Message::FolderListRequest(decode_as(&mut r)?),
            MessageKind::FolderListResponse => Message::FolderListResponse(decode_as(&mut r)?),
        };

        r.finish()?;
        Ok(msg)
    }

    pub fn client_id(&self) -> &str {
        match self {
            Message::Handshake(m) => &m.client_id,
            _ => {
                if let Some(h) = self.request_header() {
                    &h.client_id
                } else if let Some(h) = self.response_header() {
                    &h.client_id
                } else {
                    ""
                }
            }
        }
    }

    pub fn request_header(&self) -> Option<&RequestHeader> {
        match self {
            Message::AuthenticateRequest(m) => Some(&m.header),
            Message::FileListRequest(m) => Some(&m.header),
            Message::FileContentInfoRequest(m) => Some(&m.header),
            Message::FileContentDetailRequest(m) => Some(&m.header),
            Message::FolderListRequest(m) => Some(&m.header),
            _ => None,
        }
    }

    pub fn response_header(&self) -> Option<&ResponseHeader> {
        match self {
            Message::AuthenticateResponse(m) => Some(&m.header),
            Message::FileListInfoResponse(m) => Some(&m.header),
            Message::FileListDetailResponse(m) => Some(&m.header),
            Message::FileContentInfoResponse(m) => Some(&m.header),
            Message::FileContentDetailResponse(m) => Some(&m.header),
            Message::FolderListResponse(m) => Some(&m.header),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<i64> {
        self.request_header()
            .map(|h| h.request_id)
            .or_else(|| self.response_header().map(|h| h.request_id))
    }
}

macro_rules! impl_from_variant {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(m: $variant) -> Self {
                    Message::$variant(m)
                }
            }
        )*
    };
}

impl_from_variant!(
    Handshake,
    AuthenticateRequest,
    AuthenticateResponse,
    FileListRequest,
    FileListInfoResponse,
    FileListDetailResponse,
    FileContentInfoRequest,
    FileContentInfoResponse,
    FileContentDetailRequest,
    FileContentDetailResponse,
    FolderListRequest,
    FolderListResponse,
);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: i64) -> RequestHeader {
        RequestHeader::new("client-1", id)
    }

    fn resp(id: i64) -> ResponseHeader {
        ResponseHeader::reply_to(&req(id))
    }

    fn roundtrip(msg: Message) {
        let encoded = msg.encode();
        assert_eq!(encoded[0], msg.kind() as u8);
        let decoded = Message::decode(encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    fn samples() -> Vec<Message> {
        let long_path = "d/".repeat(2048) + "file.bin";
        vec![
            Handshake::new("client-1", "workstation").into(),
            Handshake::new("", "").into(),
            AuthenticateRequest {
                header: req(1),
                user: "alice".to_string(),
                password: "s3cr3t;with;separators".to_string(),
            }
            .into(),
            AuthenticateResponse {
                header: resp(1).with_error(ResponseError::AuthenticationFailed),
                session_name: String::new(),
            }
            .into(),
            FileListRequest {
                header: req(2),
                folder: "docs".to_string(),
                days_before: 0,
            }
            .into(),
            FileListInfoResponse {
                header: resp(2).with_latest(false),
                folder: "docs".to_string(),
                count: 3,
                total_size: 51_010,
            }
            .into(),
            FileListDetailResponse {
                header: resp(2),
                folder: "docs".to_string(),
                path: long_path.clone(),
                create_time: 1_700_000_000_000,
                access_time: -1,
                modify_time: 1_700_000_123_456,
                length: i64::MAX,
                checksum: 0xCAFEBABE,
            }
            .into(),
            FileContentInfoRequest {
                header: req(3),
                path: "docs/c.txt".to_string(),
                position: 1000,
                checksum: 0x12345678,
            }
            .into(),
            FileContentInfoResponse {
                header: resp(3),
                path: "docs/c.txt".to_string(),
                position: 0,
                checksum: 0,
                total_size: 4096,
                chunk_count: 1,
                chunk_size: 65536,
                modify_time: 42,
                kind: ContentKind::Content,
            }
            .into(),
            FileContentDetailRequest {
                header: req(3),
                path: "docs/ünïcode.txt".to_string(),
                position: 65536,
            }
            .into(),
            FileContentDetailResponse {
                header: resp(3),
                path: "docs/c.txt".to_string(),
                position: 0,
                data: Bytes::from_static(b"hello world"),
                data_checksum: crate::wire::checksum(b"hello world"),
                total_size: 11,
                modify_time: 42,
                kind: ContentKind::Content,
            }
            .into(),
            FileContentDetailResponse {
                header: resp(4).with_error(ResponseError::PositionOutOfRange),
                path: "gone".to_string(),
                position: 9,
                data: Bytes::new(),
                data_checksum: 0,
                total_size: 0,
                modify_time: 0,
                kind: ContentKind::FileReadError,
            }
            .into(),
            FolderListRequest {
                header: req(5),
                path: String::new(),
            }
            .into(),
            FolderListResponse {
                header: resp(5),
                path: String::new(),
                folders: "a;b;c".to_string(),
            }
            .into(),
        ]
    }

    #[test]
    fn test_every_variant_roundtrips() {
        for msg in samples() {
            roundtrip(msg);
        }
    }

    #[test]
    fn test_unknown_kind() {
        let err = Message::decode(Bytes::from_static(&[0x7f, 0, 0])).unwrap_err();
        assert_eq!(err, FrameError::UnknownKind(0x7f));
    }

    #[test]
    fn test_empty_body() {
        assert!(matches!(
            Message::decode(Bytes::new()),
            Err(FrameError::Truncated { field: "kind", .. })
        ));
    }

    #[test]
    fn test_truncated_body() {
        let full: Message = FileContentDetailRequest {
            header: req(9),
            path: "x".to_string(),
            position: 7,
        }
        .into();
        let encoded = full.encode();
        let cut = encoded.slice(..encoded.len() - 3);
        assert!(matches!(
            Message::decode(cut),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_trailing_garbage() {
        let msg: Message = FolderListRequest {
            header: req(1),
            path: "p".to_string(),
        }
        .into();
        let mut raw = msg.encode().to_vec();
        raw.push(0);
        assert_eq!(
            Message::decode(Bytes::from(raw)),
            Err(FrameError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_invalid_content_kind() {
        let msg: Message = FileContentInfoResponse {
            header: resp(3),
            path: "p".to_string(),
            position: 0,
            checksum: 0,
            total_size: 0,
            chunk_count: 0,
            chunk_size: 0,
            modify_time: 0,
            kind: ContentKind::Empty,
        }
        .into();
        let mut raw = msg.encode().to_vec();
        *raw.last_mut().unwrap() = 99;
        assert_eq!(
            Message::decode(Bytes::from(raw)),
            Err(FrameError::InvalidValue {
                field: "content kind",
                value: 99
            })
        );
    }

    #[test]
    fn test_header_accessors() {
        let msg: Message = FileListInfoResponse {
            header: resp(77).with_latest(false),
            folder: String::new(),
            count: 0,
            total_size: 0,
        }
        .into();
        assert_eq!(msg.request_id(), Some(77));
        assert_eq!(msg.client_id(), "client-1");
        assert!(!msg.response_header().unwrap().latest);
        assert!(msg.request_header().is_none());

        let hs: Message = Handshake::new("c9", "host").into();
        assert_eq!(hs.request_id(), None);
        assert_eq!(hs.client_id(), "c9");
    }

    #[test]
    fn test_folder_names() {
        let resp = FolderListResponse {
            header: resp(1),
            path: String::new(),
            folders: FolderListResponse::join_names(&["alpha", "beta"]),
        };
        assert_eq!(resp.folders, "alpha;beta");
        assert_eq!(resp.folder_names(), vec!["alpha", "beta"]);

        let empty = FolderListResponse {
            folders: String::new(),
            ..resp
        };
        assert!(empty.folder_names().is_empty());
    }

    #[test]
    fn test_detail_is_final() {
        let mut chunk = FileContentDetailResponse {
            header: resp(1),
            path: "f".to_string(),
            position: 0,
            data: Bytes::from_static(&[0; 10]),
            data_checksum: 0,
            total_size: 20,
            modify_time: 0,
            kind: ContentKind::Content,
        };
        assert!(!chunk.is_final());
        chunk.position = 10;
        assert!(chunk.is_final());
    }
}
