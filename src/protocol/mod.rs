//! Typed protocol records.
//!
//! Every message is a value type: a header embedded by value (plain,
//! [`RequestHeader`] or [`ResponseHeader`]) plus the variant's own fields.
//! Decoding dispatches on the closed [`MessageKind`] enum.

pub mod kind;
pub mod message;

pub use kind::{ContentKind, MessageKind, ResponseError, ResponseFlags, PROTOCOL_VERSION};
pub use message::{
    AuthenticateRequest, AuthenticateResponse, FileContentDetailRequest,
    FileContentDetailResponse, FileContentInfoRequest, FileContentInfoResponse,
    FileListDetailResponse, FileListInfoResponse, FileListRequest, FolderListRequest,
    FolderListResponse, Handshake, Message, RequestHeader, ResponseHeader, WireMessage,
};
