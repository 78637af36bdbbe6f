//! Closed enumerations carried in message bodies.

/// Protocol version sent in the handshake.
pub const PROTOCOL_VERSION: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Handshake = 0x01,
    AuthenticateRequest = 0x02,
    AuthenticateResponse = 0x03,
    FileListRequest = 0x04,
    FileListInfoResponse = 0x05,
    FileListDetailResponse = 0x06,
    FileContentInfoRequest = 0x07,
    FileContentInfoResponse = 0x08,
    FileContentDetailRequest = 0x09,
    FileContentDetailResponse = 0x0A,
    FolderListRequest = 0x0B,
    FolderListResponse = 0x0C,
}

impl MessageKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::AuthenticateRequest),
            0x03 => Some(Self::AuthenticateResponse),
            0x04 => Some(Self::FileListRequest),
            0x05 => Some(Self::FileListInfoResponse),
            0x06 => Some(Self::FileListDetailResponse),
            0x07 => Some(Self::FileContentInfoRequest),
            0x08 => Some(Self::FileContentInfoResponse),
            0x09 => Some(Self::FileContentDetailRequest),
            0x0A => Some(Self::FileContentDetailResponse),
            0x0B => Some(Self::FolderListRequest),
            0x0C => Some(Self::FolderListResponse),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::AuthenticateRequest
                | Self::FileListRequest
                | Self::FileContentInfoRequest
                | Self::FileContentDetailRequest
                | Self::FolderListRequest
        )
    }

    pub fn is_response(self) -> bool {
        !self.is_request() && self != Self::Handshake
    }
}

/// What a content response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ContentKind {
    #[default]
    Content = 0,
    /// Source exists with zero length
    Empty = 1,
    /// Source no longer exists
    FileDeleted = 2,
    FileReadError = 3,
}

impl ContentKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Content),
            1 => Some(Self::Empty),
            2 => Some(Self::FileDeleted),
            3 => Some(Self::FileReadError),
            _ => None,
        }
    }
}

/// Error code carried in every response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ResponseError {
    #[default]
    None = 0,
    NotAuthenticated = 1,
    AuthenticationFailed = 2,
    TooManyAttempts = 3,
    NotFound = 4,
    InvalidPath = 5,
    ReadFailed = 6,
    PositionOutOfRange = 7,
    Unsupported = 8,
}

impl ResponseError {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::NotAuthenticated),
            2 => Some(Self::AuthenticationFailed),
            3 => Some(Self::TooManyAttempts),
            4 => Some(Self::NotFound),
            5 => Some(Self::InvalidPath),
            6 => Some(Self::ReadFailed),
            7 => Some(Self::PositionOutOfRange),
            8 => Some(Self::Unsupported),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::None
    }
}

bitflags::bitflags! {
    /// Response header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResponseFlags: u8 {
        /// No more responses follow for this request id
        const LATEST = 1 << 0;
    }
}
