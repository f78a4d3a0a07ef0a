use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A single channel failed to establish.
    ChannelConnect,
    /// Every configured channel exhausted its attempts without one success.
    PoolConnect,
    /// An in-flight packet failed on its channel.
    ChannelTransport,
    /// The connected-channel set became empty.
    PoolDisconnected,
    /// A reserved lifecycle name was pushed through the ordered path.
    ReservedEvent,
    /// Allocating another sequence number would collide with an outstanding one.
    SequenceExhausted,
    InvalidFrame,
    UnexpectedEof,
    /// The pool driver is no longer running.
    Closed,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    detail: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, detail: None }
    }

    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Error {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.kind {
            ErrorKind::ChannelConnect => "Channel failed to connect",
            ErrorKind::PoolConnect => "No channel in the pool could connect",
            ErrorKind::ChannelTransport => "Channel transport error",
            ErrorKind::PoolDisconnected => "Pool disconnected",
            ErrorKind::ReservedEvent => "Reserved event name",
            ErrorKind::SequenceExhausted => "Sequence space exhausted",
            ErrorKind::InvalidFrame => "Invalid frame",
            ErrorKind::UnexpectedEof => "Unexpected end of file",
            ErrorKind::Closed => "Pool driver closed",
            ErrorKind::Io => "I/O error",
        };
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", base, detail),
            None => f.write_str(base),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        let kind = match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ErrorKind::UnexpectedEof,
            _ => ErrorKind::Io,
        };
        Error::with_detail(kind, err.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> std::io::Error {
        let kind = match err.kind {
            ErrorKind::UnexpectedEof => std::io::ErrorKind::UnexpectedEof,
            ErrorKind::InvalidFrame => std::io::ErrorKind::InvalidData,
            ErrorKind::Closed | ErrorKind::PoolDisconnected => std::io::ErrorKind::NotConnected,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
