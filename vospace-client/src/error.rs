/// Errors surfaced by the client facade and transport layer. One variant per
/// row of the error-handling table: each wraps enough context (a URL, a
/// path, a raw status) for a caller to act on without re-parsing a message
/// string.
#[derive(Debug)]
pub enum Error {
    /// HTTP 404.
    NotFound { url: String },
    /// HTTP 401, or a missing/unreadable PEM certificate.
    PermissionDenied { detail: String },
    /// HTTP 409 with a `DuplicateNode` body.
    AlreadyExists { url: String },
    /// Bad URI scheme, illegal leaf name, or an unsupported open mode.
    InvalidArgument { value: String },
    /// A non-transport exception during connect (most often an expired or
    /// unusable client certificate).
    ConnectionRefused { host: String },
    /// write()/close() on a VOFile that was never opened or already closed.
    NotConnected { url: String },
    /// MD5 or size mismatch after a copy.
    IntegrityError { detail: String },
    /// HTTP 503; only ever seen by callers if the retry loop itself gives up.
    Transient { url: String },
    /// A transport-level error exhausted the connect-retry window.
    Transport(reqwest::Error),
    /// A response status outside of the caller's acceptance set.
    Unexpected {
        status: u16,
        reason: String,
        url: String,
    },
    Io(std::io::Error),
    Xml(vospace_xml::ParsingError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { url } => write!(f, "node not found: {}", url),
            Self::PermissionDenied { detail } => write!(f, "permission denied: {}", detail),
            Self::AlreadyExists { url } => write!(f, "file exists: {}", url),
            Self::InvalidArgument { value } => write!(f, "invalid argument: {}", value),
            Self::ConnectionRefused { host } => write!(f, "vospace connection failed: {}", host),
            Self::NotConnected { url } => write!(f, "no connection for write: {}", url),
            Self::IntegrityError { detail } => write!(f, "integrity error: {}", detail),
            Self::Transient { url } => write!(f, "server busy: {}", url),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Unexpected { status, reason, url } => {
                write!(f, "unexpected server response {} ({}) for {}", reason, status, url)
            }
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::Xml(e) => write!(f, "xml error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(v: std::io::Error) -> Self {
        Self::Io(v)
    }
}

impl From<vospace_xml::ParsingError> for Error {
    fn from(v: vospace_xml::ParsingError) -> Self {
        Self::Xml(v)
    }
}

impl From<reqwest::Error> for Error {
    fn from(v: reqwest::Error) -> Self {
        Self::Transport(v)
    }
}
