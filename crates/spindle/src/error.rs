use std::fmt;
use std::path::PathBuf;

/// Why a single fetch attempt (or a whole retried fetch) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ConnectionFailed,
    TimedOut,
    HttpStatus(u16),
    BodyRead,
    /// The request could not be built (malformed URL or header)
    InvalidRequest,
    Cancelled,
}

impl FailureKind {
    /// Connection errors, timeouts, 5xx statuses and truncated bodies are transient.
    /// Every 4xx status is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed | Self::TimedOut | Self::BodyRead => true,
            Self::HttpStatus(code) => (500..600).contains(code),
            Self::InvalidRequest | Self::Cancelled => false,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed => f.write_str("connection failed"),
            Self::TimedOut => f.write_str("timed out"),
            Self::HttpStatus(code) => write!(f, "HTTP {code}"),
            Self::BodyRead => f.write_str("body read error"),
            Self::InvalidRequest => f.write_str("invalid request"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Failure half of a [`FetchResult`](crate::transport::FetchResult).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} after {attempts} attempt(s): {message}")]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

impl FetchFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "fetch cancelled")
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Malformed playlist. `line` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("playlist line {line}: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: String,
}

impl ParseError {
    pub fn new(line: usize, reason: impl Into<String>) -> Self {
        Self {
            line,
            reason: reason.into(),
        }
    }
}

/// Failure of the external media processing step.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("media processor `{program}` not found")]
    ToolMissing { program: String },

    #[error("failed to start media processor `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("media processor exited with code {code}: {message}")]
    Failed { code: i32, message: String },

    #[error("media processor I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Flat classification used by reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Parse,
    Decryption,
    Persistence,
    Processing,
    Cancelled,
    Configuration,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("request for {url} failed: {failure}")]
    Transport { url: String, failure: FetchFailure },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("playlist parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("failed to persist {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("segment {ordinal} failed: {source}")]
    SegmentFailed {
        ordinal: u64,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn transport(url: impl Into<String>, failure: FetchFailure) -> Self {
        if failure.kind == FailureKind::Cancelled {
            return Self::Cancelled;
        }
        Self::Transport {
            url: url.into(),
            failure,
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    pub fn segment(ordinal: u64, source: DownloadError) -> Self {
        Self::SegmentFailed {
            ordinal,
            source: Box::new(source),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Transport { .. } | Self::InvalidUrl { .. } => ErrorKind::Transport,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Decryption { .. } => ErrorKind::Decryption,
            Self::Persistence { .. } => ErrorKind::Persistence,
            Self::Processing(_) => ErrorKind::Processing,
            Self::SegmentFailed { source, .. } => source.kind(),
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// The ordinal of the failing segment, if this error came out of playlist assembly.
    pub fn failed_ordinal(&self) -> Option<u64> {
        match self {
            Self::SegmentFailed { ordinal, .. } => Some(*ordinal),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}
