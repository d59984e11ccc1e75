//! Error taxonomy for a mirror run.
//!
//! Two severities are kept apart by type: [`AssetError`] is recorded per asset
//! and never stops a run, [`MirrorError`] ends the run and reaches the caller.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use url::Url;

/// Why a single URL could not be retrieved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Short stable reason code used in summaries.
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::Status(_) => "status",
            FetchError::Timeout => "timeout",
            FetchError::Connect(_) => "connect",
            FetchError::Request(_) => "request",
            FetchError::Body(_) => "body",
            FetchError::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_connect() {
            FetchError::Connect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            FetchError::Body(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

/// A URL that has no safe place in the mirror.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
}

#[derive(Debug, Error)]
#[error("failed to write {}: {source}", path.display())]
pub struct WriteError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl WriteError {
    pub fn new(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }
}

/// Recoverable, per-asset failure. Counted in the summary, never propagated.
///
/// URLs that cannot be mapped never become assets; the scanner only yields
/// `http`/`https` URLs with a host, and the planner logs and skips the rest.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

impl AssetError {
    pub fn code(&self) -> &'static str {
        match self {
            AssetError::Fetch(err) => err.code(),
            AssetError::Write(_) => "write",
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login page {url} could not be fetched: {source}")]
    LoginPage {
        url: Url,
        #[source]
        source: FetchError,
    },
    #[error("no login form with a password field found at {0}")]
    FormNotFound(Url),
    #[error("credentials were rejected by {0}")]
    Rejected(Url),
    #[error("login request failed: {0}")]
    Request(#[from] FetchError),
    #[error("failed to build login client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("HTML rewrite error: {0}")]
    Rewriting(#[from] lol_html::errors::RewritingError),
    #[error("rewritten HTML is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to walk {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: jwalk::Error,
    },
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("failed to move archive into place: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Run-level failure. Aborts the mirror and is reported to the caller.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("invalid root URL `{url}`: {reason}")]
    InvalidTarget { url: String, reason: String },
    #[error("failed to prepare output directory {}: {source}", path.display())]
    OutputRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("failed to fetch root document {url}: {source}")]
    RootFetch {
        url: Url,
        #[source]
        source: FetchError,
    },
    #[error("failed to write root document: {0}")]
    RootWrite(#[source] WriteError),
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("mirroring was cancelled")]
    Cancelled,
}
