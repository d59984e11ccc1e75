pub mod archive;
pub mod auth;
pub mod charset;
pub mod cli;
pub mod downloader;
pub mod error;
pub mod file_manager;
pub mod html_parser;
pub mod logging;
pub mod mirror;
pub mod rewriter;
pub mod url_mapper;

// Re-export main types for convenience
pub use archive::zip_directory;
pub use auth::{Authenticator, Credentials, FormLogin};
pub use cli::{MirrorCommand, MirrorRequest};
pub use downloader::{AssetFetcher, FetchResult, Fetched, HttpFetcher, SessionContext, SessionCookie};
pub use error::{
    ArchiveError, AssetError, AuthError, FetchError, MappingError, MirrorError, RewriteError,
    WriteError,
};
pub use file_manager::FileManager;
pub use html_parser::{AssetReference, ElementKind, HtmlParser};
pub use mirror::{Mirror, MirrorOptions, MirrorPhase, MirrorSummary, MirrorTarget};
pub use rewriter::rewrite;
pub use url_mapper::{map_url, AssetCategory, LocalPath};
