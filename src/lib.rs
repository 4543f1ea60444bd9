//! Client-side transfer engine for a remote imaging archive.
//!
//! [`RemoteClient`] browses the archive hierarchy and moves files in both
//! directions; downloads go through a serial [`TransferQueue`] driven by the
//! [`ChunkedDownloader`], and progress is reported on an [`EventBus`].

pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod inspect;
pub mod metadata;
pub mod path;
pub mod queue;
pub mod transport;

pub use client::{FileSize, FolderListing, RemoteClient, RemoteRecord, Reply, SearchResults};
pub use config::{parse_credentials, ArchiveConfig};
pub use download::ChunkedDownloader;
pub use error::{ArchiveError, Result};
pub use events::{Event, EventBus, EventKind};
pub use path::{FolderPath, Level, QueryFilter};
pub use queue::{Transfer, TransferExecutor, TransferQueue, TransferState};
pub use transport::{HttpTransport, Transport};
