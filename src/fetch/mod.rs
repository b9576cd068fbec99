// src/fetch/mod.rs
//
// Remote side of a run: find the file, then stream it to disk.

pub mod download;
pub mod listing;
pub mod resolve;
pub mod transport;

pub use download::{transfer, LogProgress, ProgressSink};
pub use listing::{DirectoryLister, HtmlDirectoryLister};
pub use resolve::{resolve, RemoteResourceSpec, ResolvedResource, ResourceKind};
pub use transport::{HttpTransport, Transport};
