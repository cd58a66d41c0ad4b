//! Archive backend abstraction.
//!
//! The archive holds Crypt4GH file bodies (ciphertext only, headers live in
//! the metadata store). Backends expose one capability: open a readable
//! stream at a path.

mod posix;

pub use posix::PosixArchive;

#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "s3")]
pub use s3::S3Archive;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::Result;

/// A readable archive object, scoped to one request.
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// Object storage holding archived file bodies.
#[async_trait]
pub trait Archive: Send + Sync {
    /// Open a reader at an archive path.
    async fn new_file_reader(&self, path: &str) -> Result<FileReader>;
}
