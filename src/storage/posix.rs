use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;

use super::{Archive, FileReader};
use crate::{Error, Result};

/// Filesystem-backed archive: object paths live under a root directory.
pub struct PosixArchive {
    root: PathBuf,
}

impl PosixArchive {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Archive for PosixArchive {
    async fn new_file_reader(&self, path: &str) -> Result<FileReader> {
        let full = self.root.join(path.trim_start_matches('/'));
        let file = fs::File::open(&full)
            .await
            .map_err(|e| Error::Archive(format!("could not open {}: {e}", full.display())))?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_reads_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("obj1"), b"ciphertext").unwrap();

        let archive = PosixArchive::new(dir.path().to_path_buf());
        let mut reader = archive.new_file_reader("obj1").await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ciphertext");
    }

    #[tokio::test]
    async fn test_missing_object_is_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = PosixArchive::new(dir.path().to_path_buf());
        assert!(matches!(
            archive.new_file_reader("ghost").await,
            Err(Error::Archive(_))
        ));
    }
}
