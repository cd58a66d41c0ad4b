//! Metadata store: which datasets exist, which files they contain, and the
//! per-file details needed to stream an archive object.
//!
//! The trait keeps handlers independent of the backing store; production
//! uses [`PgMetadataStore`], tests use [`MemoryMetadataStore`].

mod memory;
mod postgres;

pub use memory::MemoryMetadataStore;
pub use postgres::PgMetadataStore;

use async_trait::async_trait;
use serde::Serialize;

use crate::Result;

/// File metadata served by the listing endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_id: String,
    pub dataset_id: String,
    pub display_file_name: String,
    /// Submission path, the user-facing file name.
    pub file_path: String,
    /// Archive object path.
    pub file_name: String,
    /// Ciphertext size in the archive, header excluded.
    pub file_size: i64,
    pub decrypted_file_size: i64,
    pub decrypted_file_checksum: String,
    pub decrypted_file_checksum_type: String,
    #[serde(rename = "fileStatus")]
    pub status: String,
    pub created_at: String,
    pub last_modified: String,
}

/// Dataset attributes for the S3 bucket listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetInfo {
    pub dataset_id: String,
    pub created_at: String,
}

/// Everything needed to serve one download.
#[derive(Debug, Clone)]
pub struct FileDownload {
    pub archive_path: String,
    /// Ciphertext size, header excluded.
    pub archive_size: u64,
    pub decrypted_size: u64,
    pub decrypted_checksum: String,
    pub last_modified: String,
    /// Crypt4GH header bytes, decoded from their hex persisted form.
    pub header: Vec<u8>,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Does a dataset with this exact identifier exist?
    async fn check_dataset(&self, dataset: &str) -> Result<bool>;

    /// The dataset a file belongs to, or `None` for unknown files.
    async fn check_file_permission(&self, file_id: &str) -> Result<Option<String>>;

    /// Download details for a file.
    async fn get_file(&self, file_id: &str) -> Result<FileDownload>;

    /// All files in a dataset.
    async fn get_files(&self, dataset: &str) -> Result<Vec<FileInfo>>;

    /// Dataset attributes, or `None` when unknown.
    async fn get_dataset_info(&self, dataset: &str) -> Result<Option<DatasetInfo>>;

    /// Resolve a file within a dataset by its submission path.
    async fn get_dataset_file_info(
        &self,
        dataset: &str,
        file_path: &str,
    ) -> Result<Option<FileInfo>>;
}
