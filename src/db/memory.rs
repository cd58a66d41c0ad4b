//! In-memory metadata store for tests and demos.

use async_trait::async_trait;
use std::collections::HashMap;

use super::{DatasetInfo, FileDownload, FileInfo, MetadataStore};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct StoredFile {
    info: FileInfo,
    download: FileDownload,
}

/// Metadata store backed by plain maps. Populate it before sharing.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    datasets: HashMap<String, DatasetInfo>,
    files: HashMap<String, StoredFile>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dataset(&mut self, dataset_id: &str, created_at: &str) {
        self.datasets.insert(
            dataset_id.to_string(),
            DatasetInfo {
                dataset_id: dataset_id.to_string(),
                created_at: created_at.to_string(),
            },
        );
    }

    pub fn add_file(&mut self, info: FileInfo, download: FileDownload) {
        self.files.insert(
            info.file_id.clone(),
            StoredFile { info, download },
        );
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn check_dataset(&self, dataset: &str) -> Result<bool> {
        Ok(self.datasets.contains_key(dataset))
    }

    async fn check_file_permission(&self, file_id: &str) -> Result<Option<String>> {
        Ok(self
            .files
            .get(file_id)
            .map(|f| f.info.dataset_id.clone()))
    }

    async fn get_file(&self, file_id: &str) -> Result<FileDownload> {
        self.files
            .get(file_id)
            .map(|f| f.download.clone())
            .ok_or_else(|| Error::Database(format!("no such file: {file_id}")))
    }

    async fn get_files(&self, dataset: &str) -> Result<Vec<FileInfo>> {
        Ok(self
            .files
            .values()
            .filter(|f| f.info.dataset_id == dataset)
            .map(|f| f.info.clone())
            .collect())
    }

    async fn get_dataset_info(&self, dataset: &str) -> Result<Option<DatasetInfo>> {
        Ok(self.datasets.get(dataset).cloned())
    }

    async fn get_dataset_file_info(
        &self,
        dataset: &str,
        file_path: &str,
    ) -> Result<Option<FileInfo>> {
        Ok(self
            .files
            .values()
            .find(|f| f.info.dataset_id == dataset && f.info.file_path == file_path)
            .map(|f| f.info.clone()))
    }
}
