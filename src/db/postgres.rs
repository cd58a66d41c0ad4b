//! Postgres-backed metadata store.
//!
//! Queries run against the `sda` schema. Every public method retries up to
//! three times; between attempts a ping-and-wait loop gives a flapping
//! database up to five minutes to come back before the error surfaces.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{FromRow, PgPool, Row};
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::{DatasetInfo, FileDownload, FileInfo, MetadataStore};
use crate::config::Config;
use crate::error::sanitize;
use crate::{Error, Result};

const DB_RETRY_TIMES: usize = 3;
const DB_RECONNECT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DB_RECONNECT_SLEEP: Duration = Duration::from_secs(1);

pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Connect and verify the connection with a ping.
    pub async fn connect(config: &Config) -> Result<Self> {
        let mut options = PgConnectOptions::new()
            .host(&config.db_host)
            .port(config.db_port)
            .username(&config.db_user)
            .database(&config.db_database)
            .ssl_mode(
                PgSslMode::from_str(&config.db_sslmode)
                    .map_err(|e| Error::Database(format!("invalid sslmode: {e}")))?,
            );
        if !config.db_password.is_empty() {
            options = options.password(&config.db_password);
        }
        if let Some(cacert) = &config.db_cacert {
            options = options.ssl_root_cert(cacert);
        }
        if let Some(cert) = &config.db_clientcert {
            options = options.ssl_client_cert(cert);
        }
        if let Some(key) = &config.db_clientkey {
            options = options.ssl_client_key(key);
        }

        tracing::debug!(
            "connecting to database {}:{}/{} as {}",
            config.db_host,
            config.db_port,
            config.db_database,
            config.db_user
        );

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(format!("failed to connect: {e}")))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| Error::Database(format!("no response from database: {e}")))?;

        tracing::debug!("database connection formed");
        Ok(Self { pool })
    }

    /// Wait for the database to answer pings again, bounded to five minutes.
    async fn reconnect_if_needed(&self) {
        let start = Instant::now();
        while sqlx::query("SELECT 1").execute(&self.pool).await.is_err() {
            if start.elapsed() > DB_RECONNECT_TIMEOUT {
                tracing::error!("could not reconnect to failed database in reasonable time");
                return;
            }
            tracing::warn!("database unreachable, reconnecting");
            tokio::time::sleep(DB_RECONNECT_SLEEP).await;
        }
    }

    async fn check_dataset_once(&self, dataset: &str) -> Result<bool> {
        const QUERY: &str = "SELECT stable_id FROM sda.datasets WHERE stable_id = $1";
        let row = sqlx::query(QUERY)
            .bind(dataset)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn check_file_permission_once(&self, file_id: &str) -> Result<Option<String>> {
        const QUERY: &str = "
            SELECT datasets.stable_id FROM sda.file_dataset
            JOIN sda.datasets ON dataset_id = datasets.id
            JOIN sda.files ON file_id = files.id
            WHERE files.stable_id = $1";
        let row = sqlx::query(QUERY)
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn get_file_once(&self, file_id: &str) -> Result<FileDownload> {
        const QUERY: &str = r#"
            SELECT f.archive_file_path,
                   f.archive_file_size,
                   f.decrypted_file_size,
                   dc.checksum AS decrypted_checksum,
                   to_char(f.last_modified, 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS last_modified,
                   f.header
            FROM sda.files f
            LEFT JOIN (SELECT file_id, checksum, type
                FROM sda.checksums
            WHERE source = 'UNENCRYPTED') dc
            ON f.id = dc.file_id
            WHERE stable_id = $1"#;
        let row = sqlx::query(QUERY)
            .bind(file_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(
                    "could not retrieve details for file {}: {e}",
                    sanitize(file_id)
                );
                Error::Database(e.to_string())
            })?;

        let header_hex: String = row.try_get("header").map_err(db_err)?;
        let header = hex::decode(&header_hex).map_err(|e| {
            tracing::error!(
                "could not decode file header for {}: {e}",
                sanitize(file_id)
            );
            Error::Database(format!("invalid stored header: {e}"))
        })?;

        Ok(FileDownload {
            archive_path: row.try_get("archive_file_path").map_err(db_err)?,
            archive_size: row.try_get::<i64, _>("archive_file_size").map_err(db_err)? as u64,
            decrypted_size: row.try_get::<i64, _>("decrypted_file_size").map_err(db_err)? as u64,
            decrypted_checksum: row
                .try_get::<Option<String>, _>("decrypted_checksum")
                .map_err(db_err)?
                .unwrap_or_default(),
            last_modified: row.try_get("last_modified").map_err(db_err)?,
            header,
        })
    }

    async fn get_files_once(&self, dataset: &str) -> Result<Vec<FileInfo>> {
        const QUERY: &str = r#"
            SELECT files.stable_id AS id,
                datasets.stable_id AS dataset_id,
                reverse(split_part(reverse(files.submission_file_path::text), '/'::text, 1)) AS display_file_name,
                files.submission_file_path AS file_path,
                files.archive_file_path AS file_name,
                files.archive_file_size AS file_size,
                files.decrypted_file_size,
                sha.checksum AS decrypted_file_checksum,
                sha.type AS decrypted_file_checksum_type,
                log.event AS status,
                to_char(files.created_at, 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS created_at,
                to_char(files.last_modified, 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS last_modified
            FROM sda.files
            JOIN sda.file_dataset ON file_id = files.id
            JOIN sda.datasets ON file_dataset.dataset_id = datasets.id
            LEFT JOIN (SELECT file_id, (ARRAY_AGG(event ORDER BY started_at DESC))[1] AS event FROM sda.file_event_log GROUP BY file_id) log ON files.id = log.file_id
            LEFT JOIN (SELECT file_id, checksum, type FROM sda.checksums WHERE source = 'UNENCRYPTED') sha ON files.id = sha.file_id
            WHERE datasets.stable_id = $1"#;
        let rows: Vec<DbFileInfo> = sqlx::query_as(QUERY)
            .bind(dataset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(rows.into_iter().map(DbFileInfo::into_file_info).collect())
    }

    async fn get_dataset_info_once(&self, dataset: &str) -> Result<Option<DatasetInfo>> {
        const QUERY: &str = r#"SELECT stable_id, to_char(created_at, 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS created_at FROM sda.datasets WHERE stable_id = $1"#;
        let row = sqlx::query(QUERY)
            .bind(dataset)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(match row {
            Some(row) => Some(DatasetInfo {
                dataset_id: row.try_get("stable_id").map_err(db_err)?,
                created_at: row.try_get("created_at").map_err(db_err)?,
            }),
            None => None,
        })
    }

    async fn get_dataset_file_info_once(
        &self,
        dataset: &str,
        file_path: &str,
    ) -> Result<Option<FileInfo>> {
        const QUERY: &str = r#"
            SELECT f.stable_id AS id,
                d.stable_id AS dataset_id,
                reverse(split_part(reverse(f.submission_file_path::text), '/'::text, 1)) AS display_file_name,
                f.submission_file_path AS file_path,
                f.archive_file_path AS file_name,
                f.archive_file_size AS file_size,
                f.decrypted_file_size,
                dc.checksum AS decrypted_file_checksum,
                dc.type AS decrypted_file_checksum_type,
                e.event AS status,
                to_char(f.created_at, 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS created_at,
                to_char(f.last_modified, 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS last_modified
            FROM sda.files f
            JOIN sda.file_dataset fd ON fd.file_id = f.id
            JOIN sda.datasets d ON fd.dataset_id = d.id
            LEFT JOIN (SELECT file_id,
                        (ARRAY_AGG(event ORDER BY started_at DESC))[1] AS event
                    FROM sda.file_event_log
                    GROUP BY file_id) e
            ON f.id = e.file_id
            LEFT JOIN (SELECT file_id, checksum, type
                FROM sda.checksums
            WHERE source = 'UNENCRYPTED') dc
            ON f.id = dc.file_id
            WHERE d.stable_id = $1 AND f.submission_file_path = $2"#;
        let row: Option<DbFileInfo> = sqlx::query_as(QUERY)
            .bind(dataset)
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.map(DbFileInfo::into_file_info))
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

/// Row shape shared by the file listing queries. Kept separate from the
/// domain type so nullable join columns stay explicit.
#[derive(Debug, FromRow)]
struct DbFileInfo {
    id: String,
    dataset_id: String,
    display_file_name: String,
    file_path: String,
    file_name: String,
    file_size: i64,
    decrypted_file_size: i64,
    decrypted_file_checksum: Option<String>,
    decrypted_file_checksum_type: Option<String>,
    status: Option<String>,
    created_at: String,
    last_modified: String,
}

impl DbFileInfo {
    fn into_file_info(self) -> FileInfo {
        FileInfo {
            file_id: self.id,
            dataset_id: self.dataset_id,
            display_file_name: self.display_file_name,
            file_path: self.file_path,
            file_name: self.file_name,
            file_size: self.file_size,
            decrypted_file_size: self.decrypted_file_size,
            decrypted_file_checksum: self.decrypted_file_checksum.unwrap_or_default(),
            decrypted_file_checksum_type: self.decrypted_file_checksum_type.unwrap_or_default(),
            status: self.status.unwrap_or_default(),
            created_at: self.created_at,
            last_modified: self.last_modified,
        }
    }
}

/// Retry shell shared by every query method.
macro_rules! with_retry {
    ($self:ident, $call:expr) => {{
        let mut last = None;
        for attempt in 0..DB_RETRY_TIMES {
            match $call {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt + 1 < DB_RETRY_TIMES {
                        $self.reconnect_if_needed().await;
                    }
                    last = Some(err);
                }
            }
        }
        Err(last.expect("at least one attempt was made"))
    }};
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn check_dataset(&self, dataset: &str) -> Result<bool> {
        with_retry!(self, self.check_dataset_once(dataset).await)
    }

    async fn check_file_permission(&self, file_id: &str) -> Result<Option<String>> {
        with_retry!(self, self.check_file_permission_once(file_id).await)
    }

    async fn get_file(&self, file_id: &str) -> Result<FileDownload> {
        with_retry!(self, self.get_file_once(file_id).await)
    }

    async fn get_files(&self, dataset: &str) -> Result<Vec<FileInfo>> {
        with_retry!(self, self.get_files_once(dataset).await)
    }

    async fn get_dataset_info(&self, dataset: &str) -> Result<Option<DatasetInfo>> {
        with_retry!(self, self.get_dataset_info_once(dataset).await)
    }

    async fn get_dataset_file_info(
        &self,
        dataset: &str,
        file_path: &str,
    ) -> Result<Option<FileInfo>> {
        with_retry!(self, self.get_dataset_file_info_once(dataset, file_path).await)
    }
}
