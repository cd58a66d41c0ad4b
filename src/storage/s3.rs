//! S3-backed archive.
//!
//! Streams `GetObject` bodies straight through; supports custom endpoints
//! (MinIO, Ceph RGW) with path-style addressing.

use async_trait::async_trait;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::Client;

use super::{Archive, FileReader};
use crate::{Error, Result};

pub struct S3Archive {
    client: Client,
    bucket: String,
}

impl S3Archive {
    /// Build the client from explicit settings.
    ///
    /// Region and credentials fall back to the SDK's environment resolution
    /// when unset.
    pub async fn new(
        endpoint: Option<String>,
        region: Option<String>,
        bucket: String,
        access_key: Option<String>,
        secret_key: Option<String>,
    ) -> Result<Self> {
        let mut loader = aws_config::from_env();

        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let (Some(access), Some(secret)) = (access_key, secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access, secret, None, None, "archive-config",
            ));
        }

        let sdk_config = loader.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = endpoint {
            s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config.build()),
            bucket,
        })
    }
}

#[async_trait]
impl Archive for S3Archive {
    async fn new_file_reader(&self, path: &str) -> Result<FileReader> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path.trim_start_matches('/'))
            .send()
            .await
            .map_err(|e| Error::Archive(format!("could not open s3://{}/{path}: {e}", self.bucket)))?;

        Ok(Box::new(object.body.into_async_read()))
    }
}
