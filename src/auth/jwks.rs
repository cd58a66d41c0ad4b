//! JWKS (JSON Web Key Set) fetching and caching.
//!
//! One cache serves every keyset the service touches: the access-token
//! keyset announced by OIDC discovery and the per-visa keysets named by
//! `jku` headers. Entries are fetched on miss and kept for an hour; key
//! rotation beyond that expects a process restart.

use jsonwebtoken::{Algorithm, DecodingKey};
use moka::future::Cache;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

/// Keyset cache keyed by JWKS URL.
pub struct KeysetCache {
    cache: Cache<String, Arc<Vec<Jwk>>>,
    http_client: reqwest::Client,
}

impl KeysetCache {
    pub fn new(http_client: reqwest::Client) -> Self {
        let cache = Cache::builder()
            .time_to_live(Duration::from_secs(3600))
            .max_capacity(100)
            .build();
        Self { cache, http_client }
    }

    /// Get the keys behind a JWKS URL, fetching on cache miss.
    pub async fn get(&self, jwks_url: &str) -> Result<Arc<Vec<Jwk>>> {
        if let Some(keys) = self.cache.get(jwks_url).await {
            return Ok(keys);
        }
        let keys = Arc::new(self.fetch(jwks_url).await?);
        self.cache.insert(jwks_url.to_string(), keys.clone()).await;
        Ok(keys)
    }

    async fn fetch(&self, jwks_url: &str) -> Result<Vec<Jwk>> {
        tracing::debug!("fetching JWKS from {}", jwks_url);

        let response = self
            .http_client
            .get(jwks_url)
            .send()
            .await
            .map_err(|e| Error::UpstreamAai(format!("failed to fetch JWKS: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::UpstreamAai(format!(
                "JWKS fetch from {jwks_url} failed with status {}",
                response.status()
            )));
        }

        let jwks: Jwks = response
            .json()
            .await
            .map_err(|e| Error::UpstreamAai(format!("failed to parse JWKS: {e}")))?;
        Ok(jwks.keys)
    }
}

/// JSON Web Key Set.
#[derive(Debug, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// JSON Web Key.
#[derive(Debug, Deserialize)]
pub struct Jwk {
    /// Key type ("RSA", "EC", "OKP").
    pub kty: String,
    /// Key ID.
    pub kid: Option<String>,
    /// Algorithm (e.g. "RS256").
    pub alg: Option<String>,
    /// Key use (e.g. "sig").
    #[serde(rename = "use")]
    pub use_: Option<String>,

    // RSA components
    /// RSA modulus (base64url).
    pub n: Option<String>,
    /// RSA exponent (base64url).
    pub e: Option<String>,

    // EC / OKP components
    /// Curve ("P-256", "Ed25519", …).
    pub crv: Option<String>,
    /// X coordinate or Ed25519 point (base64url).
    pub x: Option<String>,
    /// EC y coordinate (base64url).
    pub y: Option<String>,
}

impl Jwk {
    /// Convert to a `DecodingKey`.
    pub fn to_decoding_key(&self) -> Result<DecodingKey> {
        match self.kty.as_str() {
            "RSA" => {
                let n = self
                    .n
                    .as_ref()
                    .ok_or_else(|| Error::Internal("RSA key missing 'n'".to_string()))?;
                let e = self
                    .e
                    .as_ref()
                    .ok_or_else(|| Error::Internal("RSA key missing 'e'".to_string()))?;

                DecodingKey::from_rsa_components(n, e)
                    .map_err(|e| Error::Internal(format!("invalid RSA key: {e}")))
            }
            "EC" => {
                let x = self
                    .x
                    .as_ref()
                    .ok_or_else(|| Error::Internal("EC key missing 'x'".to_string()))?;
                let y = self
                    .y
                    .as_ref()
                    .ok_or_else(|| Error::Internal("EC key missing 'y'".to_string()))?;

                DecodingKey::from_ec_components(x, y)
                    .map_err(|e| Error::Internal(format!("invalid EC key: {e}")))
            }
            "OKP" => {
                let x = self
                    .x
                    .as_ref()
                    .ok_or_else(|| Error::Internal("OKP key missing 'x'".to_string()))?;

                DecodingKey::from_ed_components(x)
                    .map_err(|e| Error::Internal(format!("invalid OKP key: {e}")))
            }
            other => Err(Error::Internal(format!("unsupported key type: {other}"))),
        }
    }

    /// Signature algorithm this key verifies, from `alg` or inferred from
    /// the key type.
    pub fn algorithm(&self) -> Result<Algorithm> {
        if let Some(alg) = &self.alg {
            return alg
                .parse::<Algorithm>()
                .map_err(|_| Error::Internal(format!("unsupported algorithm: {alg}")));
        }
        match self.kty.as_str() {
            "RSA" => Ok(Algorithm::RS256),
            "EC" => match self.crv.as_deref() {
                Some("P-384") => Ok(Algorithm::ES384),
                _ => Ok(Algorithm::ES256),
            },
            "OKP" => Ok(Algorithm::EdDSA),
            other => Err(Error::Internal(format!("unsupported key type: {other}"))),
        }
    }
}
