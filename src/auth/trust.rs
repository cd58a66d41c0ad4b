//! Trusted visa issuer pinning.
//!
//! Visas are only accepted when the `(iss, jku)` pair they present matches a
//! pinned entry from the trust file. The file is read once at startup and is
//! immutable for the process lifetime.

use serde::Deserialize;
use std::path::Path;

use crate::{Error, Result};

/// One pinned issuer: the issuer URL and the JWK-set URL allowed to sign for
/// it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TrustedIssuer {
    pub iss: String,
    pub jku: String,
}

/// Static issuer↔keyset pinning table.
#[derive(Debug, Clone, Default)]
pub struct TrustList {
    entries: Option<Vec<TrustedIssuer>>,
}

impl TrustList {
    /// Load the pinning table from a JSON file containing
    /// `[{"iss": …, "jku": …}, …]`. An empty path yields trust-any mode.
    pub fn from_file(path: &str) -> Result<Self> {
        if path.is_empty() {
            tracing::warn!("no trusted issuer file configured, accepting any visa issuer");
            return Ok(Self { entries: None });
        }
        let content = std::fs::read(Path::new(path))
            .map_err(|e| Error::Internal(format!("could not open trusted issuer file: {e}")))?;
        let entries: Vec<TrustedIssuer> = serde_json::from_slice(&content)
            .map_err(|e| Error::Internal(format!("could not parse trusted issuer file: {e}")))?;
        tracing::info!("loaded {} trusted issuers", entries.len());
        Ok(Self {
            entries: Some(entries),
        })
    }

    /// Exact-match check of an issuer and the JWK-set URL it signed with.
    pub fn is_trusted(&self, iss: &str, jku: &str) -> bool {
        match &self.entries {
            None => true,
            Some(entries) => entries
                .iter()
                .any(|entry| entry.iss == iss && entry.jku == jku),
        }
    }
}
