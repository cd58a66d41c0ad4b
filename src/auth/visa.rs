//! GA4GH passport evaluation.
//!
//! The userinfo endpoint hands back a passport: a list of visa JWTs. Each
//! visa is screened (type, trusted issuer/keyset pair), then verified
//! against the keyset its `jku` header names, and finally matched against
//! the datasets this instance actually serves. The output is the
//! deduplicated list of dataset identifiers the caller may access.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use super::jwks::KeysetCache;
use super::token;
use super::trust::TrustList;
use crate::db::MetadataStore;
use crate::error::sanitize;
use crate::{Error, Result};

/// Userinfo response body.
#[derive(Debug, Deserialize)]
pub struct Passport {
    #[serde(default, rename = "ga4gh_passport_v1")]
    pub visas: Vec<String>,
}

/// The `ga4gh_visa_v1` private claim. Unknown visa types parse into
/// [`VisaClaim::Other`] so they round-trip without failure.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum VisaClaim {
    ControlledAccessGrants {
        /// The dataset identifier, possibly a full URI.
        value: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct VisaPayload {
    iss: Option<String>,
    #[serde(rename = "ga4gh_visa_v1")]
    claim: Option<VisaClaim>,
}

#[derive(Debug, Deserialize)]
struct VisaProtectedHeader {
    jku: Option<String>,
}

/// Evaluate a passport into the list of datasets the caller may access.
///
/// Visas that fail any screening step are discarded silently; only upstream
/// keyset fetch failures abort the evaluation.
pub async fn evaluate(
    passport_body: &[u8],
    trust: &TrustList,
    keysets: &KeysetCache,
    store: &dyn MetadataStore,
) -> Result<Vec<String>> {
    let passport: Passport = serde_json::from_slice(passport_body)
        .map_err(|e| Error::UpstreamAai(format!("failed to parse passport: {e}")))?;
    tracing::debug!("number of visas to check: {}", passport.visas.len());

    let mut datasets: Vec<String> = Vec::new();

    for visa in &passport.visas {
        let Some((protected, payload)) = decode_unverified(visa) else {
            tracing::debug!("failed to parse visa, skip");
            continue;
        };

        let Some(VisaClaim::ControlledAccessGrants { value }) = payload.claim else {
            tracing::debug!("visa is not a ControlledAccessGrants, skip");
            continue;
        };

        let (Some(jku), Some(iss)) = (protected.jku, payload.iss) else {
            tracing::debug!("visa carries no jku or iss, skip");
            continue;
        };

        if !trust.is_trusted(&iss, &jku) {
            tracing::debug!("visa issuer and keyset are not a trusted pair, skip");
            continue;
        }

        let keys = keysets.get(&jku).await?;
        if let Err(e) = token::verify_token(visa, &keys, None) {
            tracing::debug!("visa failed validation, skip: {e}");
            continue;
        }

        if datasets.contains(&value) {
            tracing::debug!("dataset {} already collected, skip", sanitize(&value));
            continue;
        }

        match store.check_dataset(&value).await {
            Ok(true) => {
                tracing::debug!("adding dataset {} to permissions", sanitize(&value));
                datasets.push(value);
            }
            Ok(false) => {
                tracing::debug!(
                    "visa dataset {} does not exist in this instance, skip",
                    sanitize(&value)
                );
            }
            Err(e) => return Err(e),
        }
    }

    tracing::debug!("matched {} datasets", datasets.len());
    Ok(datasets)
}

/// Decode the protected header and payload of a JWS without verifying it.
///
/// Screening needs the claims before any key is known; the signature is
/// checked afterwards against the keyset the `jku` names.
fn decode_unverified(visa: &str) -> Option<(VisaProtectedHeader, VisaPayload)> {
    let mut parts = visa.split('.');
    let header_b64 = parts.next()?;
    let payload_b64 = parts.next()?;
    parts.next()?;

    let header_json = URL_SAFE_NO_PAD.decode(header_b64).ok()?;
    let payload_json = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;

    let protected: VisaProtectedHeader = serde_json::from_slice(&header_json).ok()?;
    let payload: VisaPayload = serde_json::from_slice(&payload_json).ok()?;
    Some((protected, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jws(header: &serde_json::Value, payload: &serde_json::Value) -> String {
        format!(
            "{}.{}.c2ln",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(payload.to_string())
        )
    }

    #[test]
    fn test_controlled_access_grant_claim() {
        let claim: VisaClaim = serde_json::from_value(serde_json::json!({
            "type": "ControlledAccessGrants",
            "value": "https://doi.org/abc/EGAD00000000001",
            "source": "https://ega-archive.org/dacs/EGAC1",
            "by": "dac",
            "asserted": 1568699331
        }))
        .unwrap();
        assert_eq!(
            claim,
            VisaClaim::ControlledAccessGrants {
                value: "https://doi.org/abc/EGAD00000000001".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_visa_types_round_trip() {
        let claim: VisaClaim = serde_json::from_value(serde_json::json!({
            "type": "AcceptedTermsAndPolicies",
            "value": "https://doi.org/10.1038/s41431-018-0219-y"
        }))
        .unwrap();
        assert_eq!(claim, VisaClaim::Other);
    }

    #[test]
    fn test_decode_unverified() {
        let visa = fake_jws(
            &serde_json::json!({"alg": "ES256", "jku": "https://aai.example.org/jwk"}),
            &serde_json::json!({
                "iss": "https://aai.example.org/oidc/",
                "ga4gh_visa_v1": {"type": "ControlledAccessGrants", "value": "EGAD1"}
            }),
        );
        let (protected, payload) = decode_unverified(&visa).unwrap();
        assert_eq!(protected.jku.as_deref(), Some("https://aai.example.org/jwk"));
        assert_eq!(payload.iss.as_deref(), Some("https://aai.example.org/oidc/"));
        assert_eq!(
            payload.claim,
            Some(VisaClaim::ControlledAccessGrants {
                value: "EGAD1".to_string()
            })
        );
    }

    #[test]
    fn test_decode_unverified_rejects_non_jws() {
        assert!(decode_unverified("onlytwo.parts").is_none());
        assert!(decode_unverified("not base64 !!!.x.y").is_none());
    }

    #[test]
    fn test_passport_parse_tolerates_missing_list() {
        let passport: Passport = serde_json::from_slice(b"{\"sub\": \"user@elixir\"}").unwrap();
        assert!(passport.visas.is_empty());
    }
}
