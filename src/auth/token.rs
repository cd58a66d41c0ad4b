//! Access-token parsing and verification.

use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::jwks::Jwk;
use crate::{Error, Result};

/// Standard claims carried by access tokens and visas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Option<String>,
    pub iss: Option<String>,
    pub exp: Option<u64>,
    pub iat: Option<u64>,
    pub nbf: Option<u64>,
}

/// Pull the token string out of an `Authorization` header value.
///
/// The header must carry exactly `Bearer <token>`: an empty header is a
/// missing token, a different first word is a bad scheme, and a lone
/// `Bearer` is a malformed header.
pub fn parse_bearer(header: &str) -> Result<&str> {
    if header.is_empty() {
        tracing::debug!("authorization check failed, no header");
        return Err(Error::MissingToken);
    }

    let parts: Vec<&str> = header.split(' ').collect();
    if parts[0] != "Bearer" {
        tracing::debug!("authorization check failed, scheme is not bearer");
        return Err(Error::BadScheme);
    }

    match parts.as_slice() {
        ["Bearer", token] if !token.is_empty() => Ok(token),
        _ => {
            tracing::debug!("authorization check failed, no token after scheme");
            Err(Error::MalformedHeader)
        }
    }
}

/// Verify a JWS-signed JWT against a keyset.
///
/// Every key in the set is tried, preferring an exact `kid` match when the
/// token names one. Temporal claims are always validated; the issuer claim
/// is validated when `expected_issuer` is set.
pub fn verify_token(
    token: &str,
    keys: &[Jwk],
    expected_issuer: Option<&str>,
) -> Result<Claims> {
    let header = jsonwebtoken::decode_header(token).map_err(|e| {
        tracing::debug!("failed to decode JWT header: {e}");
        Error::BadToken
    })?;

    // A kid pins one key; without one every key is a candidate.
    let candidates: Vec<&Jwk> = match header.kid.as_deref() {
        Some(kid) => {
            let pinned: Vec<&Jwk> = keys
                .iter()
                .filter(|k| k.kid.as_deref() == Some(kid))
                .collect();
            if pinned.is_empty() {
                keys.iter().collect()
            } else {
                pinned
            }
        }
        None => keys.iter().collect(),
    };

    for jwk in candidates {
        let Ok(algorithm) = jwk.algorithm() else {
            continue;
        };
        if algorithm != header.alg {
            continue;
        }
        let Ok(key) = jwk.to_decoding_key() else {
            continue;
        };
        match decode_with(token, &key, algorithm, expected_issuer) {
            Ok(claims) => return Ok(claims),
            Err(e) => {
                tracing::debug!("token verification failed against one key: {e}");
            }
        }
    }

    tracing::debug!("no key in the set verified the token");
    Err(Error::BadToken)
}

fn decode_with(
    token: &str,
    key: &DecodingKey,
    algorithm: jsonwebtoken::Algorithm,
    expected_issuer: Option<&str>,
) -> std::result::Result<Claims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.validate_aud = false;
    if let Some(iss) = expected_issuer {
        validation.set_issuer(&[iss]);
    }

    let data = jsonwebtoken::decode::<Claims>(token, key, &validation)?;
    Ok(data.claims)
}
