//! OpenID Connect provider plumbing: discovery at startup, userinfo at
//! request time.

use serde::Deserialize;

use crate::{Error, Result};

/// Endpoints discovered from `.well-known/openid-configuration`.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcDetails {
    pub issuer: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
}

/// Fetch the discovery document once at startup.
pub async fn discover(http_client: &reqwest::Client, configuration_url: &str) -> Result<OidcDetails> {
    tracing::debug!("requesting OIDC config from {}", configuration_url);

    let response = http_client
        .get(configuration_url)
        .send()
        .await
        .map_err(|e| Error::UpstreamAai(format!("OIDC discovery request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(Error::UpstreamAai(format!(
            "OIDC discovery failed with status {}",
            response.status()
        )));
    }

    let details: OidcDetails = response
        .json()
        .await
        .map_err(|e| Error::UpstreamAai(format!("failed to parse OIDC configuration: {e}")))?;
    tracing::info!("discovered OIDC issuer {}", details.issuer);
    Ok(details)
}

/// Fetch the raw userinfo body for a bearer token.
///
/// The provider answers with the GA4GH passport; rejection of the token maps
/// to a 401, transport trouble to an upstream failure.
pub async fn fetch_userinfo(
    http_client: &reqwest::Client,
    details: &OidcDetails,
    token: &str,
) -> Result<bytes::Bytes> {
    tracing::debug!("requesting visas from {}", details.userinfo_endpoint);

    let response = http_client
        .get(&details.userinfo_endpoint)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| Error::UpstreamAai(format!("userinfo request failed: {e}")))?;

    if !response.status().is_success() {
        tracing::debug!(
            "userinfo endpoint rejected the token with status {}",
            response.status()
        );
        return Err(Error::BadToken);
    }

    response
        .bytes()
        .await
        .map_err(|e| Error::UpstreamAai(format!("failed to read userinfo response: {e}")))
}

/// Build the HTTP client shared by all AAI traffic, honoring an optional
/// extra CA root.
pub fn build_http_client(cacert: Option<&std::path::Path>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(10));

    if let Some(path) = cacert {
        let pem = std::fs::read(path)
            .map_err(|e| Error::Internal(format!("could not read AAI CA certificate: {e}")))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| Error::Internal(format!("invalid AAI CA certificate: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }

    builder
        .build()
        .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))
}
