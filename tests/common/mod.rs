//! Shared test harness: an in-memory metadata store, a tempdir archive and
//! a wiremock OIDC provider signing Ed25519 tokens and visas.
#![allow(dead_code)]

use axum_test::TestServer;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::pkcs8::{EncodePrivateKey, LineEnding};
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cryptgate::auth::{KeysetCache, OidcDetails, TrustList};
use cryptgate::config::SessionConfig;
use cryptgate::crypt4gh::{header as c4gh_header, keys, stream};
use cryptgate::db::{FileDownload, FileInfo, MemoryMetadataStore};
use cryptgate::handlers::{create_router, AppState};
use cryptgate::session::SessionCache;
use cryptgate::storage::PosixArchive;

pub const SESSION_COOKIE: &str = "sda_session_key";

/// Pre-start fixture: populate the store and archive, then [`Fixture::start`].
pub struct Fixture {
    pub store: MemoryMetadataStore,
    pub archive: tempfile::TempDir,
    pub server_sk: [u8; 32],
    pub server_pk: [u8; 32],
    object_count: usize,
}

impl Fixture {
    pub fn new() -> Self {
        let (server_sk, server_pk) = keys::generate_keypair();
        Self {
            store: MemoryMetadataStore::new(),
            archive: tempfile::tempdir().expect("tempdir"),
            server_sk,
            server_pk,
            object_count: 0,
        }
    }

    pub fn add_dataset(&mut self, dataset: &str) {
        self.store.add_dataset(dataset, "2024-01-01T00:00:00Z");
    }

    /// Seal a plaintext into the archive and register the file.
    pub fn add_file(&mut self, file_id: &str, dataset: &str, submission_path: &str, plain: &[u8]) {
        let mut data_key = [0u8; 32];
        OsRng.fill_bytes(&mut data_key);
        let (writer_sk, _) = keys::generate_keypair();

        let body = stream::seal(plain, &data_key);
        self.object_count += 1;
        let object = format!("obj{}", self.object_count);
        std::fs::write(self.archive.path().join(&object), &body).expect("write archive object");

        let header =
            c4gh_header::serialize(&data_key, None, &writer_sk, &[self.server_pk]).expect("header");
        let checksum = hex::encode(Sha256::digest(plain));
        let display = submission_path.rsplit('/').next().unwrap_or(submission_path);

        self.store.add_file(
            FileInfo {
                file_id: file_id.to_string(),
                dataset_id: dataset.to_string(),
                display_file_name: display.to_string(),
                file_path: submission_path.to_string(),
                file_name: object.clone(),
                file_size: body.len() as i64,
                decrypted_file_size: plain.len() as i64,
                decrypted_file_checksum: checksum.clone(),
                decrypted_file_checksum_type: "SHA256".to_string(),
                status: "ready".to_string(),
                created_at: "2024-05-01T10:00:00Z".to_string(),
                last_modified: "2024-05-02T10:00:00Z".to_string(),
            },
            FileDownload {
                archive_path: object,
                archive_size: body.len() as u64,
                decrypted_size: plain.len() as u64,
                decrypted_checksum: checksum,
                last_modified: "2024-05-02T10:00:00Z".to_string(),
                header,
            },
        );
    }

    /// Spin up the mock AAI and the test server.
    pub async fn start(self) -> Harness {
        let aai = MockServer::start().await;
        let signing_key = SigningKey::generate(&mut OsRng);

        let issuer = format!("{}/oidc/", aai.uri());
        let jwks_url = format!("{}/oidc/jwk", aai.uri());
        let userinfo_url = format!("{}/oidc/userinfo", aai.uri());

        let jwk = serde_json::json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "kid": "test-key",
            "alg": "EdDSA",
            "use": "sig",
            "x": URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes()),
        });
        Mock::given(method("GET"))
            .and(path("/oidc/jwk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "keys": [jwk]
            })))
            .mount(&aai)
            .await;

        let mut trust_file = tempfile::NamedTempFile::new().expect("trust file");
        write!(
            trust_file,
            r#"[{{"iss": "{issuer}", "jku": "{jwks_url}"}}]"#
        )
        .expect("write trust file");
        let trust = TrustList::from_file(trust_file.path().to_str().unwrap()).expect("trust list");

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("http client");

        let state = AppState {
            store: Arc::new(self.store),
            archive: Arc::new(PosixArchive::new(self.archive.path().to_path_buf())),
            sessions: SessionCache::new(std::time::Duration::from_secs(28800)),
            trust: Arc::new(trust),
            oidc: OidcDetails {
                issuer: issuer.clone(),
                userinfo_endpoint: userinfo_url,
                jwks_uri: jwks_url.clone(),
            },
            keysets: Arc::new(KeysetCache::new(http_client.clone())),
            http_client,
            session_config: SessionConfig {
                name: SESSION_COOKIE.to_string(),
                domain: String::new(),
                secure: false,
                httponly: true,
                expiration: std::time::Duration::from_secs(28800),
            },
            c4gh_key: self.server_sk,
        };

        let server = TestServer::new(create_router(state)).expect("test server");

        Harness {
            server,
            aai,
            signing_key,
            issuer,
            jwks_url,
            server_sk: self.server_sk,
            server_pk: self.server_pk,
            _archive: self.archive,
        }
    }
}

pub struct Harness {
    pub server: TestServer,
    pub aai: MockServer,
    signing_key: SigningKey,
    pub issuer: String,
    pub jwks_url: String,
    pub server_sk: [u8; 32],
    pub server_pk: [u8; 32],
    _archive: tempfile::TempDir,
}

impl Harness {
    fn encoding_key(&self) -> EncodingKey {
        let pem = self
            .signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("pkcs8 pem");
        EncodingKey::from_ed_pem(pem.as_bytes()).expect("encoding key")
    }

    fn sign(&self, claims: serde_json::Value, jku: Option<String>) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some("test-key".to_string());
        header.jku = jku;
        jsonwebtoken::encode(&header, &claims, &self.encoding_key()).expect("sign jwt")
    }

    /// A valid access token for the mock AAI.
    pub fn token(&self) -> String {
        let now = unix_now();
        self.sign(
            serde_json::json!({
                "iss": self.issuer,
                "sub": "requester@elixir-europe.org",
                "iat": now,
                "exp": now + 3600,
            }),
            None,
        )
    }

    /// An expired access token.
    pub fn expired_token(&self) -> String {
        let now = unix_now();
        self.sign(
            serde_json::json!({
                "iss": self.issuer,
                "sub": "requester@elixir-europe.org",
                "iat": now - 7200,
                "exp": now - 3600,
            }),
            None,
        )
    }

    /// A ControlledAccessGrants visa for a dataset, signed under the
    /// trusted jku.
    pub fn visa(&self, dataset: &str) -> String {
        self.visa_with_jku(dataset, &self.jwks_url)
    }

    pub fn visa_with_jku(&self, dataset: &str, jku: &str) -> String {
        let now = unix_now();
        self.sign(
            serde_json::json!({
                "iss": self.issuer,
                "sub": "requester@elixir-europe.org",
                "iat": now,
                "exp": now + 3600,
                "ga4gh_visa_v1": {
                    "type": "ControlledAccessGrants",
                    "value": dataset,
                    "source": "https://ega-archive.org/dacs/EGAC00000000001",
                    "by": "dac",
                    "asserted": now,
                }
            }),
            Some(jku.to_string()),
        )
    }

    /// A visa of a different type, which evaluation must skip.
    pub fn unrelated_visa(&self) -> String {
        let now = unix_now();
        self.sign(
            serde_json::json!({
                "iss": self.issuer,
                "sub": "requester@elixir-europe.org",
                "iat": now,
                "exp": now + 3600,
                "ga4gh_visa_v1": {
                    "type": "AcceptedTermsAndPolicies",
                    "value": "https://doi.org/10.1038/s41431-018-0219-y",
                }
            }),
            Some(self.jwks_url.clone()),
        )
    }

    /// Serve this passport from the userinfo endpoint.
    pub async fn mount_userinfo(&self, visas: Vec<String>) {
        self.mount_userinfo_inner(visas, None).await;
    }

    /// Serve the passport and assert the endpoint is hit exactly `hits`
    /// times over the harness lifetime.
    pub async fn mount_userinfo_expect(&self, visas: Vec<String>, hits: u64) {
        self.mount_userinfo_inner(visas, Some(hits)).await;
    }

    async fn mount_userinfo_inner(&self, visas: Vec<String>, hits: Option<u64>) {
        let mut mock = Mock::given(method("GET"))
            .and(path("/oidc/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ga4gh_passport_v1": visas
            })));
        if let Some(hits) = hits {
            mock = mock.expect(hits);
        }
        mock.mount(&self.aai).await;
    }

    pub fn bearer(&self, token: &str) -> axum::http::HeaderValue {
        axum::http::HeaderValue::from_str(&format!("Bearer {token}")).expect("header value")
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs()
}

/// sha256 hex digest, matching the stored checksums.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
