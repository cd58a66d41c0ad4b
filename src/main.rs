use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cryptgate::{
    auth::{oidc, KeysetCache, TrustList},
    config::{ArchiveType, SessionConfig},
    crypt4gh,
    db::PgMetadataStore,
    handlers::{create_router, AppState},
    session::SessionCache,
    storage::{Archive, PosixArchive},
    Config,
};

#[cfg(feature = "s3")]
use cryptgate::storage::S3Archive;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("(1/5) loading configuration");
    let http_client = oidc::build_http_client(config.oidc_cacert.as_deref())
        .context("http client init failed")?;

    tracing::info!("(2/5) connecting to the metadata store");
    let store = PgMetadataStore::connect(&config)
        .await
        .context("database connection failed")?;

    tracing::info!("(3/5) retrieving OIDC configuration");
    let oidc_details = oidc::discover(&http_client, &config.oidc_configuration_url)
        .await
        .context("oidc init failed")?;
    let trust =
        TrustList::from_file(&config.oidc_trusted_iss).context("trusted issuer list failed")?;

    tracing::info!("(4/5) preparing caches, keys and the archive backend");
    let sessions = SessionCache::new(config.session_expiration());
    let keysets = KeysetCache::new(http_client.clone());
    let c4gh_key = crypt4gh::keys::load_private_key(&config.c4gh_filepath, &config.c4gh_passphrase)
        .map_err(|e| anyhow::anyhow!("crypt4gh private key load failed: {e}"))?;

    let archive: Arc<dyn Archive> = match config.archive_type {
        ArchiveType::Posix => {
            tracing::info!("using posix archive at {:?}", config.archive_path);
            Arc::new(PosixArchive::new(config.archive_path.clone()))
        }
        #[cfg(feature = "s3")]
        ArchiveType::S3 => {
            let bucket = config
                .archive_s3_bucket
                .clone()
                .ok_or_else(|| anyhow::anyhow!("ARCHIVE_S3_BUCKET is required for S3 archives"))?;
            tracing::info!("using s3 archive, bucket={}", bucket);
            Arc::new(
                S3Archive::new(
                    config.archive_s3_url.clone(),
                    config.archive_s3_region.clone(),
                    bucket,
                    config.archive_s3_accesskey.clone(),
                    config.archive_s3_secretkey.clone(),
                )
                .await?,
            )
        }
        #[cfg(not(feature = "s3"))]
        ArchiveType::S3 => {
            anyhow::bail!(
                "S3 archives require the 's3' feature. Rebuild with: cargo build --features s3"
            )
        }
    };

    let state = AppState {
        store: Arc::new(store),
        archive,
        sessions,
        trust: Arc::new(trust),
        oidc: oidc_details,
        keysets: Arc::new(keysets),
        http_client,
        session_config: SessionConfig::from_config(&config),
        c4gh_key,
    };

    let app = create_router(state)
        .layer(TimeoutLayer::new(Duration::from_secs(20)))
        .layer(TraceLayer::new_for_http());
    let app = if config.cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    };

    tracing::info!("(5/5) starting web server");
    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .context("invalid bind address")?;

    match (&config.app_servercert, &config.app_serverkey) {
        (Some(cert), Some(key)) => {
            let tls = build_tls_config(cert, key)?;
            tracing::info!("ready to receive connections at https://{addr}");
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!("ready to receive connections at http://{addr}");
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}

/// TLS settings for local termination: TLS 1.2 as the floor, NIST curves
/// preferred, and the ECDHE-RSA-AES256-GCM suite pinned for 1.2 clients.
fn build_tls_config(
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<axum_server::tls_rustls::RustlsConfig> {
    use rustls::crypto::aws_lc_rs;

    let _ = aws_lc_rs::default_provider().install_default();

    let provider = rustls::crypto::CryptoProvider {
        cipher_suites: vec![
            aws_lc_rs::cipher_suite::TLS13_AES_256_GCM_SHA384,
            aws_lc_rs::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ],
        kx_groups: vec![
            aws_lc_rs::kx_group::SECP384R1,
            aws_lc_rs::kx_group::SECP256R1,
            aws_lc_rs::kx_group::X25519,
        ],
        ..aws_lc_rs::default_provider()
    };

    let certs = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;

    let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .context("tls protocol configuration failed")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("tls certificate configuration failed")?;

    Ok(axum_server::tls_rustls::RustlsConfig::from_config(
        Arc::new(server_config),
    ))
}

fn load_certificates(
    path: &Path,
) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path).context("tls cert open failed")?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("tls cert read failed")?;
    anyhow::ensure!(!certs.is_empty(), "tls cert file contains no certificates");
    Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).context("tls key open failed")?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .context("tls key read failed")?
        .ok_or_else(|| anyhow::anyhow!("tls key file contains no private key"))
}
