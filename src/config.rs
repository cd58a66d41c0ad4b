use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Archive backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ArchiveType {
    Posix,
    S3,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "cryptgate")]
#[command(about = "Controlled-access download service for Crypt4GH archives")]
pub struct Config {
    /// Host address to bind to
    #[arg(long, env = "APP_HOST", default_value = "0.0.0.0")]
    pub app_host: String,

    /// Port to listen on
    #[arg(long, env = "APP_PORT", default_value = "8080")]
    pub app_port: u16,

    /// TLS server certificate (PEM); plain HTTP when unset
    #[arg(long, env = "APP_SERVERCERT")]
    pub app_servercert: Option<PathBuf>,

    /// TLS server private key (PEM)
    #[arg(long, env = "APP_SERVERKEY")]
    pub app_serverkey: Option<PathBuf>,

    /// Session lifetime in seconds
    #[arg(long, env = "SESSION_EXPIRATION", default_value = "28800")]
    pub session_expiration: u64,

    /// Session cookie Domain attribute
    #[arg(long, env = "SESSION_DOMAIN", default_value = "")]
    pub session_domain: String,

    /// Session cookie Secure attribute
    #[arg(long, env = "SESSION_SECURE", default_value = "true")]
    pub session_secure: bool,

    /// Session cookie HttpOnly attribute
    #[arg(long, env = "SESSION_HTTPONLY", default_value = "true")]
    pub session_httponly: bool,

    /// Session cookie name
    #[arg(long, env = "SESSION_NAME", default_value = "sda_session_key")]
    pub session_name: String,

    /// Database host
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// Database port
    #[arg(long, env = "DB_PORT", default_value = "5432")]
    pub db_port: u16,

    /// Database user
    #[arg(long, env = "DB_USER", default_value = "download")]
    pub db_user: String,

    /// Database password
    #[arg(long, env = "DB_PASSWORD", default_value = "")]
    pub db_password: String,

    /// Database name
    #[arg(long, env = "DB_DATABASE", default_value = "sda")]
    pub db_database: String,

    /// Database TLS mode (disable, prefer, require, verify-ca, verify-full)
    #[arg(long, env = "DB_SSLMODE", default_value = "prefer")]
    pub db_sslmode: String,

    /// Database CA certificate (PEM)
    #[arg(long, env = "DB_CACERT")]
    pub db_cacert: Option<PathBuf>,

    /// Database client certificate (PEM)
    #[arg(long, env = "DB_CLIENTCERT")]
    pub db_clientcert: Option<PathBuf>,

    /// Database client key (PEM)
    #[arg(long, env = "DB_CLIENTKEY")]
    pub db_clientkey: Option<PathBuf>,

    /// Crypt4GH private key file
    #[arg(long, env = "C4GH_FILEPATH")]
    pub c4gh_filepath: PathBuf,

    /// Passphrase for the Crypt4GH private key
    #[arg(long, env = "C4GH_PASSPHRASE", default_value = "")]
    pub c4gh_passphrase: String,

    /// OpenID Connect discovery document URL
    #[arg(long, env = "OIDC_CONFIGURATION_URL")]
    pub oidc_configuration_url: String,

    /// JSON file with trusted {iss, jku} pairs; empty means trust-any
    #[arg(long, env = "OIDC_TRUSTED_ISS", default_value = "")]
    pub oidc_trusted_iss: String,

    /// Extra CA certificate for AAI connections (PEM)
    #[arg(long, env = "OIDC_CACERT")]
    pub oidc_cacert: Option<PathBuf>,

    /// Archive backend type
    #[arg(long, env = "ARCHIVE_TYPE", value_enum, default_value = "posix")]
    pub archive_type: ArchiveType,

    /// Root path for the posix archive
    #[arg(long, env = "ARCHIVE_PATH", default_value = "/archive")]
    pub archive_path: PathBuf,

    /// S3 archive endpoint URL
    #[arg(long, env = "ARCHIVE_S3_URL")]
    pub archive_s3_url: Option<String>,

    /// S3 archive bucket
    #[arg(long, env = "ARCHIVE_S3_BUCKET")]
    pub archive_s3_bucket: Option<String>,

    /// S3 archive region
    #[arg(long, env = "ARCHIVE_S3_REGION")]
    pub archive_s3_region: Option<String>,

    /// S3 archive access key
    #[arg(long, env = "ARCHIVE_S3_ACCESSKEY")]
    pub archive_s3_accesskey: Option<String>,

    /// S3 archive secret key
    #[arg(long, env = "ARCHIVE_S3_SECRETKEY")]
    pub archive_s3_secretkey: Option<String>,

    /// Enable permissive CORS
    #[arg(long, env = "APP_CORS", default_value = "false")]
    pub cors: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn session_expiration(&self) -> Duration {
        Duration::from_secs(self.session_expiration)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.app_host, self.app_port)
    }
}

/// Session cookie settings carried into the authentication middleware.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub domain: String,
    pub secure: bool,
    pub httponly: bool,
    pub expiration: Duration,
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.session_name.clone(),
            domain: config.session_domain.clone(),
            secure: config.session_secure,
            httponly: config.session_httponly,
            expiration: config.session_expiration(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from([
            "cryptgate",
            "--c4gh-filepath",
            "/keys/server.key",
            "--oidc-configuration-url",
            "https://aai.example.org/.well-known/openid-configuration",
        ]);
        assert_eq!(config.app_port, 8080);
        assert_eq!(config.session_name, "sda_session_key");
        assert_eq!(config.archive_type, ArchiveType::Posix);
        assert_eq!(config.session_expiration().as_secs(), 28800);
    }

    #[test]
    fn test_bind_addr() {
        let config = Config::parse_from([
            "cryptgate",
            "--app-host",
            "127.0.0.1",
            "--app-port",
            "9443",
            "--c4gh-filepath",
            "/keys/server.key",
            "--oidc-configuration-url",
            "https://aai.example.org/.well-known/openid-configuration",
        ]);
        assert_eq!(config.bind_addr(), "127.0.0.1:9443");
    }
}
