use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("access token must be provided")]
    MissingToken,

    #[error("authorization scheme must be bearer")]
    BadScheme,

    #[error("token string is missing from authorization header")]
    MalformedHeader,

    #[error("bad token")]
    BadToken,

    #[error("aai request failed")]
    UpstreamAai(String),

    #[error("no datasets found")]
    NoDatasets,

    #[error("dataset not found")]
    DatasetNotFound,

    #[error("file not found")]
    FileNotFound,

    #[error("{0}")]
    BadRange(String),

    #[error("unauthorised")]
    Unauthorized,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("archive error")]
    Archive(String),

    #[error("database error")]
    Database(String),

    #[error("file stream error")]
    Stream(String),

    #[error("internal error")]
    Internal(String),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::MissingToken | Error::BadToken | Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::BadScheme | Error::MalformedHeader | Error::BadRange(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NoDatasets | Error::DatasetNotFound | Error::FileNotFound => {
                StatusCode::NOT_FOUND
            }
            Error::UpstreamAai(_)
            | Error::NotImplemented(_)
            | Error::Archive(_)
            | Error::Database(_)
            | Error::Stream(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::UpstreamAai(reason)
            | Error::Archive(reason)
            | Error::Database(reason)
            | Error::Stream(reason)
            | Error::Internal(reason) => {
                tracing::error!("{}: {}", self, reason);
            }
            _ => tracing::debug!("request rejected: {}", self),
        }
        // Plain-text bodies: clients match on the description strings.
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Makes a user-supplied identifier safe for log output.
///
/// Strips CR/LF so attacker-controlled ids cannot forge log lines, and
/// prefixes the value so it is recognizable as foreign input.
pub fn sanitize(identifier: &str) -> String {
    let cleaned: String = identifier
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect();
    format!("[identifier]: {cleaned}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_line_breaks() {
        assert_eq!(
            sanitize("urn:file\r\nfake log line"),
            "[identifier]: urn:filefake log line"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::MissingToken.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::BadScheme.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::NoDatasets.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::NotImplemented("range".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_bodies_are_stable() {
        assert_eq!(Error::Unauthorized.to_string(), "unauthorised");
        assert_eq!(Error::NoDatasets.to_string(), "no datasets found");
        assert_eq!(Error::Database("boom".into()).to_string(), "database error");
    }
}
