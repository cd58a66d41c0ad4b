//! The download path: permission check, file resolution, coordinate
//! parsing, mode selection and the streamed response.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::Extension;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tokio::io::AsyncReadExt;

use super::AppState;
use crate::auth::Datasets;
use crate::crypt4gh::{header as c4gh_header, stream, DecryptStream, RawStream};
use crate::error::sanitize;
use crate::{Error, Result};

/// Recipient key for header re-encryption, base64 of 32 raw bytes.
const CLIENT_PUBLIC_KEY_HEADER: &str = "client-public-key";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinateQuery {
    pub start_coordinate: Option<String>,
    pub end_coordinate: Option<String>,
}

/// Extra response headers for downloads dispatched through the S3 surface.
pub(crate) struct S3ResponseInfo {
    pub filename: String,
    pub etag: String,
    pub last_modified: String,
}

/// `GET|HEAD /files/{fileid}[/encrypted]`.
pub async fn download(
    State(state): State<AppState>,
    method: Method,
    Path(rest): Path<String>,
    Query(query): Query<CoordinateQuery>,
    headers: HeaderMap,
    Extension(Datasets(datasets)): Extension<Datasets>,
) -> Result<Response> {
    let (file_id, encrypted) = split_mode(&rest);
    serve_file(
        &state, &method, file_id, &datasets, &query, encrypted, None, &headers,
    )
    .await
}

/// The `/encrypted` path suffix selects pass-through mode.
fn split_mode(rest: &str) -> (&str, bool) {
    match rest.strip_suffix("/encrypted") {
        Some(file_id) if !file_id.is_empty() => (file_id, true),
        _ => (rest, false),
    }
}

/// Serve one file, shared between the plain download route and the S3
/// GetObject path.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn serve_file(
    state: &AppState,
    method: &Method,
    file_id: &str,
    datasets: &[String],
    query: &CoordinateQuery,
    encrypted: bool,
    s3: Option<S3ResponseInfo>,
    headers: &HeaderMap,
) -> Result<Response> {
    // Permission first: the file's owning dataset must be in the caller's
    // authorized list.
    let dataset = match state.store.check_file_permission(file_id).await {
        Ok(Some(dataset)) => dataset,
        _ => {
            tracing::debug!("requested file {} does not exist", sanitize(file_id));
            return Err(Error::FileNotFound);
        }
    };
    if !datasets.iter().any(|d| *d == dataset) {
        tracing::debug!(
            "user requested file {} without permission for dataset {}",
            sanitize(file_id),
            sanitize(&dataset)
        );
        return Err(Error::Unauthorized);
    }

    let file = state.store.get_file(file_id).await?;
    let reader = state.archive.new_file_reader(&file.archive_path).await?;
    let coordinates = parse_coordinates(query)?;

    let mut header_bytes = file.header;
    if encrypted {
        if let Some(recipient) = client_public_key(headers)? {
            tracing::debug!("resealing header for caller-provided recipient key");
            header_bytes = c4gh_header::reencrypt(&header_bytes, &state.c4gh_key, &recipient)?;
        }
    }

    let header_len = header_bytes.len() as u64;
    let content_length = if encrypted {
        match coordinates {
            Some((start, _)) if start > 0 => {
                return Err(Error::NotImplemented(
                    "encrypted downloads only support ranges starting at coordinate zero".into(),
                ));
            }
            Some((start, end)) => stream::encrypted_end(header_len, start, end, file.archive_size),
            None => header_len + file.archive_size,
        }
    } else {
        match coordinates {
            Some((start, end)) => end - start,
            None => file.decrypted_size,
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, content_length);

    if let Some(s3) = s3 {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", s3.filename),
        );
        if !s3.etag.is_empty() {
            builder = builder.header(header::ETAG, s3.etag);
        }
        if let Some(date) = http_date(&s3.last_modified) {
            builder = builder.header(header::LAST_MODIFIED, date);
        }
    }

    if *method == Method::HEAD {
        return builder
            .body(Body::empty())
            .map_err(|e| Error::Internal(e.to_string()));
    }

    let body = if encrypted {
        let stitched = stream::stitch(header_bytes, reader);
        let raw = RawStream::new(stitched.take(content_length));
        Body::from_stream(futures::stream::try_unfold(raw, |mut raw| async move {
            match raw.next_chunk().await {
                Ok(chunk) => Ok(chunk.map(|chunk| (chunk, raw))),
                Err(e) => Err(e),
            }
        }))
    } else {
        let opened = c4gh_header::deconstruct(&header_bytes, &state.c4gh_key)?;
        let range = coordinates.map(|(start, end)| (start, Some(end)));
        let decrypting = DecryptStream::new(&opened, reader, range);
        Body::from_stream(futures::stream::try_unfold(
            decrypting,
            |mut decrypting| async move {
                match decrypting.next_chunk().await {
                    Ok(chunk) => Ok(chunk.map(|chunk| (chunk, decrypting))),
                    Err(e) => Err(std::io::Error::other(e.to_string())),
                }
            },
        ))
    };

    tracing::debug!("begin data stream for {}", sanitize(file_id));
    builder
        .body(body)
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Parse the `[startCoordinate, endCoordinate)` query window.
///
/// Both parameters must be present and non-zero to select a range; a
/// `0, 0` pair means a full-file request.
pub(crate) fn parse_coordinates(query: &CoordinateQuery) -> Result<Option<(u64, u64)>> {
    let (Some(start_raw), Some(end_raw)) = (&query.start_coordinate, &query.end_coordinate) else {
        return Ok(None);
    };
    if start_raw.is_empty() || end_raw.is_empty() {
        return Ok(None);
    }

    let start: u64 = start_raw
        .parse()
        .map_err(|_| Error::BadRange("startCoordinate must be an integer".into()))?;
    let end: u64 = end_raw
        .parse()
        .map_err(|_| Error::BadRange("endCoordinate must be an integer".into()))?;
    if end < start {
        return Err(Error::BadRange(
            "endCoordinate must be greater than startCoordinate".into(),
        ));
    }
    if start == 0 && end == 0 {
        return Ok(None);
    }
    Ok(Some((start, end)))
}

/// Decode the optional caller-supplied recipient public key.
fn client_public_key(headers: &HeaderMap) -> Result<Option<[u8; 32]>> {
    let Some(value) = headers.get(CLIENT_PUBLIC_KEY_HEADER) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| Error::BadRange("invalid client public key".into()))?;
    let bytes = BASE64
        .decode(value.trim())
        .map_err(|_| Error::BadRange("invalid client public key".into()))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::BadRange("invalid client public key".into()))?;
    Ok(Some(key))
}

/// RFC3339 timestamp to an HTTP date header value.
pub(crate) fn http_date(rfc3339: &str) -> Option<String> {
    let parsed = chrono::DateTime::parse_from_rfc3339(rfc3339).ok()?;
    Some(
        parsed
            .with_timezone(&chrono::Utc)
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(start: Option<&str>, end: Option<&str>) -> CoordinateQuery {
        CoordinateQuery {
            start_coordinate: start.map(str::to_string),
            end_coordinate: end.map(str::to_string),
        }
    }

    #[test]
    fn test_no_coordinates() {
        assert_eq!(parse_coordinates(&query(None, None)).unwrap(), None);
        assert_eq!(parse_coordinates(&query(Some("5"), None)).unwrap(), None);
    }

    #[test]
    fn test_zero_pair_is_full_file() {
        assert_eq!(
            parse_coordinates(&query(Some("0"), Some("0"))).unwrap(),
            None
        );
    }

    #[test]
    fn test_valid_range() {
        assert_eq!(
            parse_coordinates(&query(Some("10"), Some("20"))).unwrap(),
            Some((10, 20))
        );
    }

    #[test]
    fn test_non_integer_coordinates() {
        let err = parse_coordinates(&query(Some("ten"), Some("20"))).unwrap_err();
        assert_eq!(err.to_string(), "startCoordinate must be an integer");
        let err = parse_coordinates(&query(Some("10"), Some("-1"))).unwrap_err();
        assert_eq!(err.to_string(), "endCoordinate must be an integer");
    }

    #[test]
    fn test_inverted_range() {
        let err = parse_coordinates(&query(Some("20"), Some("10"))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "endCoordinate must be greater than startCoordinate"
        );
    }

    #[test]
    fn test_split_mode() {
        assert_eq!(split_mode("urn:file1"), ("urn:file1", false));
        assert_eq!(split_mode("urn:file1/encrypted"), ("urn:file1", true));
        assert_eq!(split_mode("/encrypted"), ("/encrypted", false));
    }

    #[test]
    fn test_http_date() {
        assert_eq!(
            http_date("2024-05-02T10:00:00Z").as_deref(),
            Some("Thu, 02 May 2024 10:00:00 GMT")
        );
        assert_eq!(http_date("yesterday"), None);
    }
}
