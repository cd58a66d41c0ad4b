//! S3-compatibility surface.
//!
//! Maps a subset of the S3 REST API onto the archive: buckets are datasets,
//! objects are files. Dataset ids are often URIs containing slashes, so the
//! dataset/filename split is resolved against the caller's authorized list
//! rather than the path shape.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use percent_encoding::percent_decode_str;
use serde::Serialize;

use super::download::{self, CoordinateQuery, S3ResponseInfo};
use super::AppState;
use crate::auth::Datasets;
use crate::error::sanitize;
use crate::{Error, Result};

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";
const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

#[derive(Debug, Serialize)]
#[serde(rename = "LocationConstraint")]
struct LocationConstraint {
    #[serde(rename = "@xmlns")]
    xmlns: String,
    #[serde(rename = "$text")]
    location: String,
}

#[derive(Debug, Serialize)]
struct Owner {
    #[serde(rename = "DisplayName")]
    display_name: String,
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Serialize)]
struct Bucket {
    #[serde(rename = "CreationDate")]
    creation_date: String,
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Serialize)]
struct Buckets {
    #[serde(rename = "Bucket")]
    bucket: Vec<Bucket>,
}

#[derive(Debug, Serialize)]
#[serde(rename = "ListAllMyBucketsResult")]
struct ListAllMyBucketsResult {
    #[serde(rename = "Buckets")]
    buckets: Buckets,
    #[serde(rename = "Owner")]
    owner: Owner,
}

#[derive(Debug, Serialize)]
struct Object {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "LastModified", skip_serializing_if = "String::is_empty")]
    last_modified: String,
    #[serde(rename = "Size")]
    size: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename = "ListBucketResult")]
struct ListBucketResult {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Contents")]
    contents: Vec<Object>,
}

/// Entry point for `GET|HEAD /s3/{path...}`.
///
/// The request kind is inferred the way S3 clients expect: a `location`
/// query selects GetBucketLocation, a bare path lists buckets, a dataset
/// path lists objects, and a dataset + filename path fetches an object.
pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(coordinates): Query<CoordinateQuery>,
    headers: HeaderMap,
    Extension(Datasets(datasets)): Extension<Datasets>,
) -> Result<Response> {
    let raw = uri.path().strip_prefix("/s3").unwrap_or("");
    let trimmed = raw.trim_matches('/');
    let decoded = percent_decode_str(trimmed)
        .decode_utf8()
        .map_err(|_| Error::BadRange("invalid path encoding".into()))?
        .to_string();
    let path = restore_scheme_slashes(&decoded);

    let query = uri.query().unwrap_or("");
    if has_param(query, "location") {
        return bucket_location();
    }
    if has_param(query, "prefix") {
        // Recursive listings are not supported.
        return Ok(StatusCode::NOT_IMPLEMENTED.into_response());
    }

    match split_dataset_path(&path, &datasets) {
        None if path.is_empty() => list_buckets(&state, &datasets).await,
        None => {
            tracing::debug!("s3 path {} matches no authorized dataset", sanitize(&path));
            Err(Error::DatasetNotFound)
        }
        Some((dataset, None)) => list_objects(&state, &dataset, &datasets).await,
        Some((dataset, Some(filename))) => {
            get_object(
                &state,
                &method,
                &dataset,
                &filename,
                &coordinates,
                &datasets,
                &headers,
            )
            .await
        }
    }
}

/// GetBucketLocation: a fixed region answer.
fn bucket_location() -> Result<Response> {
    xml_response(&LocationConstraint {
        xmlns: S3_XMLNS.to_string(),
        location: "us-west-2".to_string(),
    })
}

/// ListBuckets: the caller's datasets as buckets.
async fn list_buckets(state: &AppState, datasets: &[String]) -> Result<Response> {
    let mut buckets = Vec::with_capacity(datasets.len());
    for dataset in datasets {
        let info = state.store.get_dataset_info(dataset).await?;
        let Some(info) = info else { continue };
        buckets.push(Bucket {
            name: info.dataset_id,
            creation_date: info.created_at,
        });
    }

    xml_response(&ListAllMyBucketsResult {
        buckets: Buckets { bucket: buckets },
        owner: Owner {
            display_name: String::new(),
            id: String::new(),
        },
    })
}

/// ListObjects: dataset contents with submission paths as keys.
async fn list_objects(state: &AppState, dataset: &str, datasets: &[String]) -> Result<Response> {
    if !datasets.iter().any(|d| d == dataset) {
        return Err(Error::DatasetNotFound);
    }

    let files = state.store.get_files(dataset).await?;
    let contents = files
        .into_iter()
        .map(|file| Object {
            key: file
                .file_path
                .strip_suffix(".c4gh")
                .unwrap_or(&file.file_path)
                .to_string(),
            last_modified: download::http_date(&file.last_modified).unwrap_or_default(),
            size: file.decrypted_file_size,
        })
        .collect();

    xml_response(&ListBucketResult {
        name: dataset.to_string(),
        contents,
    })
}

/// GetObject: resolve the file by its submission path, then run the
/// ordinary download with S3 response headers attached.
async fn get_object(
    state: &AppState,
    method: &Method,
    dataset: &str,
    filename: &str,
    coordinates: &CoordinateQuery,
    datasets: &[String],
    headers: &HeaderMap,
) -> Result<Response> {
    let info = state
        .store
        .get_dataset_file_info(dataset, &format!("{filename}.c4gh"))
        .await?
        .ok_or(Error::FileNotFound)?;

    let s3 = S3ResponseInfo {
        filename: info.display_file_name.clone(),
        etag: info.decrypted_file_checksum.clone(),
        last_modified: info.last_modified.clone(),
    };
    download::serve_file(
        state,
        method,
        &info.file_id,
        datasets,
        coordinates,
        false,
        Some(s3),
        headers,
    )
    .await
}

fn xml_response<T: Serialize>(value: &T) -> Result<Response> {
    let body = quick_xml::se::to_string(value)
        .map_err(|e| Error::Internal(format!("xml serialization failed: {e}")))?;
    Ok((
        StatusCode::ACCEPTED,
        [(header::CONTENT_TYPE, "application/xml")],
        format!("{XML_DECLARATION}{body}"),
    )
        .into_response())
}

fn has_param(query: &str, name: &str) -> bool {
    query
        .split('&')
        .any(|pair| pair.split('=').next() == Some(name))
}

/// Restore `https://` after clients collapse double slashes to one.
fn restore_scheme_slashes(path: &str) -> String {
    for scheme in ["https:/", "http:/"] {
        if let Some(rest) = path.strip_prefix(scheme) {
            if !rest.starts_with('/') {
                return format!("{scheme}/{rest}");
            }
        }
    }
    path.to_string()
}

/// Split an S3 path into dataset and filename by matching the caller's
/// authorized datasets.
///
/// Dataset names routinely contain slashes, so the boundary can only come
/// from the dataset list. A dataset matches when the path equals it or
/// continues with a slash, which keeps `dataset1` from swallowing
/// `dataset10`.
fn split_dataset_path(path: &str, datasets: &[String]) -> Option<(String, Option<String>)> {
    for dataset in datasets {
        if !path.starts_with(dataset.as_str()) {
            continue;
        }
        if path.len() == dataset.len() {
            return Some((dataset.clone(), None));
        }
        if path.as_bytes()[dataset.len()] == b'/' {
            let filename = &path[dataset.len() + 1..];
            let filename = (!filename.is_empty()).then(|| filename.to_string());
            return Some((dataset.clone(), filename));
        }
    }
    None
}
