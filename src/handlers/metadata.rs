//! Dataset and file listing endpoints.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;

use super::AppState;
use crate::auth::Datasets;
use crate::db::FileInfo;
use crate::error::sanitize;
use crate::{Error, Result};

/// List the datasets the caller is authorized for.
///
/// This is the one endpoint that answers an empty list instead of a 404, so
/// clients can distinguish "no permissions" from "bad token".
pub async fn datasets(Extension(Datasets(datasets)): Extension<Datasets>) -> Json<Vec<String>> {
    tracing::debug!("returning {} permitted datasets", datasets.len());
    Json(datasets)
}

#[derive(Debug, Deserialize)]
pub struct SchemeQuery {
    /// Reattached URI scheme for dataset ids whose scheme cannot ride in the
    /// path (`?scheme=https` turns `doi.org/abc` into `https://doi.org/abc`).
    pub scheme: Option<String>,
}

/// List the files of one dataset: `/metadata/datasets/{dataset}/files`.
///
/// The dataset id may contain slashes, so the route captures the whole
/// remainder and the `/files` suffix is split off here.
pub async fn dataset_files(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    Query(query): Query<SchemeQuery>,
    Extension(Datasets(datasets)): Extension<Datasets>,
) -> Result<Json<Vec<FileInfo>>> {
    let Some(dataset) = rest.strip_suffix("/files") else {
        return Err(Error::DatasetNotFound);
    };

    let dataset = match &query.scheme {
        Some(scheme) if !scheme.is_empty() => format!("{scheme}://{dataset}"),
        _ => dataset.to_string(),
    };

    tracing::debug!("request to list files for dataset {}", sanitize(&dataset));

    if !datasets.contains(&dataset) {
        return Err(Error::DatasetNotFound);
    }

    let files = state.store.get_files(&dataset).await?;
    Ok(Json(files))
}
