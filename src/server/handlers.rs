use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use super::error::ApiError;
use super::AppState;
use crate::config::DERIVED_EXTENSION;
use crate::storage;

/// Multipart field carrying the workbook
pub const FILE_FIELD: &str = "file";

const UPLOAD_FAILED: &str = "An error occurred during file upload.";
const FETCH_FAILED: &str = "An error occurred while fetching the JSON data.";
const DELETE_FAILED: &str = "An error occurred while deleting the files.";

/// POST /upload
///
/// Stores the workbook in the upload area. Conversion is left to the folder
/// watcher, so the JSON shows up shortly after rather than immediately.
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, ApiError> {
    let Ok(mut multipart) = multipart else {
        tracing::error!("No file part in the request.");
        return Err(ApiError::validation("No file part in the request"));
    };

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        // A plain form value named `file` is not a file part
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field.bytes().await.map_err(multipart_error)?;
        upload = Some((filename, bytes));
        break;
    }

    let Some((filename, bytes)) = upload else {
        tracing::error!("No file part in the request.");
        return Err(ApiError::validation("No file part in the request"));
    };

    if filename.is_empty() {
        tracing::error!("No file selected for uploading.");
        return Err(ApiError::validation("No file selected"));
    }

    let extension = &state.source_extension;
    let invalid_format = || {
        ApiError::validation(format!(
            "Invalid file format. Only {} files are allowed.",
            extension
        ))
    };

    if !filename.ends_with(extension.as_str()) {
        tracing::error!(filename = %filename, "Invalid file format. Only {} files are allowed.", extension);
        return Err(invalid_format());
    }

    let safe_name = storage::sanitize_filename(&filename)
        .filter(|name| storage::base_name(std::path::Path::new(name), extension).is_some())
        .ok_or_else(|| {
            tracing::error!(filename = %filename, "Filename has no usable characters");
            invalid_format()
        })?;

    let dir = state.areas.upload_dir.clone();
    let name = safe_name.clone();
    let written = tokio::task::spawn_blocking(move || storage::write_atomic(&dir, &name, &bytes)).await?;

    match written {
        Ok(path) => {
            tracing::info!(filename = %safe_name, path = %path.display(), "File uploaded successfully");
            Ok(Json(json!({
                "message": format!("File {} uploaded successfully.", safe_name)
            })))
        }
        Err(e) => {
            tracing::error!(filename = %safe_name, error = %e, "Error during file upload");
            Err(ApiError::unexpected(UPLOAD_FAILED))
        }
    }
}

fn multipart_error(e: MultipartError) -> ApiError {
    tracing::error!(error = %e, "Malformed multipart request");
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::validation("Uploaded file is too large")
    } else {
        ApiError::validation("No file part in the request")
    }
}

/// GET /data
///
/// Returns the content of the most recently created JSON file.
pub async fn get_latest_json(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let dir = state.areas.json_dir.clone();

    tokio::task::spawn_blocking(move || -> Result<Json<Value>, ApiError> {
        let files = storage::list_files(&dir, Some(DERIVED_EXTENSION)).map_err(|e| {
            tracing::error!(error = %e, "Error fetching JSON data");
            ApiError::io(FETCH_FAILED, e)
        })?;

        if files.is_empty() {
            tracing::error!("No JSON files found.");
            return Err(ApiError::not_found("No JSON files found."));
        }

        let latest = storage::latest_file(&files)
            .map_err(|e| ApiError::io(FETCH_FAILED, e))?
            .ok_or_else(|| ApiError::not_found("No JSON files found."))?;
        tracing::info!(file = %latest.display(), "Reading data from latest file");

        let content = std::fs::read(&latest).map_err(|e| {
            tracing::error!(file = %latest.display(), error = %e, "Error fetching JSON data");
            ApiError::io(FETCH_FAILED, e)
        })?;

        let data: Value = serde_json::from_slice(&content).map_err(|e| {
            tracing::error!(file = %latest.display(), error = %e, "Error parsing JSON data");
            ApiError::io(FETCH_FAILED, e)
        })?;

        Ok(Json(data))
    })
    .await?
}

/// DELETE /delete
///
/// Keeps only the newest file in each storage area.
pub async fn delete_old_files(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let areas = state.areas.clone();

    tokio::task::spawn_blocking(move || {
        for dir in [&areas.upload_dir, &areas.json_dir] {
            storage::retain_latest(dir).map_err(|e| {
                tracing::error!(error = %e, "Error deleting files");
                ApiError::io(DELETE_FAILED, e)
            })?;
        }

        Ok::<_, ApiError>(Json(json!({ "message": "Old files deleted, latest files retained." })))
    })
    .await?
}
