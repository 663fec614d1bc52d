//! Request bodies.
//!
//! Clients send the same fields as multipart (with images), urlencoded or
//! JSON. `options` arrives either as a JSON array or as a string holding one.
//! Uploaded files are streamed to the node's spool directory, never held whole
//! in memory.

use std::path::Path;
use std::sync::Arc;

use axum::Json;
use axum::extract::multipart::Field;
use axum::extract::{Form, FromRequest, Multipart, Request};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use mosaic_core::MosaicError;
use mosaic_core::app::{NewTask, UploadedImage};
use mosaic_core::domain::TaskOption;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tempfile::{NamedTempFile, TempPath};
use tokio::io::AsyncWriteExt;

use crate::error::ApiError;
use crate::routes::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Multipart,
    Json,
    UrlEncoded,
    Empty,
}

fn body_kind(headers: &HeaderMap) -> BodyKind {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type.starts_with("multipart/form-data") {
        BodyKind::Multipart
    } else if content_type.starts_with("application/json") {
        BodyKind::Json
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        BodyKind::UrlEncoded
    } else {
        BodyKind::Empty
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OptionsField {
    List(Vec<TaskOption>),
    Encoded(String),
}

impl OptionsField {
    pub fn into_options(self) -> Result<Vec<TaskOption>, ApiError> {
        match self {
            OptionsField::List(options) => Ok(options),
            OptionsField::Encoded(text) => parse_options(&text),
        }
    }
}

fn parse_options(text: &str) -> Result<Vec<TaskOption>, ApiError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(text).map_err(|e| ApiError::invalid(format!("invalid options: {e}")))
}

/// Text fields of a task submission.
#[derive(Debug, Default, Deserialize)]
struct TaskFields {
    name: Option<String>,
    options: Option<OptionsField>,
    zipurl: Option<String>,
}

impl TaskFields {
    fn into_new_task(self) -> Result<NewTask, ApiError> {
        let options = match self.options {
            Some(field) => field.into_options()?,
            None => Vec::new(),
        };
        Ok(NewTask {
            name: self.name.filter(|n| !n.is_empty()),
            options,
            zip_url: self.zipurl.filter(|u| !u.is_empty()),
        })
    }
}

/// Task fields plus any uploaded files.
#[derive(Debug, Default)]
pub struct TaskForm {
    pub task: NewTask,
    pub images: Vec<UploadedImage>,
}

impl FromRequest<Arc<AppState>> for TaskForm {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        match body_kind(req.headers()) {
            BodyKind::Multipart => {
                let multipart = Multipart::from_request(req, state)
                    .await
                    .map_err(|e| ApiError::invalid(e.body_text()))?;
                read_multipart(multipart, &state.node.spool_dir()).await
            }
            BodyKind::Json | BodyKind::UrlEncoded => {
                let fields: TaskFields = read_fields(req, state).await?;
                Ok(TaskForm {
                    task: fields.into_new_task()?,
                    images: Vec::new(),
                })
            }
            BodyKind::Empty => Ok(TaskForm::default()),
        }
    }
}

async fn read_multipart(mut multipart: Multipart, spool_dir: &Path) -> Result<TaskForm, ApiError> {
    let mut fields = TaskFields::default();
    let mut images = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::invalid(e.body_text()))?
    {
        if let Some(file_name) = field.file_name().map(str::to_string) {
            let spooled = spool_field(field, spool_dir).await?;
            images.push(UploadedImage::spooled(file_name, spooled));
            continue;
        }
        let name = field.name().unwrap_or_default().to_string();
        let text = field
            .text()
            .await
            .map_err(|e| ApiError::invalid(e.body_text()))?;
        match name.as_str() {
            "name" => fields.name = Some(text),
            "options" => fields.options = Some(OptionsField::Encoded(text)),
            "zipurl" => fields.zipurl = Some(text),
            _ => {}
        }
    }
    Ok(TaskForm {
        task: fields.into_new_task()?,
        images,
    })
}

/// Copy one file field to a temporary file, chunk by chunk. The file is
/// deleted again if the upload is rejected later on.
async fn spool_field(mut field: Field<'_>, spool_dir: &Path) -> Result<TempPath, ApiError> {
    let (file, path) = NamedTempFile::new_in(spool_dir)
        .map_err(MosaicError::from)?
        .into_parts();
    let mut file = tokio::fs::File::from_std(file);
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::invalid(e.body_text()))?
    {
        file.write_all(&chunk).await.map_err(MosaicError::from)?;
    }
    file.flush().await.map_err(MosaicError::from)?;
    Ok(path)
}

/// JSON or urlencoded body, whichever the client sent.
async fn read_fields<T, S>(req: Request, state: &S) -> Result<T, ApiError>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    if body_kind(req.headers()) == BodyKind::Json {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid(e.body_text()))?;
        Ok(value)
    } else {
        let Form(value) = Form::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid(e.body_text()))?;
        Ok(value)
    }
}

/// Body of `/task/cancel`, `/task/remove` and `/task/restart`.
#[derive(Debug, Deserialize)]
pub struct TaskAction {
    pub uuid: Option<String>,
    pub options: Option<OptionsField>,
}

impl<S: Send + Sync> FromRequest<S> for TaskAction {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        read_fields(req, state).await.map_err(ApiError::as_outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_accept_array_or_encoded_string() {
        let list: OptionsField =
            serde_json::from_value(json!([{"name": "dsm", "value": true}])).unwrap();
        let encoded: OptionsField =
            serde_json::from_value(json!(r#"[{"name": "dsm", "value": true}]"#)).unwrap();

        let expected = vec![TaskOption::new("dsm", true)];
        assert_eq!(list.into_options().unwrap(), expected);
        assert_eq!(encoded.into_options().unwrap(), expected);
    }

    #[test]
    fn blank_options_mean_none() {
        assert!(parse_options("  ").unwrap().is_empty());
        assert!(parse_options("{not json").is_err());
    }

    #[test]
    fn empty_fields_are_dropped() {
        let task = TaskFields {
            name: Some(String::new()),
            options: None,
            zipurl: Some(String::new()),
        }
        .into_new_task()
        .unwrap();
        assert_eq!(task.name, None);
        assert_eq!(task.zip_url, None);
    }
}
