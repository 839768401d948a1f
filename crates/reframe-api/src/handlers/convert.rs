//! `POST /api/convert`.

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::{Multipart, State};
use axum::http::Response;
use reframe_media::{ConvertRequest, Pipeline, SourceDescriptor};
use reframe_models::{clean_field, ConvertParams};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use validator::Validate;

use crate::dispose::Disposer;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Raw multipart fields before validation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConvertForm {
    pub url: Option<String>,
    /// Staged upload path and the client-side file name
    pub upload: Option<(PathBuf, Option<String>)>,
    pub mode: Option<String>,
    pub fit: Option<String>,
    pub height: Option<String>,
    pub preset: Option<String>,
    pub maxrate: Option<String>,
    pub filename: Option<String>,
}

impl ConvertForm {
    /// Read every field, streaming a `file` part to `upload_path`.
    pub async fn read(
        multipart: &mut Multipart,
        upload_path: &Path,
        max_upload_bytes: u64,
    ) -> ApiResult<Self> {
        let mut form = ConvertForm::default();
        let mut url_fields = 0;

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    if form.upload.is_some() {
                        return Err(ApiError::AmbiguousInput);
                    }
                    let client_name = field.file_name().map(str::to_string);
                    let written = write_upload(field, upload_path, max_upload_bytes).await?;
                    // Browsers send an empty part when no file was picked
                    if written > 0 {
                        debug!(bytes = written, "Upload staged");
                        form.upload = Some((upload_path.to_path_buf(), client_name));
                    }
                }
                "url" => {
                    url_fields += 1;
                    form.url = non_empty(field.text().await?);
                }
                "mode" => form.mode = non_empty(field.text().await?),
                "fit" => form.fit = non_empty(field.text().await?),
                "h" => form.height = non_empty(field.text().await?),
                "preset" => form.preset = non_empty(field.text().await?),
                "maxrate" => form.maxrate = non_empty(field.text().await?),
                "filename" => form.filename = non_empty(field.text().await?),
                other => {
                    debug!(field = other, "Ignoring unknown form field");
                    let _ = field.bytes().await?;
                }
            }
        }

        if url_fields > 1 {
            return Err(ApiError::AmbiguousInput);
        }
        Ok(form)
    }

    /// Validate into a pipeline request.
    pub fn into_request(self) -> ApiResult<ConvertRequest> {
        let source = match (&self.url, &self.upload) {
            (Some(_), Some(_)) => return Err(ApiError::AmbiguousInput),
            (None, None) => return Err(ApiError::MissingInput),
            (Some(url), None) => {
                validate_source_url(url)?;
                SourceDescriptor::url(url.clone(), self.filename.clone())
            }
            (None, Some((path, client_name))) => SourceDescriptor::upload(
                path.clone(),
                self.filename.clone().or_else(|| client_name.clone()),
            ),
        };
        let params = self.params()?;
        Ok(ConvertRequest { source, params })
    }

    fn params(&self) -> ApiResult<ConvertParams> {
        let defaults = ConvertParams::default();
        let params = ConvertParams {
            mode: match &self.mode {
                Some(m) => m.parse::<reframe_models::ConvertMode>().map_err(|e| ApiError::invalid_parameter(e.to_string()))?,
                None => defaults.mode,
            },
            fit: match &self.fit {
                Some(f) => f.parse::<reframe_models::FitMode>().map_err(|e| ApiError::invalid_parameter(e.to_string()))?,
                None => defaults.fit,
            },
            height: match &self.height {
                Some(h) => h
                    .parse()
                    .map_err(|_| ApiError::invalid_parameter(format!("h must be an integer, got {}", h)))?,
                None => defaults.height,
            },
            preset: self.preset.clone().unwrap_or(defaults.preset),
            maxrate: self.maxrate.clone().unwrap_or(defaults.maxrate),
        };

        params
            .validate()
            .map_err(|e| ApiError::invalid_parameter(e.to_string()))?;
        Ok(params)
    }
}

/// Convert an uploaded or remote video to the requested geometry.
pub async fn convert(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Response<Body>> {
    let mut multipart = multipart.map_err(|e| ApiError::bad_body(e.body_text()))?;

    // Dropping the workdir removes everything staged for this request.
    let workdir = state.pipeline.create_workdir()?;

    // Client disconnect drops this future, which cancels the running engine.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let form = ConvertForm::read(
        &mut multipart,
        &Pipeline::upload_path(&workdir),
        state.pipeline.config().acquire.max_input_bytes,
    )
    .await?;
    let request = form.into_request()?;

    info!(
        mode = %request.params.mode,
        fit = %request.params.fit,
        height = request.params.height,
        upload = request.source.is_upload(),
        "Conversion requested"
    );

    let conversion = state.pipeline.run(request, workdir, cancel).await?;

    info!(
        tier = %conversion.artifact.mode_used,
        attempts = conversion.job.attempt_count(),
        size = conversion.artifact.size,
        orientation = %conversion.artifact.orientation,
        "Conversion finished"
    );

    let disposer = Disposer::new(state.config.inline_limit_bytes, state.store.clone());
    let response = disposer.dispose(&conversion.artifact).await?;
    drop(conversion);
    Ok(response)
}

async fn write_upload(mut field: Field<'_>, path: &Path, max_bytes: u64) -> ApiResult<u64> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to stage upload: {}", e)))?;

    let mut written: u64 = 0;
    while let Some(chunk) = field.chunk().await? {
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(ApiError::bad_body(format!(
                "Upload exceeds {} bytes",
                max_bytes
            )));
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| ApiError::internal(format!("Failed to stage upload: {}", e)))?;
    }

    file.flush()
        .await
        .map_err(|e| ApiError::internal(format!("Failed to stage upload: {}", e)))?;
    Ok(written)
}

fn validate_source_url(raw: &str) -> ApiResult<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ApiError::invalid_parameter(format!("url is not valid: {}", e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ApiError::invalid_parameter(format!(
            "url scheme {} is not supported",
            scheme
        ))),
    }
}

fn non_empty(value: String) -> Option<String> {
    let cleaned = clean_field(&value);
    (!cleaned.is_empty()).then_some(cleaned)
}
