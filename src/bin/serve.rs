//! HTTP front-end for the voice-clone pipeline.
//!
//! Environment:
//! - `VOICECLONE_WORKER` (required): worker command line, e.g. `python3 worker.py`
//! - `DEVICE`: `cuda`, `cuda:N`, `metal`/`mps` (default: Metal on macOS, else CUDA 0)
//! - `HOST` / `PORT`: bind address (default `0.0.0.0:8000`)
//! - `MAX_CONCURRENCY`: requests admitted at once (default 1; the model still runs one at a time)
//! - `OUTPUT_DIR`: where WAVs are written (default from config, `outputs`)
//! - `VOICECLONE_CONFIG`: optional pipeline config JSON
//!
//! Routes:
//! - `POST /v1/voice-clone` multipart `ref_audio`, `ref_text`, `text`, optional
//!   `language`, `model`, `response` (`json` or `wav`)
//! - `GET /v1/preflight`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Multipart, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Semaphore;

use qwen3_voiceclone::preflight::{self, PreflightIssue, PreflightTargets, WorkerTarget};
use qwen3_voiceclone::{
    Accelerator, DevicePolicy, Language, ModelPreset, OutputTarget, PipelineConfig,
    ProcessBackend, ReferenceLoader, SynthesisRequest, SynthesisResult, VoiceCloneError,
    VoiceClonePipeline, WorkerCommand,
};

struct AppState {
    pipeline: VoiceClonePipeline<ProcessBackend>,
    loader: ReferenceLoader,
    device_policy: DevicePolicy,
    output_dir: PathBuf,
    worker: WorkerCommand,
    semaphore: Semaphore,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'static str>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    stage: Option<&'static str>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            stage: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            stage: None,
        }
    }
}

impl From<VoiceCloneError> for ApiError {
    fn from(err: VoiceCloneError) -> Self {
        let status = match &err {
            VoiceCloneError::InvalidInput(_)
            | VoiceCloneError::Decode(_)
            | VoiceCloneError::Config(_) => StatusCode::BAD_REQUEST,
            VoiceCloneError::DeviceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
            stage: Some(err.stage()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
            stage: self.stage,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Default)]
struct VoiceCloneForm {
    ref_audio: Option<(Vec<u8>, Option<String>)>,
    ref_text: Option<String>,
    text: Option<String>,
    language: Option<String>,
    model: Option<String>,
    response: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<VoiceCloneForm, ApiError> {
    let mut form = VoiceCloneForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "ref_audio" {
            let file_name = field.file_name().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("ref_audio read error: {e}")))?;
            form.ref_audio = Some((bytes.to_vec(), file_name));
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ApiError::bad_request(format!("{name} read error: {e}")))?;
        match name.as_str() {
            "ref_text" => form.ref_text = Some(value),
            "text" => form.text = Some(value),
            "language" => form.language = Some(value),
            "model" => form.model = Some(value),
            "response" => form.response = Some(value),
            _ => tracing::debug!("Ignoring multipart field '{name}'"),
        }
    }
    Ok(form)
}

/// Keep the upload's extension so ffmpeg can pick the right demuxer.
fn upload_suffix(file_name: Option<&str>) -> String {
    file_name
        .and_then(|n| std::path::Path::new(n).extension())
        .and_then(|e| e.to_str())
        .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{e}"))
        .unwrap_or_else(|| ".wav".to_string())
}

async fn voice_clone(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_form(multipart).await?;

    let mut missing = Vec::new();
    if form.ref_audio.is_none() {
        missing.push("ref_audio");
    }
    if form.ref_text.as_deref().map_or(true, |t| t.trim().is_empty()) {
        missing.push("ref_text");
    }
    if form.text.as_deref().map_or(true, |t| t.trim().is_empty()) {
        missing.push("text");
    }
    if !missing.is_empty() {
        return Err(ApiError::bad_request(format!(
            "missing required field(s): {}",
            missing.join(", ")
        )));
    }

    let language = match form.language.as_deref() {
        Some(l) => l
            .parse::<Language>()
            .map_err(|e| ApiError::bad_request(format!("invalid language: {e}")))?,
        None => Language::default(),
    };
    let model = form
        .model
        .map(ModelPreset::from)
        .unwrap_or_default();
    let want_wav = matches!(form.response.as_deref(), Some("wav") | Some("audio"));

    let (ref_bytes, ref_name) = form
        .ref_audio
        .ok_or_else(|| ApiError::bad_request("ref_audio is required"))?;
    let ref_text = form.ref_text.unwrap_or_default();
    let text = form.text.unwrap_or_default();

    let _permit = state
        .semaphore
        .acquire()
        .await
        .map_err(|e| ApiError::internal(format!("server shutting down: {e}")))?;

    let task_state = Arc::clone(&state);
    let result = tokio::task::spawn_blocking(move || -> Result<SynthesisResult, ApiError> {
        let tmp = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(&upload_suffix(ref_name.as_deref()))
            .tempfile()
            .map_err(|e| ApiError::internal(format!("failed to create temp file: {e}")))?;
        std::fs::write(tmp.path(), &ref_bytes)
            .map_err(|e| ApiError::internal(format!("failed to write upload: {e}")))?;

        let reference = task_state.loader.load(tmp.path(), &ref_text)?;
        let request = SynthesisRequest {
            reference,
            full_text: text,
            output: OutputTarget::Directory(task_state.output_dir.clone()),
            model,
            language,
            device_policy: task_state.device_policy,
        };
        Ok(task_state.pipeline.synthesize(&request)?)
    })
    .await
    .map_err(|e| ApiError::internal(format!("task join error: {e}")))??;

    if !want_wav {
        return Ok(Json(result).into_response());
    }

    let bytes = tokio::fs::read(&result.output_path)
        .await
        .map_err(|e| ApiError::internal(format!("failed to read output: {e}")))?;
    let mut response = (StatusCode::OK, bytes).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/wav"));
    if let Ok(v) = HeaderValue::from_str(&result.failed_chunk_indices.len().to_string()) {
        headers.insert("x-failed-chunks", v);
    }
    Ok(response)
}

async fn preflight_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PreflightIssue>>, ApiError> {
    let task_state = Arc::clone(&state);
    let issues = tokio::task::spawn_blocking(move || {
        let targets = PreflightTargets {
            ffmpeg_path: task_state.loader.decoder().ffmpeg_path.clone(),
            worker: WorkerTarget::Command(task_state.worker.clone()),
            output_dir: task_state.output_dir.clone(),
        };
        let accelerator = task_state.device_policy.accelerator;
        preflight::run(&targets, || {
            task_state
                .pipeline
                .invoker()
                .lock(accelerator)
                .ensure_accelerator()
        })
    })
    .await
    .map_err(|e| ApiError::internal(format!("task join error: {e}")))?;
    Ok(Json(issues))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _profiling_guard = qwen3_voiceclone::profiling::init();

    let worker_line = std::env::var("VOICECLONE_WORKER")
        .context("VOICECLONE_WORKER is required (e.g. \"python3 worker.py\")")?;
    let worker = WorkerCommand::parse(&worker_line).context("VOICECLONE_WORKER is empty")?;

    let device_policy = match std::env::var("DEVICE") {
        Ok(d) => DevicePolicy::new(Accelerator::parse(&d).context("invalid DEVICE")?),
        Err(_) => DevicePolicy::default(),
    };

    let mut config = match std::env::var("VOICECLONE_CONFIG") {
        Ok(path) => PipelineConfig::from_file(&path)
            .with_context(|| format!("failed to load config {path}"))?,
        Err(_) => PipelineConfig::default(),
    };
    if let Ok(dir) = std::env::var("OUTPUT_DIR") {
        config.output_dir = PathBuf::from(dir);
    }

    let host = env_or("HOST", "0.0.0.0");
    let port: u16 = env_or("PORT", "8000").parse().context("invalid PORT")?;
    let max_concurrency: usize = env_or("MAX_CONCURRENCY", "1")
        .parse()
        .context("invalid MAX_CONCURRENCY")?;

    let loader = ReferenceLoader::new(config.reference.clone());
    let output_dir = config.output_dir.clone();
    let pipeline = VoiceClonePipeline::new(ProcessBackend::new(worker.clone()), config)?;

    tracing::info!(
        "Serving voice clone on {} with worker {}",
        device_policy.accelerator,
        worker_line
    );

    let state = Arc::new(AppState {
        pipeline,
        loader,
        device_policy,
        output_dir,
        worker,
        semaphore: Semaphore::new(max_concurrency.max(1)),
    });

    let app = Router::new()
        .route("/v1/voice-clone", post(voice_clone))
        .route("/v1/preflight", get(preflight_check))
        .with_state(state);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid HOST/PORT")?;
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
