//! HTTP/SSE instance of the command and event surface. The
//! orchestrator itself is transport-agnostic; this router is the
//! boundary a UI collaborator (web, native, headless harness) talks
//! across.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

use crate::conversion::ConversionConfig;
use crate::ffmpeg::{AvailableEncoders, SourceMetadata};
use crate::orchestrator::{Error, Orchestrator};
use crate::tasks::TaskSnapshot;

#[derive(OpenApi)]
#[openapi(
    paths(
        queue_conversion,
        all_conversions,
        conversion_status,
        delete_conversion,
        pause_conversion,
        resume_conversion,
        cancel_conversion,
        conversion_log,
        probe_media,
        available_encoders,
        get_max_concurrency,
        set_max_concurrency,
    ),
    components(schemas(
        QueueConversionRequest,
        ProbeRequest,
        Concurrency,
        ConversionConfig,
        SourceMetadata,
        AvailableEncoders,
        TaskSnapshot,
        crate::conversion::Container,
        crate::conversion::VideoCodec,
        crate::conversion::AudioCodec,
        crate::conversion::Preset,
        crate::conversion::Resolution,
        crate::conversion::ScalingAlgorithm,
        crate::conversion::Fps,
        crate::conversion::Rotation,
        crate::conversion::CropRect,
        crate::conversion::BitrateMode,
        crate::conversion::MetadataMode,
        crate::conversion::MetadataTags,
        crate::conversion::MetadataConfig,
        crate::ffmpeg::VideoStreamInfo,
        crate::ffmpeg::AudioTrackInfo,
        crate::ffmpeg::SubtitleTrackInfo,
        crate::tasks::TaskStatus,
    ))
)]
pub struct OpenApiDoc;

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);
    Router::new()
        .route("/api/conversion", post(queue_conversion).get(all_conversions))
        .route(
            "/api/conversion/{id}",
            get(conversion_status).delete(delete_conversion),
        )
        .route("/api/conversion/{id}/pause", post(pause_conversion))
        .route("/api/conversion/{id}/resume", post(resume_conversion))
        .route("/api/conversion/{id}/cancel", post(cancel_conversion))
        .route("/api/conversion/{id}/log", get(conversion_log))
        .route("/api/probe", post(probe_media))
        .route("/api/encoders", get(available_encoders))
        .route(
            "/api/concurrency",
            get(get_max_concurrency).put(set_max_concurrency),
        )
        .route("/api/events", get(events))
        .route("/api/openapi.json", get(openapi_doc))
        .layer(cors)
        .with_state(orchestrator)
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueConversionRequest {
    pub id: String,
    #[schema(value_type = String)]
    pub file_path: PathBuf,
    pub output_name: Option<String>,
    pub config: ConversionConfig,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRequest {
    #[schema(value_type = String)]
    pub file_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Concurrency {
    pub value: usize,
}

/// Queue a conversion task
#[utoipa::path(
    post,
    path = "/api/conversion",
    request_body = QueueConversionRequest,
    responses(
        (status = 200, description = "Task accepted and queued"),
        (status = 400, description = "Config can not produce a legal conversion"),
    ),
    tag = "Conversion",
)]
pub async fn queue_conversion(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<QueueConversionRequest>,
) -> Result<(), Error> {
    orchestrator
        .queue(
            request.id,
            request.file_path,
            request.output_name,
            request.config,
        )
        .await
}

/// List all known tasks
#[utoipa::path(
    get,
    path = "/api/conversion",
    responses(
        (status = 200, description = "Snapshots of every task", body = Vec<TaskSnapshot>),
    ),
    tag = "Conversion",
)]
pub async fn all_conversions(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Json<Vec<TaskSnapshot>> {
    Json(orchestrator.tasks())
}

/// Get one task snapshot
#[utoipa::path(
    get,
    path = "/api/conversion/{id}",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task snapshot", body = TaskSnapshot),
        (status = 404, description = "Task not found"),
    ),
    tag = "Conversion",
)]
pub async fn conversion_status(
    Path(id): Path<String>,
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Result<Json<TaskSnapshot>, Error> {
    orchestrator.task(&id).map(Json)
}

/// Drop a finished task from the registry
#[utoipa::path(
    delete,
    path = "/api/conversion/{id}",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task removed"),
        (status = 400, description = "Task is still active"),
        (status = 404, description = "Task not found"),
    ),
    tag = "Conversion",
)]
pub async fn delete_conversion(
    Path(id): Path<String>,
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Result<(), Error> {
    orchestrator.delete_task(&id)
}

/// Pause a running conversion
#[utoipa::path(
    post,
    path = "/api/conversion/{id}/pause",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Pause delivered (no-op unless running)"),
        (status = 404, description = "Task not found"),
    ),
    tag = "Conversion",
)]
pub async fn pause_conversion(
    Path(id): Path<String>,
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Result<(), Error> {
    orchestrator.pause(&id)
}

/// Resume a paused conversion
#[utoipa::path(
    post,
    path = "/api/conversion/{id}/resume",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Resume delivered (no-op unless paused)"),
        (status = 404, description = "Task not found"),
    ),
    tag = "Conversion",
)]
pub async fn resume_conversion(
    Path(id): Path<String>,
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Result<(), Error> {
    orchestrator.resume(&id)
}

/// Cancel a queued or running conversion
#[utoipa::path(
    post,
    path = "/api/conversion/{id}/cancel",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Cancellation delivered"),
        (status = 404, description = "Task not found"),
    ),
    tag = "Conversion",
)]
pub async fn cancel_conversion(
    Path(id): Path<String>,
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Result<(), Error> {
    orchestrator.cancel(&id).await
}

/// Recent log lines of a task
#[utoipa::path(
    get,
    path = "/api/conversion/{id}/log",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Bounded ring of recent stderr lines", body = Vec<String>),
        (status = 404, description = "Task not found"),
    ),
    tag = "Conversion",
)]
pub async fn conversion_log(
    Path(id): Path<String>,
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Result<Json<Vec<String>>, Error> {
    orchestrator.task_log(&id).map(Json)
}

/// Probe a media file
#[utoipa::path(
    post,
    path = "/api/probe",
    request_body = ProbeRequest,
    responses(
        (status = 200, description = "Source metadata", body = SourceMetadata),
        (status = 400, description = "ffprobe failed on the file"),
    ),
    tag = "Media",
)]
pub async fn probe_media(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<ProbeRequest>,
) -> Result<Json<SourceMetadata>, Error> {
    orchestrator.probe(&request.file_path).await.map(Json)
}

/// Hardware encoders available in the ffmpeg build
#[utoipa::path(
    get,
    path = "/api/encoders",
    responses(
        (status = 200, description = "Capability snapshot", body = AvailableEncoders),
    ),
    tag = "Media",
)]
pub async fn available_encoders(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Json<AvailableEncoders> {
    Json(orchestrator.available_encoders().await)
}

/// Current admission limit
#[utoipa::path(
    get,
    path = "/api/concurrency",
    responses((status = 200, description = "Current limit", body = Concurrency)),
    tag = "Scheduler",
)]
pub async fn get_max_concurrency(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Json<Concurrency> {
    Json(Concurrency {
        value: orchestrator.max_concurrency().await,
    })
}

/// Change the admission limit at runtime
#[utoipa::path(
    put,
    path = "/api/concurrency",
    request_body = Concurrency,
    responses(
        (status = 200, description = "Limit applied"),
        (status = 400, description = "Limit must be at least 1"),
    ),
    tag = "Scheduler",
)]
pub async fn set_max_concurrency(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<Concurrency>,
) -> Result<(), Error> {
    orchestrator.set_max_concurrency(request.value).await
}

/// Server-sent stream of conversion lifecycle events.
pub async fn events(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = orchestrator.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(receiver).map(|item| {
        if let Ok(event) = item {
            Ok(Event::default()
                .event(event.name())
                .json_data(&event)
                .unwrap_or_default())
        } else {
            // Lagged consumer: skip the gap with an empty keepalive.
            Ok(Event::default())
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn openapi_doc() -> Json<utoipa::openapi::OpenApi> {
    Json(OpenApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_request_uses_the_ui_field_names() {
        let raw = serde_json::json!({
            "id": "job-1",
            "filePath": "/media/in.mkv",
            "outputName": "final",
            "config": { "container": "mp4" }
        });
        let request: QueueConversionRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.id, "job-1");
        assert_eq!(request.file_path, PathBuf::from("/media/in.mkv"));
        assert_eq!(request.output_name.as_deref(), Some("final"));
    }

    #[test]
    fn openapi_document_builds() {
        let doc = OpenApiDoc::openapi();
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("/api/conversion"));
        assert!(json.contains("/api/concurrency"));
    }

    #[tokio::test]
    async fn router_builds() {
        let _router = router(Orchestrator::new(2));
    }
}
