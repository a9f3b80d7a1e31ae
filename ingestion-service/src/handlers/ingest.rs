use crate::dtos::{IngestRequest, IngestResponse};
use crate::models::MessageSource;
use crate::services::{IncomingMessage, IngestOutcome};
use crate::startup::AppState;
use axum::{extract::rejection::JsonRejection, extract::State, http::StatusCode, Json};
use service_core::error::AppError;
use validator::Validate;

/// Accepts one SMS from the device bridge.
///
/// 202 when the message was recorded (admitted or filtered), 200 when it was
/// a duplicate of an already ingested message.
#[tracing::instrument(skip(state, payload))]
pub async fn ingest_sms(
    State(state): State<AppState>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    let Json(request) = payload.map_err(|e| AppError::BadRequest(anyhow::anyhow!(e.body_text())))?;
    request.validate()?;

    if let Some(device_id) = &request.device_id {
        tracing::debug!(device_id = %device_id, "Bridge message received");
    }

    let incoming = IncomingMessage {
        source: MessageSource::Sms,
        external_id: None,
        received_at: request.received_at_or_now(),
        sender: request.sender.trim().to_string(),
        body: request.body,
    };

    let outcome = state.coordinator.ingest(incoming).await?;

    let (status, body) = match outcome {
        IngestOutcome::Admitted(message) => (
            StatusCode::ACCEPTED,
            IngestResponse {
                status: "accepted".to_string(),
                ingestion_id: Some(message.id),
                message: "SMS queued for processing".to_string(),
            },
        ),
        IngestOutcome::Filtered(message) => (
            StatusCode::ACCEPTED,
            IngestResponse {
                status: "filtered".to_string(),
                ingestion_id: Some(message.id),
                message: "SMS recorded but not financial".to_string(),
            },
        ),
        IngestOutcome::Duplicate { .. } => (
            StatusCode::OK,
            IngestResponse {
                status: "duplicate".to_string(),
                ingestion_id: None,
                message: "SMS already ingested".to_string(),
            },
        ),
    };

    Ok((status, Json(body)))
}
