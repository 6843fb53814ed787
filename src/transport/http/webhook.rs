use {
    crate::{
        AppState,
        domain::{error::PipelineError, id::ProviderPaymentId},
        services::reconcile::ReconcileOutcome,
        transport::http::errors::ApiError,
    },
    axum::{
        Json,
        extract::{Query, State},
    },
    serde::Deserialize,
    std::{collections::HashMap, sync::Arc},
    tracing::Instrument,
};

#[derive(Debug, Default, Deserialize)]
pub struct Notification {
    #[serde(rename = "type", alias = "topic")]
    pub kind: Option<String>,
    pub data: Option<NotificationData>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotificationData {
    /// Numeric or string, depending on the notification flavour.
    pub id: Option<serde_json::Value>,
}

/// Provider push. Only the payment id is taken from the body; the status is
/// always fetched from the provider. Processing continues in the background
/// and the provider gets its 200 right away.
#[tracing::instrument(
    name = "webhook",
    skip_all,
    fields(provider_payment_id = tracing::field::Empty, kind = tracing::field::Empty)
)]
pub async fn webhook_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let notification: Notification = if body.trim().is_empty() {
        Notification::default()
    } else {
        serde_json::from_str(&body)
            .map_err(|e| PipelineError::Validation(format!("malformed notification: {e}")))?
    };

    let kind = notification
        .kind
        .or_else(|| query.get("type").or_else(|| query.get("topic")).cloned());
    let raw_id = notification
        .data
        .and_then(|d| d.id)
        .and_then(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .or_else(|| query.get("data.id").or_else(|| query.get("id")).cloned())
        .ok_or_else(|| PipelineError::Validation("notification without data.id".into()))?;

    let id = ProviderPaymentId::new(raw_id)?;
    tracing::Span::current()
        .record("provider_payment_id", tracing::field::display(&id))
        .record("kind", tracing::field::debug(&kind));

    if let Some(kind) = kind.as_deref().filter(|k| *k != "payment") {
        tracing::info!(kind, "ignoring non-payment notification");
        return Ok(Json(serde_json::json!({ "success": true })));
    }

    let oracle = Arc::clone(&state.oracle);
    state.tasks.spawn(
        async move {
            match oracle.refresh(&id, "webhook").await {
                Ok(ReconcileOutcome::NotFound) => {
                    tracing::warn!("webhook for a payment with no local record");
                }
                Ok(ReconcileOutcome::Reconciled(r)) if !r.failed.is_empty() => {
                    tracing::warn!(failed = ?r.failed, "webhook reconciled with side effects outstanding");
                }
                Ok(ReconcileOutcome::Reconciled(r)) => {
                    tracing::info!(status = %r.record.status(), "webhook reconciled");
                }
                Err(e) => {
                    tracing::error!(error = %e, retriable = e.is_retriable(), "webhook processing failed");
                }
            }
        }
        .in_current_span(),
    );

    Ok(Json(serde_json::json!({ "success": true })))
}
