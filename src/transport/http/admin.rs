//! Operator routes. Every state change goes through the reconciler; there is
//! no path that writes a status directly.

use {
    crate::{
        AppState,
        domain::{
            error::PipelineError,
            id::ProviderPaymentId,
            payment::{PaymentRecord, PaymentStatus, SideEffect},
        },
        services::{
            payment_intent::AdminGrantInput,
            reconcile::{ReconcileOutcome, Transition},
        },
        transport::http::errors::ApiError,
    },
    axum::{
        Json,
        extract::{Path, Query, State, rejection::JsonRejection},
        http::{HeaderMap, StatusCode},
    },
    serde::{Deserialize, Serialize},
    std::sync::Arc,
    tracing::Instrument,
};

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantBody {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_email: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub course_id: String,
    #[serde(default)]
    pub course_name: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailQuery {
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub transition: &'static str,
    pub applied: Vec<SideEffect>,
    pub failed: Vec<SideEffect>,
    pub record: PaymentRecord,
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::AdminDisabled);
    };
    let given = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if constant_time_eq(given.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        tracing::warn!("admin request with bad token");
        Err(ApiError::Unauthorized)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn into_response(
    outcome: ReconcileOutcome,
    id: &ProviderPaymentId,
) -> Result<Json<ReconcileResponse>, ApiError> {
    match outcome {
        ReconcileOutcome::NotFound => Err(PipelineError::RecordNotFound(id.to_string()).into()),
        ReconcileOutcome::Reconciled(r) => Ok(Json(ReconcileResponse {
            transition: match r.transition {
                Transition::Advanced { .. } => "advanced",
                Transition::Unchanged => "unchanged",
                Transition::Anomaly { .. } => "anomaly",
            },
            applied: r.applied,
            failed: r.failed,
            record: r.record,
        })),
    }
}

#[tracing::instrument(name = "admin_grant", skip_all)]
pub async fn grant_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<GrantBody>, JsonRejection>,
) -> Result<(StatusCode, Json<PaymentRecord>), ApiError> {
    authorize(&state, &headers)?;
    let Json(body) = payload?;

    let input = AdminGrantInput {
        user_id: body.user_id,
        user_email: body.user_email,
        user_name: body.user_name,
        course_id: body.course_id,
        course_name: body.course_name,
    };
    let intents = Arc::clone(&state.intents);
    let record = state
        .tasks
        .run(async move { intents.grant_admin_access(input).await }.in_current_span())
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Operator asserts the payment is approved.
#[tracing::instrument(name = "admin_approve", skip_all, fields(provider_payment_id = tracing::field::Empty))]
pub async fn force_approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ReconcileResponse>, ApiError> {
    authorize(&state, &headers)?;
    let id = ProviderPaymentId::new(id)?;
    tracing::Span::current().record("provider_payment_id", tracing::field::display(&id));
    let reconciler = Arc::clone(&state.reconciler);
    let target = id.clone();
    let outcome = state
        .tasks
        .run(
            async move {
                reconciler
                    .reconcile(&target, PaymentStatus::Approved, "admin")
                    .await
            }
            .in_current_span(),
        )
        .await?;
    into_response(outcome, &id)
}

/// Fetch the provider's view again and retry any missing side effects.
#[tracing::instrument(name = "admin_reconcile", skip_all, fields(provider_payment_id = tracing::field::Empty))]
pub async fn rerun(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ReconcileResponse>, ApiError> {
    authorize(&state, &headers)?;
    let id = ProviderPaymentId::new(id)?;
    tracing::Span::current().record("provider_payment_id", tracing::field::display(&id));
    let oracle = Arc::clone(&state.oracle);
    let target = id.clone();
    let outcome = state
        .tasks
        .run(async move { oracle.refresh(&target, "admin").await }.in_current_span())
        .await?;
    into_response(outcome, &id)
}

pub async fn list_by_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EmailQuery>,
) -> Result<Json<Vec<PaymentRecord>>, ApiError> {
    authorize(&state, &headers)?;
    let email = query
        .email
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| PipelineError::Validation("email query parameter is required".into()))?;
    let records = state.store.list_by_email(&email).await?;
    Ok(Json(records))
}
