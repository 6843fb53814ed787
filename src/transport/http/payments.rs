use {
    crate::{
        AppState,
        domain::{
            id::ProviderPaymentId,
            money::Currency,
            payment::{PaymentMethod, PaymentStatus},
            provider::ProviderArtifacts,
        },
        services::{
            payment_intent::{PaymentIntent, PaymentIntentInput},
            status_oracle::StatusView,
        },
        transport::http::errors::ApiError,
    },
    axum::{
        Json,
        extract::{Path, State, rejection::JsonRejection},
        http::StatusCode,
    },
    serde::{Deserialize, Serialize},
    std::sync::Arc,
    tracing::Instrument,
    uuid::Uuid,
};

/// Missing fields deserialize empty and are rejected by validation, so the
/// client gets one error shape for every bad body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentBody {
    #[serde(default)]
    pub course_id: String,
    #[serde(default)]
    pub course_name: String,
    /// `"149.90"` or `149.9`.
    #[serde(default)]
    pub amount: serde_json::Value,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_email: String,
    #[serde(default)]
    pub user_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCreatedResponse {
    pub record_id: Uuid,
    pub provider_payment_id: Option<String>,
    pub checkout_id: Option<String>,
    pub status: PaymentStatus,
    pub method: PaymentMethod,
    pub amount: String,
    pub currency: Currency,
    pub artifacts: ProviderArtifacts,
}

impl From<PaymentIntent> for PaymentCreatedResponse {
    fn from(intent: PaymentIntent) -> Self {
        let record = intent.record;
        Self {
            record_id: record.id(),
            provider_payment_id: record.provider_payment_id().map(|id| id.as_str().to_string()),
            checkout_id: record.checkout_id().map(str::to_string),
            status: record.status(),
            method: record.method(),
            amount: record.money().amount().to_string(),
            currency: record.money().currency(),
            artifacts: intent.artifacts,
        }
    }
}

pub async fn create_payment(
    State(state): State<AppState>,
    payload: Result<Json<CreatePaymentBody>, JsonRejection>,
) -> Result<(StatusCode, Json<PaymentCreatedResponse>), ApiError> {
    let Json(body) = payload?;
    let amount = match body.amount {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    };

    let input = PaymentIntentInput {
        course_id: body.course_id,
        course_name: body.course_name,
        amount,
        method: body.method,
        user_id: body.user_id,
        user_email: body.user_email,
        user_name: body.user_name,
    };
    let intents = Arc::clone(&state.intents);
    let intent = state
        .tasks
        .run(async move { intents.create(input).await }.in_current_span())
        .await?;

    Ok((StatusCode::CREATED, Json(intent.into())))
}

pub async fn payment_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusView>, ApiError> {
    let id = ProviderPaymentId::new(id)?;
    let oracle = Arc::clone(&state.oracle);
    let view = state
        .tasks
        .run(async move { oracle.check(&id).await }.in_current_span())
        .await?;
    Ok(Json(view))
}
