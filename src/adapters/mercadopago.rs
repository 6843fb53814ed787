use {
    crate::{
        config::ProviderConfig,
        domain::{
            BoxFuture,
            error::PipelineError,
            id::ProviderPaymentId,
            money::MoneyAmount,
            payment::{PaymentMethod, PaymentStatus},
            provider::{
                CreatePaymentRequest, CreatedPayment, FetchedPayment, PaymentProvider,
                ProviderArtifacts,
            },
        },
    },
    reqwest::StatusCode,
    serde::{Deserialize, Serialize},
    std::str::FromStr,
    uuid::Uuid,
};

/// Gateway client for PIX payments and card checkout preferences.
pub struct MercadoPagoClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    notification_url: Option<String>,
    back_urls: Option<BackUrls>,
}

impl MercadoPagoClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Provider(format!("building HTTP client: {e}")))?;

        let back_urls = config.success_url.as_ref().map(|success| BackUrls {
            success: success.clone(),
            failure: config.failure_url.clone(),
            pending: config.pending_url.clone(),
        });

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            notification_url: config.notification_url.clone(),
            back_urls,
        })
    }

    async fn create_pix(&self, req: &CreatePaymentRequest) -> Result<CreatedPayment, PipelineError> {
        let body = PixPaymentBody {
            transaction_amount: amount_json(req.money.amount())?,
            description: &req.course_name,
            payment_method_id: "pix",
            external_reference: req.external_reference.as_str(),
            notification_url: self.notification_url.as_deref(),
            metadata: Metadata {
                record_id: req.record_id,
            },
            payer: PixPayer {
                email: &req.payer.email,
                first_name: &req.payer.first_name,
                last_name: &req.payer.last_name,
            },
        };

        let response = self
            .http
            .post(format!("{}/v1/payments", self.base_url))
            .bearer_auth(&self.access_token)
            .header("X-Idempotency-Key", req.record_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;
        let payment: MpPayment = decode(response).await?;

        let provider_payment_id = ProviderPaymentId::new(payment.id_string()?)?;
        let qr = payment
            .point_of_interaction
            .and_then(|p| p.transaction_data)
            .ok_or_else(|| PipelineError::Provider("PIX payment without transaction data".into()))?;
        let qr_code = qr
            .qr_code
            .ok_or_else(|| PipelineError::Provider("PIX payment without QR code".into()))?;

        Ok(CreatedPayment {
            provider_payment_id: Some(provider_payment_id),
            checkout_id: None,
            artifacts: ProviderArtifacts::Pix {
                qr_code,
                qr_code_base64: qr.qr_code_base64,
                ticket_url: qr.ticket_url,
            },
            status: normalize_status(&payment.status),
        })
    }

    async fn create_checkout(
        &self,
        req: &CreatePaymentRequest,
    ) -> Result<CreatedPayment, PipelineError> {
        let body = PreferenceBody {
            items: vec![PreferenceItem {
                id: &req.course_id,
                title: &req.course_name,
                quantity: 1,
                currency_id: req.money.currency().as_str(),
                unit_price: amount_json(req.money.amount())?,
            }],
            payer: PreferencePayer {
                email: &req.payer.email,
                name: &req.payer.first_name,
                surname: &req.payer.last_name,
            },
            external_reference: req.external_reference.as_str(),
            notification_url: self.notification_url.as_deref(),
            auto_return: self.back_urls.as_ref().map(|_| "approved"),
            back_urls: self.back_urls.as_ref(),
            metadata: Metadata {
                record_id: req.record_id,
            },
        };

        let response = self
            .http
            .post(format!("{}/checkout/preferences", self.base_url))
            .bearer_auth(&self.access_token)
            .header("X-Idempotency-Key", req.record_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;
        let preference: MpPreference = decode(response).await?;

        Ok(CreatedPayment {
            provider_payment_id: None,
            checkout_id: Some(preference.id),
            artifacts: ProviderArtifacts::Checkout {
                redirect_url: preference.init_point,
            },
            status: PaymentStatus::Pending,
        })
    }

    async fn fetch(&self, id: &ProviderPaymentId) -> Result<FetchedPayment, PipelineError> {
        let response = self
            .http
            .get(format!("{}/v1/payments/{}", self.base_url, id.as_str()))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(PipelineError::Provider(format!(
                "payment {id} not found at provider"
            )));
        }

        let raw: serde_json::Value = decode(response).await?;
        let payment: MpPayment = serde_json::from_value(raw.clone())
            .map_err(|e| PipelineError::Provider(format!("malformed payment body: {e}")))?;

        let status = normalize_status(&payment.status);
        let record_hint = payment
            .metadata
            .as_ref()
            .and_then(|m| m.get("record_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        Ok(FetchedPayment {
            provider_payment_id: id.clone(),
            status,
            raw_status: payment.status,
            external_reference: payment.external_reference,
            record_hint,
            raw,
        })
    }
}

impl PaymentProvider for MercadoPagoClient {
    fn create_payment<'a>(
        &'a self,
        req: &'a CreatePaymentRequest,
    ) -> BoxFuture<'a, Result<CreatedPayment, PipelineError>> {
        Box::pin(async move {
            match req.method {
                PaymentMethod::Pix => self.create_pix(req).await,
                PaymentMethod::Card => self.create_checkout(req).await,
                PaymentMethod::Admin => Err(PipelineError::Validation(
                    "admin grants are never sent to the provider".into(),
                )),
            }
        })
    }

    fn get_payment_status<'a>(
        &'a self,
        id: &'a ProviderPaymentId,
    ) -> BoxFuture<'a, Result<FetchedPayment, PipelineError>> {
        Box::pin(self.fetch(id))
    }
}

/// Gateway status → local status. Anything unrecognised stays `pending`:
/// an unknown status must never approve.
pub fn normalize_status(raw: &str) -> PaymentStatus {
    match raw {
        "approved" => PaymentStatus::Approved,
        "rejected" => PaymentStatus::Rejected,
        "cancelled" => PaymentStatus::Cancelled,
        "pending" | "in_process" | "in_mediation" | "authorized" => PaymentStatus::Pending,
        other => {
            tracing::warn!(status = other, "unrecognised provider status, treating as pending");
            PaymentStatus::Pending
        }
    }
}

fn amount_json(amount: MoneyAmount) -> Result<serde_json::Number, PipelineError> {
    serde_json::Number::from_str(&amount.to_string())
        .map_err(|e| PipelineError::Validation(format!("amount {amount}: {e}")))
}

fn unavailable(e: reqwest::Error) -> PipelineError {
    PipelineError::ProviderUnavailable(e.to_string())
}

/// Auth, throttling and server errors are transient; other non-2xx answers
/// are the provider refusing the request.
fn classify(status: StatusCode, body: &str) -> PipelineError {
    let snippet: String = body.chars().take(200).collect();
    let msg = format!("HTTP {status}: {snippet}");
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        PipelineError::ProviderUnavailable(msg)
    } else {
        PipelineError::Provider(msg)
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, PipelineError> {
    let status = response.status();
    let body = response.text().await.map_err(unavailable)?;
    if !status.is_success() {
        return Err(classify(status, &body));
    }
    serde_json::from_str(&body)
        .map_err(|e| PipelineError::Provider(format!("malformed provider response: {e}")))
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct Metadata {
    record_id: Uuid,
}

#[derive(Serialize)]
struct PixPaymentBody<'a> {
    transaction_amount: serde_json::Number,
    description: &'a str,
    payment_method_id: &'a str,
    external_reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_url: Option<&'a str>,
    metadata: Metadata,
    payer: PixPayer<'a>,
}

#[derive(Serialize)]
struct PixPayer<'a> {
    email: &'a str,
    first_name: &'a str,
    last_name: &'a str,
}

#[derive(Serialize)]
struct PreferenceBody<'a> {
    items: Vec<PreferenceItem<'a>>,
    payer: PreferencePayer<'a>,
    external_reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    back_urls: Option<&'a BackUrls>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_return: Option<&'a str>,
    metadata: Metadata,
}

#[derive(Serialize)]
struct PreferenceItem<'a> {
    id: &'a str,
    title: &'a str,
    quantity: u32,
    currency_id: &'a str,
    unit_price: serde_json::Number,
}

#[derive(Serialize)]
struct PreferencePayer<'a> {
    email: &'a str,
    name: &'a str,
    surname: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct BackUrls {
    success: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending: Option<String>,
}

#[derive(Deserialize)]
struct MpPayment {
    id: serde_json::Value,
    status: String,
    external_reference: Option<String>,
    metadata: Option<serde_json::Value>,
    point_of_interaction: Option<PointOfInteraction>,
}

impl MpPayment {
    /// The gateway sends numeric ids; accept strings too.
    fn id_string(&self) -> Result<String, PipelineError> {
        match &self.id {
            serde_json::Value::Number(n) => Ok(n.to_string()),
            serde_json::Value::String(s) => Ok(s.clone()),
            other => Err(PipelineError::Provider(format!(
                "unexpected payment id: {other}"
            ))),
        }
    }
}

#[derive(Deserialize)]
struct PointOfInteraction {
    transaction_data: Option<TransactionData>,
}

#[derive(Deserialize)]
struct TransactionData {
    qr_code: Option<String>,
    qr_code_base64: Option<String>,
    ticket_url: Option<String>,
}

#[derive(Deserialize)]
struct MpPreference {
    id: String,
    init_point: String,
}
