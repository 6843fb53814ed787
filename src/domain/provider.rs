use {
    super::BoxFuture,
    super::error::PipelineError,
    super::id::{ExternalReference, ProviderPaymentId},
    super::money::Money,
    super::payment::{Payer, PaymentMethod, PaymentStatus},
    serde::Serialize,
    uuid::Uuid,
};

/// What the intent service asks the gateway to create.
#[derive(Debug, Clone)]
pub struct CreatePaymentRequest {
    /// Local record id; doubles as the gateway idempotency key and is echoed
    /// back in payment metadata.
    pub record_id: Uuid,
    pub method: PaymentMethod,
    pub course_id: String,
    pub course_name: String,
    pub money: Money,
    pub payer: Payer,
    pub external_reference: ExternalReference,
}

/// What the paying client needs to finish paying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderArtifacts {
    #[serde(rename_all = "camelCase")]
    Pix {
        qr_code: String,
        qr_code_base64: Option<String>,
        ticket_url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Checkout { redirect_url: String },
}

#[derive(Debug, Clone)]
pub struct CreatedPayment {
    /// Absent for card checkouts until the payer actually pays.
    pub provider_payment_id: Option<ProviderPaymentId>,
    pub checkout_id: Option<String>,
    pub artifacts: ProviderArtifacts,
    pub status: PaymentStatus,
}

/// Authoritative view of a payment, fetched from the gateway.
#[derive(Debug, Clone)]
pub struct FetchedPayment {
    pub provider_payment_id: ProviderPaymentId,
    pub status: PaymentStatus,
    /// Gateway status string before normalization.
    pub raw_status: String,
    pub external_reference: Option<String>,
    /// Local record id carried in payment metadata, if any.
    pub record_hint: Option<Uuid>,
    pub raw: serde_json::Value,
}

pub trait PaymentProvider: Send + Sync {
    fn create_payment<'a>(
        &'a self,
        req: &'a CreatePaymentRequest,
    ) -> BoxFuture<'a, Result<CreatedPayment, PipelineError>>;

    fn get_payment_status<'a>(
        &'a self,
        id: &'a ProviderPaymentId,
    ) -> BoxFuture<'a, Result<FetchedPayment, PipelineError>>;
}
