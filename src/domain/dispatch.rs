//! Narrow contracts for the three side effects of an approved payment.
//! Every implementation must be safe to call twice with the same input.

use {
    super::BoxFuture,
    super::error::PipelineError,
    super::money::Money,
    super::payment::PaymentRecord,
    std::sync::Arc,
    uuid::Uuid,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementGrant {
    pub user_id: String,
    pub course_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRequest {
    pub payment_id: Uuid,
    pub user_id: String,
    pub course_id: String,
    pub course_name: String,
    pub money: Money,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationEmail {
    pub to: String,
    pub name: String,
    pub payment_id: String,
    pub course_name: String,
    pub money: Money,
}

/// Set-union on the user's courses, never append.
pub trait EntitlementGranter: Send + Sync {
    fn grant(&self, grant: EntitlementGrant) -> BoxFuture<'_, Result<(), PipelineError>>;
}

/// Returns the existing invoice id when one was already issued for the payment.
pub trait InvoiceGenerator: Send + Sync {
    fn generate_invoice(&self, req: InvoiceRequest) -> BoxFuture<'_, Result<Uuid, PipelineError>>;
}

pub trait ConfirmationMailer: Send + Sync {
    fn send_confirmation(&self, email: ConfirmationEmail)
    -> BoxFuture<'_, Result<(), PipelineError>>;
}

#[derive(Clone)]
pub struct Dispatchers {
    pub entitlements: Arc<dyn EntitlementGranter>,
    pub invoices: Arc<dyn InvoiceGenerator>,
    pub mailer: Arc<dyn ConfirmationMailer>,
}

impl EntitlementGrant {
    pub fn for_record(record: &PaymentRecord) -> Self {
        Self {
            user_id: record.user_id().to_string(),
            course_id: record.course_id().to_string(),
        }
    }
}

impl InvoiceRequest {
    pub fn for_record(record: &PaymentRecord) -> Self {
        Self {
            payment_id: record.id(),
            user_id: record.user_id().to_string(),
            course_id: record.course_id().to_string(),
            course_name: record.course_name().to_string(),
            money: record.money().clone(),
        }
    }
}

impl ConfirmationEmail {
    pub fn for_record(record: &PaymentRecord) -> Self {
        let payment_id = match record.provider_payment_id() {
            Some(id) => id.as_str().to_string(),
            None => record.id().to_string(),
        };
        Self {
            to: record.payer().email.clone(),
            name: record.payer().full_name(),
            payment_id,
            course_name: record.course_name().to_string(),
            money: record.money().clone(),
        }
    }
}
