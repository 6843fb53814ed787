use {
    super::id::ProviderPaymentId,
    chrono::{DateTime, Utc},
    uuid::Uuid,
};

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub id: Uuid,
    pub entity_id: Option<Uuid>,
    pub provider_payment_id: Option<String>,
    pub action: String,
    pub actor: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NewAuditEntry {
    pub fn new(
        entity_id: Option<Uuid>,
        provider_payment_id: Option<&ProviderPaymentId>,
        action: &str,
        actor: &str,
        detail: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            entity_id,
            provider_payment_id: provider_payment_id.map(|id| id.as_str().to_string()),
            action: action.to_string(),
            actor: actor.to_string(),
            detail,
            created_at,
        }
    }
}
