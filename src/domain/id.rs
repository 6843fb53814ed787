use {
    derive_more::Display,
    serde::{Deserialize, Serialize},
    uuid::Uuid,
};

use super::error::PipelineError;

const MAX_PROVIDER_ID_LEN: usize = 64;
const ADMIN_PREFIX: &str = "admin-";

/// Payment identifier assigned by the gateway (`1234567890`), or minted
/// locally for operator grants (`admin-<uuid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderPaymentId(String);

impl ProviderPaymentId {
    pub fn new(id: impl Into<String>) -> Result<Self, PipelineError> {
        let id = id.into();
        let id = id.trim();
        if id.is_empty() {
            return Err(PipelineError::Validation(
                "provider payment id must not be empty".into(),
            ));
        }
        if id.len() > MAX_PROVIDER_ID_LEN {
            return Err(PipelineError::Validation(format!(
                "provider payment id longer than {MAX_PROVIDER_ID_LEN} chars"
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(PipelineError::Validation(format!(
                "provider payment id has invalid characters: {id}"
            )));
        }
        Ok(Self(id.to_string()))
    }

    /// Id for an operator grant that never touches the gateway.
    pub fn admin(record_id: Uuid) -> Self {
        Self(format!("{ADMIN_PREFIX}{record_id}"))
    }

    pub fn is_admin(&self) -> bool {
        self.0.starts_with(ADMIN_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `{userId}_{courseId}`, handed to the gateway and echoed back on the payment.
/// Opaque: user and course are stored separately on the record, so this is
/// never parsed back.
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalReference(String);

impl ExternalReference {
    pub fn new(user_id: &str, course_id: &str) -> Self {
        Self(format!("{user_id}_{course_id}"))
    }

    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
