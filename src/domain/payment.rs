use {
    super::error::PipelineError,
    super::id::{ExternalReference, ProviderPaymentId},
    super::money::Money,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::{collections::BTreeSet, fmt},
    uuid::Uuid,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Only `pending` moves, and only into a terminal status.
    pub fn can_transition_to(&self, next: &PaymentStatus) -> bool {
        matches!(self, Self::Pending) && next.is_terminal()
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for PaymentStatus {
    type Error = PipelineError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(PipelineError::Validation(format!(
                "unknown payment status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Pix,
    Card,
    /// Operator-granted entitlement; never sent to the gateway.
    Admin,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pix => "pix",
            Self::Card => "card",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for PaymentMethod {
    type Error = PipelineError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pix" => Ok(Self::Pix),
            "card" => Ok(Self::Card),
            "admin" => Ok(Self::Admin),
            other => Err(PipelineError::Validation(format!(
                "unknown payment method: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    Entitlement,
    Invoice,
    Email,
}

impl SideEffect {
    /// Dispatch order on approval.
    pub const ALL: [SideEffect; 3] = [Self::Entitlement, Self::Invoice, Self::Email];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entitlement => "entitlement",
            Self::Invoice => "invoice",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for SideEffect {
    type Error = PipelineError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "entitlement" => Ok(Self::Entitlement),
            "invoice" => Ok(Self::Invoice),
            "email" => Ok(Self::Email),
            other => Err(PipelineError::Validation(format!(
                "unknown side effect: {other}"
            ))),
        }
    }
}

/// Grow-only set of side effects already fired for a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SideEffects(BTreeSet<SideEffect>);

impl SideEffects {
    pub fn contains(&self, effect: SideEffect) -> bool {
        self.0.contains(&effect)
    }

    /// Returns `false` if it was already present.
    pub fn insert(&mut self, effect: SideEffect) -> bool {
        self.0.insert(effect)
    }

    pub fn missing(&self) -> Vec<SideEffect> {
        SideEffect::ALL
            .into_iter()
            .filter(|e| !self.contains(*e))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = SideEffect> + '_ {
        self.0.iter().copied()
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.iter().map(|e| e.as_str().to_string()).collect()
    }
}

impl FromIterator<SideEffect> for SideEffects {
    fn from_iter<I: IntoIterator<Item = SideEffect>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl TryFrom<Vec<String>> for SideEffects {
    type Error = PipelineError;

    fn try_from(raw: Vec<String>) -> Result<Self, Self::Error> {
        raw.iter()
            .map(|s| SideEffect::try_from(s.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payer {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl Payer {
    /// Splits a display name at the first whitespace run.
    pub fn from_full_name(email: impl Into<String>, name: &str) -> Self {
        let name = name.trim();
        let (first, last) = match name.split_once(char::is_whitespace) {
            Some((first, last)) => (first, last.trim()),
            None => (name, ""),
        };
        Self {
            email: email.into(),
            first_name: first.to_string(),
            last_name: last.to_string(),
        }
    }

    pub fn full_name(&self) -> String {
        if self.last_name.is_empty() {
            self.first_name.clone()
        } else {
            format!("{} {}", self.first_name, self.last_name)
        }
    }
}

/// What `decide` tells the reconciler to do with an observed status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentAction {
    /// Observed status equals the stored one.
    SameStatus,
    /// `pending` → terminal.
    Advance { old_status: PaymentStatus },
    /// Stored status is terminal and the observation disagrees.
    LogAnomaly { current: PaymentStatus },
}

/// One attempted purchase. Mutated only through `apply_transition` and
/// `mark_applied`, both of which refuse to break the record's invariants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    id: Uuid,
    provider_payment_id: Option<ProviderPaymentId>,
    checkout_id: Option<String>,
    external_reference: ExternalReference,
    user_id: String,
    course_id: String,
    course_name: String,
    payer: Payer,
    money: Money,
    method: PaymentMethod,
    status: PaymentStatus,
    side_effects_applied: SideEffects,
    created_at: DateTime<Utc>,
    approved_at: Option<DateTime<Utc>>,
}

/// Everything needed to rebuild a record from storage.
#[derive(Debug, Clone)]
pub struct PaymentRecordParts {
    pub id: Uuid,
    pub provider_payment_id: Option<ProviderPaymentId>,
    pub checkout_id: Option<String>,
    pub external_reference: ExternalReference,
    pub user_id: String,
    pub course_id: String,
    pub course_name: String,
    pub payer: Payer,
    pub money: Money,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub side_effects_applied: SideEffects,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

/// Fields of a fresh `pending` record.
#[derive(Debug, Clone)]
pub struct NewPaymentRecord {
    pub id: Uuid,
    pub provider_payment_id: Option<ProviderPaymentId>,
    pub checkout_id: Option<String>,
    pub user_id: String,
    pub course_id: String,
    pub course_name: String,
    pub payer: Payer,
    pub money: Money,
    pub method: PaymentMethod,
    pub created_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn pending(new: NewPaymentRecord) -> Self {
        Self {
            external_reference: ExternalReference::new(&new.user_id, &new.course_id),
            id: new.id,
            provider_payment_id: new.provider_payment_id,
            checkout_id: new.checkout_id,
            user_id: new.user_id,
            course_id: new.course_id,
            course_name: new.course_name,
            payer: new.payer,
            money: new.money,
            method: new.method,
            status: PaymentStatus::Pending,
            side_effects_applied: SideEffects::default(),
            created_at: new.created_at,
            approved_at: None,
        }
    }

    pub fn from_parts(p: PaymentRecordParts) -> Self {
        Self {
            id: p.id,
            provider_payment_id: p.provider_payment_id,
            checkout_id: p.checkout_id,
            external_reference: p.external_reference,
            user_id: p.user_id,
            course_id: p.course_id,
            course_name: p.course_name,
            payer: p.payer,
            money: p.money,
            method: p.method,
            status: p.status,
            side_effects_applied: p.side_effects_applied,
            created_at: p.created_at,
            approved_at: p.approved_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn provider_payment_id(&self) -> Option<&ProviderPaymentId> {
        self.provider_payment_id.as_ref()
    }

    pub fn checkout_id(&self) -> Option<&str> {
        self.checkout_id.as_deref()
    }

    pub fn external_reference(&self) -> &ExternalReference {
        &self.external_reference
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn course_id(&self) -> &str {
        &self.course_id
    }

    pub fn course_name(&self) -> &str {
        &self.course_name
    }

    pub fn payer(&self) -> &Payer {
        &self.payer
    }

    pub fn money(&self) -> &Money {
        &self.money
    }

    pub fn method(&self) -> PaymentMethod {
        self.method
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn side_effects_applied(&self) -> &SideEffects {
        &self.side_effects_applied
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn approved_at(&self) -> Option<DateTime<Utc>> {
        self.approved_at
    }

    /// Approved with every side effect recorded: nothing left to do.
    pub fn is_settled(&self) -> bool {
        match self.status {
            PaymentStatus::Approved => self.side_effects_applied.is_complete(),
            PaymentStatus::Pending => false,
            PaymentStatus::Rejected | PaymentStatus::Cancelled => true,
        }
    }

    pub fn decide(&self, observed: PaymentStatus) -> PaymentAction {
        if observed == self.status {
            PaymentAction::SameStatus
        } else if self.status.can_transition_to(&observed) {
            PaymentAction::Advance {
                old_status: self.status,
            }
        } else {
            PaymentAction::LogAnomaly {
                current: self.status,
            }
        }
    }

    pub fn apply_transition(
        &mut self,
        new: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(&new) {
            return Err(PipelineError::Validation(format!(
                "invalid status transition: {} → {}",
                self.status, new
            )));
        }

        self.status = new;
        if new == PaymentStatus::Approved {
            self.approved_at = Some(at);
        }
        Ok(())
    }

    /// Records a side effect as done. Returns `false` if it already was.
    pub fn mark_applied(&mut self, effect: SideEffect) -> bool {
        self.side_effects_applied.insert(effect)
    }

    pub fn attach_provider_id(&mut self, id: ProviderPaymentId) -> Result<(), PipelineError> {
        match &self.provider_payment_id {
            None => {
                self.provider_payment_id = Some(id);
                Ok(())
            }
            Some(existing) if *existing == id => Ok(()),
            Some(existing) => Err(PipelineError::Conflict(format!(
                "record {} already bound to provider payment {existing}",
                self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::MoneyAmount;

    fn record() -> PaymentRecord {
        PaymentRecord::pending(NewPaymentRecord {
            id: Uuid::now_v7(),
            provider_payment_id: Some(ProviderPaymentId::new("1001").unwrap()),
            checkout_id: None,
            user_id: "user_1".into(),
            course_id: "course_9".into(),
            course_name: "Anatomy".into(),
            payer: Payer::from_full_name("ana@example.com", "Ana Maria Souza"),
            money: Money::brl(MoneyAmount::new(100).unwrap()),
            method: PaymentMethod::Pix,
            created_at: Utc::now(),
        })
    }

    #[test]
    fn pending_record_has_composite_reference() {
        let r = record();
        assert_eq!(r.status(), PaymentStatus::Pending);
        assert_eq!(r.external_reference().as_str(), "user_1_course_9");
        assert!(r.side_effects_applied().is_empty());
        assert!(r.approved_at().is_none());
    }

    #[test]
    fn approval_sets_timestamp_once() {
        let mut r = record();
        let at = Utc::now();
        r.apply_transition(PaymentStatus::Approved, at).unwrap();
        assert_eq!(r.approved_at(), Some(at));
        assert!(r.apply_transition(PaymentStatus::Rejected, Utc::now()).is_err());
        assert_eq!(r.status(), PaymentStatus::Approved);
    }

    #[test]
    fn decide_flags_disagreement_with_terminal_status() {
        let mut r = record();
        assert_eq!(
            r.decide(PaymentStatus::Rejected),
            PaymentAction::Advance {
                old_status: PaymentStatus::Pending
            }
        );
        r.apply_transition(PaymentStatus::Rejected, Utc::now()).unwrap();
        assert_eq!(r.decide(PaymentStatus::Rejected), PaymentAction::SameStatus);
        assert_eq!(
            r.decide(PaymentStatus::Approved),
            PaymentAction::LogAnomaly {
                current: PaymentStatus::Rejected
            }
        );
    }

    #[test]
    fn side_effects_only_grow() {
        let mut r = record();
        assert!(r.mark_applied(SideEffect::Invoice));
        assert!(!r.mark_applied(SideEffect::Invoice));
        assert_eq!(
            r.side_effects_applied().missing(),
            vec![SideEffect::Entitlement, SideEffect::Email]
        );
    }

    #[test]
    fn payer_name_split() {
        let p = Payer::from_full_name("a@b.c", "  Ana   Maria Souza ");
        assert_eq!(p.first_name, "Ana");
        assert_eq!(p.last_name, "Maria Souza");
        assert_eq!(Payer::from_full_name("a@b.c", "Ana").last_name, "");
    }

    #[test]
    fn provider_id_binds_once() {
        let mut r = PaymentRecord::from_parts(PaymentRecordParts {
            provider_payment_id: None,
            ..parts(record())
        });
        r.attach_provider_id(ProviderPaymentId::new("77").unwrap())
            .unwrap();
        r.attach_provider_id(ProviderPaymentId::new("77").unwrap())
            .unwrap();
        assert!(matches!(
            r.attach_provider_id(ProviderPaymentId::new("78").unwrap()),
            Err(PipelineError::Conflict(_))
        ));
    }

    fn parts(r: PaymentRecord) -> PaymentRecordParts {
        PaymentRecordParts {
            id: r.id,
            provider_payment_id: r.provider_payment_id,
            checkout_id: r.checkout_id,
            external_reference: r.external_reference,
            user_id: r.user_id,
            course_id: r.course_id,
            course_name: r.course_name,
            payer: r.payer,
            money: r.money,
            method: r.method,
            status: r.status,
            side_effects_applied: r.side_effects_applied,
            created_at: r.created_at,
            approved_at: r.approved_at,
        }
    }
}
