use {
    super::BoxFuture,
    super::audit::NewAuditEntry,
    super::error::PipelineError,
    super::id::ProviderPaymentId,
    super::payment::{PaymentRecord, PaymentStatus, SideEffect},
    chrono::{DateTime, Utc},
    uuid::Uuid,
};

/// Which records the sweeper should look at again.
#[derive(Debug, Clone, Copy)]
pub struct UnsettledQuery {
    /// Pending records created before this instant...
    pub pending_created_before: DateTime<Utc>,
    /// ...and after this one.
    pub pending_created_after: DateTime<Utc>,
    /// Applied to approved and pending records separately.
    pub limit: i64,
}

/// Durable storage for payment records. Records are never deleted.
pub trait PaymentStore: Send + Sync {
    /// Fails with `Conflict` if the provider payment id is already taken.
    fn insert<'a>(&'a self, record: &'a PaymentRecord) -> BoxFuture<'a, Result<(), PipelineError>>;

    fn find_by_provider_id<'a>(
        &'a self,
        id: &'a ProviderPaymentId,
    ) -> BoxFuture<'a, Result<Option<PaymentRecord>, PipelineError>>;

    fn find_by_id(&self, id: Uuid) -> BoxFuture<'_, Result<Option<PaymentRecord>, PipelineError>>;

    fn list_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, Result<Vec<PaymentRecord>, PipelineError>>;

    /// Approved records with missing side effects, plus provider-backed
    /// pending records inside the query's age window.
    fn list_unsettled(
        &self,
        query: UnsettledQuery,
    ) -> BoxFuture<'_, Result<Vec<PaymentRecord>, PipelineError>>;

    /// Set the provider id of a record that has none yet. Returns `false` if
    /// the record already carries a (different or identical) id.
    fn attach_provider_id<'a>(
        &'a self,
        record_id: Uuid,
        id: &'a ProviderPaymentId,
    ) -> BoxFuture<'a, Result<bool, PipelineError>>;

    /// Exclusive per-record lock keyed by provider payment id. Waits at most
    /// the store's lock timeout.
    fn lock<'a>(
        &'a self,
        id: &'a ProviderPaymentId,
    ) -> BoxFuture<'a, Result<Box<dyn RecordLock>, PipelineError>>;

    fn append_audit<'a>(
        &'a self,
        entry: &'a NewAuditEntry,
    ) -> BoxFuture<'a, Result<(), PipelineError>>;
}

/// Held while a reconciliation reads and writes one record. Every write is
/// durable on return; nothing is rolled back when the lock is released.
pub trait RecordLock: Send {
    fn load(&mut self) -> BoxFuture<'_, Result<Option<PaymentRecord>, PipelineError>>;

    /// Write a `pending` → terminal transition.
    fn save_status(
        &mut self,
        record_id: Uuid,
        status: PaymentStatus,
        approved_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<(), PipelineError>>;

    fn add_side_effect(
        &mut self,
        record_id: Uuid,
        effect: SideEffect,
    ) -> BoxFuture<'_, Result<(), PipelineError>>;

    fn release(self: Box<Self>) -> BoxFuture<'static, Result<(), PipelineError>>;
}
