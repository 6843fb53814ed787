//! In-process store and dispatchers. Used when no database is configured and
//! by the test suite. Same contracts as the Postgres implementations,
//! including the per-record lock.

use {
    crate::domain::{
        BoxFuture,
        audit::NewAuditEntry,
        dispatch::{EntitlementGrant, EntitlementGranter, InvoiceGenerator, InvoiceRequest},
        error::PipelineError,
        id::ProviderPaymentId,
        payment::{PaymentMethod, PaymentRecord, PaymentStatus, SideEffect},
        store::{PaymentStore, RecordLock, UnsettledQuery},
    },
    chrono::{DateTime, Utc},
    std::{
        collections::{HashMap, HashSet},
        future::ready,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        time::Duration,
    },
    tokio::sync::OwnedMutexGuard,
    uuid::Uuid,
};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type LockMap = Mutex<HashMap<ProviderPaymentId, Arc<tokio::sync::Mutex<()>>>>;

/// Drop the entry for `key` when `holders` references (the map's included)
/// are all that is left, i.e. nobody holds or waits for the lock.
fn forget_if_idle(locks: &LockMap, key: &ProviderPaymentId, holders: usize) {
    let mut locks = guard(locks);
    if locks
        .get(key)
        .is_some_and(|m| Arc::strong_count(m) == holders)
    {
        locks.remove(key);
    }
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<Uuid, PaymentRecord>,
    by_provider_id: HashMap<ProviderPaymentId, Uuid>,
    audit: Vec<NewAuditEntry>,
}

pub struct MemoryPaymentStore {
    state: Arc<Mutex<MemoryState>>,
    locks: Arc<LockMap>,
    lock_timeout: Duration,
}

impl MemoryPaymentStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            lock_timeout,
        }
    }

    pub fn len(&self) -> usize {
        guard(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-record locks currently tracked.
    pub fn lock_entries(&self) -> usize {
        guard(&self.locks).len()
    }

    /// Audit entries for one provider payment id, oldest first.
    pub fn audit_entries(&self, id: &ProviderPaymentId) -> Vec<NewAuditEntry> {
        guard(&self.state)
            .audit
            .iter()
            .filter(|e| e.provider_payment_id.as_deref() == Some(id.as_str()))
            .cloned()
            .collect()
    }

    fn insert_sync(&self, record: &PaymentRecord) -> Result<(), PipelineError> {
        let mut state = guard(&self.state);
        if state.records.contains_key(&record.id()) {
            return Err(PipelineError::Conflict(format!(
                "record {} already exists",
                record.id()
            )));
        }
        if let Some(pid) = record.provider_payment_id() {
            if state.by_provider_id.contains_key(pid) {
                return Err(PipelineError::Conflict(format!(
                    "provider payment id {pid} already recorded"
                )));
            }
            state.by_provider_id.insert(pid.clone(), record.id());
        }
        state.records.insert(record.id(), record.clone());
        Ok(())
    }

    fn attach_sync(&self, record_id: Uuid, id: &ProviderPaymentId) -> Result<bool, PipelineError> {
        let mut state = guard(&self.state);
        if let Some(owner) = state.by_provider_id.get(id) {
            if *owner == record_id {
                return Ok(false);
            }
            return Err(PipelineError::Conflict(format!(
                "provider payment id {id} already bound to record {owner}"
            )));
        }
        let Some(record) = state.records.get_mut(&record_id) else {
            return Err(PipelineError::RecordNotFound(record_id.to_string()));
        };
        if record.provider_payment_id().is_some() {
            return Ok(false);
        }
        record.attach_provider_id(id.clone())?;
        state.by_provider_id.insert(id.clone(), record_id);
        Ok(true)
    }

    fn list_unsettled_sync(&self, query: UnsettledQuery) -> Vec<PaymentRecord> {
        let limit = usize::try_from(query.limit).unwrap_or(0);
        let state = guard(&self.state);
        let oldest = |pred: &dyn Fn(&PaymentRecord) -> bool| {
            let mut picked: Vec<PaymentRecord> =
                state.records.values().filter(|r| pred(r)).cloned().collect();
            picked.sort_by_key(|r| r.created_at());
            picked.truncate(limit);
            picked
        };

        let mut out = oldest(&|r| {
            r.status() == PaymentStatus::Approved && !r.side_effects_applied().is_complete()
        });
        out.extend(oldest(&|r| {
            r.status() == PaymentStatus::Pending
                && r.provider_payment_id().is_some()
                && r.method() != PaymentMethod::Admin
                && r.created_at() < query.pending_created_before
                && r.created_at() > query.pending_created_after
        }));
        out
    }

    fn key_lock(&self, id: &ProviderPaymentId) -> Arc<tokio::sync::Mutex<()>> {
        guard(&self.locks)
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl PaymentStore for MemoryPaymentStore {
    fn insert<'a>(&'a self, record: &'a PaymentRecord) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(ready(self.insert_sync(record)))
    }

    fn find_by_provider_id<'a>(
        &'a self,
        id: &'a ProviderPaymentId,
    ) -> BoxFuture<'a, Result<Option<PaymentRecord>, PipelineError>> {
        let state = guard(&self.state);
        let found = state
            .by_provider_id
            .get(id)
            .and_then(|rid| state.records.get(rid))
            .cloned();
        Box::pin(ready(Ok(found)))
    }

    fn find_by_id(&self, id: Uuid) -> BoxFuture<'_, Result<Option<PaymentRecord>, PipelineError>> {
        let found = guard(&self.state).records.get(&id).cloned();
        Box::pin(ready(Ok(found)))
    }

    fn list_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, Result<Vec<PaymentRecord>, PipelineError>> {
        let mut found: Vec<PaymentRecord> = guard(&self.state)
            .records
            .values()
            .filter(|r| r.payer().email.eq_ignore_ascii_case(email.trim()))
            .cloned()
            .collect();
        found.sort_by_key(|r| std::cmp::Reverse(r.created_at()));
        Box::pin(ready(Ok(found)))
    }

    fn list_unsettled(
        &self,
        query: UnsettledQuery,
    ) -> BoxFuture<'_, Result<Vec<PaymentRecord>, PipelineError>> {
        Box::pin(ready(Ok(self.list_unsettled_sync(query))))
    }

    fn attach_provider_id<'a>(
        &'a self,
        record_id: Uuid,
        id: &'a ProviderPaymentId,
    ) -> BoxFuture<'a, Result<bool, PipelineError>> {
        Box::pin(ready(self.attach_sync(record_id, id)))
    }

    fn lock<'a>(
        &'a self,
        id: &'a ProviderPaymentId,
    ) -> BoxFuture<'a, Result<Box<dyn RecordLock>, PipelineError>> {
        let mutex = self.key_lock(id);
        Box::pin(async move {
            let Ok(held) = tokio::time::timeout(self.lock_timeout, mutex.lock_owned()).await
            else {
                forget_if_idle(&self.locks, id, 1);
                return Err(PipelineError::Timeout(format!(
                    "waiting for record lock on {id}"
                )));
            };
            Ok(Box::new(MemoryRecordLock {
                _held: held,
                state: Arc::clone(&self.state),
                locks: Arc::clone(&self.locks),
                key: id.clone(),
            }) as Box<dyn RecordLock>)
        })
    }

    fn append_audit<'a>(
        &'a self,
        entry: &'a NewAuditEntry,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        guard(&self.state).audit.push(entry.clone());
        Box::pin(ready(Ok(())))
    }
}

pub struct MemoryRecordLock {
    _held: OwnedMutexGuard<()>,
    state: Arc<Mutex<MemoryState>>,
    locks: Arc<LockMap>,
    key: ProviderPaymentId,
}

impl Drop for MemoryRecordLock {
    fn drop(&mut self) {
        // The map and our own guard.
        forget_if_idle(&self.locks, &self.key, 2);
    }
}

impl MemoryRecordLock {
    fn with_record<T>(
        &self,
        record_id: Uuid,
        f: impl FnOnce(&mut PaymentRecord) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let mut state = guard(&self.state);
        let record = state
            .records
            .get_mut(&record_id)
            .ok_or_else(|| PipelineError::RecordNotFound(record_id.to_string()))?;
        f(record)
    }
}

impl RecordLock for MemoryRecordLock {
    fn load(&mut self) -> BoxFuture<'_, Result<Option<PaymentRecord>, PipelineError>> {
        let state = guard(&self.state);
        let found = state
            .by_provider_id
            .get(&self.key)
            .and_then(|rid| state.records.get(rid))
            .cloned();
        Box::pin(ready(Ok(found)))
    }

    fn save_status(
        &mut self,
        record_id: Uuid,
        status: PaymentStatus,
        approved_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<(), PipelineError>> {
        let result = self.with_record(record_id, |record| {
            if record.status() != PaymentStatus::Pending {
                return Err(PipelineError::Conflict(format!(
                    "record {record_id} is no longer pending"
                )));
            }
            record.apply_transition(status, approved_at.unwrap_or_else(Utc::now))
        });
        Box::pin(ready(result))
    }

    fn add_side_effect(
        &mut self,
        record_id: Uuid,
        effect: SideEffect,
    ) -> BoxFuture<'_, Result<(), PipelineError>> {
        let result = self.with_record(record_id, |record| {
            record.mark_applied(effect);
            Ok(())
        });
        Box::pin(ready(result))
    }

    fn release(self: Box<Self>) -> BoxFuture<'static, Result<(), PipelineError>> {
        drop(self);
        Box::pin(ready(Ok(())))
    }
}

/// Set of `(user, course)` enrollments.
#[derive(Default)]
pub struct MemoryEntitlements {
    granted: Mutex<HashSet<(String, String)>>,
}

impl MemoryEntitlements {
    pub fn has(&self, user_id: &str, course_id: &str) -> bool {
        guard(&self.granted).contains(&(user_id.to_string(), course_id.to_string()))
    }
}

impl EntitlementGranter for MemoryEntitlements {
    fn grant(&self, grant: EntitlementGrant) -> BoxFuture<'_, Result<(), PipelineError>> {
        guard(&self.granted).insert((grant.user_id, grant.course_id));
        Box::pin(ready(Ok(())))
    }
}

/// One invoice per payment id.
#[derive(Default)]
pub struct MemoryInvoices {
    issued: Mutex<HashMap<Uuid, (Uuid, InvoiceRequest)>>,
}

impl MemoryInvoices {
    pub fn count(&self) -> usize {
        guard(&self.issued).len()
    }
}

impl InvoiceGenerator for MemoryInvoices {
    fn generate_invoice(&self, req: InvoiceRequest) -> BoxFuture<'_, Result<Uuid, PipelineError>> {
        let id = guard(&self.issued)
            .entry(req.payment_id)
            .or_insert_with(|| (Uuid::now_v7(), req))
            .0;
        Box::pin(ready(Ok(id)))
    }
}
