use {
    crate::{
        domain::{
            audit::NewAuditEntry,
            clock::Clock,
            error::PipelineError,
            id::ProviderPaymentId,
            payment::{PaymentMethod, PaymentRecord, PaymentStatus},
            provider::{FetchedPayment, PaymentProvider},
            store::PaymentStore,
        },
        infra::cache::TtlCache,
        services::reconcile::{ReconcileOutcome, Reconciler},
    },
    chrono::{DateTime, Utc},
    serde::Serialize,
    std::{sync::Arc, time::Duration},
};

/// What a polling client is told.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
}

impl StatusView {
    pub fn of(record: &PaymentRecord) -> Self {
        Self {
            status: record.status(),
            approved_at: record.approved_at(),
        }
    }
}

/// Learns the provider's view of a payment and feeds it to the reconciler.
/// Shared by the webhook, the polling endpoint, the sweeper and the operator
/// re-run, so every trigger lands on the same engine entry point.
pub struct StatusOracle {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn PaymentStore>,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
    cache: TtlCache<ProviderPaymentId, FetchedPayment>,
}

impl StatusOracle {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: Arc<dyn PaymentStore>,
        reconciler: Arc<Reconciler>,
        clock: Arc<dyn Clock>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            reconciler,
            cache: TtlCache::new(cache_ttl, Arc::clone(&clock)),
            clock,
        }
    }

    /// Polling path. Settled and admin records are answered locally; other
    /// lookups go through the short-lived cache. When the provider cannot be
    /// reached the stored status is returned, so the payer only ever sees
    /// "approved" or "still pending".
    #[tracing::instrument(name = "status_check", skip_all, fields(provider_payment_id = %id))]
    pub async fn check(&self, id: &ProviderPaymentId) -> Result<StatusView, PipelineError> {
        let local = self.store.find_by_provider_id(id).await?;
        match &local {
            Some(record) if record.method() == PaymentMethod::Admin || record.is_settled() => {
                return Ok(StatusView::of(record));
            }
            None if id.is_admin() => {
                return Err(PipelineError::RecordNotFound(id.to_string()));
            }
            _ => {}
        }

        let fetched = match self.cache.get(id) {
            Some(hit) => hit,
            None => match self.provider.get_payment_status(id).await {
                Ok(fetched) => {
                    self.cache.insert(id.clone(), fetched.clone());
                    fetched
                }
                Err(e) if e.is_retriable() => match local {
                    Some(record) => {
                        tracing::warn!(error = %e, "provider unreachable, answering from local record");
                        return Ok(StatusView::of(&record));
                    }
                    None => return Err(e),
                },
                Err(PipelineError::Provider(msg)) if local.is_none() => {
                    tracing::debug!(reason = %msg, "unknown locally and at the provider");
                    return Err(PipelineError::RecordNotFound(id.to_string()));
                }
                Err(e) => return Err(e),
            },
        };

        match self.apply(fetched, "poll").await {
            Ok(outcome) => outcome
                .into_record(id)
                .map(|record| StatusView::of(&record)),
            // Lock held by another trigger, or the store hiccuped. That
            // trigger finishes the work; the payer gets the stored status.
            Err(e) if e.is_retriable() => match local {
                Some(record) => {
                    tracing::warn!(error = %e, "reconcile unavailable, answering from local record");
                    Ok(StatusView::of(&record))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Uncached authoritative fetch followed by a reconcile. Admin records
    /// have no provider counterpart and are re-run with their stored status.
    #[tracing::instrument(name = "status_refresh", skip(self, id), fields(provider_payment_id = %id))]
    pub async fn refresh(
        &self,
        id: &ProviderPaymentId,
        actor: &str,
    ) -> Result<ReconcileOutcome, PipelineError> {
        if id.is_admin() {
            return match self.store.find_by_provider_id(id).await? {
                Some(record) => self.reconciler.reconcile(id, record.status(), actor).await,
                None => Ok(ReconcileOutcome::NotFound),
            };
        }

        let fetched = self.provider.get_payment_status(id).await?;
        self.cache.invalidate(id);
        self.apply(fetched, actor).await
    }

    async fn apply(
        &self,
        fetched: FetchedPayment,
        actor: &str,
    ) -> Result<ReconcileOutcome, PipelineError> {
        let id = fetched.provider_payment_id.clone();
        tracing::debug!(raw_status = %fetched.raw_status, status = %fetched.status, "provider status fetched");

        let outcome = self.reconciler.reconcile(&id, fetched.status, actor).await?;
        if !matches!(outcome, ReconcileOutcome::NotFound) {
            return Ok(outcome);
        }

        if self.bind_checkout(&fetched, actor).await? {
            return self.reconciler.reconcile(&id, fetched.status, actor).await;
        }
        Ok(ReconcileOutcome::NotFound)
    }

    /// A card checkout's record learns its payment id here: the provider
    /// payment carries the record id in its metadata. The hint is accepted
    /// only if the external references agree and the record is still unbound.
    async fn bind_checkout(
        &self,
        fetched: &FetchedPayment,
        actor: &str,
    ) -> Result<bool, PipelineError> {
        let Some(record_id) = fetched.record_hint else {
            return Ok(false);
        };
        let Some(record) = self.store.find_by_id(record_id).await? else {
            tracing::warn!(%record_id, "payment metadata names an unknown record");
            return Ok(false);
        };

        if let Some(reference) = &fetched.external_reference {
            if reference != record.external_reference().as_str() {
                tracing::warn!(
                    %record_id,
                    expected = %record.external_reference().as_str(),
                    got = %reference,
                    "external reference mismatch, not binding"
                );
                return Ok(false);
            }
        }

        let id = &fetched.provider_payment_id;
        match self.store.attach_provider_id(record_id, id).await {
            Ok(true) => {
                tracing::info!(%record_id, provider_payment_id = %id, "provider payment bound to checkout record");
                let entry = NewAuditEntry::new(
                    Some(record_id),
                    Some(id),
                    "provider_id_bound",
                    actor,
                    serde_json::json!({ "checkout_id": record.checkout_id() }),
                    self.clock.now(),
                );
                if let Err(e) = self.store.append_audit(&entry).await {
                    tracing::error!(%record_id, error = %e, "failed to write audit entry");
                }
                Ok(true)
            }
            Ok(false) => {
                // A concurrent caller may have bound this same id first.
                let bound_here = self
                    .store
                    .find_by_provider_id(id)
                    .await?
                    .is_some_and(|r| r.id() == record_id);
                if !bound_here {
                    tracing::warn!(%record_id, "record already carries another provider payment id");
                }
                Ok(bound_here)
            }
            Err(PipelineError::Conflict(msg)) => {
                tracing::warn!(%record_id, reason = %msg, "provider payment id already bound elsewhere");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
