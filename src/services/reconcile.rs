use {
    crate::domain::{
        audit::NewAuditEntry,
        clock::Clock,
        dispatch::{ConfirmationEmail, Dispatchers, EntitlementGrant, InvoiceRequest},
        error::PipelineError,
        id::ProviderPaymentId,
        payment::{PaymentAction, PaymentRecord, PaymentStatus, SideEffect},
        store::{PaymentStore, RecordLock},
    },
    std::{sync::Arc, time::Duration},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// `pending` moved to a terminal status during this call.
    Advanced {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    /// Observation matched the stored status, or was `pending`.
    Unchanged,
    /// Stored status is terminal and the observation disagrees. Ignored.
    Anomaly { observed: PaymentStatus },
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub record: PaymentRecord,
    pub transition: Transition,
    /// Side effects fired by this call.
    pub applied: Vec<SideEffect>,
    /// Side effects attempted by this call that are still missing.
    pub failed: Vec<SideEffect>,
}

#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// No local record carries this provider payment id.
    NotFound,
    Reconciled(Reconciliation),
}

impl ReconcileOutcome {
    pub fn record(&self) -> Option<&PaymentRecord> {
        match self {
            Self::NotFound => None,
            Self::Reconciled(r) => Some(&r.record),
        }
    }

    pub fn into_record(self, id: &ProviderPaymentId) -> Result<PaymentRecord, PipelineError> {
        match self {
            Self::NotFound => Err(PipelineError::RecordNotFound(id.to_string())),
            Self::Reconciled(r) => Ok(r.record),
        }
    }
}

/// The single place where a provider-observed status is applied to a record
/// and where side effects fire. Webhook, polling, sweeper and operator paths
/// all end here.
pub struct Reconciler {
    store: Arc<dyn PaymentStore>,
    dispatchers: Dispatchers,
    clock: Arc<dyn Clock>,
    dispatch_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        dispatchers: Dispatchers,
        clock: Arc<dyn Clock>,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            dispatchers,
            clock,
            dispatch_timeout,
        }
    }

    /// Apply `observed` to the record keyed by `id` under its exclusive lock,
    /// then fire whichever side effects an approved record is still missing.
    /// Safe to call any number of times with the same or stale status.
    #[tracing::instrument(
        name = "reconcile",
        skip(self, id, observed),
        fields(provider_payment_id = %id, observed = %observed)
    )]
    pub async fn reconcile(
        &self,
        id: &ProviderPaymentId,
        observed: PaymentStatus,
        actor: &str,
    ) -> Result<ReconcileOutcome, PipelineError> {
        let mut lock = self.store.lock(id).await?;
        let result = self
            .reconcile_locked(lock.as_mut(), id, observed, actor)
            .await;

        if let Err(e) = lock.release().await {
            tracing::error!(error = %e, "failed to release record lock");
        }
        result
    }

    async fn reconcile_locked(
        &self,
        lock: &mut dyn RecordLock,
        id: &ProviderPaymentId,
        observed: PaymentStatus,
        actor: &str,
    ) -> Result<ReconcileOutcome, PipelineError> {
        let Some(mut record) = lock.load().await? else {
            tracing::warn!("no record for provider payment id, nothing to reconcile");
            return Ok(ReconcileOutcome::NotFound);
        };

        let transition = match record.decide(observed) {
            PaymentAction::SameStatus => Transition::Unchanged,
            PaymentAction::Advance { old_status } => {
                let now = self.clock.now();
                let approved_at = (observed == PaymentStatus::Approved).then_some(now);

                // Durable before any side effect runs.
                lock.save_status(record.id(), observed, approved_at).await?;
                record.apply_transition(observed, now)?;

                tracing::info!(record_id = %record.id(), from = %old_status, to = %observed, actor, "payment status changed");
                self.audit(
                    &record,
                    id,
                    "status_changed",
                    actor,
                    serde_json::json!({
                        "old_status": old_status.as_str(),
                        "new_status": observed.as_str(),
                    }),
                )
                .await;
                Transition::Advanced {
                    from: old_status,
                    to: observed,
                }
            }
            PaymentAction::LogAnomaly { current } => {
                tracing::warn!(
                    record_id = %record.id(),
                    current = %current,
                    observed = %observed,
                    actor,
                    "observed status disagrees with terminal status, ignored"
                );
                self.audit(
                    &record,
                    id,
                    "anomaly",
                    actor,
                    serde_json::json!({
                        "current_status": current.as_str(),
                        "observed_status": observed.as_str(),
                    }),
                )
                .await;
                Transition::Anomaly { observed }
            }
        };

        let (applied, failed) = if record.status() == PaymentStatus::Approved {
            self.settle(lock, &mut record, id, actor).await?
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(ReconcileOutcome::Reconciled(Reconciliation {
            record,
            transition,
            applied,
            failed,
        }))
    }

    /// Fire each missing side effect once. A failure leaves that effect
    /// missing for the next pass and does not stop the others.
    async fn settle(
        &self,
        lock: &mut dyn RecordLock,
        record: &mut PaymentRecord,
        id: &ProviderPaymentId,
        actor: &str,
    ) -> Result<(Vec<SideEffect>, Vec<SideEffect>), PipelineError> {
        let mut applied = Vec::new();
        let mut failed = Vec::new();

        for effect in record.side_effects_applied().missing() {
            match self.dispatch(effect, record).await {
                Ok(detail) => {
                    lock.add_side_effect(record.id(), effect).await?;
                    record.mark_applied(effect);
                    applied.push(effect);

                    tracing::info!(record_id = %record.id(), %effect, "side effect applied");
                    self.audit(record, id, "side_effect_applied", actor, detail)
                        .await;
                }
                Err(e) => {
                    failed.push(effect);

                    tracing::warn!(record_id = %record.id(), %effect, error = %e, "side effect failed, will retry on next reconciliation");
                    self.audit(
                        record,
                        id,
                        "side_effect_failed",
                        actor,
                        serde_json::json!({
                            "effect": effect.as_str(),
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                }
            }
        }

        Ok((applied, failed))
    }

    async fn dispatch(
        &self,
        effect: SideEffect,
        record: &PaymentRecord,
    ) -> Result<serde_json::Value, PipelineError> {
        let call = async {
            match effect {
                SideEffect::Entitlement => self
                    .dispatchers
                    .entitlements
                    .grant(EntitlementGrant::for_record(record))
                    .await
                    .map(|()| serde_json::json!({ "effect": "entitlement" })),
                SideEffect::Invoice => self
                    .dispatchers
                    .invoices
                    .generate_invoice(InvoiceRequest::for_record(record))
                    .await
                    .map(|invoice_id| {
                        serde_json::json!({ "effect": "invoice", "invoice_id": invoice_id })
                    }),
                SideEffect::Email => self
                    .dispatchers
                    .mailer
                    .send_confirmation(ConfirmationEmail::for_record(record))
                    .await
                    .map(|()| serde_json::json!({ "effect": "email" })),
            }
        };

        match tokio::time::timeout(self.dispatch_timeout, call).await {
            Ok(Ok(detail)) => Ok(detail),
            Ok(Err(e @ PipelineError::Dispatcher { .. })) => Err(e),
            Ok(Err(e)) => Err(PipelineError::Dispatcher {
                effect,
                message: e.to_string(),
            }),
            Err(_) => Err(PipelineError::Dispatcher {
                effect,
                message: format!("timed out after {:?}", self.dispatch_timeout),
            }),
        }
    }

    async fn audit(
        &self,
        record: &PaymentRecord,
        id: &ProviderPaymentId,
        action: &str,
        actor: &str,
        detail: serde_json::Value,
    ) {
        let entry = NewAuditEntry::new(
            Some(record.id()),
            Some(id),
            action,
            actor,
            detail,
            self.clock.now(),
        );
        if let Err(e) = self.store.append_audit(&entry).await {
            tracing::error!(record_id = %record.id(), action, error = %e, "failed to write audit entry");
        }
    }
}
