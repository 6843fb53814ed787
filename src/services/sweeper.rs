use {
    crate::{
        config::SweeperConfig,
        domain::{
            clock::Clock,
            error::PipelineError,
            payment::PaymentStatus,
            store::{PaymentStore, UnsettledQuery},
        },
        services::{
            reconcile::{ReconcileOutcome, Reconciler},
            status_oracle::StatusOracle,
        },
    },
    std::sync::Arc,
    tokio::sync::watch,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    /// Records that ended the pass terminal with nothing left to do.
    pub settled: usize,
    pub errors: usize,
}

/// Background retry driver. Picks up approved records whose side effects are
/// incomplete and pending records the webhook may have missed.
pub struct Sweeper {
    store: Arc<dyn PaymentStore>,
    oracle: Arc<StatusOracle>,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        oracle: Arc<StatusOracle>,
        reconciler: Arc<Reconciler>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            reconciler,
            clock,
            config,
        }
    }

    pub async fn poll_once(&self) -> Result<SweepReport, PipelineError> {
        let now = self.clock.now();
        let age = |d| chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX);
        let query = UnsettledQuery {
            pending_created_before: now
                .checked_sub_signed(age(self.config.pending_min_age))
                .unwrap_or(now),
            pending_created_after: now
                .checked_sub_signed(age(self.config.pending_max_age))
                .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC),
            limit: i64::from(self.config.batch_size),
        };

        let records = self.store.list_unsettled(query).await?;
        let mut report = SweepReport {
            examined: records.len(),
            ..SweepReport::default()
        };

        for record in records {
            let Some(id) = record.provider_payment_id() else {
                continue;
            };

            // Approved records only need their missing side effects retried;
            // the provider's opinion cannot change them.
            let result = if record.status() == PaymentStatus::Approved {
                self.reconciler
                    .reconcile(id, PaymentStatus::Approved, "sweeper")
                    .await
            } else {
                self.oracle.refresh(id, "sweeper").await
            };

            match result {
                Ok(ReconcileOutcome::Reconciled(r)) if r.record.is_settled() => report.settled += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(provider_payment_id = %id, error = %e, "sweep of record failed");
                }
            }
        }

        Ok(report)
    }
}

/// Run `poll_once` every configured interval until shutdown is signalled.
pub async fn run_sweeper(sweeper: Arc<Sweeper>, mut shutdown: watch::Receiver<bool>) {
    let interval = sweeper.config.interval;
    tracing::info!(interval_secs = interval.as_secs(), "settlement sweeper started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("settlement sweeper shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match sweeper.poll_once().await {
            Ok(report) if report.examined == 0 => {}
            Ok(report) => tracing::info!(
                examined = report.examined,
                settled = report.settled,
                errors = report.errors,
                "sweep finished"
            ),
            Err(e) => tracing::error!(error = %e, "sweep poll error"),
        }
    }
}
