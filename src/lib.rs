pub mod adapters;
pub mod config;
pub mod domain;
pub mod infra;
pub mod services;
pub mod transport;

use {
    domain::store::PaymentStore,
    services::{
        payment_intent::PaymentIntentService, reconcile::Reconciler, status_oracle::StatusOracle,
        tasks::BackgroundTasks,
    },
    std::sync::Arc,
};

#[derive(Clone)]
pub struct AppState {
    pub intents: Arc<PaymentIntentService>,
    pub oracle: Arc<StatusOracle>,
    pub reconciler: Arc<Reconciler>,
    pub store: Arc<dyn PaymentStore>,
    /// `None` disables the admin routes.
    pub admin_token: Option<Arc<str>>,
    /// Reconciles started by requests; drained at shutdown.
    pub tasks: Arc<BackgroundTasks>,
}
