pub mod admin;
pub mod errors;
pub mod payments;
pub mod webhook;

use {
    crate::AppState,
    axum::{
        Router,
        routing::{get, post},
    },
};

/// All routes, without middleware. `main` adds body limit, timeout and
/// tracing layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/payments", post(payments::create_payment))
        .route("/payments/{id}/status", get(payments::payment_status))
        .route("/webhook", post(webhook::webhook_handler))
        .route("/admin/grants", post(admin::grant_access))
        .route("/admin/payments", get(admin::list_by_email))
        .route("/admin/payments/{id}/approve", post(admin::force_approve))
        .route("/admin/payments/{id}/reconcile", post(admin::rerun))
        .with_state(state)
}
