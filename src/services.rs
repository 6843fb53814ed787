pub mod payment_intent;
pub mod reconcile;
pub mod status_oracle;
pub mod sweeper;
pub mod tasks;
