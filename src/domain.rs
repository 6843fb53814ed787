pub mod audit;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod money;
pub mod payment;
pub mod provider;
pub mod store;

use std::{future::Future, pin::Pin};

/// Boxed future returned by the object-safe seams in this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
