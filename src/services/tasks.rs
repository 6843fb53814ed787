//! Request-initiated work that must not be cancelled with its request. A
//! reconcile dropped halfway could leave an email sent but unrecorded, so
//! handlers run it on a tracked task and only abandon the *wait*.

use {
    crate::domain::error::PipelineError,
    std::{
        future::Future,
        sync::{Mutex, PoisonError},
    },
    tokio::{sync::oneshot, task::JoinSet},
};

#[derive(Default)]
pub struct BackgroundTasks {
    set: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire and forget, but still drained at shutdown.
    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(finished) = set.try_join_next() {
            if let Err(e) = finished {
                tracing::error!(error = %e, "background task failed");
            }
        }
        set.spawn(work);
    }

    /// Run `work` on a tracked task and wait for its result. Dropping the
    /// returned future leaves the work running.
    pub async fn run<F, T>(&self, work: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.spawn(async move {
            let _ = tx.send(work.await);
        });
        rx.await
            .map_err(|_| PipelineError::Task("task ended without a result".into()))?
    }

    pub fn len(&self) -> usize {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every task, including ones spawned while draining.
    pub async fn drain(&self) {
        loop {
            let mut set = {
                let mut guard = self.set.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *guard)
            };
            if set.is_empty() {
                return;
            }
            tracing::info!(in_flight = set.len(), "waiting for background tasks");
            while let Some(finished) = set.join_next().await {
                if let Err(e) = finished {
                    tracing::error!(error = %e, "background task failed");
                }
            }
        }
    }
}
