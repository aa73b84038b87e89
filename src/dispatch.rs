//! Deferred execution of units of work.
//!
//! [`InlineDispatcher`] runs work on the caller's task and returns its result.
//! [`QueueDispatcher`] hands work to a background worker that retries failures
//! according to a [`RetryPolicy`].

use crate::errors::{ServiceError, ServiceResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info, warn};

/// Re-runnable body of a unit of work.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ServiceResult<()>> + Send + Sync>;

/// A named, retry-safe piece of work.
#[derive(Clone)]
pub struct UnitOfWork {
    pub name: String,
    pub job: Job,
}

impl UnitOfWork {
    pub fn new<F>(name: impl Into<String>, job: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ServiceResult<()>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            job: Arc::new(job),
        }
    }

    async fn run(&self) -> ServiceResult<()> {
        (self.job)().await
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn submit(&self, work: UnitOfWork) -> ServiceResult<()>;
}

/// Runs work immediately and reports its outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

#[async_trait]
impl Dispatcher for InlineDispatcher {
    async fn submit(&self, work: UnitOfWork) -> ServiceResult<()> {
        info!("running {} inline", work.name);
        work.run().await
    }
}

/// How often and how patiently queued work is retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; grows linearly with each attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DispatchMode {
    /// Run work on the request task.
    Inline,
    /// Hand work to a background worker.
    Queue,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub mode: DispatchMode,
    pub retry: RetryPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Queue,
            retry: RetryPolicy::default(),
        }
    }
}

/// Fire-and-forget dispatcher backed by an in-process queue.
#[derive(Clone)]
pub struct QueueDispatcher {
    sender: mpsc::UnboundedSender<UnitOfWork>,
}

impl QueueDispatcher {
    /// Start the worker. It stops once every dispatcher handle is dropped.
    pub fn spawn(policy: RetryPolicy) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<UnitOfWork>();
        let worker = tokio::spawn(async move {
            while let Some(work) = receiver.recv().await {
                tokio::spawn(run_with_retries(work, policy));
            }
        });
        (Self { sender }, worker)
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    async fn submit(&self, work: UnitOfWork) -> ServiceResult<()> {
        let name = work.name.clone();
        self.sender
            .send(work)
            .map_err(|_| ServiceError::Dispatch(format!("queue closed, dropped {}", name)))?;
        info!("queued {}", name);
        Ok(())
    }
}

async fn run_with_retries(work: UnitOfWork, policy: RetryPolicy) {
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match work.run().await {
            Ok(()) => {
                info!("{} finished on attempt {}", work.name, attempt);
                return;
            }
            Err(err) if attempt < max_attempts => {
                warn!(
                    "{} failed on attempt {}/{}: {}",
                    work.name, attempt, max_attempts, err
                );
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(err) => {
                error!("{} gave up after {} attempts: {}", work.name, attempt, err);
            }
        }
    }
}
