//! Job scheduler
//!
//! Cron jobs go through `tokio-cron-scheduler`; fixed-delay jobs and long-running
//! services are plain tasks observing one [`CancellationToken`]. Jobs may run on
//! any number of worker replicas at once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Cadence;

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct Scheduler {
    cron: JobScheduler,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    started: bool,
}

impl Scheduler {
    pub async fn new() -> anyhow::Result<Self> {
        Ok(Self {
            cron: JobScheduler::new().await?,
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            started: false,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a recurring job. Each run gets the shutdown token so long jobs
    /// can stop between units of work.
    pub async fn add<F>(&mut self, name: &'static str, cadence: &Cadence, job: F) -> anyhow::Result<()>
    where
        F: Fn(CancellationToken) -> JobFuture + Send + Sync + 'static,
    {
        match cadence {
            Cadence::Cron(expr) => {
                let job = Arc::new(job);
                let cancel = self.cancel.clone();
                self.cron
                    .add(Job::new_async(expr.as_str(), move |_uuid, _l| {
                        let job = job.clone();
                        let cancel = cancel.clone();
                        Box::pin(async move {
                            if cancel.is_cancelled() {
                                return;
                            }
                            info!(job = name, "Running scheduled job");
                            job(cancel).await;
                        })
                    })?)
                    .await?;
                info!(job = name, schedule = %expr, "Scheduled cron job");
            }
            Cadence::Every(period) => {
                let period = *period;
                let cancel = self.cancel.clone();
                self.tasks.spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(period) => {}
                        }
                        info!(job = name, "Running scheduled job");
                        job(cancel.clone()).await;
                    }
                    info!(job = name, "Job loop stopped");
                });
                info!(job = name, every_secs = period.as_secs(), "Scheduled fixed-delay job");
            }
        }
        Ok(())
    }

    /// Run a long-lived service that returns once the token is cancelled
    pub fn spawn_service<F, Fut>(&mut self, name: &'static str, service: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fut = service(self.cancel.clone());
        self.tasks.spawn(async move {
            fut.await;
            info!(service = name, "Service stopped");
        });
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.cron.start().await?;
        self.started = true;
        Ok(())
    }

    /// Stop cron triggers, cancel loops and wait for in-flight work to finish
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if self.started {
            if let Err(e) = self.cron.shutdown().await {
                warn!(error = %e, "Cron scheduler did not shut down cleanly");
            }
        }
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}
