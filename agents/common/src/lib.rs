#![warn(missing_docs)]
//! Control plane services library.
//!
//! Every long-running service here follows the same discipline: one
//! bounded "iteration" per tick that reads intent from the store,
//! compares it with observed state and issues a minimal set of
//! corrective actions. Convergence comes from repetition, not from any
//! single perfect turn, so every iteration must be safe to repeat.

use async_trait::async_trait;
use futures::future::join_all;
use std::time::Duration;

pub mod boot;
pub mod builders;
pub mod driver;
pub mod errors;
pub mod manifest;
pub mod pool_agent;
pub mod reconciler;
pub mod scheduler;
pub mod work_dir;

pub use errors::SvcError;

/// Default period between two iterations of a service
pub const DEF_ITERATION_PERIOD: Duration = Duration::from_secs(1);

/// Registration name prefix of pool builders
pub const POOL_BUILDER_PREFIX: &str = "compute_pool_builder";

/// Registration name prefix of machine build coordinators
pub const MACHINE_BUILDER_PREFIX: &str = "machine_builder";

/// One cooperative control-plane service: a named unit of work invoked
/// once per tick. Implementations must be idempotent; an error aborts
/// only the current iteration and the next tick retries.
#[async_trait]
pub trait IterationService: Send + Sync {
    /// Name of the service, used in logs
    fn name(&self) -> &str;
    /// Run a single bounded iteration
    async fn iteration(&self) -> Result<(), SvcError>;
}

/// Runnable set of services, each driven on its own periodic loop
#[derive(Default)]
pub struct Service {
    period: Option<Duration>,
    services: Vec<Box<dyn IterationService>>,
}

impl Service {
    /// Setup a default service runner
    pub fn builder() -> Self {
        Self::default()
    }

    /// Set the period between iterations, default one second
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    /// Add a service to the runner
    pub fn with_service(mut self, service: impl IterationService + 'static) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Run all services until the process is stopped. Each service gets
    /// its own task so a slow iteration of one never delays the others.
    pub async fn run(self) {
        let period = self.period.unwrap_or(DEF_ITERATION_PERIOD);
        let mut handles = vec![];
        for service in self.services {
            handles.push(tokio::spawn(async move {
                Self::run_service(service, period).await;
            }));
        }
        join_all(handles).await.iter().for_each(|result| {
            if let Err(error) = result {
                tracing::error!("Failed to wait for service task: {:?}", error);
            }
        });
    }

    async fn run_service(service: Box<dyn IterationService>, period: Duration) {
        loop {
            if let Err(error) = service.iteration().await {
                tracing::error!("Service '{}' iteration failed: {}", service.name(), error);
            }
            tokio::time::delay_for(period).await;
        }
    }
}
