//! Driving one test from registration to outcome.
//!
//! The engine is told about the test first, with a hard timeout covering
//! setup, run and teardown, so a hung test process can't leak containers.
//! Setup runs inline under its own timeout. Run is spawned onto its own
//! task and raced against the run timeout; when the timer wins the task is
//! asked to stop through [`TestContext`] and then left to finish detached.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use testnet_client::{ClientConfig, Gateway, GatewayError, NetworkContext};

use crate::config::TestConfiguration;

/// A test that builds a network during setup and exercises it during run.
pub trait Test: Send + Sync + 'static {
    /// Whatever setup hands to run, usually typed service handles.
    type Network: Send + 'static;

    fn configuration(&self) -> TestConfiguration;

    fn setup(
        &self,
        network: Arc<NetworkContext>,
    ) -> impl Future<Output = anyhow::Result<Self::Network>> + Send;

    fn run(
        &self,
        network: Self::Network,
        ctx: TestContext,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Handed to a running test. Long-running tests should watch it and stop
/// once the runner has given up on them.
#[derive(Debug, Clone)]
pub struct TestContext {
    cancel: watch::Receiver<bool>,
}

impl TestContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the runner cancels the test or goes away.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        let _ = cancel.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Debug)]
pub enum TestOutcome {
    Passed,
    Failed(anyhow::Error),
    Panicked(String),
    TimedOut(Duration),
    SetupFailed(anyhow::Error),
}

impl TestOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, TestOutcome::Passed)
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("could not register the test execution with the engine")]
    Registration(#[source] GatewayError),
}

pub struct TestRunner {
    client_config: ClientConfig,
    gateway: Arc<Gateway>,
}

impl TestRunner {
    pub fn new(client_config: ClientConfig, gateway: Arc<Gateway>) -> Self {
        Self {
            client_config,
            gateway,
        }
    }

    /// A runner talking to the engine over WebSocket as configured.
    pub fn from_config(client_config: ClientConfig) -> Self {
        let gateway = Arc::new(Gateway::from_config(&client_config));
        Self::new(client_config, gateway)
    }

    pub async fn run<T: Test>(&self, test: Arc<T>) -> Result<TestOutcome, RunnerError> {
        let config = test.configuration();
        let hard_timeout_seconds = config.hard_timeout_seconds();
        self.gateway
            .register_test_execution(hard_timeout_seconds)
            .await
            .map_err(RunnerError::Registration)?;

        let network = Arc::new(
            NetworkContext::from_config(
                &self.client_config,
                self.gateway.clone(),
                config.files_artifact_urls.clone(),
            )
            .with_partitioning(config.is_partitioning_enabled),
        );

        tracing::info!(timeout_ms = config.setup_timeout.as_millis() as u64, "setting up test network");
        let network = match tokio::time::timeout(config.setup_timeout, test.setup(network)).await {
            Ok(Ok(network)) => network,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "test setup failed");
                return Ok(TestOutcome::SetupFailed(e.context("setting up the test network")));
            }
            Err(_) => {
                tracing::warn!("test setup timed out");
                return Ok(TestOutcome::SetupFailed(anyhow::anyhow!(
                    "test network setup did not finish within {:?}",
                    config.setup_timeout
                )));
            }
        };
        tracing::info!("test network set up");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = TestContext { cancel: cancel_rx };
        let task_test = test.clone();
        let mut handle = tokio::spawn(async move { task_test.run(network, ctx).await });

        tracing::info!(timeout_ms = config.run_timeout.as_millis() as u64, "running test");
        let outcome = match tokio::time::timeout(config.run_timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => TestOutcome::Passed,
            Ok(Ok(Err(e))) => TestOutcome::Failed(e),
            Ok(Err(join_err)) if join_err.is_panic() => {
                TestOutcome::Panicked(panic_message(join_err.into_panic()))
            }
            Ok(Err(join_err)) => TestOutcome::Failed(anyhow::Error::new(join_err)),
            Err(_) => {
                let _ = cancel_tx.send(true);
                tracing::warn!(
                    timeout_ms = config.run_timeout.as_millis() as u64,
                    "test did not finish in time, leaving it detached"
                );
                TestOutcome::TimedOut(config.run_timeout)
            }
        };

        match &outcome {
            TestOutcome::Passed => tracing::info!("test passed"),
            other => tracing::info!(outcome = ?other, "test did not pass"),
        }
        Ok(outcome)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test panicked with a non-string payload".to_string()
    }
}
