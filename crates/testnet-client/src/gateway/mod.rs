//! Resilient RPC gateway to the orchestration engine.
//!
//! Each operation is one logical call under a constant-interval retry
//! policy. Transport failures are retried silently until the policy's
//! budget runs out; a reply in which the engine rejects the call is
//! returned immediately.

mod retry;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use testnet_common::protocol::{
    methods, ExecCommandArgs, ExecCommandResponse, RegisterServiceArgs, RegisterServiceResponse,
    RegisterTestExecutionArgs, RemoveServiceArgs, RepartitionArgs, StartServiceArgs,
};

use crate::config::ClientConfig;

pub use retry::RetryPolicy;
pub use transport::{EngineTransport, RpcReply, TransportError, WsTransport};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("engine unavailable for '{method}' after {attempts} attempt(s) over {elapsed:?}")]
    Unavailable {
        method: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: TransportError,
    },
    #[error("engine rejected '{method}': {message}")]
    Rejected { method: String, message: String },
    #[error("engine sent an unusable reply to '{method}'")]
    Protocol {
        method: String,
        #[source]
        source: TransportError,
    },
    #[error("could not encode arguments for '{method}'")]
    Encode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not decode the reply to '{method}'")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

impl GatewayError {
    /// True when the engine could not be reached within the retry budget.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, GatewayError::Unavailable { .. })
    }

    /// True when the engine ran the call and refused it.
    pub fn is_rejected(&self) -> bool {
        matches!(self, GatewayError::Rejected { .. })
    }
}

/// Stateless per call; cheap to share behind an `Arc`.
pub struct Gateway {
    transport: Arc<dyn EngineTransport>,
    registration: RetryPolicy,
    regular: RetryPolicy,
}

impl Gateway {
    pub fn new(
        transport: Arc<dyn EngineTransport>,
        registration: RetryPolicy,
        regular: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            registration,
            regular,
        }
    }

    /// A gateway speaking WebSocket to the engine named in `config`.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            Arc::new(WsTransport::from_config(&config.engine)),
            config.registration_retry,
            config.regular_retry,
        )
    }

    /// Registers the test run so the engine can arm a hard timeout. This is
    /// the first call of a run and uses the long registration budget.
    pub async fn register_test_execution(&self, test_timeout_seconds: u64) -> Result<(), GatewayError> {
        tracing::debug!(test_timeout_seconds, "registering test execution");
        let args = RegisterTestExecutionArgs {
            test_timeout_seconds,
        };
        self.invoke_ack(methods::REGISTER_TEST_EXECUTION, &args, self.registration)
            .await?;
        tracing::debug!(test_timeout_seconds, "test execution registered");
        Ok(())
    }

    pub async fn register_service(
        &self,
        args: &RegisterServiceArgs,
    ) -> Result<RegisterServiceResponse, GatewayError> {
        self.invoke(methods::REGISTER_SERVICE, args, self.regular).await
    }

    pub async fn start_service(&self, args: &StartServiceArgs) -> Result<(), GatewayError> {
        self.invoke_ack(methods::START_SERVICE, args, self.regular).await
    }

    pub async fn remove_service(&self, args: &RemoveServiceArgs) -> Result<(), GatewayError> {
        self.invoke_ack(methods::REMOVE_SERVICE, args, self.regular).await
    }

    pub async fn repartition(&self, args: &RepartitionArgs) -> Result<(), GatewayError> {
        self.invoke_ack(methods::REPARTITION, args, self.regular).await
    }

    pub async fn exec_command(&self, args: &ExecCommandArgs) -> Result<i32, GatewayError> {
        let resp: ExecCommandResponse = self.invoke(methods::EXEC_COMMAND, args, self.regular).await?;
        Ok(resp.exit_code)
    }

    async fn invoke<A: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        args: &A,
        policy: RetryPolicy,
    ) -> Result<R, GatewayError> {
        let result = self.call_with_retry(method, args, policy).await?;
        serde_json::from_value(result).map_err(|source| GatewayError::Decode {
            method: method.to_string(),
            source,
        })
    }

    /// Like `invoke`, for calls whose reply carries no data.
    async fn invoke_ack<A: Serialize>(
        &self,
        method: &str,
        args: &A,
        policy: RetryPolicy,
    ) -> Result<(), GatewayError> {
        self.call_with_retry(method, args, policy).await.map(|_| ())
    }

    async fn call_with_retry<A: Serialize>(
        &self,
        method: &str,
        args: &A,
        policy: RetryPolicy,
    ) -> Result<serde_json::Value, GatewayError> {
        let params = serde_json::to_value(args).map_err(|source| GatewayError::Encode {
            method: method.to_string(),
            source,
        })?;

        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.transport.call(method, &params).await {
                Ok(RpcReply::Result(value)) => {
                    if attempts > 1 {
                        tracing::debug!(method, attempts, "engine call succeeded after retries");
                    }
                    return Ok(value);
                }
                Ok(RpcReply::Rejected(message)) => {
                    tracing::debug!(method, %message, "engine rejected call");
                    return Err(GatewayError::Rejected {
                        method: method.to_string(),
                        message,
                    });
                }
                Err(source) if !source.is_transient() => {
                    return Err(GatewayError::Protocol {
                        method: method.to_string(),
                        source,
                    });
                }
                Err(source) => {
                    let elapsed = started.elapsed();
                    if !policy.allows_retry(attempts, elapsed) {
                        tracing::warn!(
                            method,
                            attempts,
                            elapsed_ms = elapsed.as_millis() as u64,
                            error = %source,
                            "engine unavailable, retry budget exhausted"
                        );
                        return Err(GatewayError::Unavailable {
                            method: method.to_string(),
                            attempts,
                            elapsed,
                            source,
                        });
                    }
                    tracing::trace!(method, attempts, error = %source, "engine call failed, retrying");
                    tokio::time::sleep(policy.interval).await;
                }
            }
        }
    }
}
