//! In-process engine and helpers for tests of code built on the client.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use testnet_common::protocol::{
    methods, ExecCommandArgs, RegisterServiceArgs, RegisterTestExecutionArgs, RemoveServiceArgs,
    RepartitionArgs, StartServiceArgs,
};
use testnet_common::ServiceId;

use crate::gateway::{EngineTransport, Gateway, RetryPolicy, RpcReply, TransportError};

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct EngineState {
    fail_next: u32,
    rejections: BTreeMap<String, String>,
    attempts: BTreeMap<String, usize>,
    answered: Vec<(String, Value)>,
    registered: BTreeMap<ServiceId, String>,
    started: BTreeSet<ServiceId>,
    exit_codes: BTreeMap<ServiceId, i32>,
    test_timeout_seconds: Option<u64>,
    next_host: u8,
}

/// An engine that lives in the test process.
///
/// Records every call it answers, assigns IPs `10.0.0.2`, `10.0.0.3`, ...
/// and places generated files at `services/<service id>/<file id>`.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A gateway with short retry budgets talking to this engine.
    pub fn gateway(self: &Arc<Self>) -> Arc<Gateway> {
        let policy = RetryPolicy::constant(Duration::from_millis(10), Duration::from_millis(100));
        Arc::new(Gateway::new(self.clone(), policy, policy))
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop the connection on the next `n` calls, whatever the method.
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// Refuse every call to `method` with `message`.
    pub fn reject(&self, method: &str, message: &str) {
        self.state()
            .rejections
            .insert(method.to_string(), message.to_string());
    }

    pub fn clear_rejection(&self, method: &str) {
        self.state().rejections.remove(method);
    }

    /// Delay every answer; lets tests observe overlapping calls.
    pub fn set_latency(&self, latency: Duration) {
        *self
            .latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(latency);
    }

    pub fn set_exit_code(&self, service_id: &str, code: i32) {
        self.state().exit_codes.insert(ServiceId::from(service_id), code);
    }

    /// Calls to `method` seen, including ones that failed or were refused.
    pub fn attempts(&self, method: &str) -> usize {
        self.state().attempts.get(method).copied().unwrap_or(0)
    }

    /// Parameters of every call to `method` the engine answered, in order.
    pub fn calls(&self, method: &str) -> Vec<Value> {
        self.state()
            .answered
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    /// Like `calls`, decoded into the method's argument type.
    pub fn calls_as<T: DeserializeOwned>(&self, method: &str) -> Vec<T> {
        self.calls(method)
            .into_iter()
            .map(|v| serde_json::from_value(v).expect("recorded call has the expected shape"))
            .collect()
    }

    pub fn test_timeout_seconds(&self) -> Option<u64> {
        self.state().test_timeout_seconds
    }

    pub fn is_registered(&self, service_id: &str) -> bool {
        self.state().registered.contains_key(&ServiceId::from(service_id))
    }

    pub fn is_started(&self, service_id: &str) -> bool {
        self.state().started.contains(&ServiceId::from(service_id))
    }

    /// Highest number of calls the engine was answering at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn answer(&self, method: &str, params: &Value) -> Result<RpcReply, TransportError> {
        let mut state = self.state();
        *state.attempts.entry(method.to_string()).or_default() += 1;

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Disconnected("connection reset by fake engine".into()));
        }
        if let Some(message) = state.rejections.get(method) {
            return Ok(RpcReply::Rejected(message.clone()));
        }

        let reply = match method {
            methods::REGISTER_TEST_EXECUTION => {
                let args: RegisterTestExecutionArgs = decode(params)?;
                state.test_timeout_seconds = Some(args.test_timeout_seconds);
                RpcReply::Result(json!({}))
            }
            methods::REGISTER_SERVICE => {
                let args: RegisterServiceArgs = decode(params)?;
                if state.registered.contains_key(&args.service_id) {
                    return Ok(RpcReply::Rejected(format!(
                        "service '{}' is already registered",
                        args.service_id
                    )));
                }
                state.next_host += 1;
                let ip = format!("10.0.0.{}", state.next_host + 1);
                state.registered.insert(args.service_id.clone(), ip.clone());
                let paths: BTreeMap<String, String> = args
                    .files_to_generate
                    .iter()
                    .map(|file_id| (file_id.clone(), format!("services/{}/{file_id}", args.service_id)))
                    .collect();
                RpcReply::Result(json!({
                    "ip_address": ip,
                    "generated_files_relative_filepaths": paths,
                }))
            }
            methods::START_SERVICE => {
                let args: StartServiceArgs = decode(params)?;
                if !state.registered.contains_key(&args.service_id) {
                    return Ok(RpcReply::Rejected(format!(
                        "service '{}' was never registered",
                        args.service_id
                    )));
                }
                state.started.insert(args.service_id);
                RpcReply::Result(json!({}))
            }
            methods::REMOVE_SERVICE => {
                let args: RemoveServiceArgs = decode(params)?;
                if state.registered.remove(&args.service_id).is_none() {
                    return Ok(RpcReply::Rejected(format!(
                        "no service '{}' to remove",
                        args.service_id
                    )));
                }
                state.started.remove(&args.service_id);
                RpcReply::Result(json!({}))
            }
            methods::EXEC_COMMAND => {
                let args: ExecCommandArgs = decode(params)?;
                let code = state.exit_codes.get(&args.service_id).copied().unwrap_or(0);
                RpcReply::Result(json!({ "exit_code": code }))
            }
            methods::REPARTITION => {
                let _: RepartitionArgs = decode(params)?;
                RpcReply::Result(json!({}))
            }
            other => RpcReply::Rejected(format!("unknown method '{other}'")),
        };

        state.answered.push((method.to_string(), params.clone()));
        Ok(reply)
    }
}

fn decode<T: DeserializeOwned>(params: &Value) -> Result<T, TransportError> {
    serde_json::from_value(params.clone()).map_err(|e| TransportError::Malformed(e.to_string()))
}

impl EngineTransport for FakeEngine {
    fn call<'a>(
        &'a self,
        method: &'a str,
        params: &'a Value,
    ) -> BoxFuture<'a, Result<RpcReply, TransportError>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let latency = *self
                .latency
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match latency {
                Some(latency) => tokio::time::sleep(latency).await,
                None => tokio::task::yield_now().await,
            }

            let reply = self.answer(method, params);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            reply
        })
    }
}
