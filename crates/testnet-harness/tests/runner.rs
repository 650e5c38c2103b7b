use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use testnet_client::test_util::{init_tracing, FakeEngine};
use testnet_client::{
    ClientConfig, ContainerConfigFactory, ContainerCreationConfig, ContainerRunConfig,
    NetworkContext, PartitionConnectionInfo, PartitionId, Service, ServiceContext, ServiceId,
};
use testnet_common::protocol::methods;
use testnet_harness::{RunnerError, Test, TestConfiguration, TestContext, TestOutcome, TestRunner};

struct Datastore {
    ctx: ServiceContext,
}

impl Service for Datastore {
    fn service_id(&self) -> &ServiceId {
        self.ctx.service_id()
    }

    fn ip_address(&self) -> &str {
        self.ctx.ip_address()
    }

    fn is_available(&self) -> BoxFuture<'_, bool> {
        Box::pin(async { true })
    }
}

struct DatastoreFactory;

impl ContainerConfigFactory for DatastoreFactory {
    type Service = Datastore;

    fn creation_config(&self) -> anyhow::Result<ContainerCreationConfig> {
        Ok(ContainerCreationConfig::builder("kurtosistech/example-datastore", "/test-volume").build())
    }

    fn run_config(
        &self,
        _ip_address: &str,
        _generated_files: &BTreeMap<String, PathBuf>,
    ) -> anyhow::Result<ContainerRunConfig> {
        Ok(ContainerRunConfig::default())
    }

    fn wrap(&self, ctx: ServiceContext) -> Datastore {
        Datastore { ctx }
    }
}

enum Behavior {
    Pass,
    Fail,
    Panic,
    FailSetup,
    HangInSetup,
    /// Runs until cancelled, then reports back through the sender.
    HangInRun(Mutex<Option<oneshot::Sender<()>>>),
    Partition,
}

struct DatastoreTest {
    behavior: Behavior,
}

impl DatastoreTest {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self { behavior })
    }
}

impl Test for DatastoreTest {
    type Network = Arc<Datastore>;

    fn configuration(&self) -> TestConfiguration {
        TestConfiguration::builder()
            .with_setup_timeout(Duration::from_secs(10))
            .with_run_timeout(Duration::from_secs(5))
            .with_setup_teardown_buffer(Duration::from_secs(1))
            .with_partitioning_enabled(matches!(self.behavior, Behavior::Partition))
            .build()
    }

    async fn setup(&self, network: Arc<NetworkContext>) -> anyhow::Result<Arc<Datastore>> {
        match self.behavior {
            Behavior::FailSetup => anyhow::bail!("datastore image missing"),
            Behavior::HangInSetup => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            _ => {}
        }
        let (datastore, checker) = network.add_service("datastore", &DatastoreFactory).await?;
        checker
            .wait_for_startup(Duration::from_millis(10), 5)
            .await?;

        if matches!(self.behavior, Behavior::Partition) {
            network
                .add_service_to_partition("api", "api", &DatastoreFactory)
                .await?;
            network
                .repartition_network(
                    BTreeMap::from([
                        (PartitionId::from("api"), BTreeSet::from([ServiceId::from("api")])),
                        (
                            PartitionId::default_partition(),
                            BTreeSet::from([ServiceId::from("datastore")]),
                        ),
                    ]),
                    BTreeMap::from([(
                        PartitionId::from("api"),
                        BTreeMap::from([(
                            PartitionId::default_partition(),
                            PartitionConnectionInfo::blocked(),
                        )]),
                    )]),
                    PartitionConnectionInfo::unblocked(),
                )
                .await?;
        }
        Ok(datastore)
    }

    async fn run(&self, datastore: Arc<Datastore>, ctx: TestContext) -> anyhow::Result<()> {
        match &self.behavior {
            Behavior::Fail => anyhow::bail!("expected 3 items in datastore, found 0"),
            Behavior::Panic => panic!("boom"),
            Behavior::HangInRun(done) => {
                let done = done.lock().unwrap().take();
                ctx.cancelled().await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
                Ok(())
            }
            _ => {
                let code = datastore.ctx.exec_command(vec!["true".into()]).await?;
                anyhow::ensure!(code == 0, "exec returned {code}");
                Ok(())
            }
        }
    }
}

fn runner(engine: &Arc<FakeEngine>, volume: &tempfile::TempDir) -> TestRunner {
    init_tracing();
    let mut config = ClientConfig::default();
    config.volume.suite_execution_volume_dirpath = volume.path().to_path_buf();
    TestRunner::new(config, engine.gateway())
}

#[tokio::test]
async fn passing_test() {
    let engine = FakeEngine::new();
    let volume = tempfile::tempdir().unwrap();

    let outcome = runner(&engine, &volume)
        .run(DatastoreTest::new(Behavior::Pass))
        .await
        .unwrap();
    assert!(outcome.is_passed(), "{outcome:?}");
    // setup + run + buffer
    assert_eq!(engine.test_timeout_seconds(), Some(16));
    assert!(engine.is_started("datastore"));
    assert_eq!(engine.attempts(methods::EXEC_COMMAND), 1);
}

#[tokio::test]
async fn failing_test_keeps_its_error() {
    let engine = FakeEngine::new();
    let volume = tempfile::tempdir().unwrap();

    let outcome = runner(&engine, &volume)
        .run(DatastoreTest::new(Behavior::Fail))
        .await
        .unwrap();
    match outcome {
        TestOutcome::Failed(e) => assert!(e.to_string().contains("found 0")),
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn panicking_test_is_reported() {
    let engine = FakeEngine::new();
    let volume = tempfile::tempdir().unwrap();

    let outcome = runner(&engine, &volume)
        .run(DatastoreTest::new(Behavior::Panic))
        .await
        .unwrap();
    match outcome {
        TestOutcome::Panicked(message) => assert_eq!(message, "boom"),
        other => panic!("expected Panicked, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn hung_test_times_out_and_is_cancelled() {
    let engine = FakeEngine::new();
    let volume = tempfile::tempdir().unwrap();
    let (done_tx, done_rx) = oneshot::channel();

    let outcome = runner(&engine, &volume)
        .run(DatastoreTest::new(Behavior::HangInRun(Mutex::new(Some(done_tx)))))
        .await
        .unwrap();
    match outcome {
        TestOutcome::TimedOut(after) => assert_eq!(after, Duration::from_secs(5)),
        other => panic!("expected TimedOut, got {other:?}"),
    }

    // the detached task saw the cancellation
    done_rx.await.unwrap();
}

#[tokio::test]
async fn setup_failure_is_its_own_outcome() {
    let engine = FakeEngine::new();
    let volume = tempfile::tempdir().unwrap();

    let outcome = runner(&engine, &volume)
        .run(DatastoreTest::new(Behavior::FailSetup))
        .await
        .unwrap();
    match outcome {
        TestOutcome::SetupFailed(e) => {
            let chain = format!("{e:#}");
            assert!(chain.contains("datastore image missing"), "{chain}");
        }
        other => panic!("expected SetupFailed, got {other:?}"),
    }
    assert_eq!(engine.attempts(methods::EXEC_COMMAND), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_setup_times_out() {
    let engine = FakeEngine::new();
    let volume = tempfile::tempdir().unwrap();

    let outcome = runner(&engine, &volume)
        .run(DatastoreTest::new(Behavior::HangInSetup))
        .await
        .unwrap();
    match outcome {
        TestOutcome::SetupFailed(e) => assert!(e.to_string().contains("did not finish")),
        other => panic!("expected SetupFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn registration_failure_stops_the_run() {
    let engine = FakeEngine::new();
    let volume = tempfile::tempdir().unwrap();
    engine.reject(methods::REGISTER_TEST_EXECUTION, "engine is shutting down");

    let err = runner(&engine, &volume)
        .run(DatastoreTest::new(Behavior::Pass))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Registration(_)));
    assert_eq!(engine.attempts(methods::REGISTER_SERVICE), 0);
}

#[tokio::test]
async fn partitioned_setup() {
    let engine = FakeEngine::new();
    let volume = tempfile::tempdir().unwrap();

    let outcome = runner(&engine, &volume)
        .run(DatastoreTest::new(Behavior::Partition))
        .await
        .unwrap();
    assert!(outcome.is_passed(), "{outcome:?}");
    assert_eq!(engine.calls(methods::REPARTITION).len(), 1);
}
