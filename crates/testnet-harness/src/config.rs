//! Per-test configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use testnet_client::FilesArtifactId;

pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(180);
/// Extra time the engine allows on top of setup and run before killing the test.
pub const DEFAULT_SETUP_TEARDOWN_BUFFER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfiguration {
    pub setup_timeout: Duration,
    pub run_timeout: Duration,
    pub setup_teardown_buffer: Duration,
    pub is_partitioning_enabled: bool,
    /// Files artifacts the test's services may mount, by ID.
    pub files_artifact_urls: BTreeMap<FilesArtifactId, String>,
}

impl Default for TestConfiguration {
    fn default() -> Self {
        Self {
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            setup_teardown_buffer: DEFAULT_SETUP_TEARDOWN_BUFFER,
            is_partitioning_enabled: false,
            files_artifact_urls: BTreeMap::new(),
        }
    }
}

impl TestConfiguration {
    pub fn builder() -> TestConfigurationBuilder {
        TestConfigurationBuilder::default()
    }

    /// Hard timeout armed on the engine, in whole seconds rounded up.
    pub fn hard_timeout_seconds(&self) -> u64 {
        let total = self.setup_timeout + self.run_timeout + self.setup_teardown_buffer;
        let secs = total.as_secs();
        if total.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

#[derive(Debug, Default)]
pub struct TestConfigurationBuilder {
    config: TestConfiguration,
}

impl TestConfigurationBuilder {
    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.config.setup_timeout = timeout;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.config.run_timeout = timeout;
        self
    }

    pub fn with_setup_teardown_buffer(mut self, buffer: Duration) -> Self {
        self.config.setup_teardown_buffer = buffer;
        self
    }

    pub fn with_partitioning_enabled(mut self, enabled: bool) -> Self {
        self.config.is_partitioning_enabled = enabled;
        self
    }

    pub fn with_files_artifact_urls<I, K, V>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<FilesArtifactId>,
        V: Into<String>,
    {
        self.config
            .files_artifact_urls
            .extend(urls.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn build(self) -> TestConfiguration {
        self.config
    }
}
