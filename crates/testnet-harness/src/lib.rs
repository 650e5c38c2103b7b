//! Test runner for testnet: the caller of the network context.

pub mod config;
pub mod runner;

pub use config::{TestConfiguration, TestConfigurationBuilder};
pub use runner::{RunnerError, Test, TestContext, TestOutcome, TestRunner};
