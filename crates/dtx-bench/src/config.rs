use clap::Parser;
use dtx_coordinator::CoordinatorConfig;
use dtx_core::BackendKind;

/// Configuration for the dtx-bench harness.
#[derive(Parser, Debug, Clone)]
#[command(name = "dtx-bench")]
#[command(about = "Benchmark and consistency checks for the distributed transaction coordinator")]
pub struct Config {
    /// Backends taking part: local, remote or mixed
    #[arg(long, default_value = "mixed", env = "DTX_BENCH_MODE")]
    pub mode: Mode,

    /// Devices per backend kind
    #[arg(long, default_value = "2", env = "DTX_BENCH_DEVICES")]
    pub devices: usize,

    /// Number of outer list entries
    #[arg(long, default_value = "10", env = "DTX_BENCH_OUTER_ELEMENTS")]
    pub outer_elements: usize,

    /// Number of inner list entries per outer entry
    #[arg(long, default_value = "10", env = "DTX_BENCH_INNER_ELEMENTS")]
    pub inner_elements: usize,

    /// Edits per distributed transaction
    #[arg(long, default_value = "25", env = "DTX_BENCH_PUTS_PER_TX")]
    pub puts_per_tx: usize,

    /// Benchmark iterations per writer
    #[arg(long, default_value = "5", env = "DTX_BENCH_LOOPS")]
    pub loops: usize,

    /// Edit applied to every element
    #[arg(long, default_value = "put", env = "DTX_BENCH_OPERATION")]
    pub operation: Operation,

    /// Consistency scenario run after the benchmark
    #[arg(long, default_value = "normal", env = "DTX_BENCH_SCENARIO")]
    pub scenario: Scenario,

    /// Simulated latency of every backend read and write, in milliseconds
    #[arg(long, default_value = "0", env = "DTX_BENCH_LATENCY_MS")]
    pub latency_ms: u64,

    /// Per-edit deadline in milliseconds
    #[arg(long, env = "DTX_EDIT_TIMEOUT_MS")]
    pub edit_timeout_ms: Option<u64>,

    /// Per-participant commit deadline in milliseconds
    #[arg(long, env = "DTX_SUBMIT_TIMEOUT_MS")]
    pub submit_timeout_ms: Option<u64>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.devices > 0, "--devices must be at least 1");
        anyhow::ensure!(self.puts_per_tx > 0, "--puts-per-tx must be at least 1");
        anyhow::ensure!(
            self.outer_elements > 0 && self.inner_elements > 0,
            "--outer-elements and --inner-elements must be at least 1"
        );
        Ok(())
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            edit_timeout_ms: self.edit_timeout_ms,
            submit_timeout_ms: self.submit_timeout_ms,
            ..CoordinatorConfig::default()
        }
    }

    /// Total number of elements written per run.
    pub fn element_count(&self) -> usize {
        self.outer_elements * self.inner_elements
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Local,
    Remote,
    Mixed,
}

impl Mode {
    pub fn kinds(&self) -> &'static [BackendKind] {
        match self {
            Mode::Local => &[BackendKind::Local],
            Mode::Remote => &[BackendKind::Remote],
            Mode::Mixed => &[BackendKind::Local, BackendKind::Remote],
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Local => write!(f, "local"),
            Mode::Remote => write!(f, "remote"),
            Mode::Mixed => write!(f, "mixed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Operation {
    Put,
    Merge,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Put => write!(f, "put"),
            Operation::Merge => write!(f, "merge"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Scenario {
    /// Every transaction commits
    Normal,
    /// One edit per transaction fails and triggers a rollback
    RollbackOnFailure,
    /// Every transaction is rolled back explicitly
    Rollback,
}

impl Scenario {
    /// Whether elements should be present once the scenario ran.
    pub fn expect_present(&self, operation: Operation) -> bool {
        let committed = *self == Scenario::Normal;
        match operation {
            Operation::Put | Operation::Merge => committed,
            Operation::Delete => !committed,
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scenario::Normal => write!(f, "normal"),
            Scenario::RollbackOnFailure => write!(f, "rollback-on-failure"),
            Scenario::Rollback => write!(f, "rollback"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["dtx-bench"]).unwrap();
        assert_eq!(config.mode, Mode::Mixed);
        assert_eq!(config.operation, Operation::Put);
        assert_eq!(config.scenario, Scenario::Normal);
        assert_eq!(config.element_count(), 100);
        assert!(config.validate().is_ok());
        assert_eq!(config.coordinator_config(), CoordinatorConfig::default());
    }

    #[test]
    fn test_parse_flags() {
        let config = Config::try_parse_from([
            "dtx-bench",
            "--mode",
            "remote",
            "--scenario",
            "rollback-on-failure",
            "--operation",
            "delete",
            "--puts-per-tx",
            "7",
            "--edit-timeout-ms",
            "50",
        ])
        .unwrap();
        assert_eq!(config.mode.kinds(), &[BackendKind::Remote]);
        assert_eq!(config.scenario, Scenario::RollbackOnFailure);
        assert_eq!(config.operation, Operation::Delete);
        assert_eq!(config.puts_per_tx, 7);
        assert_eq!(config.coordinator_config().edit_timeout_ms, Some(50));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = Config::try_parse_from(["dtx-bench", "--puts-per-tx", "0"]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expected_presence() {
        assert!(Scenario::Normal.expect_present(Operation::Put));
        assert!(!Scenario::Normal.expect_present(Operation::Delete));
        assert!(!Scenario::Rollback.expect_present(Operation::Merge));
        assert!(Scenario::RollbackOnFailure.expect_present(Operation::Delete));
    }
}
