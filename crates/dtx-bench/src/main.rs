//! Benchmark and consistency harness for the distributed transaction
//! coordinator, run against in-memory backends.

mod backends;
mod config;
mod workload;
mod writer;

use anyhow::ensure;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use backends::Backends;
use config::{Config, Operation, Scenario};
use writer::{BaselineWriter, DtxAsyncWriter, DtxSyncWriter, WriteJob, WriteReport, Writer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    info!("Starting dtx-bench");
    info!("  Mode: {}", config.mode);
    info!("  Devices per kind: {}", config.devices);
    info!(
        "  Elements: {} ({} x {})",
        config.element_count(),
        config.outer_elements,
        config.inner_elements
    );
    info!("  Edits per transaction: {}", config.puts_per_tx);
    info!("  Operation: {}", config.operation);
    info!("  Scenario: {}", config.scenario);

    tokio::select! {
        result = run(&config) => result,
        _ = signal::ctrl_c() => {
            warn!("Received Ctrl+C, stopping");
            Ok(())
        }
    }
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let benchmark = WriteJob {
        operation: config.operation,
        puts_per_tx: config.puts_per_tx,
        scenario: Scenario::Normal,
        error_path: workload::error_path(config),
    };
    let writers: [&dyn Writer; 3] = [&BaselineWriter, &DtxSyncWriter, &DtxAsyncWriter];

    for writer in writers {
        let mut total = WriteReport::default();
        for _ in 0..config.loops {
            let backends = Backends::new(config);
            let elements = workload::build(config, backends.participants());
            if config.operation == Operation::Delete {
                workload::seed(&backends, &elements);
            }
            total.accumulate(writer.write(&backends, &elements, &benchmark).await?);
        }

        let loops = config.loops.max(1) as u32;
        info!(
            "{:>10}: {:?} per run, {} committed, {} failed",
            writer.name(),
            total.elapsed / loops,
            total.committed,
            total.failed
        );
    }

    let scenario = WriteJob {
        scenario: config.scenario,
        ..benchmark
    };
    let expect_present = config.scenario.expect_present(config.operation);
    for writer in [&DtxSyncWriter as &dyn Writer, &DtxAsyncWriter] {
        let backends = Backends::new(config);
        let elements = workload::build(config, backends.participants());
        if config.operation == Operation::Delete {
            workload::seed(&backends, &elements);
        }
        let report = writer.write(&backends, &elements, &scenario).await?;

        let mismatches = workload::mismatches(&backends, &elements, expect_present);
        ensure!(
            mismatches == 0,
            "{}: {} of {} elements inconsistent after {} scenario",
            writer.name(),
            mismatches,
            elements.len(),
            config.scenario
        );
        ensure!(
            backends.locked_devices() == 0,
            "{}: devices still locked after {} scenario",
            writer.name(),
            config.scenario
        );
        info!(
            "{:>10}: {} scenario consistent ({} committed, {} rolled back)",
            writer.name(),
            config.scenario,
            report.committed,
            report.failed
        );
    }

    Ok(())
}
