use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dtx_coordinator::DistributedTransaction;
use dtx_core::{Participant, TransactionHandle, TransactionProvider};
use dtx_memory::Fault;
use futures::future::join_all;
use rand::Rng;
use tracing::{debug, trace};

use crate::backends::Backends;
use crate::config::{Operation, Scenario};
use crate::workload::{Element, SCOPE};

/// Outcome of one writer run.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteReport {
    pub elapsed: Duration,
    pub committed: usize,
    pub failed: usize,
}

impl WriteReport {
    pub fn accumulate(&mut self, other: WriteReport) {
        self.elapsed += other.elapsed;
        self.committed += other.committed;
        self.failed += other.failed;
    }
}

/// What a writer needs besides the elements.
#[derive(Debug, Clone)]
pub struct WriteJob {
    pub operation: Operation,
    pub puts_per_tx: usize,
    pub scenario: Scenario,
    /// Target of the failing edit in the rollback-on-failure scenario.
    pub error_path: dtx_core::DataPath,
}

/// Writes a workload in batches of `puts_per_tx` edits per transaction.
#[async_trait]
pub trait Writer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write(
        &self,
        backends: &Backends,
        elements: &[Element],
        job: &WriteJob,
    ) -> anyhow::Result<WriteReport>;
}

/// Direct provider transactions, no locking and no compensation.
pub struct BaselineWriter;

#[async_trait]
impl Writer for BaselineWriter {
    fn name(&self) -> &'static str {
        "baseline"
    }

    async fn write(
        &self,
        backends: &Backends,
        elements: &[Element],
        job: &WriteJob,
    ) -> anyhow::Result<WriteReport> {
        anyhow::ensure!(
            job.scenario == Scenario::Normal,
            "the baseline writer cannot roll back"
        );

        let mut report = WriteReport::default();
        let started = Instant::now();
        for batch in elements.chunks(job.puts_per_tx) {
            let mut handles: HashMap<Participant, Arc<dyn TransactionHandle>> = HashMap::new();
            let mut ok = true;
            for element in batch {
                let participant = &element.participant;
                let handle = match handles.get(participant) {
                    Some(handle) => Arc::clone(handle),
                    None => {
                        let handle = backends
                            .provider(participant.kind)
                            .new_tx(&participant.device)?;
                        handles.insert(participant.clone(), Arc::clone(&handle));
                        handle
                    }
                };
                let written = match job.operation {
                    Operation::Put => {
                        handle
                            .put(SCOPE, &element.path, element.value.clone())
                            .await
                    }
                    Operation::Merge => {
                        handle
                            .merge(SCOPE, &element.path, element.value.clone())
                            .await
                    }
                    Operation::Delete => handle.delete(SCOPE, &element.path).await,
                };
                if let Err(e) = written {
                    trace!("Baseline write failed: {}", e);
                    ok = false;
                }
            }

            let submits = join_all(handles.values().map(|handle| handle.submit())).await;
            if ok && submits.iter().all(Result::is_ok) {
                report.committed += 1;
            } else {
                report.failed += 1;
            }
        }
        report.elapsed = started.elapsed();
        Ok(report)
    }
}

/// Distributed transactions, one edit awaited at a time.
pub struct DtxSyncWriter;

/// Distributed transactions, every edit of a batch in flight at once.
pub struct DtxAsyncWriter;

#[async_trait]
impl Writer for DtxSyncWriter {
    fn name(&self) -> &'static str {
        "dtx-sync"
    }

    async fn write(
        &self,
        backends: &Backends,
        elements: &[Element],
        job: &WriteJob,
    ) -> anyhow::Result<WriteReport> {
        write_batches(backends, elements, job, false).await
    }
}

#[async_trait]
impl Writer for DtxAsyncWriter {
    fn name(&self) -> &'static str {
        "dtx-async"
    }

    async fn write(
        &self,
        backends: &Backends,
        elements: &[Element],
        job: &WriteJob,
    ) -> anyhow::Result<WriteReport> {
        write_batches(backends, elements, job, true).await
    }
}

async fn edit(
    tx: &DistributedTransaction,
    element: &Element,
    operation: Operation,
) -> dtx_coordinator::Result<()> {
    let kind = element.participant.kind;
    let device = &element.participant.device;
    let value = element.value.clone();
    match operation {
        Operation::Put => {
            tx.put_and_rollback_on_failure(kind, SCOPE, &element.path, value, device)
                .await
        }
        Operation::Merge => {
            tx.merge_and_rollback_on_failure(kind, SCOPE, &element.path, value, device)
                .await
        }
        Operation::Delete => {
            tx.delete_and_rollback_on_failure(kind, SCOPE, &element.path, device)
                .await
        }
    }
}

async fn write_batches(
    backends: &Backends,
    elements: &[Element],
    job: &WriteJob,
    concurrent: bool,
) -> anyhow::Result<WriteReport> {
    let mut report = WriteReport::default();
    let started = Instant::now();

    for batch in elements.chunks(job.puts_per_tx) {
        let tx = backends.dtx.new_transaction_for(backends.lock_set())?;

        // The failing edit goes right after a random element of the batch
        let mut edits: Vec<(Element, bool)> =
            batch.iter().cloned().map(|element| (element, false)).collect();
        if job.scenario == Scenario::RollbackOnFailure {
            let at = rand::thread_rng().gen_range(0..batch.len());
            let target = batch[at].participant.clone();
            if let Some(device) = backends.device(&target) {
                device.inject(Fault::FailWrite(job.error_path.clone()));
            }
            let failing = Element {
                participant: target,
                path: job.error_path.clone(),
                value: batch[at].value.clone(),
            };
            edits.insert(at + 1, (failing, true));
        }

        let outcomes = if concurrent {
            join_all(edits.iter().map(|(element, _)| edit(&tx, element, job.operation))).await
        } else {
            let mut outcomes = Vec::with_capacity(edits.len());
            for (element, _) in &edits {
                outcomes.push(edit(&tx, element, job.operation).await);
            }
            outcomes
        };
        for ((element, expected_failure), outcome) in edits.iter().zip(&outcomes) {
            if let Err(e) = outcome {
                if *expected_failure {
                    debug!("Injected failure at {}: {}", element.path, e);
                } else {
                    trace!("Edit of {} failed: {}", element.path, e);
                }
            }
        }

        let finished = match job.scenario {
            Scenario::Rollback => tx.rollback().await.map(|_| false),
            Scenario::Normal | Scenario::RollbackOnFailure => tx.submit().await.map(|_| true),
        };
        match finished {
            Ok(true) => report.committed += 1,
            Ok(false) => report.failed += 1,
            Err(e) => {
                debug!("Transaction {} did not commit: {}", tx.identifier(), e);
                report.failed += 1;
            }
        }
    }

    report.elapsed = started.elapsed();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::workload;
    use clap::Parser;

    fn setup(args: &[&str]) -> (Config, Backends, Vec<Element>) {
        let mut argv = vec![
            "dtx-bench",
            "--outer-elements",
            "3",
            "--inner-elements",
            "4",
            "--puts-per-tx",
            "5",
        ];
        argv.extend_from_slice(args);
        let config = Config::try_parse_from(argv).unwrap();
        let backends = Backends::new(&config);
        let elements = workload::build(&config, backends.participants());
        (config, backends, elements)
    }

    fn job(config: &Config) -> WriteJob {
        WriteJob {
            operation: config.operation,
            puts_per_tx: config.puts_per_tx,
            scenario: config.scenario,
            error_path: workload::error_path(config),
        }
    }

    #[tokio::test]
    async fn test_baseline_commits_every_batch() {
        let (config, backends, elements) = setup(&[]);
        let report = BaselineWriter
            .write(&backends, &elements, &job(&config))
            .await
            .unwrap();

        // 12 elements in batches of 5
        assert_eq!(report.committed, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(workload::mismatches(&backends, &elements, true), 0);
    }

    #[tokio::test]
    async fn test_baseline_refuses_rollback_scenarios() {
        let (config, backends, elements) = setup(&["--scenario", "rollback"]);
        assert!(BaselineWriter
            .write(&backends, &elements, &job(&config))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dtx_writers_commit() {
        for writer in [&DtxSyncWriter as &dyn Writer, &DtxAsyncWriter] {
            let (config, backends, elements) = setup(&["--operation", "merge"]);
            let report = writer
                .write(&backends, &elements, &job(&config))
                .await
                .unwrap();
            assert_eq!(report.committed, 3, "{}", writer.name());
            assert_eq!(workload::mismatches(&backends, &elements, true), 0);
            assert_eq!(backends.locked_devices(), 0);
        }
    }

    #[tokio::test]
    async fn test_rollback_on_failure_restores_data() {
        for writer in [&DtxSyncWriter as &dyn Writer, &DtxAsyncWriter] {
            let (config, backends, elements) = setup(&["--scenario", "rollback-on-failure"]);
            let report = writer
                .write(&backends, &elements, &job(&config))
                .await
                .unwrap();
            assert_eq!(report.committed, 0, "{}", writer.name());
            assert_eq!(report.failed, 3);
            assert_eq!(workload::mismatches(&backends, &elements, false), 0);
            assert_eq!(backends.locked_devices(), 0);
        }
    }

    #[tokio::test]
    async fn test_explicit_rollback_of_deletes() {
        let (config, backends, elements) =
            setup(&["--scenario", "rollback", "--operation", "delete"]);
        workload::seed(&backends, &elements);

        let report = DtxSyncWriter
            .write(&backends, &elements, &job(&config))
            .await
            .unwrap();
        assert_eq!(report.failed, 3);
        assert_eq!(workload::mismatches(&backends, &elements, true), 0);
    }
}
