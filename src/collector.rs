/// One collection run: open a shell, run the plan, close the shell, then
/// merge the new rows into the dataset.
///
/// The shell is closed on every path, including failures. Nothing is written
/// unless every command succeeded and the run was not cancelled, so a failed
/// run leaves the stored dataset byte-for-byte unchanged.
use crate::aggregate::{to_table, CancelFlag, CollectError, ResultAggregator};
use crate::channel::{ChannelError, ShellChannel};
use crate::merge::{DatasetMerger, MergeError};
use crate::plan::CommandPlan;
use crate::table::Table;
use std::path::PathBuf;

#[derive(Debug)]
pub enum RunError {
    /// The shell could not be opened.
    Connect(ChannelError),
    Collect(CollectError),
    Merge(MergeError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Connect(e) => write!(f, "could not open remote shell: {e}"),
            RunError::Collect(e) => write!(f, "collection failed: {e}"),
            RunError::Merge(e) => write!(f, "could not save dataset: {e}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Connect(e) => Some(e),
            RunError::Collect(e) => Some(e),
            RunError::Merge(e) => Some(e),
        }
    }
}

impl From<CollectError> for RunError {
    fn from(e: CollectError) -> Self {
        RunError::Collect(e)
    }
}

impl From<MergeError> for RunError {
    fn from(e: MergeError) -> Self {
        RunError::Merge(e)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub rows_collected: usize,
    pub rows_total: usize,
    pub output: PathBuf,
}

pub struct Collector {
    plan: CommandPlan,
    headers: Vec<String>,
    aggregator: ResultAggregator,
    merger: DatasetMerger,
}

impl Collector {
    /// Build a collector, rejecting an empty plan or misaligned headers up front.
    pub fn new(
        plan: CommandPlan,
        headers: Vec<String>,
        aggregator: ResultAggregator,
        merger: DatasetMerger,
    ) -> Result<Self, CollectError> {
        if plan.is_empty() {
            return Err(CollectError::EmptyPlan);
        }
        if headers.len() != plan.len() {
            return Err(CollectError::SchemaMismatch {
                headers: headers.len(),
                commands: plan.len(),
            });
        }
        Ok(Self {
            plan,
            headers,
            aggregator,
            merger,
        })
    }

    /// Run the plan on an already-open channel and build this run's table.
    pub fn collect_table(
        &self,
        channel: &mut dyn ShellChannel,
        cancel: &CancelFlag,
    ) -> Result<Table, CollectError> {
        let results = self.aggregator.aggregate(&self.plan, channel, cancel)?;
        to_table(&results, &self.headers)
    }

    /// Open a channel with `open`, collect, close, then merge and persist.
    pub fn run<C, F>(&self, open: F, cancel: &CancelFlag) -> Result<RunSummary, RunError>
    where
        C: ShellChannel,
        F: FnOnce() -> Result<C, ChannelError>,
    {
        let mut channel = open().map_err(RunError::Connect)?;
        let collected = self.collect_table(&mut channel, cancel);
        if let Err(e) = channel.close() {
            tracing::warn!(error = %e, "failed to close remote shell cleanly");
        }
        let table = collected?;

        if cancel.is_cancelled() {
            return Err(CollectError::Cancelled.into());
        }

        let rows_collected = table.rows().len();
        let merged = self.merger.merge_and_persist(table)?;
        let summary = RunSummary {
            rows_collected,
            rows_total: merged.rows().len(),
            output: self.merger.path().to_path_buf(),
        };
        tracing::info!(
            rows_collected = summary.rows_collected,
            rows_total = summary.rows_total,
            output = %summary.output.display(),
            "dataset written"
        );
        Ok(summary)
    }
}
