/// Runs a command plan against a shell and assembles the results into a table.
///
/// Commands run strictly in plan order, one at a time. The per-command value
/// lists have independent lengths; `to_table` pads them on the right to a
/// common length so the table is rectangular. Row `r` across columns is only
/// a coherent observation when the commands happen to produce aligned counts.
use crate::channel::{ChannelError, ChannelSynchronizer, ShellChannel};
use crate::extract::{DecodeError, ExtractedValue, KeywordExtractor};
use crate::plan::{verbatim_lines, CommandPlan};
use crate::table::Table;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation shared between the run and its supervisor.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Errors that abort a collection run.
#[derive(Debug)]
pub enum CollectError {
    /// Sending or reading a command failed.
    Channel {
        command: String,
        source: ChannelError,
    },
    /// A percentage in filtered output could not be parsed.
    Decode {
        command: String,
        source: DecodeError,
    },
    /// The plan has no commands.
    EmptyPlan,
    /// Header count differs from the number of commands.
    SchemaMismatch { headers: usize, commands: usize },
    /// The run was cancelled before it finished.
    Cancelled,
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::Channel { command, source } => {
                write!(f, "command {:?} failed: {}", command, source)
            }
            CollectError::Decode { command, source } => {
                write!(f, "command {:?} output: {}", command, source)
            }
            CollectError::EmptyPlan => write!(f, "no commands configured"),
            CollectError::SchemaMismatch { headers, commands } => write!(
                f,
                "{} headers configured for {} commands; they must match one-to-one",
                headers, commands
            ),
            CollectError::Cancelled => write!(f, "collection cancelled"),
        }
    }
}

impl std::error::Error for CollectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectError::Channel { source, .. } => Some(source),
            CollectError::Decode { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Values collected for one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub command: String,
    pub values: Vec<ExtractedValue>,
}

/// Per-command results of one run, in plan order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    results: Vec<CommandResult>,
}

impl ResultSet {
    pub fn new(results: Vec<CommandResult>) -> Self {
        Self { results }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Length of the longest value list.
    pub fn max_len(&self) -> usize {
        self.results.iter().map(|r| r.values.len()).max().unwrap_or(0)
    }
}

pub struct ResultAggregator {
    sync: ChannelSynchronizer,
    extractor: KeywordExtractor,
}

impl ResultAggregator {
    pub fn new(sync: ChannelSynchronizer, extractor: KeywordExtractor) -> Self {
        Self { sync, extractor }
    }

    /// Execute every command in `plan` and collect its values.
    ///
    /// Stops at the first failing command; no partial result set is returned.
    pub fn aggregate(
        &self,
        plan: &CommandPlan,
        channel: &mut dyn ShellChannel,
        cancel: &CancelFlag,
    ) -> Result<ResultSet, CollectError> {
        if plan.is_empty() {
            return Err(CollectError::EmptyPlan);
        }

        let mut results = Vec::with_capacity(plan.len());
        for (idx, spec) in plan.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(CollectError::Cancelled);
            }

            let text = self
                .sync
                .execute(channel, &spec.name, spec.settle)
                .map_err(|e| CollectError::Channel {
                    command: spec.name.clone(),
                    source: e,
                })?;

            let values = if spec.filtered {
                self.extractor
                    .extract(&text)
                    .map_err(|e| CollectError::Decode {
                        command: spec.name.clone(),
                        source: e,
                    })?
            } else {
                verbatim_lines(&text)
                    .into_iter()
                    .map(ExtractedValue::Raw)
                    .collect()
            };

            tracing::info!(
                step = idx + 1,
                total = plan.len(),
                command = %spec.name,
                filtered = spec.filtered,
                values = values.len(),
                "command collected"
            );
            results.push(CommandResult {
                command: spec.name.clone(),
                values,
            });
        }

        Ok(ResultSet::new(results))
    }
}

/// Assemble a result set into a table, column `i` holding command `i`'s values.
pub fn to_table(results: &ResultSet, headers: &[String]) -> Result<Table, CollectError> {
    if results.is_empty() {
        return Err(CollectError::EmptyPlan);
    }
    if headers.len() != results.len() {
        return Err(CollectError::SchemaMismatch {
            headers: headers.len(),
            commands: results.len(),
        });
    }

    let max_len = results.max_len();
    let columns: Vec<Vec<String>> = results
        .iter()
        .map(|r| {
            tracing::debug!(command = %r.command, values = r.values.len(), max_len, "column assembled");
            let mut cells: Vec<String> = r.values.iter().map(ExtractedValue::to_cell).collect();
            cells.resize(max_len, String::new());
            cells
        })
        .collect();

    let mut table = Table::new(headers.to_vec());
    for row in 0..max_len {
        table.push_row(columns.iter().map(|col| col[row].clone()).collect());
    }
    Ok(table)
}
