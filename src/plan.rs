use serde::Serialize;
use std::time::Duration;

/// One command to run and how to read its output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandSpec {
    /// Command text sent to the shell.
    pub name: String,
    /// `true`: run output through the keyword extractor.
    /// `false`: keep verbatim lines, minus the first and last.
    pub filtered: bool,
    /// How long to wait for output before reading.
    #[serde(rename = "settle_ms", serialize_with = "as_millis")]
    pub settle: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, filtered: bool, settle: Duration) -> Self {
        Self {
            name: name.into(),
            filtered,
            settle,
        }
    }
}

/// Ordered list of commands for one collection run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CommandPlan {
    commands: Vec<CommandSpec>,
}

impl CommandPlan {
    pub fn new(commands: Vec<CommandSpec>) -> Self {
        Self { commands }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Lines of unfiltered output with the banner and prompt lines removed.
///
/// The block is trimmed, split into lines, and the first and last lines are
/// dropped; the rest are trimmed individually. Output of one or two lines
/// therefore yields nothing, even if those lines were real data.
pub fn verbatim_lines(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.trim().lines().collect();
    if lines.len() <= 2 {
        return Vec::new();
    }
    lines[1..lines.len() - 1]
        .iter()
        .map(|l| l.trim().to_string())
        .collect()
}
