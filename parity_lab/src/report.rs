use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{checker::EquivalenceRun, kernel::OperatorKind};

/// Archived outcome of one `check_equivalence` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParityReport {
    pub label: String,
    pub kind: OperatorKind,
    pub runs: Vec<EquivalenceRun>,
}

impl ParityReport {
    pub fn new(label: impl Into<String>, kind: OperatorKind, runs: Vec<EquivalenceRun>) -> Self {
        Self {
            label: label.into(),
            kind,
            runs,
        }
    }

    pub fn passed(&self) -> bool {
        self.runs.iter().all(|run| run.report.passed())
    }

    pub fn failures(&self) -> impl Iterator<Item = &EquivalenceRun> {
        self.runs.iter().filter(|run| !run.report.passed())
    }
}

/// Writes reports as pretty JSON so runs can be archived and diffed.
pub fn export_report_json<P: AsRef<Path>>(reports: &[ParityReport], path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(reports).context("failed to serialize reports")?;
    fs::write(&path, json)
        .with_context(|| format!("failed to write report JSON to {}", path.as_ref().display()))?;
    Ok(())
}

pub fn import_report_json<P: AsRef<Path>>(path: P) -> Result<Vec<ParityReport>> {
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read report JSON {}", path.as_ref().display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("invalid report JSON in {}", path.as_ref().display()))
}
