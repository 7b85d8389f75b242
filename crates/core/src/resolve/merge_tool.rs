//! Merge-tool selection and invocation.
//!
//! Tools are selected by sniffing a representative input: a NUL byte in the
//! first 8 KiB selects the binary tool, otherwise the first file class whose
//! pattern matches the item's name, otherwise the default tool. Builtins run
//! in-process; external tools run synchronously through
//! [`std::process::Command`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use glob_match::glob_match;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::{ExternalTool, MergeClass, MergeConfig};
use crate::errors::MergeToolError;

/// Bytes sniffed for binary detection.
const SNIFF_LEN: usize = 8 * 1024;

/// How a merge-tool run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// The result file is a complete merge.
    Clean,
    /// The result file holds conflict markers.
    Conflict,
    /// No usable result.
    Failed,
}

/// Files handed to a merge tool.
#[derive(Debug, Clone, Copy)]
pub struct MergeInputs<'a> {
    pub ancestor: &'a Path,
    pub baseline: &'a Path,
    pub other: &'a Path,
    pub result: &'a Path,
}

#[derive(Debug, Clone)]
pub struct MergeToolRegistry {
    default_tool: String,
    binary_tool: String,
    classes: Vec<MergeClass>,
    tools: BTreeMap<String, ExternalTool>,
}

impl MergeToolRegistry {
    pub fn from_config(config: &MergeConfig) -> Self {
        Self {
            default_tool: config.default_tool.clone(),
            binary_tool: config.binary_tool.clone(),
            classes: config.classes.clone(),
            tools: config.tools.clone(),
        }
    }

    /// Pick the tool for an item named `entryname` whose content starts
    /// with `sample`.
    pub fn select(&self, entryname: &str, sample: &[u8]) -> &str {
        let head = &sample[..sample.len().min(SNIFF_LEN)];
        if head.contains(&0) {
            debug!(entryname, tool = %self.binary_tool, "binary content");
            return &self.binary_tool;
        }
        for class in &self.classes {
            if class.patterns.iter().any(|p| glob_match(p, entryname)) {
                debug!(entryname, class = %class.name, tool = %class.tool, "matched file class");
                return &class.tool;
            }
        }
        &self.default_tool
    }

    /// Run `tool` over `inputs`, writing the merged result to
    /// `inputs.result`.
    #[instrument(skip(self, inputs), fields(result = %inputs.result.display()))]
    pub fn run(&self, tool: &str, inputs: &MergeInputs<'_>) -> Result<MergeOutcome, MergeToolError> {
        let outcome = match tool {
            ":diffy" => run_diffy(inputs)?,
            ":baseline" => {
                fs::copy(inputs.baseline, inputs.result)?;
                MergeOutcome::Clean
            }
            ":other" => {
                fs::copy(inputs.other, inputs.result)?;
                MergeOutcome::Clean
            }
            ":fail" => MergeOutcome::Failed,
            name => {
                let external = self
                    .tools
                    .get(name)
                    .ok_or_else(|| MergeToolError::UnknownTool(name.to_string()))?;
                run_external(name, external, inputs)?
            }
        };
        info!(tool, outcome = ?outcome, "merge tool finished");
        Ok(outcome)
    }
}

/// Line-based three-way merge. Non-UTF-8 input cannot be merged this way.
fn run_diffy(inputs: &MergeInputs<'_>) -> Result<MergeOutcome, MergeToolError> {
    let read = |path: &Path| -> Result<Option<String>, MergeToolError> {
        Ok(String::from_utf8(fs::read(path)?).ok())
    };
    let (Some(ancestor), Some(ours), Some(theirs)) = (
        read(inputs.ancestor)?,
        read(inputs.baseline)?,
        read(inputs.other)?,
    ) else {
        warn!("inputs are not UTF-8, cannot line-merge");
        return Ok(MergeOutcome::Failed);
    };

    match diffy::merge(&ancestor, &ours, &theirs) {
        Ok(merged) => {
            fs::write(inputs.result, merged)?;
            Ok(MergeOutcome::Clean)
        }
        Err(with_markers) => {
            fs::write(inputs.result, with_markers)?;
            Ok(MergeOutcome::Conflict)
        }
    }
}

fn run_external(
    name: &str,
    tool: &ExternalTool,
    inputs: &MergeInputs<'_>,
) -> Result<MergeOutcome, MergeToolError> {
    let args: Vec<String> = tool
        .args
        .iter()
        .map(|arg| substitute(arg, inputs))
        .collect();
    debug!(tool = name, command = %tool.command, args = ?args, "launching external merge tool");

    let status = Command::new(&tool.command)
        .args(&args)
        .stdin(Stdio::null())
        .status()
        .map_err(|e| MergeToolError::LaunchFailed {
            tool: name.to_string(),
            detail: e.to_string(),
        })?;

    Ok(match status.code() {
        Some(0) if inputs.result.exists() => MergeOutcome::Clean,
        Some(code) if tool.conflict_exit_codes.contains(&code) => MergeOutcome::Conflict,
        code => {
            warn!(tool = name, code = ?code, "merge tool failed");
            MergeOutcome::Failed
        }
    })
}

fn substitute(arg: &str, inputs: &MergeInputs<'_>) -> String {
    arg.replace("@ANCESTOR@", &inputs.ancestor.to_string_lossy())
        .replace("@BASELINE@", &inputs.baseline.to_string_lossy())
        .replace("@OTHER@", &inputs.other.to_string_lossy())
        .replace("@RESULT@", &inputs.result.to_string_lossy())
}
