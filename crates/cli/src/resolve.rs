//! `wcengine resolve`: list, inspect and resolve conflicted items.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use dialoguer::Select;

use wcengine_core::models::{gid7, Alias};
use wcengine_core::resolve::{
    Choice, MergeOutcome, ResolveValue, ValueData, ValueOrigin, LABEL_BASELINE, LABEL_OTHER,
};
use wcengine_core::{ConflictAxis, Transaction, WorkingCopy};

use crate::style;

#[derive(Subcommand, Debug)]
pub enum ResolveAction {
    /// List items with conflicts.
    List,
    /// Show the choices of a conflicted item.
    Show { path: PathBuf },
    /// Accept a value for one conflict axis.
    Accept {
        path: PathBuf,

        /// existence, name, location, attributes or contents.
        axis: String,

        /// Value label; prompts when omitted.
        label: Option<String>,
    },
    /// Merge two contents values into a new one.
    Merge {
        path: PathBuf,

        #[arg(long, default_value = LABEL_BASELINE)]
        baseline: String,

        #[arg(long, default_value = LABEL_OTHER)]
        other: String,

        /// Merge tool; defaults to the tool configured for the file.
        #[arg(long)]
        tool: Option<String>,
    },
}

pub fn run(wc: &WorkingCopy, cwd: &Path, action: ResolveAction) -> Result<()> {
    match action {
        ResolveAction::List => run_list(wc),
        ResolveAction::Show { path } => run_show(wc, cwd, &path),
        ResolveAction::Accept { path, axis, label } => {
            run_accept(wc, cwd, &path, &axis, label.as_deref())
        }
        ResolveAction::Merge {
            path,
            baseline,
            other,
            tool,
        } => run_merge(wc, cwd, &path, &baseline, &other, tool.as_deref()),
    }
}

/// Conflicted items are matched by path among the enumerated issues, so
/// deleted items can be named too.
fn conflicted(tx: &mut Transaction<'_>, wc: &WorkingCopy, cwd: &Path, arg: &Path) -> Result<Alias> {
    let rel = crate::wc_relative(wc, cwd, arg)?;
    tx.resolve_items()
        .context("failed to list conflicts")?
        .into_iter()
        .find(|s| s.path == rel)
        .map(|s| s.alias)
        .ok_or_else(|| anyhow::anyhow!("'{}' has no conflicts", arg.display()))
}

fn parse_axis(s: &str) -> Result<ConflictAxis> {
    ConflictAxis::parse(s).ok_or_else(|| {
        let names: Vec<&str> = ConflictAxis::ALL.iter().map(|a| a.as_str()).collect();
        anyhow::anyhow!("unknown axis '{}': use one of {}", s, names.join(", "))
    })
}

fn join_axes(axes: &[ConflictAxis]) -> String {
    if axes.is_empty() {
        return "—".into();
    }
    axes.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(", ")
}

fn describe_data(data: &ValueData) -> String {
    match data {
        ValueData::Existence(true) => "exists".into(),
        ValueData::Existence(false) => "absent".into(),
        ValueData::Name(name) => name.clone(),
        ValueData::Location(gid) => format!("dir {}", gid7(gid)),
        ValueData::Attributes(bits) => format!("{bits:#x}"),
        ValueData::Contents(hid) => hid[..12.min(hid.len())].to_string(),
    }
}

fn describe_origin(value: &ResolveValue) -> String {
    match &value.origin {
        ValueOrigin::Changeset(_) => "changeset".into(),
        ValueOrigin::Automerge { tool } => format!("automerge ({tool})"),
        ValueOrigin::Merge { tool, outcome } => {
            let outcome = match outcome {
                MergeOutcome::Clean => "clean",
                MergeOutcome::Conflict => "conflict",
                MergeOutcome::Failed => "failed",
            };
            format!("merge ({tool}, {outcome})")
        }
        ValueOrigin::Saved => "saved".into(),
        ValueOrigin::Working => "working copy".into(),
    }
}

fn choice_table(choice: &Choice) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Label", "Value", "Origin", ""]);
    for (idx, value) in choice.values.iter().enumerate() {
        let mut marks = Vec::new();
        if choice.accepted.as_deref() == Some(value.label.as_str()) {
            marks.push("accepted");
        }
        if choice.leaves.as_ref().is_some_and(|l| l.contains(&idx)) {
            marks.push("leaf");
        }
        if !value.is_usable() {
            marks.push("unusable");
        }
        table.add_row(vec![
            Cell::new(&value.label),
            Cell::new(describe_data(&value.data)),
            Cell::new(describe_origin(value)),
            Cell::new(marks.join(", ")),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

fn run_list(wc: &WorkingCopy) -> Result<()> {
    let mut tx = wc.begin().context("failed to open transaction")?;
    let items = tx.resolve_items().context("failed to list conflicts")?;
    tx.cancel();

    if items.is_empty() {
        println!("{}", style::success("No conflicts"));
        return Ok(());
    }

    println!("{}", style::header(&format!("Conflicts ({})", items.len())));
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Path", "Unresolved", "Resolved"]);
    for item in &items {
        table.add_row(vec![
            Cell::new(&item.path),
            Cell::new(join_axes(&item.unresolved)),
            Cell::new(join_axes(&item.resolved)),
        ]);
    }
    println!("{}", table);
    Ok(())
}

fn run_show(wc: &WorkingCopy, cwd: &Path, path: &Path) -> Result<()> {
    let mut tx = wc.begin().context("failed to open transaction")?;
    let alias = conflicted(&mut tx, wc, cwd, path)?;
    let item = tx.resolve_item(alias).context("failed to read conflict")?;
    tx.cancel();

    println!("{}", style::header(&item.path));
    println!("  Type   : {}", item.entry_type);
    println!("  GID    : {}", item.gid);
    println!("  Status : {}", style::status_labels(item.status_flags));
    if item.choices.is_empty() {
        println!();
        println!("{}", style::dim("No open choices."));
    }
    for choice in &item.choices {
        println!();
        let title = if choice.resolved {
            format!("{} (resolved)", choice.axis)
        } else {
            choice.axis.to_string()
        };
        println!("{}", style::header(&title));
        println!("{}", choice_table(choice));
    }
    Ok(())
}

fn run_accept(
    wc: &WorkingCopy,
    cwd: &Path,
    path: &Path,
    axis: &str,
    label: Option<&str>,
) -> Result<()> {
    let axis = parse_axis(axis)?;
    let mut tx = wc.begin().context("failed to open transaction")?;
    let alias = conflicted(&mut tx, wc, cwd, path)?;

    let label = match label {
        Some(l) => l.to_string(),
        None => {
            let item = tx.resolve_item(alias).context("failed to read conflict")?;
            let choice = item
                .choice(axis)
                .ok_or_else(|| anyhow::anyhow!("'{}' has no {} conflict", path.display(), axis))?;
            let usable: Vec<&ResolveValue> =
                choice.values.iter().filter(|v| v.is_usable()).collect();
            if usable.is_empty() {
                anyhow::bail!("no usable {axis} values for '{}'", path.display());
            }
            let options: Vec<String> = usable
                .iter()
                .map(|v| format!("{}  {}", v.label, style::dim(&describe_data(&v.data))))
                .collect();
            let picked = Select::new()
                .with_prompt(format!("Accept which {axis} for {}", item.path))
                .items(&options)
                .default(0)
                .interact()
                .context("no value selected")?;
            usable[picked].label.clone()
        }
    };

    tx.resolve_accept(alias, axis, &label)
        .with_context(|| format!("failed to accept '{label}'"))?;
    super::finish(tx)?;
    println!(
        "{}",
        style::success(&format!("Accepted {label} for {axis} of {}", path.display()))
    );
    Ok(())
}

fn run_merge(
    wc: &WorkingCopy,
    cwd: &Path,
    path: &Path,
    baseline: &str,
    other: &str,
    tool: Option<&str>,
) -> Result<()> {
    let mut tx = wc.begin().context("failed to open transaction")?;
    let alias = conflicted(&mut tx, wc, cwd, path)?;
    let label = tx
        .resolve_merge(alias, baseline, other, tool)
        .context("merge failed")?;

    let item = tx.resolve_item(alias).context("failed to read conflict")?;
    let usable = item
        .choice(ConflictAxis::Contents)
        .and_then(|c| c.value(&label))
        .is_some_and(|(_, v)| v.is_usable());
    super::finish(tx)?;

    if usable {
        println!("{}", style::success(&format!("Merged as '{label}'")));
        println!(
            "{}",
            style::dim(&format!(
                "accept it with: wcengine resolve accept {} contents {label}",
                path.display()
            ))
        );
    } else {
        println!(
            "{}",
            style::warn(&format!("Merge '{label}' did not produce a usable result"))
        );
    }
    Ok(())
}
