//! wcengine command-line tool.
//!
//! Provides subcommands for creating a working copy, inspecting its status,
//! making structural changes, committing the baseline, and resolving merge
//! conflicts item by item.

mod resolve;
mod style;

use std::path::{Component, Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use wcengine_core::config::META_DIR_NAME;
use wcengine_core::models::Alias;
use wcengine_core::{StatusOptions, Transaction, WcConfig, WorkingCopy};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// wcengine command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "wcengine",
    version,
    about = "Inspect and change a version-controlled working copy"
)]
struct Cli {
    /// Directory inside the working copy.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Turn a directory into an empty working copy.
    Init {
        /// Directory to initialize.
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Show changed, uncontrolled and conflicted items.
    Status {
        /// List unchanged and ignored items too.
        #[arg(short, long)]
        all: bool,

        /// Report ignored items as found.
        #[arg(long)]
        no_ignores: bool,

        /// Print entries as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Put uncontrolled items under version control.
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Add only the named items, not their contents.
        #[arg(long)]
        no_recursive: bool,
    },

    /// Remove items from version control.
    Remove {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Leave the files on disk as uncontrolled items.
        #[arg(long)]
        keep: bool,
    },

    /// Move items into another directory.
    Move {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Destination directory.
        dest: PathBuf,
    },

    /// Rename an item in place.
    Rename {
        path: PathBuf,

        /// New entry name.
        name: String,
    },

    /// Record the working copy as the new baseline.
    Commit,

    /// Resolve merge conflicts.
    Resolve {
        #[command(subcommand)]
        action: resolve::ResolveAction,
    },

    /// Inspect the working copy configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Validate a configuration file.
    Validate {
        /// File to validate; defaults to the working copy's own.
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(configured_log_level(&cli.dir)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { path } => cmd_init(&cli.dir.join(path)),
        Commands::Config {
            action: ConfigAction::Validate { file },
        } => cmd_validate(&cli.dir, file.as_deref()),
        command => {
            let wc = open_working_copy(&cli.dir)?;
            let cwd = absolute(&cli.dir)?;
            match command {
                Commands::Status {
                    all,
                    no_ignores,
                    json,
                } => cmd_status(&wc, all, no_ignores, json),
                Commands::Add {
                    paths,
                    no_recursive,
                } => cmd_add(&wc, &cwd, &paths, !no_recursive),
                Commands::Remove { paths, keep } => cmd_remove(&wc, &cwd, &paths, keep),
                Commands::Move { paths, dest } => cmd_move(&wc, &cwd, &paths, &dest),
                Commands::Rename { path, name } => cmd_rename(&wc, &cwd, &path, &name),
                Commands::Commit => cmd_commit(&wc),
                Commands::Resolve { action } => resolve::run(&wc, &cwd, action),
                Commands::Init { .. } | Commands::Config { .. } => unreachable!(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Working copy helpers
// ---------------------------------------------------------------------------

/// The `[logging] level` of the enclosing working copy, or `warn`.
fn configured_log_level(dir: &Path) -> String {
    let Ok(start) = absolute(dir) else {
        return "warn".into();
    };
    start
        .ancestors()
        .map(|d| d.join(META_DIR_NAME).join("config.toml"))
        .find(|p| p.exists())
        .and_then(|p| WcConfig::load_from_file(p).ok())
        .map(|c| c.logging.level)
        .unwrap_or_else(|| "warn".into())
}

fn open_working_copy(dir: &Path) -> Result<WorkingCopy> {
    let start = absolute(dir)?;
    let wc = WorkingCopy::discover(&start)
        .with_context(|| format!("no working copy at or above {}", start.display()))?;
    debug!(root = %wc.root().display(), "opened working copy");
    Ok(wc)
}

/// Make `path` absolute and drop `.` and `..` components without touching
/// the filesystem, so paths of deleted or lost items still resolve.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("failed to read current directory")?
            .join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Forward-slash path of `arg` relative to the working copy root.
pub(crate) fn wc_relative(wc: &WorkingCopy, cwd: &Path, arg: &Path) -> Result<String> {
    let abs = absolute(&cwd.join(arg))?;
    let root = absolute(wc.root())?;
    let rel = abs
        .strip_prefix(&root)
        .with_context(|| format!("{} is outside the working copy", arg.display()))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn lookup(tx: &mut Transaction<'_>, wc: &WorkingCopy, cwd: &Path, arg: &Path) -> Result<Alias> {
    let rel = wc_relative(wc, cwd, arg)?;
    tx.lookup_path(&rel)
        .with_context(|| format!("failed to look up {rel}"))?
        .ok_or_else(|| anyhow::anyhow!("'{}' not found in the working copy", arg.display()))
}

fn finish(tx: Transaction<'_>) -> Result<()> {
    let summary = tx.apply().context("failed to apply changes")?;
    println!(
        "{}",
        style::dim(&format!(
            "{} filesystem op(s), {} row op(s)",
            summary.filesystem_ops, summary.row_ops
        ))
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(path: &Path) -> Result<()> {
    let path = absolute(path)?;
    std::fs::create_dir_all(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    // A user-level config, if present, seeds every new working copy.
    let template = dirs::config_dir().map(|d| d.join("wcengine").join("config.toml"));
    let config = match template {
        Some(ref file) if file.exists() => WcConfig::load_from_file(file)
            .with_context(|| format!("failed to load {}", file.display()))?,
        _ => WcConfig::default(),
    };

    WorkingCopy::init(&path, config).context("failed to initialize working copy")?;

    println!(
        "{}",
        style::success(&format!("Initialized working copy in {}", path.display()))
    );
    if let Some(file) = template.filter(|f| f.exists()) {
        println!("{}", style::dim(&format!("configuration from {}", file.display())));
    }
    Ok(())
}

fn cmd_validate(dir: &Path, file: Option<&Path>) -> Result<()> {
    let path = match file {
        Some(f) => absolute(f)?,
        None => open_working_copy(dir)?
            .meta_dir()
            .join("config.toml"),
    };
    println!("Validating configuration: {}", path.display());
    println!();

    let config = WcConfig::load_from_file(&path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => println!("  [OK] All fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!(
        "  Reserved names : {}",
        config.working_copy.reserved_names.join(", ")
    );
    println!(
        "  Case collisions: {}",
        if config.working_copy.case_insensitive_collisions {
            "case-insensitive"
        } else {
            "exact"
        }
    );
    println!("  Ignore patterns: {}", config.status.ignores.len());
    println!("  Default tool   : {}", config.merge.default_tool);
    println!("  External tools : {}", config.merge.tools.len());
    println!("  Log level      : {}", config.logging.level);
    println!();
    println!("Configuration is valid.");
    Ok(())
}

fn cmd_status(wc: &WorkingCopy, all: bool, no_ignores: bool, json: bool) -> Result<()> {
    let mut tx = wc.begin().context("failed to open transaction")?;
    let entries = tx
        .status_all(StatusOptions {
            no_ignores,
            list_all: all,
        })
        .context("failed to compute status")?;
    tx.cancel();

    if json {
        let out: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "path": entry.path.to_string_lossy(),
                    "flags": entry.flags.bits(),
                    "labels": entry.flags.labels(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("{}", style::success("Working copy is clean"));
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Path", "Status"]);
    for entry in &entries {
        table.add_row(vec![
            Cell::new(entry.path.display()),
            Cell::new(style::status_labels(entry.flags)),
        ]);
    }
    println!("{}", table);
    println!("{} item(s) shown", entries.len());
    Ok(())
}

fn cmd_add(wc: &WorkingCopy, cwd: &Path, paths: &[PathBuf], recursive: bool) -> Result<()> {
    let mut tx = wc.begin().context("failed to open transaction")?;
    let mut added = 0;
    for path in paths {
        let alias = lookup(&mut tx, wc, cwd, path)?;
        added += tx
            .add(alias, recursive)
            .with_context(|| format!("failed to add {}", path.display()))?;
    }
    finish(tx)?;
    println!("{}", style::success(&format!("Added {added} item(s)")));
    Ok(())
}

fn cmd_remove(wc: &WorkingCopy, cwd: &Path, paths: &[PathBuf], keep: bool) -> Result<()> {
    let mut tx = wc.begin().context("failed to open transaction")?;
    for path in paths {
        let alias = lookup(&mut tx, wc, cwd, path)?;
        tx.remove(alias, keep)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    finish(tx)?;
    println!("{}", style::success(&format!("Removed {} item(s)", paths.len())));
    Ok(())
}

fn cmd_move(wc: &WorkingCopy, cwd: &Path, paths: &[PathBuf], dest: &Path) -> Result<()> {
    let mut tx = wc.begin().context("failed to open transaction")?;
    let target = lookup(&mut tx, wc, cwd, dest)?;
    for path in paths {
        let alias = lookup(&mut tx, wc, cwd, path)?;
        tx.move_item(alias, target)
            .with_context(|| format!("failed to move {}", path.display()))?;
    }
    finish(tx)?;
    println!(
        "{}",
        style::success(&format!("Moved {} item(s) to {}", paths.len(), dest.display()))
    );
    Ok(())
}

fn cmd_rename(wc: &WorkingCopy, cwd: &Path, path: &Path, name: &str) -> Result<()> {
    let mut tx = wc.begin().context("failed to open transaction")?;
    let alias = lookup(&mut tx, wc, cwd, path)?;
    tx.rename(alias, name)
        .with_context(|| format!("failed to rename {}", path.display()))?;
    finish(tx)?;
    println!(
        "{}",
        style::success(&format!("Renamed {} to {}", path.display(), name))
    );
    Ok(())
}

fn cmd_commit(wc: &WorkingCopy) -> Result<()> {
    let mut tx = wc.begin().context("failed to open transaction")?;
    let summary = tx.commit_baseline().context("failed to commit")?;
    finish(tx)?;
    println!(
        "{}",
        style::success(&format!(
            "Committed {} row(s), root {}",
            summary.rows,
            &summary.root_hash[..12.min(summary.root_hash.len())]
        ))
    );
    Ok(())
}
