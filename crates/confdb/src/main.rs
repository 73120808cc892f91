#![warn(unused, missing_docs)]
//!
//! confdb is an in-memory hierarchical configuration database with snapshot
//! backup and restore.
//!
//! The database mirrors configuration trees as typed instances of registered
//! object classes. A backup document captures the schema and the instances;
//! the reconciliation engine can verify a running database against such a
//! document and converge it back onto one, honouring inter-object
//! dependencies, unit commit boundaries and bounded retry on transient
//! misses.

use std::fs;
use std::io::BufReader;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use confdb_backup::ops::{self, BackupOp, BackupRequest};
use confdb_backup::{document, EngineSettings, NoAgents};
use confdb_store::Database;
use confdb_types::Oid;

/// Configuration type definitions.
pub mod config;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(about, version)]
struct Opts {
    /// Path to the configuration file
    #[arg(short, long, default_value = "confdb.toml")]
    config: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct Target {
    /// The backup document to operate on
    file: PathBuf,
    /// Restrict the operation to a subtree (repeatable)
    #[arg(long = "subtree", value_name = "OID")]
    subtrees: Vec<Oid>,
    /// Read additional subtrees from a filter document
    #[arg(long, value_name = "FILE")]
    filters: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Snapshot the database into a backup document.
    Backup {
        #[command(flatten)]
        target: Target,
    },
    /// Compare the database against a backup document.
    Verify {
        #[command(flatten)]
        target: Target,
    },
    /// Reconcile the database onto a backup document.
    Restore {
        #[command(flatten)]
        target: Target,
    },
    /// Verify and, on divergence, restore and verify again.
    Ensure {
        #[command(flatten)]
        target: Target,
    },
}

impl Command {
    fn op(&self) -> BackupOp {
        match self {
            Command::Backup { .. } => BackupOp::Create,
            Command::Verify { .. } => BackupOp::Verify,
            Command::Restore { .. } => BackupOp::RestoreNoHistory,
            Command::Ensure { .. } => BackupOp::VerifyAndRestore,
        }
    }

    fn target(&self) -> &Target {
        match self {
            Command::Backup { target }
            | Command::Verify { target }
            | Command::Restore { target }
            | Command::Ensure { target } => target,
        }
    }

    fn mutates(&self) -> bool {
        matches!(self, Command::Restore { .. } | Command::Ensure { .. })
    }
}

fn run() -> Result<(), anyhow::Error> {
    let opts = Opts::parse();

    let contents = fs::read_to_string(&opts.config)?;
    let config: Config = toml::from_str(contents.as_str())?;
    let settings: EngineSettings = config.engine.clone().into();

    let mut db = Database::new();
    let mut sync = NoAgents;
    if config.general.bootstrap.exists() {
        tracing::info!(
            file = %config.general.bootstrap.display(),
            "seeding the database"
        );
        ops::process(
            &mut db,
            &mut sync,
            &settings,
            &BackupRequest::new(BackupOp::RestoreNoHistory, &config.general.bootstrap),
        )?;
    } else {
        tracing::info!("no bootstrap document, starting empty");
    }

    let target = opts.command.target();
    let mut subtrees = target.subtrees.clone();
    if let Some(filters) = &target.filters {
        let file = fs::File::open(filters)?;
        subtrees.extend(document::read_filters(BufReader::new(file))?);
    }

    let request = BackupRequest {
        op: opts.command.op(),
        filename: target.file.clone(),
        subtrees,
    };
    ops::process(&mut db, &mut sync, &settings, &request)?;

    if opts.command.mutates() {
        tracing::info!(
            file = %config.general.bootstrap.display(),
            "persisting the reconciled state"
        );
        ops::process(
            &mut db,
            &mut sync,
            &settings,
            &BackupRequest::new(BackupOp::Create, &config.general.bootstrap),
        )?;
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .compact()
        .init();

    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
