use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "versionfs")]
#[command(about = "Workspace versioning and recorded-run engine", long_about = None)]
pub struct Cli {
    /// Output results in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Path to a JSON config file (defaults to a tree under the system temp
    /// directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a tale around an existing workspace directory
    CreateTale {
        /// Display title
        #[arg(short, long)]
        title: String,

        /// Workspace directory (created if missing)
        #[arg(short, long)]
        workspace: PathBuf,

        /// Creator user id
        #[arg(short, long, default_value = "local")]
        creator: String,
    },

    /// List all tales
    ListTales,

    /// Remove a tale, its versions and its runs
    RemoveTale {
        /// Tale id
        tale: String,
    },

    /// Snapshot a tale's workspace into a new version
    CreateVersion {
        /// Tale id
        tale: String,

        /// Version name (generated from the current time if omitted)
        #[arg(short, long)]
        name: Option<String>,

        /// Create even if nothing changed since the last version
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Suffix the name instead of failing when it is taken
        #[arg(long, default_value_t = false)]
        allow_rename: bool,
    },

    /// List a tale's versions
    ListVersions {
        /// Tale id
        tale: String,

        #[arg(long, default_value_t = 0)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Rename a version
    RenameVersion {
        /// Version id
        version: String,

        /// New name
        name: String,

        #[arg(long, default_value_t = false)]
        allow_rename: bool,
    },

    /// Delete a version (fails while runs reference it)
    DeleteVersion {
        /// Version id
        version: String,
    },

    /// Print the dataset recorded in a version's manifest
    VersionDataset {
        /// Version id
        version: String,
    },

    /// Restore a tale's workspace and metadata from a version
    Restore {
        /// Tale id
        tale: String,

        /// Version id
        version: String,
    },

    /// Create a run from a version
    CreateRun {
        /// Version id
        version: String,

        /// Run name (generated from the current time if omitted)
        #[arg(short, long)]
        name: Option<String>,

        #[arg(long, default_value_t = false)]
        allow_rename: bool,
    },

    /// List a tale's runs
    ListRuns {
        /// Tale id
        tale: String,
    },

    /// Print a run's status
    RunStatus {
        /// Run id
        run: String,
    },

    /// Set a run's status code (0..=5)
    SetRunStatus {
        /// Run id
        run: String,

        /// Status code
        status: i32,
    },

    /// Dispatch the recorded-run job for a run
    StartRun {
        /// Run id
        run: String,

        /// Entrypoint script (defaults to run.sh)
        #[arg(short, long)]
        entrypoint: Option<String>,
    },

    /// Delete a run
    DeleteRun {
        /// Run id
        run: String,
    },

    /// Copy one tale's versions and runs into another
    Fork {
        /// Source tale id
        source: String,

        /// Destination tale id
        destination: String,

        /// Restrict to one version and restore it in the destination
        #[arg(short, long)]
        version: Option<String>,

        /// Copy only the given version (requires --version)
        #[arg(long, default_value_t = false)]
        shallow: bool,
    },

    /// Run one heartbeat sweep over live runs
    Reap,

    /// Print recent engine operations
    Audit {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}
