use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "filesmith",
    about = "Safe, token-efficient file editing for AI assistants",
    version
)]
pub struct Cli {
    /// Path to a config file (default: .filesmith/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Restrict operations to these paths (repeatable; overrides config)
    #[arg(long = "allow", global = true)]
    pub allowed: Vec<PathBuf>,

    /// Emit JSON instead of a human summary
    #[arg(long, global = true)]
    pub json: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Search file names and contents with positions
    Search {
        path: PathBuf,
        pattern: String,
        /// Also search file contents
        #[arg(long)]
        content: bool,
        /// Only files with these extensions (repeatable)
        #[arg(long = "file-type")]
        file_types: Vec<String>,
    },

    /// Text search with case, whole-word, and context options
    Grep {
        path: PathBuf,
        pattern: String,
        /// Case-insensitive matching
        #[arg(short = 'i', long)]
        ignore_case: bool,
        /// Match whole words only
        #[arg(short = 'w', long)]
        whole_word: bool,
        /// Show N context lines around each match
        #[arg(short = 'C', long, value_name = "N")]
        context: Option<usize>,
    },

    /// Count literal occurrences of a pattern
    Count {
        path: PathBuf,
        pattern: String,
        /// Also list 1-based line numbers per file
        #[arg(long)]
        lines: bool,
    },

    /// Replace text in one file with intelligent matching
    Edit {
        path: PathBuf,
        old_text: String,
        new_text: String,
        /// Override the high/critical risk gate
        #[arg(long)]
        force: bool,
    },

    /// Apply an ordered list of edits to one file
    MultiEdit {
        path: PathBuf,
        /// JSON array of {"old_text", "new_text"} pairs, or '-' for stdin
        edits: String,
    },

    /// Replace the nth occurrence of a pattern (negative = from the end)
    ReplaceNth {
        path: PathBuf,
        pattern: String,
        replacement: String,
        #[arg(allow_hyphen_values = true)]
        occurrence: i64,
    },

    /// Apply a regex pattern list to one file
    Transform {
        path: PathBuf,
        /// JSON array of pattern specs, or '-' for stdin
        patterns: String,
        #[arg(long, value_enum, default_value_t = ModeArg::Sequential)]
        mode: ModeArg,
        /// Count replacements without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a multi-step pipeline plan
    Pipeline {
        /// Plan JSON file, or '-' for stdin
        plan: String,
        /// Preview without mutating
        #[arg(long)]
        dry_run: bool,
        /// Override risk and file-count gates
        #[arg(long)]
        force: bool,
    },

    /// Backup store operations
    #[command(subcommand)]
    Backup(BackupCommands),

    /// Dry-run impact analysis (never mutates)
    #[command(subcommand)]
    Analyze(AnalyzeCommands),
}

#[derive(Debug, Subcommand)]
pub enum BackupCommands {
    /// Snapshot files into a new backup record
    Create {
        paths: Vec<PathBuf>,
        /// Free-form description stored with the record
        #[arg(long, default_value = "")]
        context: String,
    },

    /// List backups, newest first
    List {
        #[arg(long)]
        limit: Option<usize>,
        /// Only records with this operation tag
        #[arg(long)]
        operation: Option<String>,
        /// Only records touching paths containing this substring
        #[arg(long)]
        path_contains: Option<String>,
        /// Only records newer than this many hours
        #[arg(long)]
        hours: Option<u64>,
    },

    /// Restore a backup ('latest' and id prefixes work)
    Restore {
        backup_id: String,
        /// Restore only this file from the record
        #[arg(long)]
        file: Option<PathBuf>,
        /// Snapshot current state before overwriting it
        #[arg(long)]
        pre_backup: bool,
    },

    /// Diff a backed-up file against its current state
    Compare { backup_id: String, path: PathBuf },

    /// Delete backups older than a cutoff
    Cleanup {
        /// Age cutoff in days (default: configured retention)
        #[arg(long)]
        days: Option<u64>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum AnalyzeCommands {
    /// Impact of a find/replace
    Edit {
        path: PathBuf,
        old_text: String,
        new_text: String,
    },

    /// Impact of overwriting the file with new content
    Write {
        path: PathBuf,
        /// File holding the new content, or '-' for stdin
        content: String,
    },

    /// Impact of deleting the file
    Delete { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Sequential,
    Parallel,
}

impl From<ModeArg> for filesmith_core::TransformMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Sequential => Self::Sequential,
            ModeArg::Parallel => Self::Parallel,
        }
    }
}
