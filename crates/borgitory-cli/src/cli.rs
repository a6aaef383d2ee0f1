use std::path::PathBuf;

use clap::Parser;

fn default_max_concurrent_operations() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(16)
}

#[derive(Debug, Clone, Parser)]
#[command(name = "borgitory-demo", version, about = "Borgitory job execution core demo")]
pub struct Cli {
    /// Path to the Borg repository (must already exist; `borg init` it first).
    #[arg(long, env = "BORGITORY_REPO")]
    pub repo: PathBuf,

    /// Directory to back up.
    #[arg(long, env = "BORGITORY_SOURCE")]
    pub source: PathBuf,

    /// Repository passphrase.
    #[arg(long, env = "BORGITORY_PASSPHRASE", default_value = "")]
    pub passphrase: String,

    /// Compression algorithm passed to `borg create --compression`.
    #[arg(long, env = "BORGITORY_COMPRESSION", default_value = "zstd")]
    pub compression: String,

    /// Skip the prune step after backup.
    #[arg(long, default_value_t = false)]
    pub no_prune: bool,

    /// Skip the consistency check step after prune.
    #[arg(long, default_value_t = false)]
    pub no_check: bool,

    /// Number of most recent daily archives to keep when pruning.
    #[arg(long, env = "BORGITORY_KEEP_DAILY", default_value_t = 7)]
    pub keep_daily: u32,

    /// Number of most recent weekly archives to keep when pruning.
    #[arg(long, env = "BORGITORY_KEEP_WEEKLY", default_value_t = 4)]
    pub keep_weekly: u32,

    /// Max concurrently-running backup jobs.
    #[arg(long, env = "BORGITORY_MAX_CONCURRENT_BACKUPS", default_value_t = 2)]
    pub max_concurrent_backups: usize,

    /// Max concurrently-running non-backup jobs (prune/check/cloud-sync).
    #[arg(
        long,
        env = "BORGITORY_MAX_CONCURRENT_OPERATIONS",
        default_value_t = default_max_concurrent_operations()
    )]
    pub max_concurrent_operations: usize,

    #[arg(long, env = "BORGITORY_NO_TUI", default_value_t = false)]
    pub no_tui: bool,
}
