use anyhow::anyhow;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use git_backup::upload::Uploader;
use git_backup::{BackupEngine, BackupError, BackupOptions, Config, FailurePolicy, ProviderOptions};

const COMMIT_HASH: Option<&str> = option_env!("GIT_BACKUP_COMMIT");
const BUILD_TIMESTAMP: Option<&str> = option_env!("GIT_BACKUP_BUILD_TIME");

#[derive(Parser)]
#[command(name = "git-backup")]
#[command(about = "Back up every repository of your git hosting accounts")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Configuration file path (defaults to ./git-backup.yml, then the XDG config location)
    #[arg(short, long)]
    config_file: Option<PathBuf>,

    /// Target path of the backup folder
    #[arg(short, long, default_value = "backup")]
    backup_path: String,

    /// Fail at the end of backing up repositories, rather than right away
    #[arg(long)]
    fail_at_end: bool,

    /// Make bare clones without checking out the main branch
    #[arg(long)]
    bare_clone: bool,

    /// Disable verification of SSL/TLS certificates
    #[arg(long)]
    insecure: bool,

    /// Number of repositories cloned at the same time
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    jobs: u16,

    /// Timeout in seconds for each git operation
    #[arg(long, default_value_t = 3600)]
    git_timeout: u64,

    /// Upload the finished backup to the container in the config's `upload` section
    #[arg(long)]
    upload: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Show the version number and exit
    #[arg(long)]
    version: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        print_version();
        return ExitCode::SUCCESS;
    }

    init_logging(cli.verbose);
    info!("Starting git-backup v{}", env!("CARGO_PKG_VERSION"));

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn print_version() {
    println!(
        "git-backup, version {} ({}-{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    println!(
        "Built {} ({})",
        COMMIT_HASH.unwrap_or("n/a"),
        BUILD_TIMESTAMP.unwrap_or("n/a")
    );
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Load the config, back up every source, then optionally upload.
///
/// This is the only place a run's outcome is turned into an exit code.
async fn run(cli: &Cli) -> Result<(), BackupError> {
    let config_path = Config::locate(cli.config_file.as_deref());
    let config = load_config(&config_path)?;

    if cli.insecure {
        warn!("TLS certificate verification is disabled");
    }

    let provider_options = ProviderOptions {
        insecure: cli.insecure,
        git_timeout: Duration::from_secs(cli.git_timeout),
    };
    let sources = config
        .sources(&provider_options)
        .map_err(BackupError::Config)?;

    let root = shellexpand::full(&cli.backup_path)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| BackupError::Config(anyhow!("Failed to expand backup path: {}", e)))?;

    let engine = BackupEngine::new(BackupOptions {
        root: root.clone(),
        policy: FailurePolicy::from_fail_at_end(cli.fail_at_end),
        bare: cli.bare_clone,
        jobs: usize::from(cli.jobs),
    });

    let report = engine.run(&sources).await;
    report.result?;

    if cli.upload {
        upload_backup(&config, &root, cli.insecure).await;
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config, BackupError> {
    if !path.exists() {
        return Err(BackupError::ConfigMissing(path.to_path_buf()));
    }

    info!("Using config file {}", path.display());
    Config::load(path).map_err(BackupError::Config)
}

/// Best effort: a failed upload is logged but leaves the backup outcome alone.
async fn upload_backup(config: &Config, root: &Path, insecure: bool) {
    let Some(upload) = &config.upload else {
        warn!("--upload given but the config has no `upload` section, skipping");
        return;
    };

    let result = match Uploader::new(upload, insecure) {
        Ok(uploader) => uploader.upload_dir(root).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("Failed to upload backup: {:#}", e);
    }
}
