use anyhow::{Context, Result};
use blt_core::session::{BltSession, SessionConfig};
use blt_core::{NullObserver, version};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development tasks for the BLT workspace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build {
        /// Include the SocketCAN driver
        #[arg(long)]
        socketcan: bool,
    },
    /// Run all tests
    Test,
    /// Run clippy with warnings denied
    Clippy,
    /// Validate a session configuration file without touching the target
    CheckConfig {
        path: PathBuf,
        /// Write a default configuration to `path` instead
        #[arg(long)]
        write_default: bool,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    println!("{what}...");
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn check_config(path: &PathBuf, write_default: bool) -> Result<()> {
    if write_default {
        SessionConfig::default().save_to_file(path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = SessionConfig::load_from_file(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut session = BltSession::with_observer(Arc::new(NullObserver));
    session
        .init_from_config(&config)
        .with_context(|| format!("{} is not a usable configuration", path.display()))?;
    println!(
        "{}: {} over {} (library {})",
        path.display(),
        config.session,
        config.transport,
        version::string()
    );
    session.terminate();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build { socketcan } => {
            let mut args = vec!["build", "--workspace"];
            if *socketcan {
                args.extend(["--features", "blt-core/socketcan"]);
            }
            cargo(&args, "Building workspace")?;
        }
        Commands::Test => cargo(&["test", "--workspace"], "Running tests")?,
        Commands::Clippy => cargo(
            &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
            "Running clippy",
        )?,
        Commands::CheckConfig {
            path,
            write_default,
        } => check_config(path, *write_default)?,
    }

    Ok(())
}
