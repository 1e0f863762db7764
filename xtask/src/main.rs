use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build,
    /// Run the test suite
    Test,
    /// Cross-build the daemon for an ARM board
    Cross {
        /// Rust target triple
        #[arg(long, default_value = "armv7-unknown-linux-gnueabihf")]
        target: String,
    },
}

fn cargo(args: &[&str]) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("cargo {} failed", args.join(" "));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building workspace...");
            cargo(&["build", "--workspace"])?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"])?;
        }
        Commands::Cross { target } => {
            println!("Building uuc for {target}...");
            cargo(&["build", "--release", "-p", "uuc-cli", "--target", target])?;
        }
    }

    Ok(())
}
