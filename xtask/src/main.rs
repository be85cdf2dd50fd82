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
    /// Run every test in the workspace
    Test,
    /// Run the CLI against the simulated bootloader
    Simulate {
        #[arg(long)]
        firmware: String,
        #[arg(long)]
        init: String,
        #[arg(long, default_value = "secure")]
        dialect: String,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building workspace...");
            cargo(&["build", "--workspace"], "Build")?;
        }
        Commands::Test => {
            println!("Testing workspace...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::Simulate {
            firmware,
            init,
            dialect,
        } => {
            println!("Running simulated {dialect} transfer...");
            cargo(
                &[
                    "run",
                    "-p",
                    "dfu-cli",
                    "--",
                    "simulate",
                    "--firmware",
                    firmware,
                    "--init",
                    init,
                    "--dialect",
                    dialect,
                ],
                "Simulation",
            )?;
        }
    }

    Ok(())
}
