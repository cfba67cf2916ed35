//! Slotwarden - offline inspection of ledgers and configuration.
//!
//! Sessions are started through the library with a page factory; this binary
//! only reads what they leave behind.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use slotwarden::ledger::{render_report, LedgerStore};
use slotwarden::{AccountStatus, BotConfig, SlotError, StatusLedger};

#[derive(Parser)]
#[command(name = "slotwarden")]
#[command(version)]
#[command(about = "Inspect booking session ledgers and configuration", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Working directory holding settings.json (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".", env = "SLOTWARDEN_DIR")]
    dir: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the ledger report for one account, or a summary of all accounts
    Report {
        /// Account identity; omit to list every account
        identity: Option<String>,
    },

    /// List configured locations
    Locations,

    /// Validate settings.json
    CheckConfig,
}

fn status_label(status: AccountStatus) -> colored::ColoredString {
    let text = status.as_str();
    if status.is_success() {
        text.green().bold()
    } else if status.is_failure() {
        text.red()
    } else {
        text.yellow()
    }
}

fn run(cli: Cli) -> slotwarden::Result<()> {
    let config = BotConfig::load(&cli.dir)?;
    let results_dir = config.results_dir_in(&cli.dir);

    match cli.command {
        Commands::Report { identity } => {
            let store = LedgerStore::new(&results_dir);
            if !store.exists() {
                println!(
                    "{} No ledger at {}",
                    "Info:".blue(),
                    store.ledger_file_path().display()
                );
                return Ok(());
            }
            let ledger = StatusLedger::open(&results_dir)?;

            match identity {
                Some(identity) => println!("{}", ledger.report(&identity)?),
                None => {
                    let snapshot = ledger.snapshot()?;
                    println!("{} {} accounts", "Ledger:".bold(), snapshot.len());
                    for (identity, record) in &snapshot {
                        println!(
                            "  {:<32} {:<18} attempts={:<4} updated={}",
                            identity,
                            status_label(record.status),
                            record.total_attempts,
                            record.last_updated.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                    if cli.verbose {
                        for (identity, record) in &snapshot {
                            println!("\n{}", render_report(identity, record));
                        }
                    }
                }
            }
        }

        Commands::Locations => {
            for (code, location) in &config.locations {
                println!("{:<6} {:<20} {}", code.bold(), location.name, location.url);
                if let Some(booking_url) = &location.booking_url {
                    println!("{:<6} {:<20} {}", "", "booking form", booking_url.dimmed());
                }
            }
        }

        Commands::CheckConfig => {
            let problems = config.validate();
            if problems.is_empty() {
                println!(
                    "{} {} is valid ({} locations)",
                    "OK".green().bold(),
                    BotConfig::settings_path(&cli.dir).display(),
                    config.locations.len()
                );
            } else {
                for problem in &problems {
                    eprintln!("  {} {}", "-".red(), problem);
                }
                return Err(SlotError::InvalidConfig {
                    field: "settings.json".to_string(),
                    reason: format!("{} problems found", problems.len()),
                });
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "slotwarden=debug,info"
    } else {
        "slotwarden=info,warn"
    };

    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    if !cli.dir.exists() {
        eprintln!(
            "{} Directory does not exist: {}",
            "Error:".red().bold(),
            cli.dir.display()
        );
        std::process::exit(1);
    }

    if let Err(e) = run(cli) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(e.exit_code());
    }

    Ok(())
}
