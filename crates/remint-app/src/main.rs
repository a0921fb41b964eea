use std::process;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::{filter::LevelFilter, fmt};

use remint_app::{AppError, config, server};

/// Top-level CLI entry point.
#[derive(Default, Debug, Parser)]
#[command(
    name = "remint",
    version,
    author,
    about = "Remint image regeneration service"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the Remint HTTP server.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct ServeArgs;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(determine_log_level(&cli));

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(_)) => {
            let config = config::load()?;
            server::serve(config).await?;
        }
        None => {
            Cli::print_help();
        }
    }

    Ok(())
}
