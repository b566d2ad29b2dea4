use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod daemon;

#[derive(Parser)]
#[command(name = "vbr-monitor")]
#[command(author, version, about = "Polling monitor for Veeam Backup & Replication job states")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the polling daemon
    Daemon {
        /// Also send logs to the systemd journal
        #[arg(long)]
        journald: bool,
    },

    /// Poll every configured server once and show job states
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Only query this server
        #[arg(long)]
        server: Option<String>,

        /// Only show this job (id, or name for jobs without an id)
        #[arg(long)]
        job: Option<String>,
    },

    /// Trigger a daemon refresh via D-Bus
    Refresh {
        /// Re-read the config file instead of polling
        #[arg(long)]
        reload: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(json: bool, journald: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let journald_layer = if journald {
        match tracing_journald::layer() {
            Ok(layer) => Some(layer),
            Err(e) => {
                eprintln!("journald unavailable, logging to stderr only: {e}");
                None
            }
        }
    } else {
        None
    };

    let (json_layer, text_layer) = if json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(journald_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { journald } => {
            init_logging(cli.json_logs, journald);
            daemon::run().await
        }
        Commands::Status { json, server, job } => {
            init_logging(cli.json_logs, false);
            cli::status::run(json, server, job).await
        }
        Commands::Refresh { reload } => {
            init_logging(cli.json_logs, false);
            cli::refresh::run(reload).await
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}
