use clap::{Parser, Subcommand};

mod commands;

use commands::CliError;

#[derive(Parser)]
#[command(name = "ssx")]
#[command(about = "Mirror a payments provider's entity catalog into Postgres", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the schema migrations
    Migrate {
        #[arg(long)]
        database_url: Option<String>,
    },

    /// Backfill one object kind, or "all"
    Backfill {
        /// Object kind (e.g. product, charge) or "all"
        object: String,

        #[arg(long)]
        database_url: Option<String>,

        #[arg(long)]
        stripe_key: Option<String>,
    },

    /// Run event ingestion: live stream by default, HTTP ingress behind a
    /// tunnel when one is configured
    Start {
        #[arg(long)]
        database_url: Option<String>,

        #[arg(long)]
        stripe_key: Option<String>,

        /// Tunnel auth token (provisioning itself happens outside this tool)
        #[arg(long)]
        ngrok_token: Option<String>,

        /// Public url the tunnel exposes; managed webhook target
        #[arg(long)]
        public_url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli.cmd {
        Commands::Migrate { database_url } => commands::migrate::run(database_url.as_deref()).await,
        Commands::Backfill {
            object,
            database_url,
            stripe_key,
        } => commands::backfill::run(&object, database_url.as_deref(), stripe_key.as_deref()).await,
        Commands::Start {
            database_url,
            stripe_key,
            ngrok_token,
            public_url,
        } => {
            commands::start::run(
                database_url.as_deref(),
                stripe_key.as_deref(),
                ngrok_token.as_deref(),
                public_url.as_deref(),
            )
            .await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
