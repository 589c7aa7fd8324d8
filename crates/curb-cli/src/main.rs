use anyhow::Result;
use clap::{Parser, Subcommand};
use curb_extract::ExtractParams;
use curb_web::{AppState, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "curb-cli")]
#[command(about = "Curbstone listing dataset builder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract one run's raw text listings into structured records.
    Extract {
        /// Run to process; defaults to the latest known run.
        #[arg(long)]
        run_id: Option<String>,
        /// Cap on files processed, 0 = unlimited.
        #[arg(long, default_value_t = 0)]
        max_files: usize,
        /// Rewrite records that already exist.
        #[arg(long)]
        overwrite: bool,
    },
    /// Consolidate all structured records into the master CSV.
    Materialize,
    /// Run the HTTP trigger service.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Extract {
            run_id,
            max_files,
            overwrite,
        } => {
            let config = Config::from_env()?;
            let state = AppState::from_config(&config);
            let report = state
                .extract_job()
                .run(&ExtractParams {
                    run_id,
                    max_files,
                    overwrite,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Materialize => {
            let config = Config::from_env()?;
            let state = AppState::from_config(&config);
            let report = state.materialize_job().run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve => {
            curb_web::serve_from_env().await?;
        }
    }

    Ok(())
}
