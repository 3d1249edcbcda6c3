use anyhow::Result;
use clap::{Parser, Subcommand};
use espec_core::SearchParams;
use espec_pipeline::{ListingSearchPipeline, PipelineConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "espec-cli")]
#[command(about = "ESpec import listing search")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP search endpoint.
    Serve,
    /// Run one search and print the JSON response.
    Search {
        q: String,
        #[arg(long, default_value = "now")]
        eligible: String,
        #[arg(long)]
        soon_months: Option<u32>,
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("espec=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => espec_web::serve_from_env().await?,
        Commands::Search {
            q,
            eligible,
            soon_months,
            limit,
        } => {
            let pipeline = ListingSearchPipeline::from_config(&PipelineConfig::from_env())?;
            let params = SearchParams {
                q: Some(q),
                eligible: Some(eligible),
                soon_months: soon_months.map(|v| v.to_string()),
                limit: limit.map(|v| v.to_string()),
            };
            let response = pipeline.search(&params).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}
