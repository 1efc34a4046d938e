use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "stc-cli")]
#[command(about = "Steal The Cats catalog command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Ingest one batch of images.
    FetchCats,
    /// Extract tags from breed temperaments.
    FetchTags,
    /// Link every image to every tag.
    Link,
    /// Ingest, extract and link in one run.
    Sync,
    /// Serve the HTTP API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stc_sync=info,stc_web=info,stc_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Migrate => {
            let config = stc_sync::SyncConfig::from_env();
            let pool =
                stc_storage::connect(&config.database_url, &stc_storage::PoolSettings::default())
                    .await?;
            stc_storage::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::FetchCats => {
            let pipeline = stc_sync::pipeline_from_env().await?;
            let inserted = pipeline.ingest_images().await?;
            println!("fetch-cats complete: inserted={inserted}");
        }
        Commands::FetchTags => {
            let pipeline = stc_sync::pipeline_from_env().await?;
            let inserted = pipeline.extract_tags().await?;
            println!("fetch-tags complete: inserted={inserted}");
        }
        Commands::Link => {
            let pipeline = stc_sync::pipeline_from_env().await?;
            let created = pipeline.link_all().await?;
            println!("link complete: created={created}");
        }
        Commands::Sync => {
            let pipeline = stc_sync::pipeline_from_env().await?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} images={} tags={} edges={} total_images={}",
                summary.run_id,
                summary.images_inserted,
                summary.tags_inserted,
                summary.edges_created,
                summary.total_images
            );
        }
        Commands::Serve => {
            let pipeline = stc_sync::pipeline_from_env().await?;
            let port = stc_web::port_from_env();
            info!(source = pipeline.source_id(), "starting server");
            stc_web::serve(stc_web::AppState::new(pipeline), port).await?;
        }
    }

    Ok(())
}
