//! vvquest - Command-line front end for the image search engine

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vvquest::config::Settings;
use vvquest::domain::ModeKind;
use vvquest::services::GenerationStatus;
use vvquest::App;

#[derive(Parser)]
#[command(name = "vvquest")]
#[command(author, version, about = "Semantic image search", long_about = None)]
struct Cli {
    /// Path to the settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured local models
    Models,

    /// Download a local model
    Download {
        /// Model id from the catalog
        model: String,
    },

    /// Select the embedding mode used by later commands
    Mode {
        /// `local` or `api`
        mode: ModeKind,

        /// Local model to use
        #[arg(long)]
        model: Option<String>,
    },

    /// Show or change remote API settings
    Config {
        #[arg(long)]
        api_key: Option<String>,

        #[arg(long)]
        base_url: Option<String>,
    },

    /// Build the embedding cache and wait for it to finish
    Generate {
        /// Rebuild even if the cache is current
        #[arg(long)]
        force: bool,
    },

    /// Search the cache
    Search {
        query: String,

        /// Number of results
        #[arg(short, long)]
        k: Option<usize>,
    },

    /// Show mode, cache and generation status
    Status,

    /// Delete the embedding cache
    Clear,
}

#[derive(Serialize)]
struct Status {
    mode: vvquest::services::ModeInfo,
    state: vvquest::services::ControllerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    has_cache: bool,
    generation: vvquest::services::JobProgress,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(Settings::default_path);
    let mut settings = Settings::load(&config_path)?;

    match cli.command {
        Commands::Models => {
            let app = App::new(settings).await?;
            print_json(&app.list_models())?;
        }

        Commands::Download { model } => {
            let app = App::new(settings).await?;
            let outcome = app.download_model(&model).await?;
            tracing::info!(model_id = %model, ?outcome, "Download finished");
            print_json(&outcome)?;
        }

        Commands::Mode { mode, model } => {
            settings.startup.generate_cache = false;
            let app = App::new(settings.clone()).await?;
            let model = model.or_else(|| settings.startup.model.clone());
            app.set_mode(mode, model.as_deref()).await?;

            let info = app.get_mode();
            settings.startup.mode = info.mode;
            if info.model_id.is_some() {
                settings.startup.model = info.model_id.clone();
            }
            settings.save(&config_path)?;
            print_json(&info)?;
        }

        Commands::Config { api_key, base_url } => {
            let app = App::new(settings.clone()).await?;
            if api_key.is_some() || base_url.is_some() {
                app.update_api_config(api_key, base_url).await?;
                settings.api = app.api_settings();
                settings.save(&config_path)?;
            }
            print_json(&app.api_config())?;
        }

        Commands::Generate { force } => {
            settings.startup.generate_cache = false;
            let app = App::new(settings).await?;
            app.bootstrap().await?;

            let started = if force {
                app.regenerate_cache()?
            } else {
                app.generate_cache()?
            };
            let Some(job) = started.job else {
                tracing::info!("Cache is already current");
                return Ok(());
            };

            let progress = job.wait().await;
            print_json(&progress)?;
            if progress.status == GenerationStatus::Failed {
                anyhow::bail!(
                    "cache generation failed: {}",
                    progress.error.unwrap_or_default()
                );
            }
        }

        Commands::Search { query, k } => {
            settings.startup.generate_cache = false;
            let app = App::new(settings).await?;
            app.bootstrap().await?;

            let hits = match k {
                Some(k) => app.search(&query, k).await,
                None => app.search_default(&query).await,
            }
            .context("search failed")?;
            print_json(&hits)?;
        }

        Commands::Status => {
            settings.startup.generate_cache = false;
            let app = App::new(settings).await?;
            if let Err(e) = app.bootstrap().await {
                tracing::warn!("{:#}", e);
            }
            print_json(&Status {
                mode: app.get_mode(),
                state: app.controller_state(),
                last_error: app.last_error(),
                has_cache: app.has_cache(),
                generation: app.generation_status(),
            })?;
        }

        Commands::Clear => {
            let app = App::new(settings).await?;
            app.clear_cache().await?;
        }
    }

    Ok(())
}
