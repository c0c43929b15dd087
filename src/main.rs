use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pm25_map::config::{AppConfig, CsvLayout};
use pm25_map::state::{self, Selection};
use pm25_map::{data, render, server};
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a CSV of station readings into a GeoJSON point collection
    Convert {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
        /// Read the CSV column layout from this config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// CSV has no header row; columns are name, longitude, latitude, value
        #[arg(long, conflicts_with = "config")]
        no_header: bool,
    },
    /// Render the map for one year to SVG
    Render {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Defaults to the configured default year
        #[arg(short, long)]
        year: Option<String>,
    },
    /// Serve the interactive map
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            input,
            output,
            config,
            no_header,
        } => {
            let layout = match config {
                Some(path) => AppConfig::load_from_file(&path)?.input.csv,
                None if no_header => CsvLayout::positional(),
                None => CsvLayout::default(),
            };

            let conversion = data::load_points(input.clone(), layout).await?;
            let collection = data::points_to_geojson(&conversion.features);
            let json = serde_json::to_string_pretty(&collection)?;
            fs::write(&output, json)
                .with_context(|| format!("Failed to write GeoJSON: {:?}", output))?;

            println!(
                "Wrote {} features to {:?} ({} rows skipped)",
                conversion.features.len(),
                output,
                conversion.rejected.len()
            );
        }
        Commands::Render { config, year } => {
            let app_config = AppConfig::load_from_file(&config)?;
            let year = year.unwrap_or_else(|| app_config.input.default_year.clone());
            if !app_config.has_year(&year) {
                bail!("Unknown year: {}", year);
            }

            info!("Rendering map for {} with config {:?}", year, config);
            let layers = state::load_layers(&app_config, &year).await;
            let selection = Selection {
                year: year.clone(),
                generation: 1,
            };
            let map = state::build_map(&app_config, selection, layers)?;
            render::write_map(&map.scene, &map.scale, &app_config.output.dir, &year)?;

            println!(
                "Rendered {} counties and {} stations to {:?}",
                map.scene.shapes().len(),
                map.scene.markers().len(),
                app_config.output.dir.join(format!("{year}.svg"))
            );
        }
        Commands::Serve { config } => {
            let app_config = AppConfig::load_from_file(&config)?;
            server::start_server(app_config).await?;
        }
    }

    Ok(())
}
