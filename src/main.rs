extern crate log;
pub mod config;
pub mod geofile;
pub mod layer;
pub mod service;
pub mod web;

use crate::config::Config;
use crate::layer::Layer;
use crate::service::query::SpatialFilter;
use anyhow::anyhow;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::{fs::read_to_string, path::Path};

/// Fetch layers from a remote map service and persist them to disk.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input config file.
    #[arg(short, long)]
    config_filepath: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the layers the configured service offers.
    Layers,
    /// Fetch the configured layer and write it to the output folder.
    Fetch {
        /// GeoJSON file with a polygon restricting the fetch to
        /// intersecting features.
        #[arg(long)]
        polygon_filepath: Option<PathBuf>,
    },
    /// Serve the landing page and the map view.
    Serve,
}

fn try_main() -> anyhow::Result<()> {
    let args = Args::try_parse()?;
    if !Path::new(&args.config_filepath).exists() {
        return Err(anyhow!("Config file {} not found", &args.config_filepath));
    }
    let config_contents = read_to_string(args.config_filepath)?;
    let config: Config = serde_yaml::from_str(&config_contents)?;

    match args.command {
        Command::Layers => {
            let layer = Layer::connect(&config.service_url, &config.layer_name)?;
            for name in layer.list_layers() {
                println!("{}", name);
            }
        }
        Command::Fetch { polygon_filepath } => {
            let layer = Layer::connect(&config.service_url, &config.layer_name)?;
            let table = match polygon_filepath {
                Some(filepath) => {
                    log::info!("Fetching '{}' clipped by {:?}", layer.name(), filepath);
                    let filter = SpatialFilter::from_geojson(&read_to_string(filepath)?)?;
                    layer.get_by_polygon(&filter)?
                }
                None => {
                    log::info!("Fetching all features of '{}'", layer.name());
                    layer.get_all()?
                }
            };
            log::info!("Fetched {} features", table.len());
            let written_path = Layer::save(&table, &config.layer_name, &config.output)?;
            log::info!("Wrote {:?}", written_path);
        }
        Command::Serve => web::server::run(&config.server)?,
    }
    Ok(())
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    env_logger::init();
    if let Err(e) = try_main() {
        eprintln!("Error: {:?}", e);
        std::process::exit(1)
    }
}
