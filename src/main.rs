//! Main module for the avsrag service binary.
//!
//! Parses the command line, loads configuration and either runs the server or
//! writes the default configuration.
//!
//! # Examples
//!
//! ```sh
//! avsrag init
//! avsrag serve
//! avsrag serve --config ./config.yaml --bind 0.0.0.0:5000
//! ```

use avs_rag::{commands, config, config_dir, server, template};
use clap::Parser;
use once_cell::sync::OnceCell;
use std::{error::Error, fs, path::PathBuf};
use tracing::{debug, info};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt::init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

/// Parse the command line and execute the selected command.
async fn run() -> Result<(), Box<dyn Error>> {
    let cli = commands::Cli::parse();

    match cli.command {
        commands::Commands::Serve {
            config: config_path,
            bind,
        } => {
            let config_path = match config_path {
                Some(path) => path,
                None => default_config_path()?,
            };
            debug!("Loading config from: {}", config_path.display());
            let mut rag_config = config::load_config(&config_path)?;
            if let Some(bind) = bind {
                rag_config.bind_address = bind;
            }
            debug!("Config loaded: {:?}", rag_config);
            server::serve(rag_config).await?;
        }
        commands::Commands::Init => {
            debug!("Initializing configuration");
            init()?;
        }
    }

    Ok(())
}

fn default_config_path() -> Result<PathBuf, Box<dyn Error>> {
    Ok(config_dir()?.join("config.yaml"))
}

/// Write the default configuration and prompt template.
///
/// Creates `<config_dir>/config.yaml` and `<config_dir>/templates/default.yaml`.
fn init() -> Result<(), Box<dyn Error>> {
    let config_dir = config_dir()?;
    let templates = config_dir.join("templates");
    info!("Creating template config directory: {}", templates.display());
    fs::create_dir_all(&templates)?;

    let template_path = templates.join("default.yaml");
    info!("Creating template file: {}", template_path.display());
    let template_yaml = serde_yaml::to_string(&template::PromptTemplate::default())?;
    fs::write(template_path, template_yaml)?;

    let config_path = config_dir.join("config.yaml");
    info!("Creating config file: {}", config_path.display());
    let rag_config = config::RagConfig {
        template: Some("default".to_string()),
        ..config::RagConfig::default()
    };
    let config_yaml = serde_yaml::to_string(&rag_config)?;
    fs::write(config_path, config_yaml)?;

    Ok(())
}
