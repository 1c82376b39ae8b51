//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum that represents the available subcommands and their
//! options.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use avs_rag::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Serve { config, bind } => {
//!         // Run the server
//!     }
//!     Commands::Init => {
//!         // Write the default config and template
//!     }
//! }
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Run the HTTP and WebSocket server.
    #[clap(name = "serve", alias = "s")]
    Serve {
        /// Configuration file. Defaults to `<config_dir>/config.yaml`.
        #[arg(long, short = 'c', env = "AVSRAG_CONFIG")]
        config: Option<PathBuf>,

        /// Listen address, overriding `bind_address` from the config.
        #[arg(long, short = 'b')]
        bind: Option<String>,
    },

    /// Write the default configuration and prompt template into the config directory.
    Init,
}
