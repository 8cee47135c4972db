//! Hamster CLI Module
//! Command-line interface for matching and updating drivers

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::config::{ConfigError, Layout};

#[derive(Parser, Debug)]
#[command(name = "hamster")]
#[command(author = "Hamster Team")]
#[command(version)]
#[command(about = "Driver matching and transactional update engine", long_about = None)]
pub struct Cli {
    /// Data directory (defaults to the per-user local data directory)
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compare two driver version strings
    Compare {
        a: String,
        b: String,
    },

    /// Show which devices would be updated, without changing anything
    Plan {
        /// Inventory JSON written by the hardware scan
        inventory: PathBuf,
    },

    /// Download, verify and install every warranted update
    Run {
        /// Inventory JSON written by the hardware scan
        inventory: PathBuf,

        /// Skip the system restore point
        #[arg(long)]
        no_restore_point: bool,
    },

    /// Show recorded installation attempts
    History {
        /// Only records for this hardware ID
        #[arg(long)]
        device: Option<String>,

        /// Only records that need manual attention
        #[arg(long)]
        attention: bool,
    },

    /// Local catalog management
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum CatalogAction {
    /// Import listings from a JSON array file
    Import {
        file: PathBuf,
    },

    /// Show catalog location and size
    Status,
}

impl Cli {
    pub fn layout(&self) -> Result<Layout, ConfigError> {
        let base_dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => Layout::default_base_dir()?,
        };
        Ok(Layout::new(base_dir))
    }
}
