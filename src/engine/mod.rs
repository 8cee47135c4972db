// Hamster Engine - Core module structure
pub mod audit;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod installer;
pub mod locks;
pub mod model;
pub mod orchestrator;
pub mod platform;
pub mod updater;
pub mod version;

pub use config::{Config, Layout};
pub use error::{EngineError, ErrorKind, Result};
pub use orchestrator::{PlanSet, RunReport, UpdateOrchestrator};
pub use version::{compare, DriverVersion};
