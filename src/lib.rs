pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use crate::config::CliConfig;
pub use crate::config::RecipeConfig;

pub use crate::adapters::installer::{IndexInstaller, PipInstaller};
pub use crate::adapters::observer::LoggingObserver;
pub use crate::adapters::storage::LocalStorage;
pub use crate::app::pipelines::ImagePipeline;
pub use crate::core::{engine::BuildEngine, engine::BuildReport, launch::Launcher};
pub use crate::domain::model::{BuildState, BuildStep, ImageConfig, LaunchSpec};
pub use crate::utils::error::{BootstrapError, Result};
