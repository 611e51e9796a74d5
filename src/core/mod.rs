pub mod digest;
pub mod dockerfile;
pub mod engine;
pub mod launch;
pub mod requirements;
pub mod source;
pub mod state;

pub use crate::domain::ports::{BuildPipeline, PackageInstaller, Storage};
pub use crate::utils::error::Result;
pub use engine::{BuildEngine, BuildReport};
pub use launch::Launcher;
