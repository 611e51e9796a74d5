use crate::core::requirements::Requirement;
use crate::domain::model::{
    BaseRuntime, BuildContext, BuildState, BuildStep, InstalledPackage, PublishedImage,
};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Filesystem the image is assembled into. Paths are relative to its root.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;
    async fn create_dir_all(&self, path: &str) -> Result<()>;
    async fn list_dir(&self, path: &str) -> Result<Vec<String>>;
    async fn exists(&self, path: &str) -> bool;

    /// Host path backing `path`, for tools that need a real directory.
    fn local_path(&self, path: &str) -> Option<PathBuf>;
}

#[async_trait]
pub trait PackageInstaller: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the installer itself up to date; returns the installer version when known.
    /// Anything upgraded lives under `scratch`, which is private to the build and never published.
    async fn upgrade(&self, runtime: &BaseRuntime, scratch: &Path) -> Result<Option<String>>;

    /// Install every requirement or nothing.
    async fn install(
        &self,
        requirements: &[Requirement],
        manifest_path: &str,
        runtime: &BaseRuntime,
        rootfs: &dyn Storage,
        scratch: &Path,
    ) -> Result<Vec<InstalledPackage>>;
}

/// Side-effect-only hooks. Nothing returned here can change a build result.
pub trait BuildObserver: Send + Sync {
    fn on_transition(&self, _from: BuildState, _to: BuildState) {}

    fn on_listing(&self, directory: &str, entries: &[String]) -> Result<()>;
}

#[async_trait]
pub trait BuildPipeline: Send + Sync {
    async fn prepare(&self) -> Result<BuildContext>;
    async fn run_step(&self, step: BuildStep, ctx: &mut BuildContext) -> Result<()>;
    async fn publish(&self, ctx: &BuildContext) -> Result<PublishedImage>;
    async fn discard(&self, ctx: &BuildContext) -> Result<()>;

    fn observer(&self) -> Option<&dyn BuildObserver> {
        None
    }
}
