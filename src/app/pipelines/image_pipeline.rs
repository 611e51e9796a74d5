use crate::adapters::installer::{IndexInstaller, PipInstaller};
use crate::adapters::storage::LocalStorage;
use crate::config::toml_config::{InstallerKind, RecipeConfig};
use crate::core::digest::{digest_tree, image_digest, sha256_hex};
use crate::core::requirements::parse_manifest;
use crate::core::source::{copy_tree, ExclusionSet};
use crate::domain::model::{
    container_join, rootfs_relative, BaseRuntime, BuildContext, BuildRecipe, BuildStep,
    ImageConfig, ImageLayer, LaunchSpec, PublishedImage, CONFIG_FILE,
};
use crate::domain::ports::{BuildObserver, BuildPipeline, PackageInstaller, Storage};
use crate::utils::error::{BootstrapError, Result};
use crate::utils::validation;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zip::write::{SimpleFileOptions, ZipWriter};

const RUNTIME_MARKER: &str = ".runtime.json";

/// Builds an image directory from a recipe on the local filesystem.
pub struct ImagePipeline {
    recipe: BuildRecipe,
    installer: Arc<dyn PackageInstaller>,
    observer: Option<Arc<dyn BuildObserver>>,
    output_dir: PathBuf,
    archive: bool,
    labels: BTreeMap<String, String>,
}

impl ImagePipeline {
    pub fn new(
        recipe: BuildRecipe,
        installer: Arc<dyn PackageInstaller>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            recipe,
            installer,
            observer: None,
            output_dir: output_dir.into(),
            archive: false,
            labels: BTreeMap::new(),
        }
    }

    /// Wire the recipe, installer and output options from a loaded config.
    pub fn from_config(config: &RecipeConfig) -> Result<Self> {
        let recipe = config.to_recipe()?;
        let installer: Arc<dyn PackageInstaller> = match config.dependencies.installer {
            InstallerKind::Index => Arc::new(IndexInstaller::new(
                config.dependencies.index_url.clone(),
                config.request_timeout(),
            )?),
            InstallerKind::Pip => Arc::new(PipInstaller::new(config.dependencies.python.clone())),
        };

        Ok(Self::new(recipe, installer, config.output_dir())
            .with_archive(config.output.archive)
            .with_labels(config.image.labels.clone()))
    }

    pub fn with_observer(mut self, observer: Arc<dyn BuildObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_archive(mut self, archive: bool) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn recipe(&self) -> &BuildRecipe {
        &self.recipe
    }

    /// Where the image lands once published.
    pub fn image_dir(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}", self.recipe.image_name, self.recipe.image_tag))
    }

    fn rootfs(ctx: &BuildContext) -> LocalStorage {
        LocalStorage::new(ctx.rootfs())
    }

    fn runtime(ctx: &BuildContext) -> Result<&BaseRuntime> {
        ctx.runtime.as_ref().ok_or_else(|| BootstrapError::InvalidTransition {
            from: "PENDING".to_string(),
            to: "runtime required before this step".to_string(),
        })
    }

    async fn select_base(&self, ctx: &mut BuildContext) -> Result<()> {
        let runtime = BaseRuntime::parse(&self.recipe.base_runtime)?;
        if runtime.is_floating() {
            tracing::warn!(
                "⚠️ '{}' is a floating tag; reproducibility depends on the registry",
                runtime.identifier
            );
        }

        let marker = serde_json::to_vec_pretty(&runtime)?;
        let rootfs = Self::rootfs(ctx);
        rootfs.write_file(RUNTIME_MARKER, &marker).await?;

        ctx.layers.push(ImageLayer {
            step: BuildStep::SelectBase,
            digest: format!("sha256:{}", sha256_hex(&marker)),
            files: 1,
        });
        tracing::info!(
            "🐍 Base runtime {} (language {})",
            runtime.identifier,
            runtime.language_version.as_deref().unwrap_or("unknown")
        );
        ctx.runtime = Some(runtime);
        Ok(())
    }

    async fn materialize_source(&self, ctx: &mut BuildContext) -> Result<()> {
        let exclusions = ExclusionSet::new(&self.recipe.source.exclude)?;
        let rootfs = Self::rootfs(ctx);
        let stats = copy_tree(
            &self.recipe.source.host_path,
            &rootfs,
            &self.recipe.source.destination,
            &exclusions,
        )
        .await?;

        let (digest, files) =
            digest_tree(&ctx.rootfs().join(rootfs_relative(&self.recipe.source.destination)))?;
        ctx.layers.push(ImageLayer {
            step: BuildStep::MaterializeSource,
            digest,
            files,
        });
        tracing::info!(
            "📁 Copied {} files ({} bytes, {} excluded) to {}",
            stats.files,
            stats.bytes,
            stats.excluded,
            self.recipe.source.destination
        );
        Ok(())
    }

    async fn set_working_context(&self, ctx: &mut BuildContext) -> Result<()> {
        let rootfs = Self::rootfs(ctx);
        rootfs
            .create_dir_all(&rootfs_relative(&self.recipe.build_workdir))
            .await?;
        ctx.current_dir = self.recipe.build_workdir.clone();
        Ok(())
    }

    async fn upgrade_installer(&self, ctx: &mut BuildContext) -> Result<()> {
        if !self.recipe.upgrade_installer {
            tracing::debug!("Installer upgrade disabled by recipe");
            return Ok(());
        }
        let runtime = Self::runtime(ctx)?.clone();
        ctx.installer_version = self.installer.upgrade(&runtime, &ctx.scratch()).await?;
        Ok(())
    }

    async fn install_dependencies(&self, ctx: &mut BuildContext) -> Result<()> {
        let runtime = Self::runtime(ctx)?.clone();
        let rootfs = Self::rootfs(ctx);
        let manifest_path = container_join(&ctx.current_dir, &self.recipe.manifest);
        validation::validate_container_path("dependencies.manifest", &manifest_path)?;

        if !rootfs.exists(&rootfs_relative(&manifest_path)).await {
            return Err(BootstrapError::input(
                manifest_path,
                "dependency manifest not found in the copied source",
            ));
        }
        let content = rootfs.read_file(&rootfs_relative(&manifest_path)).await?;
        let content = String::from_utf8(content).map_err(|_| {
            BootstrapError::input(manifest_path.clone(), "manifest is not valid UTF-8")
        })?;
        let requirements = parse_manifest(&content)?;
        tracing::info!(
            "📜 {} requirements from {} via {} installer",
            requirements.len(),
            manifest_path,
            self.installer.name()
        );

        ctx.packages = self
            .installer
            .install(&requirements, &manifest_path, &runtime, &rootfs, &ctx.scratch())
            .await?;

        let site_packages = ctx.rootfs().join(rootfs_relative(&runtime.site_packages()));
        let (digest, files) = digest_tree(&site_packages)?;
        ctx.layers.push(ImageLayer {
            step: BuildStep::InstallDependencies,
            digest,
            files,
        });
        Ok(())
    }

    async fn diagnostic_listing(&self, ctx: &mut BuildContext) -> Result<()> {
        let Some(observer) = &self.observer else {
            return Ok(());
        };
        let rootfs = Self::rootfs(ctx);
        let entries = rootfs.list_dir(&rootfs_relative(&ctx.current_dir)).await?;
        observer.on_listing(&ctx.current_dir, &entries)
    }

    async fn configure_environment(&self, ctx: &mut BuildContext) -> Result<()> {
        let env = self.recipe.environment.clone();
        if !env.module_path_contains(&self.recipe.source.destination) {
            return Err(BootstrapError::ConfigValidationError {
                field: "environment.module_path".to_string(),
                message: format!(
                    "module search path must contain {}",
                    self.recipe.source.destination
                ),
            });
        }
        tracing::info!("🌐 Environment: {} variables", env.len());
        ctx.environment = env;
        Ok(())
    }

    async fn set_run_directory(&self, ctx: &mut BuildContext) -> Result<()> {
        let rootfs = Self::rootfs(ctx);
        let relative = rootfs_relative(&self.recipe.run_workdir);
        if !rootfs.exists(&relative).await {
            tracing::debug!(
                "{} does not exist in the source tree, creating it empty",
                self.recipe.run_workdir
            );
            rootfs.create_dir_all(&relative).await?;
        }
        ctx.run_workdir = Some(self.recipe.run_workdir.clone());
        Ok(())
    }

    fn launch_spec(&self, ctx: &BuildContext) -> Result<LaunchSpec> {
        let workdir = ctx.run_workdir.clone().ok_or_else(|| BootstrapError::InvalidTransition {
            from: "ENV_CONFIGURED".to_string(),
            to: "publish without a run directory".to_string(),
        })?;
        if ctx.command.is_empty() {
            return Err(BootstrapError::InvalidTransition {
                from: "COMMAND_DECLARED".to_string(),
                to: "publish without a default command".to_string(),
            });
        }
        Ok(LaunchSpec {
            env: ctx.environment.clone(),
            workdir,
            command: ctx.command.clone(),
            exposed_ports: ctx.exposed_ports.clone(),
        })
    }

    fn archive_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}.zip", self.recipe.image_name, self.recipe.image_tag))
    }

    /// Archive written next to the staging dir while the build is still unpublished.
    fn staged_archive(ctx: &BuildContext) -> PathBuf {
        ctx.staging_dir.with_file_name(format!(
            "{}.zip",
            ctx.staging_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        ))
    }

    fn write_archive(image_dir: &Path, archive_path: &Path) -> Result<()> {
        let mut files = Vec::new();
        let mut pending = vec![image_dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        files.sort();

        let mut zip = ZipWriter::new(fs::File::create(archive_path)?);
        for file in files {
            let name = file
                .strip_prefix(image_dir)
                .unwrap_or(&file)
                .to_string_lossy()
                .replace('\\', "/");
            zip.start_file(name, SimpleFileOptions::default())?;
            zip.write_all(&fs::read(&file)?)?;
        }
        zip.finish()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BuildPipeline for ImagePipeline {
    async fn prepare(&self) -> Result<BuildContext> {
        fs::create_dir_all(&self.output_dir)?;
        let build_id = uuid::Uuid::new_v4().simple().to_string();
        let staging_dir = self.output_dir.join(format!(
            ".staging-{}-{}",
            self.recipe.image_name, build_id
        ));

        let ctx = BuildContext::new(build_id, staging_dir);
        fs::create_dir_all(ctx.rootfs())?;
        tracing::debug!("Staging build in {}", ctx.staging_dir.display());
        Ok(ctx)
    }

    async fn run_step(&self, step: BuildStep, ctx: &mut BuildContext) -> Result<()> {
        match step {
            BuildStep::SelectBase => self.select_base(ctx).await,
            BuildStep::MaterializeSource => self.materialize_source(ctx).await,
            BuildStep::SetWorkingContext => self.set_working_context(ctx).await,
            BuildStep::UpgradeInstaller => self.upgrade_installer(ctx).await,
            BuildStep::InstallDependencies => self.install_dependencies(ctx).await,
            BuildStep::DiagnosticListing => self.diagnostic_listing(ctx).await,
            BuildStep::ConfigureEnvironment => self.configure_environment(ctx).await,
            BuildStep::SetRunDirectory => self.set_run_directory(ctx).await,
            BuildStep::DeclarePort => {
                ctx.exposed_ports = vec![self.recipe.port.to_string()];
                tracing::info!("🔌 Declared port {}", self.recipe.port);
                Ok(())
            }
            BuildStep::DeclareCommand => {
                ctx.command = self.recipe.command.clone();
                tracing::info!("▶️ Default command {:?} in {}", ctx.command, self.recipe.run_workdir);
                Ok(())
            }
        }
    }

    async fn publish(&self, ctx: &BuildContext) -> Result<PublishedImage> {
        let launch = self.launch_spec(ctx)?;
        let runtime = Self::runtime(ctx)?.clone();
        let digest = image_digest(&ctx.layers, &launch)?;

        let mut labels = self.labels.clone();
        labels.insert(
            "org.opencontainers.image.created".to_string(),
            chrono::Utc::now().to_rfc3339(),
        );
        labels.insert("app-bootstrap.installer".to_string(), self.installer.name().to_string());

        let config = ImageConfig {
            name: self.recipe.image_name.clone(),
            tag: self.recipe.image_tag.clone(),
            digest: digest.clone(),
            runtime,
            launch,
            build_workdir: self.recipe.build_workdir.clone(),
            installer_version: ctx.installer_version.clone(),
            packages: ctx.packages.clone(),
            layers: ctx.layers.clone(),
            labels,
        };
        let scratch = ctx.scratch();
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }
        fs::write(
            ctx.staging_dir.join(CONFIG_FILE),
            serde_json::to_vec_pretty(&config)?,
        )?;

        // 壓縮檔先寫在暫存區，映像與壓縮檔都就緒後才一起換上
        let staged_archive = if self.archive {
            let path = Self::staged_archive(ctx);
            Self::write_archive(&ctx.staging_dir, &path)?;
            Some(path)
        } else {
            None
        };

        let image_dir = self.image_dir();
        let previous = self
            .output_dir
            .join(format!(".previous-{}", ctx.build_id));
        let had_previous = image_dir.exists();
        if had_previous {
            fs::rename(&image_dir, &previous)?;
        }
        let restore_previous = || -> Result<()> {
            if had_previous {
                fs::rename(&previous, &image_dir)?;
            }
            Ok(())
        };

        if let Err(e) = fs::rename(&ctx.staging_dir, &image_dir) {
            restore_previous()?;
            return Err(e.into());
        }

        let archive = match staged_archive {
            Some(staged) => {
                let path = self.archive_path();
                if let Err(e) = fs::rename(&staged, &path) {
                    // 壓縮檔放不上去，整個發佈撤回
                    fs::rename(&image_dir, &ctx.staging_dir)?;
                    restore_previous()?;
                    return Err(BootstrapError::input(
                        path.display().to_string(),
                        format!("cannot publish image archive: {}", e),
                    ));
                }
                Some(path)
            }
            None => None,
        };

        if had_previous {
            fs::remove_dir_all(&previous)?;
        }

        Ok(PublishedImage {
            path: image_dir,
            digest,
            archive,
        })
    }

    async fn discard(&self, ctx: &BuildContext) -> Result<()> {
        if ctx.staging_dir.exists() {
            fs::remove_dir_all(&ctx.staging_dir)?;
        }
        let staged_archive = Self::staged_archive(ctx);
        if staged_archive.exists() {
            fs::remove_file(&staged_archive)?;
        }
        Ok(())
    }

    fn observer(&self) -> Option<&dyn BuildObserver> {
        self.observer.as_deref()
    }
}
