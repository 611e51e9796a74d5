use crate::utils::error::{BootstrapError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub const TZ_VAR: &str = "TZ";
pub const MODULE_PATH_VAR: &str = "PYTHONPATH";
pub const MODULE_PATH_SEPARATOR: char = ':';

/// Layout of a published image directory.
pub const CONFIG_FILE: &str = "config.json";
pub const ROOTFS_DIR: &str = "rootfs";

/// Staging-only sibling of the rootfs.
pub const SCRATCH_DIR: &str = "scratch";

/// Map an absolute container path to a path relative to the image rootfs.
pub fn rootfs_relative(container_path: &str) -> String {
    container_path.trim_start_matches('/').to_string()
}

/// Join a container path with a relative path, staying in container syntax.
pub fn container_join(base: &str, relative: &str) -> String {
    if relative.starts_with('/') {
        return relative.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), relative)
}

/// Interpreter environment the image is based on, e.g. `python:3.12-slim`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRuntime {
    pub identifier: String,
    pub image: String,
    pub tag: Option<String>,
    /// Content digest such as `sha256:…` when the reference is pinned with `@`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// `major.minor`, derived from the tag.
    pub language_version: Option<String>,
    pub interpreter: String,
}

impl BaseRuntime {
    pub fn parse(identifier: &str) -> Result<Self> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(BootstrapError::input("base.runtime", "runtime identifier is empty"));
        }
        if identifier.chars().any(char::is_whitespace) {
            return Err(BootstrapError::input(
                "base.runtime",
                format!("runtime identifier '{}' contains whitespace", identifier),
            ));
        }

        let (reference, digest) = match identifier.split_once('@') {
            Some((reference, digest)) => {
                if reference.is_empty() || !Self::is_content_digest(digest) {
                    return Err(BootstrapError::input(
                        "base.runtime",
                        format!("malformed digest in runtime identifier '{}'", identifier),
                    ));
                }
                (reference, Some(digest.to_string()))
            }
            None => (identifier, None),
        };

        let (image, tag) = match reference.rsplit_once(':') {
            // registry:port/name without tag
            Some((_, tag)) if tag.contains('/') => (reference.to_string(), None),
            Some((image, tag)) => {
                if image.is_empty() || tag.is_empty() {
                    return Err(BootstrapError::input(
                        "base.runtime",
                        format!("malformed runtime identifier '{}'", identifier),
                    ));
                }
                (image.to_string(), Some(tag.to_string()))
            }
            None => (reference.to_string(), None),
        };

        let language_version = tag.as_deref().and_then(Self::version_prefix);
        let short_name = image.rsplit('/').next().unwrap_or(&image).to_string();

        Ok(Self {
            identifier: identifier.to_string(),
            interpreter: short_name,
            image,
            tag,
            digest,
            language_version,
        })
    }

    /// `algorithm:hex`, e.g. `sha256:6b3f…`.
    fn is_content_digest(digest: &str) -> bool {
        match digest.split_once(':') {
            Some((algorithm, hex)) => {
                !algorithm.is_empty()
                    && algorithm.chars().all(|c| c.is_ascii_alphanumeric())
                    && !hex.is_empty()
                    && hex.chars().all(|c| c.is_ascii_hexdigit())
            }
            None => false,
        }
    }

    /// Leading `major.minor` of a tag such as `3.12.4-slim-bookworm`.
    fn version_prefix(tag: &str) -> Option<String> {
        let numeric: Vec<&str> = tag
            .split(['-', '.'])
            .take_while(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
            .take(2)
            .collect();
        match numeric.as_slice() {
            [major, minor] => Some(format!("{}.{}", major, minor)),
            [major] => Some(major.to_string()),
            _ => None,
        }
    }

    /// References whose content can change between builds. A digest pin never floats.
    pub fn is_floating(&self) -> bool {
        if self.digest.is_some() {
            return false;
        }
        match self.tag.as_deref() {
            None | Some("latest") => true,
            Some(_) => self.language_version.is_none(),
        }
    }

    pub fn site_packages(&self) -> String {
        match &self.language_version {
            Some(version) if version.contains('.') => {
                format!("/usr/local/lib/{}{}/site-packages", self.interpreter, version)
            }
            _ => format!("/usr/local/lib/{}/site-packages", self.interpreter),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMapping {
    pub host_path: PathBuf,
    pub destination: String,
    pub exclude: Vec<String>,
}

/// Process-wide environment baked into the image. Ordered so serialization is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessEnvironment {
    vars: BTreeMap<String, String>,
}

impl ProcessEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn timezone(&self) -> Option<&str> {
        self.get(TZ_VAR)
    }

    pub fn set_timezone(&mut self, tz: impl Into<String>) {
        self.set(TZ_VAR, tz);
    }

    pub fn module_search_path(&self) -> Vec<&str> {
        self.get(MODULE_PATH_VAR)
            .map(|v| v.split(MODULE_PATH_SEPARATOR).filter(|p| !p.is_empty()).collect())
            .unwrap_or_default()
    }

    /// Append `entry` to the module search path unless already present.
    pub fn augment_module_path(&mut self, entry: &str) {
        let mut entries: Vec<String> = self
            .module_search_path()
            .into_iter()
            .map(str::to_string)
            .collect();
        if !entries.iter().any(|e| e.trim_end_matches('/') == entry.trim_end_matches('/')) {
            entries.push(entry.to_string());
        }
        let joined = entries.join(&MODULE_PATH_SEPARATOR.to_string());
        self.set(MODULE_PATH_VAR, joined);
    }

    pub fn module_path_contains(&self, entry: &str) -> bool {
        self.module_search_path()
            .iter()
            .any(|e| e.trim_end_matches('/') == entry.trim_end_matches('/'))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDeclaration {
    pub port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for PortDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}/{}", self.port, proto)
    }
}

/// Everything a build needs, fixed before the first step runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecipe {
    pub image_name: String,
    pub image_tag: String,
    pub base_runtime: String,
    pub source: SourceMapping,
    pub build_workdir: String,
    pub manifest: String,
    pub upgrade_installer: bool,
    pub environment: ProcessEnvironment,
    pub run_workdir: String,
    pub port: PortDeclaration,
    pub command: Vec<String>,
}

impl BuildRecipe {
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }

    /// Manifest location inside the image, resolved against the build workdir.
    pub fn manifest_container_path(&self) -> String {
        container_join(&self.build_workdir, &self.manifest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    Pending,
    BaseSelected,
    SourceCopied,
    DependenciesInstalled,
    EnvConfigured,
    CommandDeclared,
    ImageReady,
    BuildFailed,
}

impl BuildState {
    /// Successor on the happy path; terminal states have none.
    pub fn next(self) -> Option<BuildState> {
        match self {
            Self::Pending => Some(Self::BaseSelected),
            Self::BaseSelected => Some(Self::SourceCopied),
            Self::SourceCopied => Some(Self::DependenciesInstalled),
            Self::DependenciesInstalled => Some(Self::EnvConfigured),
            Self::EnvConfigured => Some(Self::CommandDeclared),
            Self::CommandDeclared => Some(Self::ImageReady),
            Self::ImageReady | Self::BuildFailed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ImageReady | Self::BuildFailed)
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::BaseSelected => "BASE_SELECTED",
            Self::SourceCopied => "SOURCE_COPIED",
            Self::DependenciesInstalled => "DEPENDENCIES_INSTALLED",
            Self::EnvConfigured => "ENV_CONFIGURED",
            Self::CommandDeclared => "COMMAND_DECLARED",
            Self::ImageReady => "IMAGE_READY",
            Self::BuildFailed => "BUILD_FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStep {
    SelectBase,
    MaterializeSource,
    SetWorkingContext,
    UpgradeInstaller,
    InstallDependencies,
    DiagnosticListing,
    ConfigureEnvironment,
    SetRunDirectory,
    DeclarePort,
    DeclareCommand,
}

impl BuildStep {
    pub const ALL: [BuildStep; 10] = [
        Self::SelectBase,
        Self::MaterializeSource,
        Self::SetWorkingContext,
        Self::UpgradeInstaller,
        Self::InstallDependencies,
        Self::DiagnosticListing,
        Self::ConfigureEnvironment,
        Self::SetRunDirectory,
        Self::DeclarePort,
        Self::DeclareCommand,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::SelectBase => "select-base",
            Self::MaterializeSource => "materialize-source",
            Self::SetWorkingContext => "set-working-context",
            Self::UpgradeInstaller => "upgrade-installer",
            Self::InstallDependencies => "install-dependencies",
            Self::DiagnosticListing => "diagnostic-listing",
            Self::ConfigureEnvironment => "configure-environment",
            Self::SetRunDirectory => "set-run-directory",
            Self::DeclarePort => "declare-port",
            Self::DeclareCommand => "declare-command",
        }
    }

    /// State reached once this step completes, if it closes a stage.
    pub fn completes(self) -> Option<BuildState> {
        match self {
            Self::SelectBase => Some(BuildState::BaseSelected),
            Self::MaterializeSource => Some(BuildState::SourceCopied),
            Self::InstallDependencies => Some(BuildState::DependenciesInstalled),
            Self::SetRunDirectory => Some(BuildState::EnvConfigured),
            Self::DeclareCommand => Some(BuildState::CommandDeclared),
            _ => None,
        }
    }

    /// Observational steps never decide the build result.
    pub fn is_observational(self) -> bool {
        matches!(self, Self::DiagnosticListing)
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The immutable record handed to process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub env: ProcessEnvironment,
    pub workdir: String,
    pub command: Vec<String>,
    pub exposed_ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayer {
    pub step: BuildStep,
    pub digest: String,
    pub files: usize,
}

/// Published alongside the rootfs as `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub name: String,
    pub tag: String,
    pub digest: String,
    pub runtime: BaseRuntime,
    pub launch: LaunchSpec,
    pub build_workdir: String,
    pub installer_version: Option<String>,
    pub packages: Vec<InstalledPackage>,
    pub layers: Vec<ImageLayer>,
    pub labels: BTreeMap<String, String>,
}

/// Mutable scratch state threaded through the steps of one build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub build_id: String,
    pub staging_dir: PathBuf,
    pub current_dir: String,
    pub runtime: Option<BaseRuntime>,
    pub installer_version: Option<String>,
    pub packages: Vec<InstalledPackage>,
    pub layers: Vec<ImageLayer>,
    pub environment: ProcessEnvironment,
    pub run_workdir: Option<String>,
    pub exposed_ports: Vec<String>,
    pub command: Vec<String>,
}

impl BuildContext {
    pub fn new(build_id: String, staging_dir: PathBuf) -> Self {
        Self {
            build_id,
            staging_dir,
            current_dir: "/".to_string(),
            runtime: None,
            installer_version: None,
            packages: Vec::new(),
            layers: Vec::new(),
            environment: ProcessEnvironment::new(),
            run_workdir: None,
            exposed_ports: Vec::new(),
            command: Vec::new(),
        }
    }

    pub fn rootfs(&self) -> PathBuf {
        self.staging_dir.join(ROOTFS_DIR)
    }

    /// Build-private working area for installer tooling; removed before publishing.
    pub fn scratch(&self) -> PathBuf {
        self.staging_dir.join(SCRATCH_DIR)
    }
}

#[derive(Debug, Clone)]
pub struct PublishedImage {
    pub path: PathBuf,
    pub digest: String,
    pub archive: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: BuildStep,
    pub duration: std::time::Duration,
    pub succeeded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pinned_runtime() {
        let runtime = BaseRuntime::parse("python:3.12").unwrap();
        assert_eq!(runtime.image, "python");
        assert_eq!(runtime.tag.as_deref(), Some("3.12"));
        assert_eq!(runtime.language_version.as_deref(), Some("3.12"));
        assert_eq!(runtime.interpreter, "python");
        assert!(!runtime.is_floating());
        assert_eq!(runtime.site_packages(), "/usr/local/lib/python3.12/site-packages");
    }

    #[test]
    fn test_parse_runtime_variants() {
        let slim = BaseRuntime::parse("python:3.12.4-slim-bookworm").unwrap();
        assert_eq!(slim.language_version.as_deref(), Some("3.12"));

        let registry = BaseRuntime::parse("registry.local:5000/python").unwrap();
        assert_eq!(registry.image, "registry.local:5000/python");
        assert!(registry.tag.is_none());
        assert!(registry.is_floating());

        assert!(BaseRuntime::parse("python:latest").unwrap().is_floating());
        assert!(BaseRuntime::parse("").is_err());
        assert!(BaseRuntime::parse("python:").is_err());
        assert!(BaseRuntime::parse("py thon:3.12").is_err());
    }

    #[test]
    fn test_parse_digest_pinned_runtime() {
        let digest = "sha256:5f0a6a0e8c2bd1b6e2b9c2d0b5b8b2c6f1a9e0d4c3b2a1908f7e6d5c4b3a2910";
        let runtime = BaseRuntime::parse(&format!("python:3.12@{}", digest)).unwrap();
        assert_eq!(runtime.image, "python");
        assert_eq!(runtime.tag.as_deref(), Some("3.12"));
        assert_eq!(runtime.digest.as_deref(), Some(digest));
        assert_eq!(runtime.language_version.as_deref(), Some("3.12"));
        assert!(!runtime.is_floating());

        let registry =
            BaseRuntime::parse(&format!("registry.local:5000/python:3.11-slim@{}", digest)).unwrap();
        assert_eq!(registry.image, "registry.local:5000/python");
        assert_eq!(registry.tag.as_deref(), Some("3.11-slim"));
        assert_eq!(registry.interpreter, "python");

        let untagged = BaseRuntime::parse(&format!("python@{}", digest)).unwrap();
        assert!(untagged.tag.is_none());
        assert!(!untagged.is_floating());

        assert!(BaseRuntime::parse("python:3.12@").is_err());
        assert!(BaseRuntime::parse("python:3.12@sha256:not-hex").is_err());
        assert!(BaseRuntime::parse("@sha256:abcd").is_err());
    }

    #[test]
    fn test_same_identifier_same_runtime() {
        assert_eq!(
            BaseRuntime::parse("python:3.12").unwrap(),
            BaseRuntime::parse("python:3.12").unwrap()
        );
    }

    #[test]
    fn test_module_path_augmentation_is_idempotent() {
        let mut env = ProcessEnvironment::new();
        env.augment_module_path("/app");
        env.augment_module_path("/app/");
        assert_eq!(env.get(MODULE_PATH_VAR), Some("/app"));

        let mut existing = ProcessEnvironment::new();
        existing.set(MODULE_PATH_VAR, "/opt/lib");
        existing.augment_module_path("/app");
        assert_eq!(existing.module_search_path(), vec!["/opt/lib", "/app"]);
        assert!(existing.module_path_contains("/app"));
    }

    #[test]
    fn test_state_happy_path_order() {
        let mut state = BuildState::Pending;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            seen.push(next);
            state = next;
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(seen.last(), Some(&BuildState::ImageReady));
        assert_eq!(BuildState::DependenciesInstalled.to_string(), "DEPENDENCIES_INSTALLED");
    }

    #[test]
    fn test_port_display() {
        let port = PortDeclaration {
            port: 8000,
            protocol: Protocol::Tcp,
        };
        assert_eq!(port.to_string(), "8000/tcp");
    }

    #[test]
    fn test_manifest_resolves_against_build_workdir() {
        assert_eq!(container_join("/app", "requirements.txt"), "/app/requirements.txt");
        assert_eq!(container_join("/app/", "deps/req.txt"), "/app/deps/req.txt");
        assert_eq!(container_join("/app", "/etc/req.txt"), "/etc/req.txt");
        assert_eq!(rootfs_relative("/app/src"), "app/src");
    }
}
