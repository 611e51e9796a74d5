use crate::core::source::ExclusionSet;
use crate::domain::model::{
    container_join, BaseRuntime, BuildRecipe, PortDeclaration, ProcessEnvironment, Protocol,
    SourceMapping,
};
use crate::utils::error::{BootstrapError, Result};
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

static ENV_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeConfig {
    pub image: ImageSection,
    #[serde(default)]
    pub base: BaseSection,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub dependencies: DependencySection,
    #[serde(default)]
    pub environment: EnvironmentSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub output: OutputSection,
    pub monitoring: Option<MonitoringSection>,

    /// Directory relative source paths resolve against; the config file's directory.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSection {
    pub name: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseSection {
    #[serde(default = "default_runtime")]
    pub runtime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
    #[serde(default = "default_source_path")]
    pub path: String,
    #[serde(default = "default_app_root")]
    pub destination: String,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstallerKind {
    #[default]
    Index,
    Pip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencySection {
    #[serde(default = "default_manifest")]
    pub manifest: String,
    #[serde(default)]
    pub installer: InstallerKind,
    #[serde(default = "default_index_url")]
    pub index_url: String,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_true")]
    pub upgrade_installer: bool,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSection {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Extra module search path entries; the source destination is always appended.
    #[serde(default)]
    pub module_path: Vec<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    pub workdir: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    /// Directory dependencies are installed from; defaults to the source destination.
    pub build_workdir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSection {
    #[serde(default = "default_output_path")]
    pub path: String,
    #[serde(default)]
    pub archive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSection {
    pub enabled: bool,
}

fn default_tag() -> String {
    "latest".to_string()
}
fn default_runtime() -> String {
    "python:3.12".to_string()
}
fn default_source_path() -> String {
    ".".to_string()
}
fn default_app_root() -> String {
    "/app".to_string()
}
fn default_manifest() -> String {
    "requirements.txt".to_string()
}
fn default_index_url() -> String {
    "https://pypi.org".to_string()
}
fn default_python() -> String {
    "python3".to_string()
}
fn default_true() -> bool {
    true
}
fn default_timeout() -> u64 {
    30
}
fn default_timezone() -> String {
    "Asia/Tehran".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_command() -> Vec<String> {
    vec!["python".to_string(), "main.py".to_string()]
}
fn default_output_path() -> String {
    "./images".to_string()
}

impl Default for BaseSection {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
        }
    }
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            path: default_source_path(),
            destination: default_app_root(),
            exclude: Vec::new(),
        }
    }
}

impl Default for DependencySection {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
            installer: InstallerKind::default(),
            index_url: default_index_url(),
            python: default_python(),
            upgrade_installer: true,
            timeout_seconds: default_timeout(),
        }
    }
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            module_path: Vec::new(),
            vars: BTreeMap::new(),
        }
    }
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            workdir: None,
            port: default_port(),
            protocol: Protocol::default(),
            command: default_command(),
            build_workdir: None,
        }
    }
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            archive: false,
        }
    }
}

impl RecipeConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BootstrapError::input(path.display().to_string(), format!("cannot read recipe: {}", e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content);

        toml::from_str(&processed_content).map_err(|e| BootstrapError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${INDEX_URL})；未設定的保持原樣
    fn substitute_env_vars(content: &str) -> String {
        ENV_REFERENCE
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn source_dir(&self) -> PathBuf {
        let path = PathBuf::from(&self.source.path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        let path = PathBuf::from(&self.output.path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }

    pub fn run_workdir(&self) -> String {
        self.runtime
            .workdir
            .clone()
            .unwrap_or_else(|| format!("{}/src", self.source.destination.trim_end_matches('/')))
    }

    pub fn build_workdir(&self) -> String {
        self.runtime
            .build_workdir
            .clone()
            .unwrap_or_else(|| self.source.destination.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.dependencies.timeout_seconds)
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.as_ref().map(|m| m.enabled).unwrap_or(false)
    }

    pub fn process_environment(&self) -> ProcessEnvironment {
        let mut env = ProcessEnvironment::new();
        for (name, value) in &self.environment.vars {
            env.set(name.clone(), value.clone());
        }
        env.set_timezone(self.environment.timezone.clone());
        for entry in &self.environment.module_path {
            env.augment_module_path(entry);
        }
        env.augment_module_path(&self.source.destination);
        env
    }

    /// Validate and freeze into the recipe the build runs from.
    pub fn to_recipe(&self) -> Result<BuildRecipe> {
        self.validate()?;

        let recipe = BuildRecipe {
            image_name: self.image.name.clone(),
            image_tag: self.image.tag.clone(),
            base_runtime: self.base.runtime.clone(),
            source: SourceMapping {
                host_path: self.source_dir(),
                destination: self.source.destination.clone(),
                exclude: self.source.exclude.clone(),
            },
            build_workdir: self.build_workdir(),
            manifest: self.dependencies.manifest.clone(),
            upgrade_installer: self.dependencies.upgrade_installer,
            environment: self.process_environment(),
            run_workdir: self.run_workdir(),
            port: PortDeclaration {
                port: self.runtime.port,
                protocol: self.runtime.protocol,
            },
            command: self.runtime.command.clone(),
        };

        if !recipe.environment.module_path_contains(&recipe.source.destination) {
            return Err(BootstrapError::ConfigValidationError {
                field: "environment.module_path".to_string(),
                message: format!("module search path must contain {}", recipe.source.destination),
            });
        }

        Ok(recipe)
    }
}

impl Validate for RecipeConfig {
    fn validate(&self) -> Result<()> {
        validation::validate_non_empty_string("image.name", &self.image.name)?;
        validation::validate_non_empty_string("image.tag", &self.image.tag)?;
        if self.image.name.chars().any(|c| c.is_whitespace() || c == '/' || c == ':') {
            return Err(BootstrapError::InvalidConfigValueError {
                field: "image.name".to_string(),
                value: self.image.name.clone(),
                reason: "Image names cannot contain whitespace, '/' or ':'".to_string(),
            });
        }

        let runtime = BaseRuntime::parse(&self.base.runtime)?;
        if runtime.is_floating() {
            tracing::warn!(
                "⚠️ Base runtime '{}' is not pinned to a version; rebuilds may differ",
                runtime.identifier
            );
        }

        validation::validate_path("source.path", &self.source.path)?;
        validation::validate_container_path("source.destination", &self.source.destination)?;
        ExclusionSet::new(&self.source.exclude)?;

        validation::validate_path("dependencies.manifest", &self.dependencies.manifest)?;
        validation::validate_range(
            "dependencies.timeout_seconds",
            self.dependencies.timeout_seconds,
            1,
            600,
        )?;
        match self.dependencies.installer {
            InstallerKind::Index => {
                validation::validate_url("dependencies.index_url", &self.dependencies.index_url)?
            }
            InstallerKind::Pip => {
                validation::validate_non_empty_string("dependencies.python", &self.dependencies.python)?
            }
        }

        validation::validate_timezone("environment.timezone", &self.environment.timezone)?;
        for name in self.environment.vars.keys() {
            validation::validate_env_name("environment.vars", name)?;
        }
        for entry in &self.environment.module_path {
            validation::validate_container_path("environment.module_path", entry)?;
        }

        let build_workdir = self.build_workdir();
        validation::validate_container_path("runtime.build_workdir", &build_workdir)?;
        validation::validate_container_path(
            "dependencies.manifest",
            &container_join(&build_workdir, &self.dependencies.manifest),
        )?;
        let run_workdir = self.run_workdir();
        validation::validate_container_path("runtime.workdir", &run_workdir)?;
        validation::validate_strict_subdirectory(
            "runtime.workdir",
            &run_workdir,
            &self.source.destination,
        )?;

        validation::validate_port("runtime.port", self.runtime.port)?;
        let program = self.runtime.command.first().ok_or_else(|| {
            BootstrapError::MissingConfigError {
                field: "runtime.command".to_string(),
            }
        })?;
        validation::validate_non_empty_string("runtime.command", program)?;

        validation::validate_path("output.path", &self.output.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{MODULE_PATH_VAR, TZ_VAR};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_minimal_config_uses_documented_defaults() {
        let config = RecipeConfig::from_toml_str(
            r#"
[image]
name = "metrics-agent"
"#,
        )
        .unwrap();

        let recipe = config.to_recipe().unwrap();
        assert_eq!(recipe.image_ref(), "metrics-agent:latest");
        assert_eq!(recipe.base_runtime, "python:3.12");
        assert_eq!(recipe.source.destination, "/app");
        assert_eq!(recipe.build_workdir, "/app");
        assert_eq!(recipe.run_workdir, "/app/src");
        assert_eq!(recipe.manifest_container_path(), "/app/requirements.txt");
        assert_eq!(recipe.environment.get(TZ_VAR), Some("Asia/Tehran"));
        assert_eq!(recipe.environment.get(MODULE_PATH_VAR), Some("/app"));
        assert_eq!(recipe.port.to_string(), "8000/tcp");
        assert_eq!(recipe.command, vec!["python", "main.py"]);
        assert!(recipe.upgrade_installer);
    }

    #[test]
    fn test_full_config() {
        let config = RecipeConfig::from_toml_str(
            r#"
[image]
name = "metrics-agent"
tag = "2024.10"

[base]
runtime = "python:3.12-slim"

[source]
path = "service"
exclude = [".git", "*.pyc"]

[dependencies]
installer = "pip"
python = "/usr/bin/python3.12"
upgrade_installer = false

[environment]
timezone = "UTC"
module_path = ["/opt/shared"]
vars = { LOG_LEVEL = "debug" }

[runtime]
port = 9000
command = ["python", "-m", "agent"]

[output]
path = "/tmp/images"
archive = true

[monitoring]
enabled = true
"#,
        )
        .unwrap();

        assert_eq!(config.dependencies.installer, InstallerKind::Pip);
        assert!(config.monitoring_enabled());
        assert!(config.output.archive);

        let recipe = config.to_recipe().unwrap();
        assert_eq!(recipe.environment.get(MODULE_PATH_VAR), Some("/opt/shared:/app"));
        assert_eq!(recipe.environment.get("LOG_LEVEL"), Some("debug"));
        assert_eq!(recipe.environment.get(TZ_VAR), Some("UTC"));
        assert_eq!(recipe.source.exclude.len(), 2);
        assert_eq!(recipe.port.port, 9000);
        assert!(!recipe.upgrade_installer);
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("APP_BOOTSTRAP_TEST_INDEX", "https://mirror.example.com");

        let config = RecipeConfig::from_toml_str(
            r#"
[image]
name = "metrics-agent"

[dependencies]
index_url = "${APP_BOOTSTRAP_TEST_INDEX}"
"#,
        )
        .unwrap();
        assert_eq!(config.dependencies.index_url, "https://mirror.example.com");

        std::env::remove_var("APP_BOOTSTRAP_TEST_INDEX");
    }

    #[test]
    fn test_run_workdir_must_be_below_app_root() {
        for workdir in ["/app", "/srv", "relative/src"] {
            let config = RecipeConfig::from_toml_str(&format!(
                r#"
[image]
name = "metrics-agent"

[runtime]
workdir = "{}"
"#,
                workdir
            ))
            .unwrap();
            assert!(config.validate().is_err(), "workdir {} should be rejected", workdir);
        }
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            "[image]\nname = \"\"",
            "[image]\nname = \"a\"\n[base]\nruntime = \"python:\"",
            "[image]\nname = \"a\"\n[environment]\ntimezone = \"tehran\"",
            "[image]\nname = \"a\"\n[runtime]\nport = 0",
            "[image]\nname = \"a\"\n[runtime]\ncommand = []",
            "[image]\nname = \"a\"\n[dependencies]\nindex_url = \"not a url\"",
            "[image]\nname = \"a\"\n[source]\nexclude = [\"[\"]",
        ];
        for case in cases {
            let config = RecipeConfig::from_toml_str(case).unwrap();
            assert!(config.validate().is_err(), "expected rejection for:\n{}", case);
        }
    }

    #[test]
    fn test_manifest_cannot_leave_the_image() {
        let escapes = [
            "../../etc/shadow",
            "deps/../../requirements.txt",
            "/app/../root/.netrc",
        ];
        for manifest in escapes {
            let config = RecipeConfig::from_toml_str(&format!(
                "[image]\nname = \"a\"\n[dependencies]\nmanifest = \"{}\"",
                manifest
            ))
            .unwrap();
            match config.validate() {
                Err(BootstrapError::InvalidConfigValueError { field, .. }) => {
                    assert_eq!(field, "dependencies.manifest")
                }
                other => panic!("manifest {} should be rejected, got {:?}", manifest, other),
            }
        }

        let nested = RecipeConfig::from_toml_str(
            "[image]\nname = \"a\"\n[dependencies]\nmanifest = \"deps/prod.txt\"",
        )
        .unwrap();
        assert!(nested.validate().is_ok());
    }

    #[test]
    fn test_config_from_file_resolves_relative_paths() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"[image]\nname = \"file-test\"\n[source]\npath = \"svc\"\n")
            .unwrap();

        let config = RecipeConfig::from_file(temp_file.path()).unwrap();
        let parent = temp_file.path().parent().unwrap();
        assert_eq!(config.image.name, "file-test");
        assert_eq!(config.source_dir(), parent.join("svc"));
        assert_eq!(config.output_dir(), parent.join("./images"));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = RecipeConfig::from_toml_str("[image\nname=").unwrap_err();
        assert!(matches!(err, BootstrapError::ConfigValidationError { .. }));
    }
}
