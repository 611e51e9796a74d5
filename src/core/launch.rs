use crate::domain::model::{
    rootfs_relative, ImageConfig, CONFIG_FILE, MODULE_PATH_SEPARATOR, MODULE_PATH_VAR, ROOTFS_DIR,
};
use crate::utils::error::{BootstrapError, Result};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;

/// Starts a published image's command on the host, with the image's
/// environment and working directory mapped onto its root filesystem.
#[derive(Debug, Clone)]
pub struct Launcher {
    image_dir: PathBuf,
    config: ImageConfig,
}

impl Launcher {
    pub fn open(image_dir: impl AsRef<Path>) -> Result<Self> {
        let image_dir = image_dir.as_ref().to_path_buf();
        let config_path = image_dir.join(CONFIG_FILE);
        let content = std::fs::read_to_string(&config_path).map_err(|e| BootstrapError::LaunchError {
            message: format!("cannot read {}: {}", config_path.display(), e),
        })?;
        let config: ImageConfig = serde_json::from_str(&content)?;
        Ok(Self { image_dir, config })
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn rootfs(&self) -> PathBuf {
        self.image_dir.join(ROOTFS_DIR)
    }

    fn host_path(&self, container_path: &str) -> PathBuf {
        self.rootfs().join(rootfs_relative(container_path))
    }

    /// Image environment with absolute module path entries rewritten to the rootfs.
    pub fn environment(&self) -> Vec<(String, String)> {
        self.config
            .launch
            .env
            .iter()
            .map(|(name, value)| {
                if name == MODULE_PATH_VAR {
                    let mapped: Vec<String> = value
                        .split(MODULE_PATH_SEPARATOR)
                        .filter(|entry| !entry.is_empty())
                        .map(|entry| {
                            if entry.starts_with('/') {
                                self.host_path(entry).to_string_lossy().into_owned()
                            } else {
                                entry.to_string()
                            }
                        })
                        .collect();
                    (name.clone(), mapped.join(&MODULE_PATH_SEPARATOR.to_string()))
                } else {
                    (name.clone(), value.clone())
                }
            })
            .collect()
    }

    fn command(&self, override_command: &[String]) -> Result<Command> {
        let argv = if override_command.is_empty() {
            &self.config.launch.command
        } else {
            override_command
        };
        let Some((program, args)) = argv.split_first() else {
            return Err(BootstrapError::LaunchError {
                message: "image declares no command".to_string(),
            });
        };

        let workdir = self.host_path(&self.config.launch.workdir);
        if !workdir.is_dir() {
            return Err(BootstrapError::LaunchError {
                message: format!("working directory {} is missing", self.config.launch.workdir),
            });
        }

        let program = if program.starts_with('/') {
            self.host_path(program).to_string_lossy().into_owned()
        } else {
            program.clone()
        };

        let mut command = Command::new(&program);
        command.args(args).current_dir(&workdir).env_clear();
        // 只保留 PATH，讓宿主機的直譯器可以被找到
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }
        command.envs(self.environment());
        tracing::info!(
            "🚀 Launching {:?} in {} ({})",
            argv,
            self.config.launch.workdir,
            self.config.launch.exposed_ports.join(", ")
        );
        Ok(command)
    }

    fn spawn_error(program: &str, error: std::io::Error) -> BootstrapError {
        BootstrapError::LaunchError {
            message: format!("cannot start '{}': {}", program, error),
        }
    }

    /// Run the command once, inheriting stdio, and return its exit code.
    pub async fn launch(&self, override_command: &[String]) -> Result<i32> {
        let mut command = self.command(override_command)?;
        let program = format!("{:?}", command.as_std().get_program());
        let status = command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| Self::spawn_error(&program, e))?;
        Ok(exit_code(status))
    }

    /// Run the command once and capture its output.
    pub async fn launch_with_output(&self, override_command: &[String]) -> Result<Output> {
        let mut command = self.command(override_command)?;
        let program = format!("{:?}", command.as_std().get_program());
        command
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Self::spawn_error(&program, e))
    }
}

/// Exit code of a finished process; on unix a signal maps to 128 + signo.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{BaseRuntime, LaunchSpec, ProcessEnvironment};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn write_image(dir: &Path, command: &[&str]) {
        let mut env = ProcessEnvironment::new();
        env.set_timezone("Asia/Tehran");
        env.augment_module_path("/app");
        let config = ImageConfig {
            name: "app".to_string(),
            tag: "latest".to_string(),
            digest: "sha256:0".to_string(),
            runtime: BaseRuntime::parse("python:3.12").unwrap(),
            launch: LaunchSpec {
                env,
                workdir: "/app/src".to_string(),
                command: command.iter().map(|s| s.to_string()).collect(),
                exposed_ports: vec!["8000/tcp".to_string()],
            },
            build_workdir: "/app".to_string(),
            installer_version: None,
            packages: vec![],
            layers: vec![],
            labels: BTreeMap::new(),
        };
        std::fs::create_dir_all(dir.join("rootfs/app/src")).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), serde_json::to_vec(&config).unwrap()).unwrap();
    }

    #[test]
    fn test_module_path_is_mapped_onto_rootfs() {
        let temp = TempDir::new().unwrap();
        write_image(temp.path(), &["python", "main.py"]);

        let launcher = Launcher::open(temp.path()).unwrap();
        let env: BTreeMap<_, _> = launcher.environment().into_iter().collect();
        assert_eq!(env["TZ"], "Asia/Tehran");
        assert_eq!(
            PathBuf::from(&env["PYTHONPATH"]),
            temp.path().join("rootfs").join("app")
        );
    }

    #[test]
    fn test_open_without_config_fails() {
        let temp = TempDir::new().unwrap();
        let err = Launcher::open(temp.path()).unwrap_err();
        assert!(matches!(err, BootstrapError::LaunchError { .. }));
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let temp = TempDir::new().unwrap();
        write_image(temp.path(), &["definitely-not-a-real-binary-4821"]);

        let launcher = Launcher::open(temp.path()).unwrap();
        let err = launcher.launch_with_output(&[]).await.unwrap_err();
        assert!(matches!(err, BootstrapError::LaunchError { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_and_exit_code() {
        let temp = TempDir::new().unwrap();
        write_image(temp.path(), &["sh", "-c", "echo \"$TZ $(pwd)\"; exit 7"]);

        let launcher = Launcher::open(temp.path()).unwrap();
        let output = launcher.launch_with_output(&[]).await.unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);

        assert_eq!(exit_code(output.status), 7);
        assert!(stdout.starts_with("Asia/Tehran "));
        assert!(stdout.trim_end().ends_with("app/src"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_override_command() {
        let temp = TempDir::new().unwrap();
        write_image(temp.path(), &["sh", "-c", "exit 3"]);

        let launcher = Launcher::open(temp.path()).unwrap();
        let code = launcher
            .launch(&["sh".to_string(), "-c".to_string(), "exit 0".to_string()])
            .await
            .unwrap();
        assert_eq!(code, 0);
    }
}
