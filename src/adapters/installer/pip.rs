use crate::core::requirements::Requirement;
use crate::domain::model::{rootfs_relative, BaseRuntime, InstalledPackage};
use crate::domain::ports::{PackageInstaller, Storage};
use crate::utils::error::{BootstrapError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Where an upgraded pip is installed inside the build scratch area.
const PIP_HOME: &str = "pip";

/// Runs the real `pip` of a host interpreter, installing into the image's site-packages.
/// The host interpreter's own packages are never modified.
pub struct PipInstaller {
    python: String,
}

impl PipInstaller {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    /// Run `python -m pip`, preferring a pip previously upgraded into `pip_home`.
    async fn run_pip(
        &self,
        args: &[&str],
        pip_home: Option<&Path>,
    ) -> Result<std::process::Output> {
        tracing::debug!("Running {} -m pip {}", self.python, args.join(" "));
        let mut command = Command::new(&self.python);
        command.arg("-m").arg("pip").args(args);
        if let Some(home) = pip_home.filter(|home| home.is_dir()) {
            command.env("PYTHONPATH", home);
        }
        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BootstrapError::InstallerError {
                message: format!("failed to start '{}': {}", self.python, e),
            })?;
        Ok(output)
    }

    fn failure(context: &str, output: &std::process::Output) -> BootstrapError {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        BootstrapError::InstallerError {
            message: format!(
                "{} exited with {}: {}",
                context,
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            ),
        }
    }
}

/// `langgraph-0.2.14.dist-info` -> (langgraph, 0.2.14)
fn parse_dist_info(dir_name: &str) -> Option<InstalledPackage> {
    let stem = dir_name.trim_end_matches('/').strip_suffix(".dist-info")?;
    let (name, version) = stem.rsplit_once('-')?;
    Some(InstalledPackage {
        name: name.to_string(),
        version: version.to_string(),
    })
}

#[async_trait]
impl PackageInstaller for PipInstaller {
    fn name(&self) -> &str {
        "pip"
    }

    async fn upgrade(&self, _runtime: &BaseRuntime, scratch: &Path) -> Result<Option<String>> {
        let pip_home = scratch.join(PIP_HOME);
        std::fs::create_dir_all(&pip_home)?;
        let pip_home_str = pip_home.to_string_lossy().to_string();

        let output = self
            .run_pip(
                &[
                    "install",
                    "--upgrade",
                    "--no-cache-dir",
                    "--disable-pip-version-check",
                    "--target",
                    &pip_home_str,
                    "pip",
                ],
                None,
            )
            .await?;
        if !output.status.success() {
            return Err(Self::failure("pip upgrade", &output));
        }

        let output = self.run_pip(&["--version"], Some(&pip_home)).await?;
        // "pip 24.2 from /usr/lib/... (python 3.12)"
        let version = String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .nth(1)
            .map(str::to_string);
        Ok(version)
    }

    async fn install(
        &self,
        requirements: &[Requirement],
        manifest_path: &str,
        runtime: &BaseRuntime,
        rootfs: &dyn Storage,
        scratch: &Path,
    ) -> Result<Vec<InstalledPackage>> {
        let site_packages = rootfs_relative(&runtime.site_packages());
        let manifest = rootfs_relative(manifest_path);
        let (Some(target), Some(manifest_file)) =
            (rootfs.local_path(&site_packages), rootfs.local_path(&manifest))
        else {
            return Err(BootstrapError::InstallerError {
                message: "pip needs a filesystem-backed image root".to_string(),
            });
        };

        if requirements.is_empty() {
            tracing::info!("No requirements listed, skipping pip install");
            return Ok(Vec::new());
        }

        // 安裝到暫存目錄，成功後才搬進 site-packages
        let incoming = target.with_extension("incoming");
        let incoming_str = incoming.to_string_lossy().to_string();
        let manifest_str = manifest_file.to_string_lossy().to_string();
        let output = self
            .run_pip(
                &[
                    "install",
                    "--no-cache-dir",
                    "--disable-pip-version-check",
                    "--target",
                    &incoming_str,
                    "-r",
                    &manifest_str,
                ],
                Some(&scratch.join(PIP_HOME)),
            )
            .await?;

        if !output.status.success() {
            if incoming.exists() {
                std::fs::remove_dir_all(&incoming)?;
            }
            let err = Self::failure("pip install", &output);
            return Err(BootstrapError::DependencyResolutionError {
                package: manifest_path.to_string(),
                reason: err.to_string(),
            });
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(&incoming, &target)?;

        installed_packages(&target)
    }
}

fn installed_packages(site_packages: &Path) -> Result<Vec<InstalledPackage>> {
    let mut packages = Vec::new();
    if site_packages.is_dir() {
        for entry in std::fs::read_dir(site_packages)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(package) = parse_dist_info(&name) {
                packages.push(package);
            }
        }
    }
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dist_info() {
        assert_eq!(
            parse_dist_info("typing_extensions-4.12.2.dist-info"),
            Some(InstalledPackage {
                name: "typing_extensions".to_string(),
                version: "4.12.2".to_string()
            })
        );
        assert!(parse_dist_info("langgraph").is_none());
    }

    #[cfg(unix)]
    mod fake_interpreter {
        use super::super::*;
        use crate::adapters::storage::LocalStorage;
        use crate::core::requirements::parse_manifest;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn script(dir: &Path, body: &str) -> String {
            let path = dir.join("fake-python");
            let log = dir.join("calls.log");
            std::fs::write(
                &path,
                format!(
                    "#!/bin/sh\necho \"$PYTHONPATH|$*\" >> '{}'\n{}\n",
                    log.display(),
                    body
                ),
            )
            .unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().to_string()
        }

        fn calls(dir: &Path) -> Vec<String> {
            std::fs::read_to_string(dir.join("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        const WORKING_PIP: &str = r#"
case "$*" in
  *--version*)
    [ -n "$PYTHONPATH" ] || exit 9
    echo "pip 24.2 from $PYTHONPATH/pip (python 3.12)" ;;
  *--target*)
    while [ $# -gt 0 ]; do
      if [ "$1" = "--target" ]; then shift; target="$1"; fi
      shift
    done
    case "$target" in
      */scratch/pip) mkdir -p "$target/pip" ;;
      *) mkdir -p "$target/langgraph-0.2.14.dist-info" ;;
    esac ;;
  *) exit 7 ;;
esac
exit 0"#;

        #[tokio::test]
        async fn test_install_moves_packages_into_site_packages() {
            let tools = TempDir::new().unwrap();
            let image = TempDir::new().unwrap();
            let rootfs = LocalStorage::new(image.path().join("rootfs"));
            let scratch = image.path().join("scratch");
            rootfs.write_file("app/requirements.txt", b"langgraph\n").await.unwrap();

            let pip = PipInstaller::new(script(tools.path(), WORKING_PIP));
            let runtime = BaseRuntime::parse("python:3.12").unwrap();

            assert_eq!(
                pip.upgrade(&runtime, &scratch).await.unwrap().as_deref(),
                Some("24.2")
            );

            let reqs = parse_manifest("langgraph\n").unwrap();
            let installed = pip
                .install(&reqs, "/app/requirements.txt", &runtime, &rootfs, &scratch)
                .await
                .unwrap();

            assert_eq!(installed.len(), 1);
            assert_eq!(installed[0].name, "langgraph");
            assert!(image
                .path()
                .join("rootfs/usr/local/lib/python3.12/site-packages/langgraph-0.2.14.dist-info")
                .is_dir());
        }

        #[tokio::test]
        async fn test_upgrade_stays_inside_build_scratch() {
            let tools = TempDir::new().unwrap();
            let image = TempDir::new().unwrap();
            let rootfs = LocalStorage::new(image.path().join("rootfs"));
            let scratch = image.path().join("scratch");
            rootfs.write_file("app/requirements.txt", b"langgraph\n").await.unwrap();

            let pip = PipInstaller::new(script(tools.path(), WORKING_PIP));
            let runtime = BaseRuntime::parse("python:3.12").unwrap();
            pip.upgrade(&runtime, &scratch).await.unwrap();
            let reqs = parse_manifest("langgraph\n").unwrap();
            pip.install(&reqs, "/app/requirements.txt", &runtime, &rootfs, &scratch)
                .await
                .unwrap();

            let pip_home = scratch.join("pip").to_string_lossy().to_string();
            let calls = calls(tools.path());
            assert_eq!(calls.len(), 3);

            let upgrade = &calls[0];
            assert!(upgrade.contains("install --upgrade"));
            assert!(upgrade.contains(&format!("--target {} pip", pip_home)));
            // every later call runs the upgraded copy
            assert!(calls[1].starts_with(&format!("{}|", pip_home)));
            assert!(calls[1].ends_with("--version"));
            assert!(calls[2].starts_with(&format!("{}|", pip_home)));
            assert!(calls
                .iter()
                .all(|c| !c.contains("--upgrade") || c.contains("--target")));
            assert!(scratch.join("pip/pip").is_dir());
        }

        #[tokio::test]
        async fn test_failing_pip_is_resolution_error() {
            let tools = TempDir::new().unwrap();
            let image = TempDir::new().unwrap();
            let rootfs = LocalStorage::new(image.path());
            let scratch = tools.path().join("scratch");

            let pip = PipInstaller::new(script(
                tools.path(),
                "echo 'ERROR: No matching distribution found for langgrahp' >&2\nexit 1",
            ));
            let runtime = BaseRuntime::parse("python:3.12").unwrap();
            let reqs = parse_manifest("langgrahp\n").unwrap();

            let err = pip
                .install(&reqs, "/app/requirements.txt", &runtime, &rootfs, &scratch)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("No matching distribution"));

            let upgrade_err = pip.upgrade(&runtime, &scratch).await.unwrap_err();
            assert!(matches!(upgrade_err, BootstrapError::InstallerError { .. }));
        }
    }
}
