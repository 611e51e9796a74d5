use crate::core::digest::sha256_hex;
use crate::core::requirements::Requirement;
use crate::domain::model::{rootfs_relative, BaseRuntime, InstalledPackage};
use crate::domain::ports::{PackageInstaller, Storage};
use crate::utils::error::{BootstrapError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::{Component, Path};
use std::time::Duration;
use url::Url;
use zip::ZipArchive;

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    info: ProjectInfo,
    #[serde(default)]
    releases: HashMap<String, Vec<ReleaseFile>>,
}

#[derive(Debug, Deserialize)]
struct ProjectInfo {
    name: String,
    version: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ReleaseFile {
    #[serde(default)]
    yanked: bool,
    #[serde(default)]
    url: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    packagetype: String,
    #[serde(default)]
    digests: HashMap<String, String>,
}

impl ReleaseFile {
    /// Non-yanked wheel with no ABI or platform constraint that a Python 3 interpreter can load.
    fn is_pure_wheel(&self) -> bool {
        if self.yanked || self.packagetype != "bdist_wheel" {
            return false;
        }
        let Some(stem) = self.filename.strip_suffix(".whl") else {
            return false;
        };
        let tags: Vec<&str> = stem.rsplitn(4, '-').collect();
        match tags.as_slice() {
            [platform, abi, python, _] => {
                *platform == "any"
                    && *abi == "none"
                    && python.split('.').any(|tag| tag.starts_with("py3"))
            }
            _ => false,
        }
    }
}

struct ResolvedWheel {
    package: InstalledPackage,
    file: ReleaseFile,
}

/// One extracted wheel member, already mapped to its rootfs-relative destination.
struct WheelEntry {
    path: String,
    data: Vec<u8>,
}

/// Resolves requirements against a PyPI-compatible JSON API, downloads one
/// pure-Python wheel per requirement and unpacks it into the image's site-packages.
pub struct IndexInstaller {
    client: Client,
    index_url: String,
}

impl IndexInstaller {
    pub fn new(index_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("app-bootstrap/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            index_url: index_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_project(&self, name: &str) -> Result<ProjectResponse> {
        let url = format!("{}/pypi/{}/json", self.index_url, name);
        tracing::debug!("Querying package index: {}", url);

        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(BootstrapError::DependencyResolutionError {
                package: name.to_string(),
                reason: format!("not found on {}", self.index_url),
            }),
            status if !status.is_success() => Err(BootstrapError::InstallerError {
                message: format!("index returned {} for {}", status, name),
            }),
            _ => Ok(response.json::<ProjectResponse>().await?),
        }
    }

    async fn resolve(&self, requirement: &Requirement) -> Result<ResolvedWheel> {
        let project = self.fetch_project(&requirement.name).await?;

        let candidates = project
            .releases
            .iter()
            .filter(|(_, files)| files.iter().any(ReleaseFile::is_pure_wheel))
            .map(|(version, _)| version.as_str());

        let version = requirement.select_version(candidates).ok_or_else(|| {
            BootstrapError::DependencyResolutionError {
                package: requirement.name.clone(),
                reason: if requirement.specifiers.is_empty() {
                    "no release ships a pure-Python wheel".to_string()
                } else {
                    format!(
                        "no release with a pure-Python wheel satisfies '{}'",
                        requirement.specifier_string()
                    )
                },
            }
        })?;
        let version = version.to_string();

        let file = project
            .releases
            .get(&version)
            .and_then(|files| files.iter().find(|f| f.is_pure_wheel()))
            .cloned()
            .ok_or_else(|| BootstrapError::DependencyResolutionError {
                package: requirement.name.clone(),
                reason: format!("release {} has no pure-Python wheel", version),
            })?;

        Ok(ResolvedWheel {
            package: InstalledPackage {
                name: project.info.name,
                version,
            },
            file,
        })
    }

    async fn download(&self, wheel: &ResolvedWheel) -> Result<Vec<u8>> {
        let base = Url::parse(&format!("{}/", self.index_url)).map_err(|e| {
            BootstrapError::InstallerError {
                message: format!("invalid index URL '{}': {}", self.index_url, e),
            }
        })?;
        let url = base.join(&wheel.file.url).map_err(|e| BootstrapError::InstallerError {
            message: format!("invalid wheel URL '{}': {}", wheel.file.url, e),
        })?;
        tracing::debug!("Downloading {}", url);

        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(BootstrapError::InstallerError {
                message: format!("download of {} returned {}", wheel.file.filename, response.status()),
            });
        }
        let bytes = response.bytes().await?.to_vec();

        if let Some(expected) = wheel.file.digests.get("sha256") {
            let actual = sha256_hex(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(BootstrapError::InstallerError {
                    message: format!(
                        "{} sha256 mismatch: index says {}, downloaded {}",
                        wheel.file.filename, expected, actual
                    ),
                });
            }
        }
        Ok(bytes)
    }
}

/// Rootfs-relative destination of a wheel member, or `None` for members that are not installed.
fn wheel_destination(name: &Path, site_packages: &str) -> Option<String> {
    let parts: Vec<&str> = name
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;

    match parts.as_slice() {
        [data, scheme, rest @ ..] if data.ends_with(".data") && !rest.is_empty() => {
            let root = match *scheme {
                "purelib" | "platlib" => site_packages.to_string(),
                "scripts" => "usr/local/bin".to_string(),
                "data" => "usr/local".to_string(),
                _ => return None,
            };
            Some(format!("{}/{}", root, rest.join("/")))
        }
        [] => None,
        _ => Some(format!("{}/{}", site_packages, parts.join("/"))),
    }
}

/// Read every member up front so a corrupt archive fails before anything is written.
fn unpack_wheel(filename: &str, bytes: Vec<u8>, site_packages: &str) -> Result<Vec<WheelEntry>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut entries = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let mut member = archive.by_index(index)?;
        if member.is_dir() {
            continue;
        }
        let Some(name) = member.enclosed_name() else {
            return Err(BootstrapError::InstallerError {
                message: format!("{} contains unsafe path '{}'", filename, member.name()),
            });
        };
        let Some(path) = wheel_destination(&name, site_packages) else {
            tracing::debug!("Skipping {} from {}", name.display(), filename);
            continue;
        };

        let mut data = Vec::with_capacity(member.size() as usize);
        member.read_to_end(&mut data)?;
        entries.push(WheelEntry { path, data });
    }

    Ok(entries)
}

fn dist_info_dir(site_packages: &str, package: &InstalledPackage) -> String {
    let name = package.name.replace(['-', '.'], "_");
    format!("{}/{}-{}.dist-info", site_packages, name, package.version)
}

#[async_trait]
impl PackageInstaller for IndexInstaller {
    fn name(&self) -> &str {
        "index"
    }

    async fn upgrade(&self, _runtime: &BaseRuntime, _scratch: &Path) -> Result<Option<String>> {
        let pip = self.fetch_project("pip").await.map_err(|e| BootstrapError::InstallerError {
            message: format!("could not resolve the current pip release: {}", e),
        })?;
        tracing::info!("⬆️ Package installer at pip {}", pip.info.version);
        Ok(Some(pip.info.version))
    }

    async fn install(
        &self,
        requirements: &[Requirement],
        _manifest_path: &str,
        runtime: &BaseRuntime,
        rootfs: &dyn Storage,
        _scratch: &Path,
    ) -> Result<Vec<InstalledPackage>> {
        let site_packages = rootfs_relative(&runtime.site_packages());

        // 先全部解析、下載、解壓驗證，再寫入，失敗時不留下部分安裝
        let mut resolved = Vec::with_capacity(requirements.len());
        for requirement in requirements {
            let wheel = self.resolve(requirement).await?;
            tracing::info!(
                "📦 {} -> {} {} ({})",
                requirement,
                wheel.package.name,
                wheel.package.version,
                wheel.file.filename
            );
            resolved.push(wheel);
        }

        let mut unpacked = Vec::with_capacity(resolved.len());
        for wheel in &resolved {
            let bytes = self.download(wheel).await?;
            let entries = unpack_wheel(&wheel.file.filename, bytes, &site_packages)?;
            unpacked.push(entries);
        }

        rootfs.create_dir_all(&site_packages).await?;
        for (wheel, entries) in resolved.iter().zip(unpacked) {
            for entry in &entries {
                rootfs.write_file(&entry.path, &entry.data).await?;
            }
            let dist_info = dist_info_dir(&site_packages, &wheel.package);
            rootfs.write_file(&format!("{}/INSTALLER", dist_info), b"app-bootstrap\n").await?;
            tracing::debug!("Unpacked {} files from {}", entries.len(), wheel.file.filename);
        }

        Ok(resolved.into_iter().map(|w| w.package).collect())
    }
}
