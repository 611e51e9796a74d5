use crate::domain::model::rootfs_relative;
use crate::domain::ports::Storage;
use crate::utils::error::{BootstrapError, Result};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::Path;
use std::sync::LazyLock;

// Names that usually should not ship inside an image.
static SENSITIVE: LazyLock<GlobSet> = LazyLock::new(|| {
    let mut builder = GlobSetBuilder::new();
    for pattern in [".env", ".env.*", ".git", "*.pem", "*.key", "id_rsa", "id_ed25519", ".aws"] {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub bytes: u64,
    pub excluded: usize,
    pub sensitive: Vec<String>,
}

/// Compiled exclusion globs, matched against the path relative to the source root
/// and against the bare file name.
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    set: GlobSet,
}

impl ExclusionSet {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let trimmed = pattern.trim().trim_end_matches('/');
            if trimmed.is_empty() {
                return Err(BootstrapError::ConfigValidationError {
                    field: "source.exclude".to_string(),
                    message: "exclude entries must be non-empty".to_string(),
                });
            }
            let glob = GlobBuilder::new(trimmed).build().map_err(|e| {
                BootstrapError::ConfigValidationError {
                    field: "source.exclude".to_string(),
                    message: format!("Invalid glob '{}': {}", trimmed, e),
                }
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| BootstrapError::ConfigValidationError {
            field: "source.exclude".to_string(),
            message: format!("Invalid glob set: {}", e),
        })?;
        Ok(Self { set })
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        let name = relative.rsplit('/').next().unwrap_or(relative);
        self.set.is_match(relative) || self.set.is_match(name)
    }
}

fn is_sensitive(relative: &str) -> bool {
    let name = relative.rsplit('/').next().unwrap_or(relative);
    SENSITIVE.is_match(name)
}

/// Copy the host source tree into `destination` inside the image rootfs.
pub async fn copy_tree(
    host_root: &Path,
    rootfs: &dyn Storage,
    destination: &str,
    exclusions: &ExclusionSet,
) -> Result<CopyStats> {
    let display = host_root.display().to_string();
    let metadata = std::fs::metadata(host_root)
        .map_err(|e| BootstrapError::input(&display, format!("source tree unreadable: {}", e)))?;
    if !metadata.is_dir() {
        return Err(BootstrapError::input(&display, "source path is not a directory"));
    }

    let dest_root = rootfs_relative(destination);
    rootfs.create_dir_all(&dest_root).await?;

    let mut stats = CopyStats::default();
    // 以堆疊走訪，避免遞迴 async
    let mut pending = vec![String::new()];

    while let Some(relative_dir) = pending.pop() {
        let host_dir = host_root.join(&relative_dir);
        let mut entries = std::fs::read_dir(&host_dir)
            .map_err(|e| BootstrapError::input(host_dir.display().to_string(), e.to_string()))?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().to_string();
            let relative = if relative_dir.is_empty() {
                name
            } else {
                format!("{}/{}", relative_dir, name)
            };

            if exclusions.is_excluded(&relative) {
                tracing::debug!("Excluded from image: {}", relative);
                stats.excluded += 1;
                continue;
            }
            if is_sensitive(&relative) {
                stats.sensitive.push(relative.clone());
            }

            let target = format!("{}/{}", dest_root, relative);
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                rootfs.create_dir_all(&target).await?;
                pending.push(relative);
            } else if file_type.is_file() {
                let data = std::fs::read(entry.path()).map_err(|e| {
                    BootstrapError::input(entry.path().display().to_string(), e.to_string())
                })?;
                stats.bytes += data.len() as u64;
                stats.files += 1;
                rootfs.write_file(&target, &data).await?;
            } else {
                tracing::debug!("Skipping non-regular file: {}", relative);
            }
        }
    }

    for path in &stats.sensitive {
        tracing::warn!(
            "⚠️ '{}' was copied into the image; add it to source.exclude if it should not ship",
            path
        );
    }

    Ok(stats)
}
