use crate::domain::model::{ImageLayer, LaunchSpec};
use crate::utils::error::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Content digest of a directory tree: relative paths and file contents in sorted order.
/// Returns the digest and the number of files hashed. A missing directory hashes as empty.
pub fn digest_tree(dir: &Path) -> Result<(String, usize)> {
    let mut files = Vec::new();
    if dir.is_dir() {
        collect_files(dir, &mut files)?;
    }

    let mut hasher = Sha256::new();
    for file in &files {
        let relative = file.strip_prefix(dir).unwrap_or(file);
        let rel = relative.to_string_lossy().replace('\\', "/");
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(sha256_hex(&fs::read(file)?).as_bytes());
        hasher.update([b'\n']);
    }

    Ok((format!("sha256:{}", hex::encode(hasher.finalize())), files.len()))
}

/// Image digest over the ordered layers and the launch contract. Timestamps never enter it.
pub fn image_digest(layers: &[ImageLayer], launch: &LaunchSpec) -> Result<String> {
    let mut hasher = Sha256::new();
    for layer in layers {
        hasher.update(layer.step.name().as_bytes());
        hasher.update([0u8]);
        hasher.update(layer.digest.as_bytes());
        hasher.update([b'\n']);
    }
    hasher.update(serde_json::to_vec(launch)?);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_digest_tree_is_stable_and_content_sensitive() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.py"), "print('hi')\n").unwrap();
        fs::write(dir.path().join("requirements.txt"), "langgraph\n").unwrap();

        let (first, count) = digest_tree(dir.path()).unwrap();
        let (second, _) = digest_tree(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(count, 2);
        assert!(first.starts_with("sha256:"));

        fs::write(dir.path().join("src/main.py"), "print('bye')\n").unwrap();
        let (changed, _) = digest_tree(dir.path()).unwrap();
        assert_ne!(first, changed);
    }

    #[test]
    fn test_sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_hex(b"").len(), 64);
    }

    #[test]
    fn test_missing_directory_hashes_as_empty() {
        let dir = TempDir::new().unwrap();
        let (digest, count) = digest_tree(&dir.path().join("absent")).unwrap();
        assert_eq!(count, 0);
        assert_eq!(digest, digest_tree(&dir.path().join("also-absent")).unwrap().0);
    }
}
