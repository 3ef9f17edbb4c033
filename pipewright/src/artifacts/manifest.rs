//! Content digests of stored artifacts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::Path;

/// The files of an artifact and their SHA-256 digests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Artifact name.
    pub name: String,
    /// Hex digest by path relative to the artifact root, `/`-separated.
    pub files: BTreeMap<String, String>,
    /// Total bytes across all files.
    pub bytes: u64,
}

impl ArtifactManifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Records one file.
    pub fn insert(&mut self, rel: impl Into<String>, digest: String, bytes: u64) {
        self.files.insert(rel.into(), digest);
        self.bytes = self.bytes.saturating_add(bytes);
    }

    /// Folds another manifest of the same artifact into this one.
    pub fn merge(&mut self, other: Self) {
        self.files.extend(other.files);
        self.bytes = self.bytes.saturating_add(other.bytes);
    }

    /// Returns the number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if the manifest lists no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Returns true if both manifests list the same files with the same content.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.files == other.files
    }

    /// Digests every file under `dir`.
    pub fn scan(name: impl Into<String>, dir: &Path) -> io::Result<Self> {
        let mut manifest = Self::new(name);
        scan_into(&mut manifest, dir, dir)?;
        Ok(manifest)
    }
}

fn scan_into(manifest: &mut ArtifactManifest, root: &Path, dir: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            scan_into(manifest, root, &path)?;
        } else {
            let (digest, bytes) = digest_file(&path)?;
            manifest.insert(relative_key(root, &path), digest, bytes);
        }
    }
    Ok(())
}

/// Returns the hex SHA-256 of a file and its size.
pub(crate) fn digest_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// Renders `path` relative to `root` with `/` separators.
pub(crate) fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_digests_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/x.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("top"), b"").unwrap();

        let manifest = ArtifactManifest::scan("dist", dir.path()).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.bytes, 5);
        assert_eq!(
            manifest.files["a/b/x.txt"],
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_merge() {
        let mut a = ArtifactManifest::new("x");
        a.insert("one", "d1".into(), 3);
        let mut b = ArtifactManifest::new("x");
        b.insert("two", "d2".into(), 4);

        a.merge(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.bytes, 7);
    }
}
