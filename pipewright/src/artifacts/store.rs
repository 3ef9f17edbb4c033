//! Save and restore of artifact trees.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use super::manifest::{digest_file, relative_key};
use super::ArtifactManifest;
use crate::errors::ArtifactError;

/// Checks that `path` is relative and stays below its root.
///
/// Returns the path with `.` components removed; an empty result means the
/// root itself.
pub fn validate_relative_path(path: &str) -> Result<PathBuf, ArtifactError> {
    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArtifactError::InvalidPath {
                    path: path.to_string(),
                })
            }
        }
    }
    Ok(normalized)
}

/// The run's artifact root.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    index: Mutex<BTreeMap<String, ArtifactManifest>>,
}

impl ArtifactStore {
    /// Creates a store rooted at `root`. Nothing is touched until [`prepare`](Self::prepare).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the artifact root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the artifact root.
    pub async fn prepare(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Returns the combined manifest of everything saved under `name`.
    #[must_use]
    pub fn manifest(&self, name: &str) -> Option<ArtifactManifest> {
        self.index.lock().get(name).cloned()
    }

    /// Returns the names saved so far.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.index.lock().keys().cloned().collect()
    }

    fn artifact_dir(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        let rel = validate_relative_path(name)?;
        if rel.components().count() != 1 {
            return Err(ArtifactError::InvalidPath {
                path: name.to_string(),
            });
        }
        Ok(self.root.join(rel))
    }

    /// Copies `rel` from `job_dir` to `<root>/<name>/<rel>`.
    ///
    /// The first save of `name` in this store replaces whatever an earlier
    /// run left under `<root>/<name>`. Returns the manifest of the files
    /// written by this call.
    pub async fn save(
        &self,
        name: &str,
        rel: &str,
        job: &str,
        job_dir: &Path,
    ) -> Result<ArtifactManifest, ArtifactError> {
        let rel_path = validate_relative_path(rel)?;
        let src = job_dir.join(&rel_path);
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            return Err(ArtifactError::SourceMissing {
                name: name.to_string(),
                job: job.to_string(),
                path: rel.to_string(),
            });
        }

        let artifact_dir = self.artifact_dir(name)?;
        let first_save = !self.index.lock().contains_key(name);
        if first_save {
            remove_stale(name, &artifact_dir).await?;
        }
        let dest = artifact_dir.join(&rel_path);
        let manifest = copy_blocking(name, src, dest, artifact_dir).await?;

        info!(
            artifact = name,
            job,
            path = rel,
            files = manifest.len(),
            bytes = manifest.bytes,
            "Saved artifact"
        );
        self.index
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| ArtifactManifest::new(name))
            .merge(manifest.clone());
        Ok(manifest)
    }

    /// Copies the stored tree of `name` into `job_dir`, under `target` if given.
    ///
    /// # Errors
    ///
    /// [`ArtifactError::Unknown`] if nothing was saved under `name` through
    /// this store, even when the directory exists on disk.
    pub async fn restore(
        &self,
        name: &str,
        target: Option<&str>,
        job_dir: &Path,
    ) -> Result<ArtifactManifest, ArtifactError> {
        let artifact_dir = self.artifact_dir(name)?;
        let saved = self.index.lock().contains_key(name);
        if !saved {
            return Err(ArtifactError::Unknown {
                name: name.to_string(),
            });
        }

        let dest = job_dir.join(validate_relative_path(target.unwrap_or(""))?);
        let manifest = copy_blocking(name, artifact_dir, dest.clone(), dest).await?;
        debug!(artifact = name, files = manifest.len(), "Restored artifact");
        Ok(manifest)
    }
}

async fn remove_stale(name: &str, dir: &Path) -> Result<(), ArtifactError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            debug!(artifact = name, path = %dir.display(), "Removed stale artifact");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ArtifactError::Copy {
            name: name.to_string(),
            path: dir.to_path_buf(),
            source,
        }),
    }
}

async fn copy_blocking(
    name: &str,
    src: PathBuf,
    dest: PathBuf,
    key_root: PathBuf,
) -> Result<ArtifactManifest, ArtifactError> {
    let owned_name = name.to_string();
    let fallback = src.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let mut manifest = ArtifactManifest::new(owned_name);
        copy_tree(&src, &dest, &key_root, &mut manifest).map(|()| manifest)
    })
    .await;

    match joined {
        Ok(Ok(manifest)) => Ok(manifest),
        Ok(Err((path, source))) => Err(ArtifactError::Copy {
            name: name.to_string(),
            path,
            source,
        }),
        Err(join_err) => Err(ArtifactError::Copy {
            name: name.to_string(),
            path: fallback,
            source: io::Error::other(join_err.to_string()),
        }),
    }
}

fn at(path: &Path) -> impl FnOnce(io::Error) -> (PathBuf, io::Error) + '_ {
    move |e| (path.to_path_buf(), e)
}

fn copy_tree(
    src: &Path,
    dest: &Path,
    key_root: &Path,
    manifest: &mut ArtifactManifest,
) -> Result<(), (PathBuf, io::Error)> {
    let meta = std::fs::metadata(src).map_err(at(src))?;
    if meta.is_dir() {
        std::fs::create_dir_all(dest).map_err(at(dest))?;
        for entry in std::fs::read_dir(src).map_err(at(src))? {
            let file_name = entry.map_err(at(src))?.file_name();
            copy_tree(&src.join(&file_name), &dest.join(&file_name), key_root, manifest)?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(at(parent))?;
        }
        std::fs::copy(src, dest).map_err(at(src))?;
        let (digest, bytes) = digest_file(dest).map_err(at(dest))?;
        manifest.insert(relative_key(key_root, dest), digest, bytes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_to_different_path() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("artifacts"));
        store.prepare().await.unwrap();

        let build_dir = tmp.path().join("jobs/build");
        write(&build_dir.join("out/app"), "binary");
        write(&build_dir.join("out/lib/util.so"), "library");

        let saved = store.save("dist", "out/", "build", &build_dir).await.unwrap();
        assert_eq!(saved.len(), 2);

        let deploy_dir = tmp.path().join("jobs/deploy");
        std::fs::create_dir_all(&deploy_dir).unwrap();
        let restored = store
            .restore("dist", Some("incoming"), &deploy_dir)
            .await
            .unwrap();

        assert!(saved.same_content(&restored));
        assert_eq!(
            std::fs::read_to_string(deploy_dir.join("incoming/out/lib/util.so")).unwrap(),
            "library"
        );
        let original = ArtifactManifest::scan("dist", &build_dir).unwrap();
        let copied = ArtifactManifest::scan("dist", &deploy_dir.join("incoming")).unwrap();
        assert!(original.same_content(&copied));
    }

    #[tokio::test]
    async fn test_repeated_saves_under_one_name_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("artifacts"));
        let job_dir = tmp.path().join("job");
        write(&job_dir.join("a.log"), "a");
        write(&job_dir.join("logs/a.log"), "nested");

        store.save("logs", "a.log", "j", &job_dir).await.unwrap();
        store.save("logs", "logs", "j", &job_dir).await.unwrap();

        let manifest = store.manifest("logs").unwrap();
        assert_eq!(
            manifest.files.keys().cloned().collect::<Vec<_>>(),
            vec!["a.log".to_string(), "logs/a.log".to_string()]
        );
        assert_eq!(store.names(), vec!["logs".to_string()]);
    }

    #[tokio::test]
    async fn test_restore_unknown_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("artifacts"));
        store.prepare().await.unwrap();

        let err = store.restore("nope", None, tmp.path()).await.unwrap_err();
        assert!(matches!(err, ArtifactError::Unknown { name } if name == "nope"));
    }

    #[tokio::test]
    async fn test_shared_root_does_not_leak_between_stores() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("artifacts");
        let job_dir = tmp.path().join("jobs/build");
        let deploy_dir = tmp.path().join("jobs/deploy");

        let first = ArtifactStore::new(&root);
        first.prepare().await.unwrap();
        write(&job_dir.join("out/old.txt"), "old");
        first.save("dist", "out", "build", &job_dir).await.unwrap();

        let second = ArtifactStore::new(&root);
        second.prepare().await.unwrap();
        let err = second.restore("dist", None, &deploy_dir).await.unwrap_err();
        assert!(matches!(err, ArtifactError::Unknown { name } if name == "dist"));

        std::fs::remove_dir_all(&job_dir).unwrap();
        write(&job_dir.join("out/new.txt"), "new");
        let saved = second.save("dist", "out", "build", &job_dir).await.unwrap();
        let restored = second.restore("dist", None, &deploy_dir).await.unwrap();

        assert!(saved.same_content(&restored));
        assert_eq!(
            restored.files.keys().cloned().collect::<Vec<_>>(),
            vec!["out/new.txt".to_string()]
        );
        assert!(!deploy_dir.join("out/old.txt").exists());
    }

    #[tokio::test]
    async fn test_save_missing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("artifacts"));

        let err = store.save("dist", "out", "build", tmp.path()).await.unwrap_err();
        assert!(matches!(err, ArtifactError::SourceMissing { .. }));
    }

    #[test]
    fn test_validate_relative_path() {
        assert_eq!(validate_relative_path("./out/").unwrap(), PathBuf::from("out"));
        assert_eq!(validate_relative_path("").unwrap(), PathBuf::new());
        assert!(validate_relative_path("../etc").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("a/../../b").is_err());
    }
}
