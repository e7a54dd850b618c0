use crate::engine::errors::StoreError;
use std::path::{Component, Path, PathBuf};

pub const CATALOG_DIR: &str = ".catalog-root";
pub const CATALOG_FILE: &str = "catalog.json";
pub const SHARE_DIR: &str = "share";
pub const DOWNLOADS_DIR: &str = "downloads";
pub const SHARE_MANIFESTS_DIR: &str = ".torrents";

/// On-disk placement of everything the node owns below its root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog_root(&self) -> PathBuf {
        self.root.join(CATALOG_DIR)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_root().join(CATALOG_FILE)
    }

    pub fn task_dir(&self, content_hash: &str) -> PathBuf {
        self.catalog_root().join(content_hash)
    }

    pub fn manifest_path(&self, content_hash: &str) -> PathBuf {
        self.task_dir(content_hash)
            .join(format!("{content_hash}.manifest"))
    }

    pub fn snapshot_path(&self, content_hash: &str) -> PathBuf {
        self.task_dir(content_hash)
            .join(format!("{content_hash}.snapshot"))
    }

    pub fn share_dir(&self) -> PathBuf {
        self.root.join(SHARE_DIR)
    }

    pub fn share_manifests_dir(&self) -> PathBuf {
        self.share_dir().join(SHARE_MANIFESTS_DIR)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join(DOWNLOADS_DIR)
    }

    /// Resolves a caller supplied download directory below `<root>/downloads`.
    ///
    /// Absolute paths and `..` components are refused so a request can never
    /// write outside the node root.
    pub fn download_dir_for(&self, relative: &str) -> Option<PathBuf> {
        let rel = Path::new(relative);
        let mut out = self.downloads_dir();
        for comp in rel.components() {
            match comp {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(out)
    }

    /// Catalog `path` value for a file stored under `dir`, relative to the root.
    pub fn placement_of(&self, dir: &Path) -> String {
        dir.strip_prefix(&self.root)
            .unwrap_or(dir)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    pub async fn ensure_dirs(&self) -> Result<(), StoreError> {
        for dir in [
            self.root.clone(),
            self.catalog_root(),
            self.share_dir(),
            self.downloads_dir(),
        ] {
            ensure_dir(&dir).await?;
        }
        Ok(())
    }
}

pub async fn ensure_dir(path: &Path) -> Result<(), StoreError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| StoreError::EnsureDir {
            path: path.to_path_buf(),
            source,
        })
}

pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".tmp");
    PathBuf::from(s)
}

/// Writes `bytes` next to `path` and renames over it, so readers never see a
/// partially written file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|source| StoreError::WriteFile {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| StoreError::Rename {
            from: tmp,
            to: path.to_path_buf(),
            source,
        })
}

/// Removes a file or a whole directory. A path that is already gone is fine.
pub(crate) async fn remove_path(path: &Path, dir: bool) -> Result<(), StoreError> {
    let res = if dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match res {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::RemovePath {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_files_live_under_per_hash_directory() {
        let layout = StorageLayout::new("/srv/node");
        let hash = "0123456789abcdef0123456789abcdef";
        assert_eq!(
            layout.snapshot_path(hash),
            PathBuf::from(format!("/srv/node/.catalog-root/{hash}/{hash}.snapshot"))
        );
        assert_eq!(
            layout.manifest_path(hash),
            PathBuf::from(format!("/srv/node/.catalog-root/{hash}/{hash}.manifest"))
        );
    }

    #[test]
    fn download_dir_rejects_escaping_paths() {
        let layout = StorageLayout::new("/srv/node");
        assert_eq!(
            layout.download_dir_for("movies/2024"),
            Some(PathBuf::from("/srv/node/downloads/movies/2024"))
        );
        assert_eq!(
            layout.download_dir_for(""),
            Some(PathBuf::from("/srv/node/downloads"))
        );
        assert_eq!(layout.download_dir_for("../etc"), None);
        assert_eq!(layout.download_dir_for("/etc"), None);
    }

    #[tokio::test]
    async fn remove_path_tolerates_missing_targets() {
        let dir = crate::engine::test_support::temp_dir("layout-remove");
        let file = dir.join("nested/data.bin");
        ensure_dir(&dir.join("nested")).await.expect("mkdir");
        tokio::fs::write(&file, b"x").await.expect("write");

        remove_path(&file, false).await.expect("remove file");
        assert!(!file.exists());
        remove_path(&file, false).await.expect("already gone");
        remove_path(&dir, true).await.expect("remove dir");
        assert!(!dir.exists());
        remove_path(&dir, true).await.expect("dir already gone");
    }

    #[test]
    fn placement_is_relative_to_root() {
        let layout = StorageLayout::new("/srv/node");
        assert_eq!(layout.placement_of(&layout.share_dir()), "share");
        assert_eq!(
            layout.placement_of(Path::new("/srv/node/downloads/a/b")),
            "downloads/a/b"
        );
    }
}
