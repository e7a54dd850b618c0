use crate::engine::errors::StoreError;
use crate::engine::layout::{DOWNLOADS_DIR, SHARE_DIR, write_atomic};
use crate::engine::manifest::is_hex_digest;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CATALOG_VERSION: &str = "1.0";

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageRole {
    Share,
    Download,
}

impl StorageRole {
    /// Role implied by the first component of a catalog `path`.
    pub fn from_placement(path: &str) -> Option<Self> {
        match path.split('/').next()? {
            SHARE_DIR => Some(Self::Share),
            DOWNLOADS_DIR => Some(Self::Download),
            _ => None,
        }
    }
}

/// One `fileslist` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogEntry {
    #[serde(rename = "filename")]
    pub file_name: String,
    /// Directory holding the file, relative to the node root.
    pub path: String,
    #[serde(rename = "md5")]
    pub content_hash: String,
}

impl CatalogEntry {
    pub fn role(&self) -> Option<StorageRole> {
        StorageRole::from_placement(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub version: String,
    #[serde(rename = "fileslist")]
    pub entries: Vec<CatalogEntry>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            version: CATALOG_VERSION.to_string(),
            entries: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct RawCatalog {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    fileslist: Vec<serde_json::Value>,
}

impl Catalog {
    /// Reads the catalog, writing an empty one first if none exists.
    ///
    /// Entries are decoded one by one: a malformed record is logged and
    /// dropped while the rest still load. Only an unreadable file or a
    /// document that is not a catalog object at all is an error.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                let catalog = Self::default();
                catalog.save(path).await?;
                tracing::info!(path = %path.display(), "created empty catalog");
                return Ok(catalog);
            }
            Err(source) => {
                return Err(StoreError::ReadFile {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let raw: RawCatalog =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut entries: Vec<CatalogEntry> = Vec::with_capacity(raw.fileslist.len());
        for (i, value) in raw.fileslist.into_iter().enumerate() {
            match decode_entry(value) {
                Ok(entry) if entries.iter().any(|e| e.content_hash == entry.content_hash) => {
                    tracing::warn!(index = i, content_hash = %entry.content_hash, "skipping duplicate catalog entry");
                }
                Ok(entry) => entries.push(entry),
                Err(reason) => {
                    tracing::warn!(path = %path.display(), index = i, %reason, "skipping corrupt catalog entry");
                }
            }
        }
        Ok(Self {
            version: raw.version.unwrap_or_else(|| CATALOG_VERSION.to_string()),
            entries,
        })
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(self).map_err(|source| StoreError::Serialize { source })?;
        write_atomic(path, &bytes).await
    }

    pub fn contains(&self, content_hash: &str) -> bool {
        self.entries.iter().any(|e| e.content_hash == content_hash)
    }

    pub fn remove(&mut self, content_hash: &str) -> Option<CatalogEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.content_hash == content_hash)?;
        Some(self.entries.remove(pos))
    }
}

fn decode_entry(value: serde_json::Value) -> std::result::Result<CatalogEntry, String> {
    let mut entry: CatalogEntry = serde_json::from_value(value).map_err(|e| e.to_string())?;
    entry.content_hash.make_ascii_lowercase();
    if !is_hex_digest(&entry.content_hash, 32) {
        return Err(format!("md5 '{}' is not a 32 char hex digest", entry.content_hash));
    }
    if entry.role().is_none() {
        return Err(format!("path '{}' is neither share nor downloads", entry.path));
    }
    if entry.file_name.is_empty() {
        return Err("empty filename".to_string());
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::errors::ErrorKind;
    use crate::engine::test_support::temp_dir;

    #[test]
    fn role_follows_first_path_component() {
        assert_eq!(StorageRole::from_placement("share"), Some(StorageRole::Share));
        assert_eq!(
            StorageRole::from_placement("downloads/movies"),
            Some(StorageRole::Download)
        );
        assert_eq!(StorageRole::from_placement("elsewhere"), None);
    }

    #[tokio::test]
    async fn missing_catalog_is_created_empty() {
        let root = temp_dir("catalog-create");
        std::fs::create_dir_all(&root).expect("mkdir");
        let path = root.join("catalog.json");

        let catalog = Catalog::load_or_create(&path).await.expect("load");
        assert_eq!(catalog, Catalog::default());
        let on_disk: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(on_disk["version"], CATALOG_VERSION);
        assert_eq!(on_disk["fileslist"], serde_json::json!([]));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn corrupt_entries_are_skipped_and_rest_load() {
        let root = temp_dir("catalog-corrupt");
        std::fs::create_dir_all(&root).expect("mkdir");
        let path = root.join("catalog.json");
        let doc = serde_json::json!({
            "version": "1.0",
            "fileslist": [
                {"filename": "a.bin", "path": "share", "md5": "0123456789ABCDEF0123456789ABCDEF"},
                {"filename": "b.bin", "path": "downloads"},
                "not an object",
                {"filename": "c.bin", "path": "downloads/sub", "md5": "fedcba9876543210fedcba9876543210"},
                {"filename": "d.bin", "path": "tmp", "md5": "11111111111111111111111111111111"},
            ]
        });
        std::fs::write(&path, doc.to_string()).expect("write");

        let catalog = Catalog::load_or_create(&path).await.expect("load");
        assert_eq!(catalog.entries.len(), 2);
        assert_eq!(catalog.entries[0].content_hash, "0123456789abcdef0123456789abcdef");
        assert_eq!(catalog.entries[0].role(), Some(StorageRole::Share));
        assert_eq!(catalog.entries[1].role(), Some(StorageRole::Download));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn unparsable_document_is_a_parse_error() {
        let root = temp_dir("catalog-garbage");
        std::fs::create_dir_all(&root).expect("mkdir");
        let path = root.join("catalog.json");
        std::fs::write(&path, b"[1, 2").expect("write");
        let err = Catalog::load_or_create(&path).await.expect_err("garbage");
        assert_eq!(err.kind(), ErrorKind::Parse);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn save_uses_wire_field_names() {
        let root = temp_dir("catalog-save");
        std::fs::create_dir_all(&root).expect("mkdir");
        let path = root.join("catalog.json");
        let mut catalog = Catalog::default();
        catalog.entries.push(CatalogEntry {
            file_name: "a.bin".to_string(),
            path: "share".to_string(),
            content_hash: "0123456789abcdef0123456789abcdef".to_string(),
        });
        catalog.save(&path).await.expect("save");

        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(v["fileslist"][0]["filename"], "a.bin");
        assert_eq!(v["fileslist"][0]["md5"], "0123456789abcdef0123456789abcdef");
        assert!(catalog.contains("0123456789abcdef0123456789abcdef"));
        assert!(catalog.remove("0123456789abcdef0123456789abcdef").is_some());
        assert!(catalog.entries.is_empty());
        let _ = std::fs::remove_dir_all(root);
    }
}
