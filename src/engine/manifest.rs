use crate::engine::errors::EngineError;
use serde::{Deserialize, Serialize};

pub const MANIFEST_VERSION: &str = "1.0";
pub const CONTENT_TYPE_SINGLE_FILE: &str = "singlefile";
pub const HASH_HEX_LEN: usize = 32;

/// The torrent document produced by the manifest creation tool.
///
/// Unknown fields are rejected. `mtime` is the one optional extra the
/// creation tool emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub version: String,
    #[serde(rename = "contenttype")]
    pub content_type: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_md5: String,
    pub block_size: u64,
    pub part_count: u64,
    pub file_parts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
}

impl Manifest {
    /// Parses and validates manifest bytes. Hex digests are normalized to lowercase.
    pub fn parse(bytes: &[u8]) -> Result<Self, EngineError> {
        let mut manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::Validation(format!("malformed manifest: {e}")))?;
        manifest.file_md5.make_ascii_lowercase();
        for part in &mut manifest.file_parts {
            part.make_ascii_lowercase();
        }
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.version != MANIFEST_VERSION {
            return Err(EngineError::Validation(format!(
                "unsupported manifest version '{}'",
                self.version
            )));
        }
        if self.content_type != CONTENT_TYPE_SINGLE_FILE {
            return Err(EngineError::Validation(format!(
                "unsupported content type '{}'",
                self.content_type
            )));
        }
        if !is_plain_file_name(&self.file_name) {
            return Err(EngineError::Validation(format!(
                "file_name '{}' must be a plain file name",
                self.file_name
            )));
        }
        if self.file_size == 0 || self.block_size == 0 {
            return Err(EngineError::Validation(
                "file_size and block_size must be positive".to_string(),
            ));
        }
        if self.file_parts.len() as u64 != self.part_count {
            return Err(EngineError::Validation(format!(
                "part_count {} does not match {} file_parts",
                self.part_count,
                self.file_parts.len()
            )));
        }
        let expected = self.file_size.div_ceil(self.block_size);
        if self.part_count != expected {
            return Err(EngineError::Validation(format!(
                "part_count {} does not cover file_size {} with block_size {} (expected {expected})",
                self.part_count, self.file_size, self.block_size
            )));
        }
        if !is_hex_digest(&self.file_md5, HASH_HEX_LEN) {
            return Err(EngineError::Validation(format!(
                "file_md5 '{}' is not a {HASH_HEX_LEN} char hex digest",
                self.file_md5
            )));
        }
        if let Some((idx, _)) = self
            .file_parts
            .iter()
            .enumerate()
            .find(|(_, p)| !is_hex_digest(p, HASH_HEX_LEN))
        {
            return Err(EngineError::Validation(format!(
                "file_parts[{idx}] is not a {HASH_HEX_LEN} char hex digest"
            )));
        }
        Ok(())
    }

    pub fn content_hash(&self) -> &str {
        &self.file_md5
    }
}

pub fn is_hex_digest(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}
