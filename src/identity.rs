use std::path::Path;

pub const PEER_ID_LEN: usize = 20;

pub type Result<T> = std::result::Result<T, IdentityError>;

#[derive(Debug)]
pub enum IdentityError {
    Malformed { path: String },
    Random(String),
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    Write {
        path: String,
        source: std::io::Error,
    },
    Rename {
        from: String,
        to: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed { path } => {
                write!(f, "peer id file does not hold {PEER_ID_LEN} hex chars: {path}")
            }
            Self::Random(msg) => write!(f, "{msg}"),
            Self::CreateDir { path, .. } => write!(f, "failed creating directory {path}"),
            Self::Write { path, .. } => write!(f, "failed to write {path}"),
            Self::Rename { from, to, .. } => write!(f, "failed to rename {from} -> {to}"),
        }
    }
}

impl std::error::Error for IdentityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDir { source, .. } => Some(source),
            Self::Write { source, .. } => Some(source),
            Self::Rename { source, .. } => Some(source),
            Self::Malformed { .. } | Self::Random(_) => None,
        }
    }
}

pub fn is_valid_peer_id(value: &str) -> bool {
    value.len() == PEER_ID_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn generate_peer_id() -> Result<String> {
    let mut b = [0u8; PEER_ID_LEN / 2];
    getrandom::getrandom(&mut b)
        .map_err(|e| IdentityError::Random(format!("failed to generate peer id: {e}")))?;
    Ok(b.iter().map(|x| format!("{x:02x}")).collect())
}

/// Loads the node's peer id from `path`, creating it on first run.
///
/// Kept out of `config.toml` so a running node never rewrites a tracked file.
pub async fn load_or_create_peer_id(path: &Path) -> Result<String> {
    if let Ok(raw) = tokio::fs::read_to_string(path).await {
        let id = raw.trim().to_ascii_lowercase();
        if !is_valid_peer_id(&id) {
            return Err(IdentityError::Malformed {
                path: path.display().to_string(),
            });
        }
        return Ok(id);
    }

    let id = generate_peer_id()?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| IdentityError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, format!("{id}\n"))
        .await
        .map_err(|source| IdentityError::Write {
            path: tmp.display().to_string(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| IdentityError::Rename {
            from: tmp.display().to_string(),
            to: path.display().to_string(),
            source,
        })?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_id_is_created_once_and_reused() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("swarm-node-identity-{nanos}"));
        let path = dir.join("peer_id");

        let first = load_or_create_peer_id(&path).await.expect("create");
        assert!(is_valid_peer_id(&first));
        assert_eq!(first, first.to_ascii_lowercase());
        let second = load_or_create_peer_id(&path).await.expect("reload");
        assert_eq!(first, second);

        std::fs::write(&path, "nope").expect("corrupt");
        assert!(matches!(
            load_or_create_peer_id(&path).await,
            Err(IdentityError::Malformed { .. })
        ));
        let _ = std::fs::remove_dir_all(dir);
    }
}
