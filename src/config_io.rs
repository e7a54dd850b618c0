use crate::config::Config;
use std::path::Path;

pub type Result<T> = std::result::Result<T, ConfigIoError>;

#[derive(Debug)]
pub enum ConfigIoError {
    CreateDefault {
        path: String,
        source: Box<ConfigIoError>,
    },
    Read {
        path: String,
        source: std::io::Error,
    },
    ParseToml {
        path: String,
        source: toml::de::Error,
    },
    SerializeToml {
        source: toml::ser::Error,
    },
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    Write {
        path: String,
        source: std::io::Error,
    },
    Invalid {
        path: String,
        reason: String,
    },
}

impl std::fmt::Display for ConfigIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateDefault { path, .. } => {
                write!(f, "failed to create default config at {path}")
            }
            Self::Read { path, .. } => write!(f, "failed reading config file {path}"),
            Self::ParseToml { path, .. } => write!(f, "invalid TOML in {path}"),
            Self::SerializeToml { .. } => write!(f, "failed serializing config to TOML"),
            Self::CreateDir { path, .. } => write!(f, "failed creating directory {path}"),
            Self::Write { path, .. } => write!(f, "failed writing config file {path}"),
            Self::Invalid { path, reason } => write!(f, "invalid config in {path}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDefault { source, .. } => Some(source.as_ref()),
            Self::Read { source, .. } => Some(source),
            Self::ParseToml { source, .. } => Some(source),
            Self::SerializeToml { source } => Some(source),
            Self::CreateDir { source, .. } => Some(source),
            Self::Write { source, .. } => Some(source),
            Self::Invalid { .. } => None,
        }
    }
}

/// Reads `path`, or writes the default config there and returns it.
pub async fn load_or_create_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();

    if !path.exists() {
        let default_cfg = Config::default();
        save_config(path, &default_cfg)
            .await
            .map_err(|source| ConfigIoError::CreateDefault {
                path: path.display().to_string(),
                source: Box::new(source),
            })?;
        return Ok(default_cfg);
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigIoError::Read {
            path: path.display().to_string(),
            source,
        })?;

    let cfg: Config = toml::from_str(&content).map_err(|source| ConfigIoError::ParseToml {
        path: path.display().to_string(),
        source,
    })?;
    validate(&cfg).map_err(|reason| ConfigIoError::Invalid {
        path: path.display().to_string(),
        reason,
    })?;

    Ok(cfg)
}

pub async fn save_config(path: impl AsRef<Path>, cfg: &Config) -> Result<()> {
    let path = path.as_ref();

    let toml_string =
        toml::to_string_pretty(cfg).map_err(|source| ConfigIoError::SerializeToml { source })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ConfigIoError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
    }

    let tmp = format!("{}.tmp", path.display());
    tokio::fs::write(&tmp, toml_string)
        .await
        .map_err(|source| ConfigIoError::Write {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| ConfigIoError::Write {
            path: path.display().to_string(),
            source,
        })?;

    Ok(())
}

fn validate(cfg: &Config) -> std::result::Result<(), String> {
    if cfg.general.root_path.trim().is_empty() {
        return Err("general.root_path must not be empty".to_string());
    }
    let peer_id = &cfg.general.peer_id;
    if !peer_id.is_empty() && !crate::identity::is_valid_peer_id(peer_id) {
        return Err(format!("general.peer_id '{peer_id}' is not 20 hex chars"));
    }
    if cfg.node.max_file_num == 0 {
        return Err("node.max_file_num must be positive".to_string());
    }
    if let Some(bad) = cfg.bt.seed_peers.iter().find(|p| !p.contains(':')) {
        return Err(format!("bt.seed_peers entry '{bad}' is not host:port"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("swarm-node-config-{tag}-{nanos}"))
    }

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = temp_dir("create");
        let path = dir.join("config.toml");
        let cfg = load_or_create_config(&path).await.expect("create");
        assert_eq!(cfg, Config::default());
        let written = std::fs::read_to_string(&path).expect("read");
        assert!(written.contains("[tracker]"));

        let again = load_or_create_config(&path).await.expect("reload");
        assert_eq!(again, cfg);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn malformed_and_invalid_configs_are_rejected() {
        let dir = temp_dir("invalid");
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("config.toml");

        std::fs::write(&path, "[general\n").expect("write");
        let err = load_or_create_config(&path).await.expect_err("bad toml");
        assert!(matches!(err, ConfigIoError::ParseToml { .. }));

        std::fs::write(&path, "[general]\npeer_id = \"xyz\"\n").expect("write");
        let err = load_or_create_config(&path).await.expect_err("bad peer id");
        assert!(matches!(err, ConfigIoError::Invalid { .. }));
        let _ = std::fs::remove_dir_all(dir);
    }
}
