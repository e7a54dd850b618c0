use anyhow::Context as _;
use fs2::FileExt as _;
use std::{fs::OpenOptions, path::Path};

/// File name of the lock inside `<root>/.catalog-root`.
pub const LOCK_FILE: &str = "node.lock";

/// Advisory lock that keeps two nodes from sharing one root directory.
/// Released by the OS when the process exits, however it exits.
#[derive(Debug)]
pub struct SingleInstanceLock {
    _file: std::fs::File,
    path: std::path::PathBuf,
}

impl SingleInstanceLock {
    pub fn acquire(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file, path }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(anyhow::anyhow!(
                "another swarm-node owns this root (lock held at {})",
                path.display()
            )),
            Err(e) => Err(anyhow::anyhow!(e))
                .with_context(|| format!("failed to lock {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_root_fails_until_first_is_dropped() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("swarm-node-lock-{nanos}"));
        let path = dir.join(LOCK_FILE);

        let first = SingleInstanceLock::acquire(&path).expect("first lock");
        assert_eq!(first.path(), path.as_path());
        let err = SingleInstanceLock::acquire(&path).expect_err("second lock");
        assert!(err.to_string().contains("another swarm-node"));
        drop(first);
        SingleInstanceLock::acquire(&path).expect("relock");
        let _ = std::fs::remove_dir_all(dir);
    }
}
