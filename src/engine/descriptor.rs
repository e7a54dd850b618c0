use crate::engine::errors::{EngineError, StoreError};
use crate::engine::layout::{StorageLayout, ensure_dir, write_atomic};
use crate::engine::manifest::Manifest;
use crate::engine::policy::FetchPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::time::Instant;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Unfetched,
    Fetching,
    Complete,
    Failed,
}

/// In-memory block record. Carries the retry bookkeeping that the on-disk
/// [`PersistedBlockFlag`] drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub hash: String,
    pub state: BlockState,
    pub fail_count: u32,
    pub last_attempt: Option<Instant>,
    window_started: Option<Instant>,
    window_failures: u32,
}

impl Block {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            state: BlockState::Unfetched,
            fail_count: 0,
            last_attempt: None,
            window_started: None,
            window_failures: 0,
        }
    }

    pub fn completed(hash: impl Into<String>) -> Self {
        Self {
            state: BlockState::Complete,
            ..Self::new(hash)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == BlockState::Complete
    }

    /// Gave up on this block for good (only with a total failure cap).
    pub fn is_exhausted(&self, policy: &FetchPolicy) -> bool {
        self.state == BlockState::Failed
            && policy
                .max_block_failures
                .is_some_and(|max| self.fail_count >= max)
    }

    /// Whether the scheduler may hand this block to a worker at `now`.
    pub fn is_schedulable(&self, now: Instant, policy: &FetchPolicy) -> bool {
        match self.state {
            BlockState::Unfetched => true,
            BlockState::Fetching | BlockState::Complete => false,
            BlockState::Failed => {
                if self.is_exhausted(policy) {
                    return false;
                }
                self.window_failures < policy.fail_ceiling || self.window_elapsed(now, policy)
            }
        }
    }

    pub fn begin_fetch(&mut self, now: Instant) {
        self.state = BlockState::Fetching;
        self.last_attempt = Some(now);
    }

    pub fn mark_complete(&mut self) {
        self.state = BlockState::Complete;
    }

    pub fn mark_failed(&mut self, now: Instant, policy: &FetchPolicy) {
        self.state = BlockState::Failed;
        self.fail_count = self.fail_count.saturating_add(1);
        self.last_attempt = Some(now);
        if self.window_started.is_none() || self.window_elapsed(now, policy) {
            self.window_started = Some(now);
            self.window_failures = 1;
        } else {
            self.window_failures = self.window_failures.saturating_add(1);
        }
    }

    fn window_elapsed(&self, now: Instant, policy: &FetchPolicy) -> bool {
        match self.window_started {
            Some(started) => now.saturating_duration_since(started) >= policy.fail_window,
            None => true,
        }
    }
}

/// Two-state block flag as written to the snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedBlockFlag {
    pub md5: String,
    pub bk: u8,
}

impl From<&Block> for PersistedBlockFlag {
    fn from(block: &Block) -> Self {
        Self {
            md5: block.hash.clone(),
            bk: u8::from(block.is_complete()),
        }
    }
}

impl TryFrom<PersistedBlockFlag> for Block {
    type Error = StoreError;

    fn try_from(flag: PersistedBlockFlag) -> Result<Self> {
        match flag.bk {
            0 => Ok(Block::new(flag.md5)),
            1 => Ok(Block::completed(flag.md5)),
            other => Err(StoreError::Invalid(format!(
                "block flag must be 0 or 1, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    NoShare,
    Download,
    Stop,
    Pause,
    Share,
}

impl TaskState {
    /// Numeric code used by status endpoints.
    pub fn code(self) -> u8 {
        match self {
            Self::NoShare => 0,
            Self::Download => 1,
            Self::Stop => 2,
            Self::Pause => 3,
            Self::Share => 4,
        }
    }

    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (NoShare, Stop)
                | (Stop, Pause)
                | (Pause, Stop)
                | (Pause, Download)
                | (Stop, Download)
                | (Download, Pause)
                | (Download, Stop)
                | (Download, Download)
                | (Download, Share)
                | (Share, Stop)
                | (Stop, Share)
                | (Pause, Share)
                | (Share, Share)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub manifest_version: String,
    pub content_type: String,
    pub content_hash: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub block_size: u64,
    pub block_count: u64,
    pub blocks: Vec<Block>,
    pub task_state: TaskState,
    pub max_workers: usize,
}

impl FileDescriptor {
    /// Builds a descriptor in `Stop` state. `complete` pre-marks every block
    /// (a locally owned file being shared).
    pub fn from_manifest(
        manifest: &Manifest,
        file_path: PathBuf,
        complete: bool,
        max_workers: usize,
    ) -> Self {
        let blocks = manifest
            .file_parts
            .iter()
            .map(|hash| {
                if complete {
                    Block::completed(hash.clone())
                } else {
                    Block::new(hash.clone())
                }
            })
            .collect();
        Self {
            manifest_version: manifest.version.clone(),
            content_type: manifest.content_type.clone(),
            content_hash: manifest.file_md5.clone(),
            file_name: manifest.file_name.clone(),
            file_path,
            file_size: manifest.file_size,
            block_size: manifest.block_size,
            block_count: manifest.part_count,
            blocks,
            task_state: TaskState::Stop,
            max_workers,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.file_size == 0 || self.block_count == 0 || self.block_size == 0 {
            return Err(StoreError::Invalid(format!(
                "file_size={}, block_count={}, block_size={} must all be positive",
                self.file_size, self.block_count, self.block_size
            )));
        }
        if self.blocks.len() as u64 != self.block_count {
            return Err(StoreError::Invalid(format!(
                "{} blocks recorded for block_count {}",
                self.blocks.len(),
                self.block_count
            )));
        }
        Ok(())
    }

    /// Byte offset and length of block `index`; the last block may be short.
    pub fn block_range(&self, index: usize) -> Option<(u64, u64)> {
        if index as u64 >= self.block_count {
            return None;
        }
        let offset = index as u64 * self.block_size;
        if offset >= self.file_size {
            return None;
        }
        Some((offset, self.block_size.min(self.file_size - offset)))
    }

    pub fn complete_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_complete()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(Block::is_complete)
    }

    pub fn transition(&mut self, to: TaskState) -> std::result::Result<(), EngineError> {
        if !self.task_state.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                from: self.task_state,
                to,
            });
        }
        self.task_state = to;
        Ok(())
    }

    pub fn to_snapshot(&self) -> DescriptorSnapshot {
        DescriptorSnapshot {
            version: self.manifest_version.clone(),
            content_type: self.content_type.clone(),
            file_md5: self.content_hash.clone(),
            file_name: self.file_name.clone(),
            file_path: self.file_path.clone(),
            file_size: self.file_size,
            block_size: self.block_size,
            part_count: self.block_count,
            task_state: self.task_state,
            max_workers: self.max_workers,
            file_parts: self.blocks.iter().map(PersistedBlockFlag::from).collect(),
        }
    }

    pub fn from_snapshot(snapshot: DescriptorSnapshot) -> Result<Self> {
        let blocks = snapshot
            .file_parts
            .into_iter()
            .map(Block::try_from)
            .collect::<Result<Vec<_>>>()?;
        let descriptor = Self {
            manifest_version: snapshot.version,
            content_type: snapshot.content_type,
            content_hash: snapshot.file_md5,
            file_name: snapshot.file_name,
            file_path: snapshot.file_path,
            file_size: snapshot.file_size,
            block_size: snapshot.block_size,
            block_count: snapshot.part_count,
            blocks,
            task_state: snapshot.task_state,
            max_workers: snapshot.max_workers,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Writes the snapshot to `<catalog-root>/<hash>/<hash>.snapshot`.
    pub async fn save(&self, layout: &StorageLayout, content_hash: &str) -> Result<()> {
        self.validate()?;
        ensure_dir(&layout.task_dir(content_hash)).await?;
        let bytes = serde_json::to_vec_pretty(&self.to_snapshot())
            .map_err(|source| StoreError::Serialize { source })?;
        write_atomic(&layout.snapshot_path(content_hash), &bytes).await
    }

    pub async fn load(layout: &StorageLayout, content_hash: &str) -> Result<Self> {
        let dir = layout.task_dir(content_hash);
        if !dir.is_dir() {
            return Err(StoreError::NotFound { path: dir });
        }
        let path = layout.snapshot_path(content_hash);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| StoreError::ReadFile {
                path: path.clone(),
                source,
            })?;
        let snapshot: DescriptorSnapshot = serde_json::from_slice(&bytes)
            .map_err(|source| StoreError::Parse { path, source })?;
        Self::from_snapshot(snapshot)
    }
}

/// Snapshot file schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DescriptorSnapshot {
    pub version: String,
    #[serde(rename = "contenttype")]
    pub content_type: String,
    pub file_md5: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub block_size: u64,
    pub part_count: u64,
    pub task_state: TaskState,
    pub max_workers: usize,
    pub file_parts: Vec<PersistedBlockFlag>,
}

pub async fn save_manifest(layout: &StorageLayout, content_hash: &str, bytes: &[u8]) -> Result<()> {
    ensure_dir(&layout.task_dir(content_hash)).await?;
    write_atomic(&layout.manifest_path(content_hash), bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::errors::ErrorKind;
    use std::time::Duration;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("swarm-node-descriptor-{tag}-{nanos}"));
        p
    }

    const HASH: &str = "0123456789abcdef0123456789abcdef";

    fn sample_descriptor() -> FileDescriptor {
        FileDescriptor {
            manifest_version: "1.0".to_string(),
            content_type: "singlefile".to_string(),
            content_hash: HASH.to_string(),
            file_name: "a.bin".to_string(),
            file_path: PathBuf::from("/tmp/a.bin"),
            file_size: 1_048_576,
            block_size: 524_288,
            block_count: 2,
            blocks: vec![
                Block::completed("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
                Block::new("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
            ],
            task_state: TaskState::Download,
            max_workers: 4,
        }
    }

    #[tokio::test]
    async fn save_and_load_roundtrip_keeps_flags_and_resets_counters() {
        let root = temp_dir("roundtrip");
        let layout = StorageLayout::new(&root);
        let policy = FetchPolicy::default();
        let now = Instant::now();

        let mut d = sample_descriptor();
        d.blocks[1].begin_fetch(now);
        d.blocks[1].mark_failed(now, &policy);
        d.save(&layout, HASH).await.expect("save");

        let loaded = FileDescriptor::load(&layout, HASH).await.expect("load");
        assert_eq!(loaded.content_hash, d.content_hash);
        assert_eq!(loaded.block_count, 2);
        assert_eq!(loaded.block_size, d.block_size);
        assert_eq!(loaded.file_size, d.file_size);
        assert_eq!(loaded.task_state, TaskState::Download);
        assert!(loaded.blocks[0].is_complete());
        assert_eq!(loaded.blocks[1].state, BlockState::Unfetched);
        assert_eq!(loaded.blocks[1].fail_count, 0);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn in_flight_blocks_persist_as_not_complete() {
        let root = temp_dir("inflight");
        let layout = StorageLayout::new(&root);
        let mut d = sample_descriptor();
        d.blocks[1].begin_fetch(Instant::now());
        d.save(&layout, HASH).await.expect("save");

        let snap = d.to_snapshot();
        assert_eq!(snap.file_parts[0].bk, 1);
        assert_eq!(snap.file_parts[1].bk, 0);

        let loaded = FileDescriptor::load(&layout, HASH).await.expect("load");
        assert_eq!(loaded.blocks[1].state, BlockState::Unfetched);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn saving_twice_is_byte_identical() {
        let root = temp_dir("idempotent");
        let layout = StorageLayout::new(&root);
        let d = sample_descriptor();
        d.save(&layout, HASH).await.expect("save 1");
        let first = std::fs::read(layout.snapshot_path(HASH)).expect("read 1");
        d.save(&layout, HASH).await.expect("save 2");
        let second = std::fs::read(layout.snapshot_path(HASH)).expect("read 2");
        assert_eq!(first, second);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn save_rejects_non_positive_sizes_and_length_mismatch() {
        let root = temp_dir("invalid");
        let layout = StorageLayout::new(&root);

        let mut d = sample_descriptor();
        d.block_size = 0;
        let err = d.save(&layout, HASH).await.expect_err("zero block size");
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut d = sample_descriptor();
        d.blocks.pop();
        let err = d.save(&layout, HASH).await.expect_err("short blocks");
        assert_eq!(err.kind(), ErrorKind::Validation);

        assert!(!layout.snapshot_path(HASH).exists());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn load_reports_missing_malformed_and_mistyped_snapshots() {
        let root = temp_dir("load-errors");
        let layout = StorageLayout::new(&root);

        let err = FileDescriptor::load(&layout, HASH).await.expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        sample_descriptor().save(&layout, HASH).await.expect("save");
        std::fs::write(layout.snapshot_path(HASH), b"{not-json").expect("corrupt");
        let err = FileDescriptor::load(&layout, HASH).await.expect_err("malformed");
        assert_eq!(err.kind(), ErrorKind::Parse);

        let mut v = serde_json::to_value(sample_descriptor().to_snapshot()).expect("value");
        v["block_size"] = serde_json::json!("524288");
        std::fs::write(layout.snapshot_path(HASH), v.to_string()).expect("mistyped");
        let err = FileDescriptor::load(&layout, HASH).await.expect_err("mistyped");
        assert_eq!(err.kind(), ErrorKind::Parse);

        let mut v = serde_json::to_value(sample_descriptor().to_snapshot()).expect("value");
        v["file_parts"][0]["bk"] = serde_json::json!(2);
        std::fs::write(layout.snapshot_path(HASH), v.to_string()).expect("bad flag");
        let err = FileDescriptor::load(&layout, HASH).await.expect_err("bad flag");
        assert_eq!(err.kind(), ErrorKind::Validation);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn block_range_shortens_last_block() {
        let mut d = sample_descriptor();
        d.file_size = 1_000_000;
        assert_eq!(d.block_range(0), Some((0, 524_288)));
        assert_eq!(d.block_range(1), Some((524_288, 475_712)));
        assert_eq!(d.block_range(2), None);
    }

    #[test]
    fn failing_ceiling_holds_block_until_window_passes() {
        let policy = FetchPolicy::default();
        let start = Instant::now();
        let mut block = Block::new("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

        for i in 0..10 {
            let at = start + Duration::from_secs(i);
            assert!(block.is_schedulable(at, &policy), "attempt {i}");
            block.begin_fetch(at);
            block.mark_failed(at, &policy);
        }
        assert_eq!(block.fail_count, 10);
        assert!(!block.is_schedulable(start + Duration::from_secs(30), &policy));
        assert!(!block.is_schedulable(start + Duration::from_secs(59), &policy));
        assert!(block.is_schedulable(start + Duration::from_secs(60), &policy));

        // The total counter survives the new window.
        let later = start + Duration::from_secs(61);
        block.begin_fetch(later);
        block.mark_failed(later, &policy);
        assert_eq!(block.fail_count, 11);
        assert!(block.is_schedulable(later, &policy));
    }

    #[test]
    fn total_failure_cap_exhausts_block() {
        let policy = FetchPolicy {
            max_block_failures: Some(2),
            ..FetchPolicy::default()
        };
        let now = Instant::now();
        let mut block = Block::new("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        block.begin_fetch(now);
        block.mark_failed(now, &policy);
        assert!(!block.is_exhausted(&policy));
        block.begin_fetch(now);
        block.mark_failed(now, &policy);
        assert!(block.is_exhausted(&policy));
        assert!(!block.is_schedulable(now + Duration::from_secs(3600), &policy));
    }

    #[test]
    fn task_state_transitions_follow_lifecycle() {
        use TaskState::*;
        assert!(NoShare.can_transition_to(Stop));
        assert!(Stop.can_transition_to(Pause));
        assert!(Pause.can_transition_to(Download));
        assert!(Download.can_transition_to(Share));
        assert!(Share.can_transition_to(Stop));
        assert!(!NoShare.can_transition_to(Download));
        assert!(!Share.can_transition_to(Download));
        assert_eq!(Share.code(), 4);

        let mut d = sample_descriptor();
        d.task_state = Share;
        let err = d.transition(Download).expect_err("share cannot download");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
