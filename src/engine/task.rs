//! Per-file task orchestrator.
//!
//! A running download is one collector task plus `max_workers` [`Worker`]s
//! joined by two bounded queues. The collector is the only writer of the
//! [`FileDescriptor`] while the run lasts; it persists a snapshot after every
//! completed block so a crash loses at most the blocks in flight.

use crate::engine::descriptor::{self, BlockState, FileDescriptor, TaskState};
use crate::engine::errors::{EngineError, StoreError};
use crate::engine::fetch::BlockFetcher;
use crate::engine::layout::{StorageLayout, ensure_dir, remove_path};
use crate::engine::manifest::Manifest;
use crate::engine::policy::{FetchPolicy, StopMode};
use crate::engine::worker::{Job, WorkResult, Worker, WorkerStats};
use crate::logging::redact_hex;
use serde::Serialize;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Collaborators shared by every task of one registry.
pub struct TaskContext {
    pub layout: StorageLayout,
    pub policy: FetchPolicy,
    pub fetcher: Arc<dyn BlockFetcher>,
}

/// Read-only view of a task, published by whoever last touched its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub content_hash: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub block_size: u64,
    pub block_count: u64,
    pub state: TaskState,
    pub state_code: u8,
    pub complete_blocks: usize,
    pub fetching_blocks: usize,
    pub failed_blocks: usize,
    pub downloaded_bytes: u64,
    pub fetch_time_ms: u64,
    pub running: bool,
    #[serde(skip)]
    pub completed: Vec<bool>,
}

impl TaskStatus {
    fn from_descriptor(d: &FileDescriptor, running: bool, transfer: Transfer) -> Self {
        let count = |state: BlockState| d.blocks.iter().filter(|b| b.state == state).count();
        Self {
            content_hash: d.content_hash.clone(),
            file_name: d.file_name.clone(),
            file_path: d.file_path.clone(),
            file_size: d.file_size,
            block_size: d.block_size,
            block_count: d.block_count,
            state: d.task_state,
            state_code: d.task_state.code(),
            complete_blocks: d.complete_count(),
            fetching_blocks: count(BlockState::Fetching),
            failed_blocks: count(BlockState::Failed),
            downloaded_bytes: transfer.bytes,
            fetch_time_ms: u64::try_from(transfer.fetch_time.as_millis()).unwrap_or(u64::MAX),
            running,
            completed: d.blocks.iter().map(|b| b.is_complete()).collect(),
        }
    }

    fn transfer(&self) -> Transfer {
        Transfer {
            bytes: self.downloaded_bytes,
            fetch_time: Duration::from_millis(self.fetch_time_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Transfer {
    bytes: u64,
    fetch_time: Duration,
}

#[derive(Debug)]
enum CollectorCommand {
    Pause,
    Resume,
    Stop,
}

struct RunHandles {
    control_tx: mpsc::Sender<CollectorCommand>,
    worker_stops: Vec<oneshot::Sender<()>>,
    workers: Vec<JoinHandle<WorkerStats>>,
    collector: JoinHandle<()>,
}

impl RunHandles {
    fn is_live(&self) -> bool {
        !self.collector.is_finished()
    }
}

pub struct FileTask {
    content_hash: String,
    ctx: Arc<TaskContext>,
    run: Mutex<Option<RunHandles>>,
    status_tx: Arc<watch::Sender<TaskStatus>>,
}

impl FileTask {
    /// Registers a locally held file under `<root>/share` for sharing.
    ///
    /// Returns `(file_name, content_hash)`.
    pub async fn create_share_task(
        layout: &StorageLayout,
        manifest_bytes: &[u8],
    ) -> Result<(String, String)> {
        let manifest = Manifest::parse(manifest_bytes)?;
        let file_path = layout.share_dir().join(&manifest.file_name);
        let meta = tokio::fs::metadata(&file_path)
            .await
            .map_err(|source| StoreError::ReadFile {
                path: file_path.clone(),
                source,
            })?;
        if !meta.is_file() || meta.len() != manifest.file_size {
            return Err(EngineError::Validation(format!(
                "'{}' is not a {} byte file",
                file_path.display(),
                manifest.file_size
            )));
        }

        let hash = manifest.content_hash().to_string();
        descriptor::save_manifest(layout, &hash, manifest_bytes).await?;
        let descriptor = FileDescriptor::from_manifest(&manifest, file_path, true, 0);
        descriptor.save(layout, &hash).await?;
        tracing::info!(
            content_hash = %redact_hex(&hash),
            file = %manifest.file_name,
            "share task created"
        );
        Ok((manifest.file_name, hash))
    }

    /// Prepares a download of `manifest_bytes` into `dest_dir`. The manifest is
    /// persisted before the descriptor so it survives a crash before `start`.
    pub async fn create_download_task(
        layout: &StorageLayout,
        max_workers: usize,
        content_hash: &str,
        dest_dir: &Path,
        manifest_bytes: &[u8],
    ) -> Result<()> {
        let manifest = Manifest::parse(manifest_bytes)?;
        if manifest.content_hash() != content_hash {
            return Err(EngineError::Validation(format!(
                "manifest describes {} instead of {content_hash}",
                manifest.content_hash()
            )));
        }
        ensure_dir(dest_dir).await?;
        descriptor::save_manifest(layout, content_hash, manifest_bytes).await?;
        let descriptor = FileDescriptor::from_manifest(
            &manifest,
            dest_dir.join(&manifest.file_name),
            false,
            max_workers,
        );
        descriptor.save(layout, content_hash).await?;
        tracing::info!(
            content_hash = %redact_hex(content_hash),
            file = %manifest.file_name,
            blocks = manifest.part_count,
            "download task created"
        );
        Ok(())
    }

    /// Attaches to the persisted descriptor of `content_hash` without starting it.
    pub async fn open(ctx: Arc<TaskContext>, content_hash: &str) -> Result<Self> {
        let descriptor = FileDescriptor::load(&ctx.layout, content_hash).await?;
        let status = TaskStatus::from_descriptor(&descriptor, false, Transfer::default());
        let (status_tx, _) = watch::channel(status);
        Ok(Self {
            content_hash: content_hash.to_string(),
            ctx,
            run: Mutex::new(None),
            status_tx: Arc::new(status_tx),
        })
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn status(&self) -> TaskStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    /// Loads the descriptor and launches workers plus the collector.
    ///
    /// A task whose blocks are all complete goes straight to `Share` without
    /// spawning anything. The lock is held for setup only.
    pub async fn start(&self, max_workers: usize, file_path: &Path) -> Result<()> {
        let mut run = self.run.lock().await;
        self.start_locked(&mut run, max_workers, file_path).await
    }

    async fn start_locked(
        &self,
        run: &mut Option<RunHandles>,
        max_workers: usize,
        file_path: &Path,
    ) -> Result<()> {
        if run.as_ref().is_some_and(RunHandles::is_live) {
            return Err(EngineError::InvalidTransition {
                from: self.status().state,
                to: TaskState::Download,
            });
        }
        *run = None;

        let layout = &self.ctx.layout;
        let mut descriptor = FileDescriptor::load(layout, &self.content_hash).await?;
        if descriptor.is_complete() {
            descriptor.transition(TaskState::Share)?;
            descriptor.save(layout, &self.content_hash).await?;
            self.publish(&descriptor, false);
            tracing::info!(content_hash = %redact_hex(&self.content_hash), "sharing complete file");
            return Ok(());
        }

        descriptor.transition(TaskState::Download)?;
        prepare_target(file_path, descriptor.file_size).await?;
        let workers = self
            .ctx
            .policy
            .effective_workers(max_workers, descriptor.block_size);
        descriptor.file_path = file_path.to_path_buf();
        descriptor.max_workers = max_workers;
        descriptor.save(layout, &self.content_hash).await?;

        let (job_tx, job_rx) = mpsc::channel::<Job>(workers);
        let (result_tx, result_rx) = mpsc::channel::<WorkResult>(workers);
        let jobs = Arc::new(Mutex::new(job_rx));
        let mut worker_stops = Vec::with_capacity(workers);
        let mut worker_joins = Vec::with_capacity(workers);
        for id in 0..workers {
            let (stop_tx, stop_rx) = oneshot::channel();
            let worker = Worker::new(
                id,
                self.content_hash.clone(),
                file_path,
                Arc::clone(&self.ctx.fetcher),
            );
            worker_joins.push(tokio::spawn(worker.run(
                Arc::clone(&jobs),
                result_tx.clone(),
                stop_rx,
            )));
            worker_stops.push(stop_tx);
        }
        drop(result_tx);

        let (control_tx, control_rx) = mpsc::channel(8);
        let transfer = self.status().transfer();
        self.publish_with(&descriptor, true, transfer);
        let collector = Collector {
            ctx: Arc::clone(&self.ctx),
            descriptor,
            job_tx: Some(job_tx),
            status_tx: Arc::clone(&self.status_tx),
            transfer,
        };
        let collector = tokio::spawn(collector.run(result_rx, control_rx));

        tracing::info!(
            content_hash = %redact_hex(&self.content_hash),
            workers,
            path = %file_path.display(),
            "download started"
        );
        *run = Some(RunHandles {
            control_tx,
            worker_stops,
            workers: worker_joins,
            collector,
        });
        Ok(())
    }

    /// Holds job issuance. A task that is not running is just marked `Pause`.
    pub async fn pause(&self) -> Result<()> {
        let run = self.run.lock().await;
        if let Some(handles) = run.as_ref().filter(|h| h.is_live()) {
            return send_command(handles, CollectorCommand::Pause).await;
        }
        self.set_idle_state(TaskState::Pause).await
    }

    /// Resumes issuance, starting the pipeline if the task is not running.
    pub async fn resume(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        if let Some(handles) = run.as_ref().filter(|h| h.is_live()) {
            return send_command(handles, CollectorCommand::Resume).await;
        }
        let descriptor = FileDescriptor::load(&self.ctx.layout, &self.content_hash).await?;
        self.start_locked(&mut run, descriptor.max_workers, &descriptor.file_path)
            .await
    }

    /// Signals every worker and the collector. With [`StopMode::Graceful`]
    /// this also waits for all of them to exit.
    pub async fn stop(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        let join = self.ctx.policy.stop_mode == StopMode::Graceful;
        if self.halt(&mut run, join).await {
            tracing::info!(content_hash = %redact_hex(&self.content_hash), "task stopped");
            return Ok(());
        }
        self.set_idle_state(TaskState::Stop).await
    }

    /// Stops the pipeline, waits for every worker and the collector to exit
    /// whatever the stop mode, then deletes `.catalog-root/<hash>` and, with
    /// `delete_data`, the data file.
    ///
    /// The run lock is held until the files are gone, so the task cannot be
    /// restarted in between. Calling it again after a failure is safe.
    pub async fn stop_and_remove(&self, delete_data: bool) -> Result<()> {
        let mut run = self.run.lock().await;
        self.halt(&mut run, true).await;
        if delete_data {
            let data_path = self.status().file_path;
            remove_path(&data_path, false).await?;
        }
        remove_path(&self.ctx.layout.task_dir(&self.content_hash), true).await?;
        Ok(())
    }

    /// Signals the current run, if any, and optionally joins it. Returns
    /// whether the collector was still live.
    async fn halt(&self, run: &mut Option<RunHandles>, join: bool) -> bool {
        let Some(handles) = run.take() else {
            return false;
        };
        let live = handles.is_live();
        let RunHandles {
            control_tx,
            worker_stops,
            workers,
            collector,
        } = handles;
        if live {
            let _ = control_tx.try_send(CollectorCommand::Stop);
        }
        // A full control queue still ends the collector once the sender is gone.
        drop(control_tx);
        for stop in worker_stops {
            let _ = stop.send(());
        }
        if join {
            for worker in workers {
                let _ = worker.await;
            }
            let _ = collector.await;
        }
        live
    }

    /// Reads a complete block for a peer. Only `Share` and `Download` tasks serve.
    pub async fn read_block(&self, index: usize) -> Result<Vec<u8>> {
        let status = self.status();
        if !matches!(status.state, TaskState::Share | TaskState::Download) {
            return Err(EngineError::Unavailable(format!(
                "task is in {:?} state",
                status.state
            )));
        }
        if !status.completed.get(index).copied().unwrap_or(false) {
            return Err(EngineError::Unavailable(format!("block {index} is not complete")));
        }
        let offset = index as u64 * status.block_size;
        let length = status.block_size.min(status.file_size - offset);
        let path = status.file_path;
        let read = async {
            let mut file = tokio::fs::File::open(&path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; length as usize];
            file.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        }
        .await;
        read.map_err(|source| EngineError::Store(StoreError::ReadFile { path, source }))
    }

    async fn set_idle_state(&self, to: TaskState) -> Result<()> {
        let layout = &self.ctx.layout;
        let mut descriptor = FileDescriptor::load(layout, &self.content_hash).await?;
        if descriptor.task_state == to {
            self.publish(&descriptor, false);
            return Ok(());
        }
        descriptor.transition(to)?;
        descriptor.save(layout, &self.content_hash).await?;
        self.publish(&descriptor, false);
        Ok(())
    }

    fn publish(&self, descriptor: &FileDescriptor, running: bool) {
        let transfer = self.status().transfer();
        self.publish_with(descriptor, running, transfer);
    }

    fn publish_with(&self, descriptor: &FileDescriptor, running: bool, transfer: Transfer) {
        self.status_tx
            .send_replace(TaskStatus::from_descriptor(descriptor, running, transfer));
    }
}

async fn send_command(handles: &RunHandles, cmd: CollectorCommand) -> Result<()> {
    handles
        .control_tx
        .send(cmd)
        .await
        .map_err(|_| EngineError::Unavailable("collector has exited".to_string()))
}

/// Makes sure the download target exists and has its final length.
async fn prepare_target(path: &Path, file_size: u64) -> Result<()> {
    if tokio::fs::metadata(path).await.is_err() {
        tracing::warn!(path = %path.display(), "download target missing; recreating it");
        if let Some(parent) = path.parent() {
            ensure_dir(parent).await?;
        }
    }
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|source| StoreError::WriteFile {
            path: path.to_path_buf(),
            source,
        })?;
    let len = file
        .metadata()
        .await
        .map_err(|source| StoreError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    if len < file_size {
        file.set_len(file_size)
            .await
            .map_err(|source| StoreError::WriteFile {
                path: path.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Finished,
}

struct Collector {
    ctx: Arc<TaskContext>,
    descriptor: FileDescriptor,
    job_tx: Option<mpsc::Sender<Job>>,
    status_tx: Arc<watch::Sender<TaskStatus>>,
    transfer: Transfer,
}

impl Collector {
    async fn run(
        mut self,
        mut results: mpsc::Receiver<WorkResult>,
        mut control: mpsc::Receiver<CollectorCommand>,
    ) {
        let mut tick = interval(self.ctx.policy.schedule_every.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = control.recv() => match cmd {
                    Some(CollectorCommand::Pause) => self.set_state(TaskState::Pause).await,
                    Some(CollectorCommand::Resume) => self.set_state(TaskState::Download).await,
                    Some(CollectorCommand::Stop) | None => {
                        self.set_state(TaskState::Stop).await;
                        break;
                    }
                },
                Some(result) = results.recv() => {
                    if self.on_result(result).await == Flow::Finished {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if self.on_tick().await == Flow::Finished {
                        break;
                    }
                }
            }
        }
        self.job_tx = None;
        self.publish(false);
    }

    async fn on_tick(&mut self) -> Flow {
        if self.descriptor.task_state != TaskState::Download {
            return Flow::Continue;
        }
        let Some(job_tx) = self.job_tx.clone() else {
            return Flow::Continue;
        };
        let now = Instant::now();
        let policy = &self.ctx.policy;
        let mut issued = 0;
        while issued < policy.jobs_per_tick.max(1) {
            let Some(index) = self
                .descriptor
                .blocks
                .iter()
                .position(|b| b.is_schedulable(now, policy))
            else {
                break;
            };
            let Some((offset, length)) = self.descriptor.block_range(index) else {
                break;
            };
            let job = Job {
                block_index: index,
                offset,
                length,
                hash: self.descriptor.blocks[index].hash.clone(),
            };
            match job_tx.try_send(job) {
                Ok(()) => {
                    self.descriptor.blocks[index].begin_fetch(now);
                    issued += 1;
                }
                // Workers saturated: skip the rest of this tick.
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => break,
            }
        }
        if issued > 0 {
            self.publish(true);
            return Flow::Continue;
        }

        let blocks = &self.descriptor.blocks;
        let idle = !blocks.iter().any(|b| {
            b.state == BlockState::Fetching || b.is_schedulable(now, policy)
        });
        let waiting = blocks
            .iter()
            .any(|b| b.state == BlockState::Failed && !b.is_exhausted(policy));
        if idle && !waiting && !self.descriptor.is_complete() {
            let exhausted = blocks.iter().filter(|b| b.is_exhausted(policy)).count();
            tracing::error!(
                content_hash = %redact_hex(&self.descriptor.content_hash),
                exhausted,
                "download gave up: remaining blocks exceeded their failure limit"
            );
            self.set_state(TaskState::Stop).await;
            return Flow::Finished;
        }
        Flow::Continue
    }

    async fn on_result(&mut self, result: WorkResult) -> Flow {
        let policy = &self.ctx.policy;
        let Some(block) = self.descriptor.blocks.get_mut(result.block_index) else {
            tracing::warn!(block = result.block_index, "result for unknown block");
            return Flow::Continue;
        };
        if block.state != BlockState::Fetching {
            tracing::debug!(block = result.block_index, "ignoring stale result");
            return Flow::Continue;
        }

        if result.is_success() {
            block.mark_complete();
            self.transfer.bytes += result.data.len() as u64;
            self.transfer.fetch_time += result.fetch_time;
            tracing::debug!(
                worker = result.worker_id,
                block = result.block_index,
                bytes = result.data.len(),
                "block complete"
            );
            if self.descriptor.is_complete() && self.descriptor.transition(TaskState::Share).is_ok()
            {
                tracing::info!(
                    content_hash = %redact_hex(&self.descriptor.content_hash),
                    bytes = self.transfer.bytes,
                    "download complete; sharing"
                );
            }
            self.persist().await;
            if self.descriptor.task_state == TaskState::Share {
                return Flow::Finished;
            }
        } else {
            block.mark_failed(Instant::now(), policy);
            if block.is_exhausted(policy) {
                tracing::warn!(
                    block = result.block_index,
                    failures = block.fail_count,
                    "block exceeded its failure limit"
                );
            }
        }
        self.publish(true);
        Flow::Continue
    }

    async fn set_state(&mut self, to: TaskState) {
        if self.descriptor.task_state == to {
            return;
        }
        if let Err(err) = self.descriptor.transition(to) {
            tracing::warn!(error = %err, "ignoring task command");
            return;
        }
        self.persist().await;
        self.publish(true);
    }

    async fn persist(&self) {
        let hash = &self.descriptor.content_hash;
        if let Err(err) = self.descriptor.save(&self.ctx.layout, hash).await {
            tracing::error!(
                content_hash = %redact_hex(hash),
                error = %err,
                "failed to persist task snapshot"
            );
        }
    }

    fn publish(&self, running: bool) {
        self.status_tx.send_replace(TaskStatus::from_descriptor(
            &self.descriptor,
            running,
            self.transfer,
        ));
    }
}
