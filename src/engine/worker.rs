use crate::engine::fetch::{BlockFetcher, FetchFailure, FetchRequest};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;

/// One block to fetch. Consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub block_index: usize,
    pub offset: u64,
    pub length: u64,
    pub hash: String,
}

/// Outcome of one [`Job`]. An empty `data` payload means the attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkResult {
    pub worker_id: usize,
    pub block_index: usize,
    pub offset: u64,
    pub length: u64,
    pub data: Vec<u8>,
    pub started_at: Instant,
    pub fetch_time: Duration,
}

impl WorkResult {
    pub fn is_success(&self) -> bool {
        !self.data.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub total_bytes: u64,
    pub total_fetch_time: Duration,
    pub error_count: u64,
}

/// Receiving half of the job queue, shared by every worker of a task.
pub type JobQueue = Arc<Mutex<mpsc::Receiver<Job>>>;

pub struct Worker {
    id: usize,
    content_hash: String,
    target_path: PathBuf,
    fetcher: Arc<dyn BlockFetcher>,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(
        id: usize,
        content_hash: impl Into<String>,
        target_path: impl Into<PathBuf>,
        fetcher: Arc<dyn BlockFetcher>,
    ) -> Self {
        Self {
            id,
            content_hash: content_hash.into(),
            target_path: target_path.into(),
            fetcher,
            stats: WorkerStats::default(),
        }
    }

    /// Pulls jobs until stopped or until the job queue closes.
    ///
    /// A stop signal ends the loop at once, abandoning the job in hand.
    pub async fn run(
        mut self,
        jobs: JobQueue,
        results: mpsc::Sender<WorkResult>,
        mut stop: oneshot::Receiver<()>,
    ) -> WorkerStats {
        loop {
            let job = tokio::select! {
                biased;
                _ = &mut stop => break,
                job = next_job(&jobs) => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let result = tokio::select! {
                biased;
                _ = &mut stop => break,
                result = self.process(job) => result,
            };

            tokio::select! {
                biased;
                _ = &mut stop => break,
                sent = results.send(result) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(
            worker = self.id,
            bytes = self.stats.total_bytes,
            errors = self.stats.error_count,
            "worker stopped"
        );
        self.stats
    }

    async fn process(&mut self, job: Job) -> WorkResult {
        let started_at = Instant::now();
        let outcome = self.fetch_and_store(&job).await;
        let fetch_time = started_at.elapsed();
        let data = match outcome {
            Ok(data) => {
                self.stats.total_bytes += data.len() as u64;
                self.stats.total_fetch_time += fetch_time;
                data
            }
            Err(err) => {
                self.stats.error_count += 1;
                if crate::logging::warn_throttled("block_fetch_failed", Duration::from_secs(5)) {
                    tracing::warn!(
                        worker = self.id,
                        content_hash = %crate::logging::redact_hex(&self.content_hash),
                        block = job.block_index,
                        error = %err,
                        "block fetch failed"
                    );
                }
                Vec::new()
            }
        };
        WorkResult {
            worker_id: self.id,
            block_index: job.block_index,
            offset: job.offset,
            length: job.length,
            data,
            started_at,
            fetch_time,
        }
    }

    async fn fetch_and_store(&self, job: &Job) -> Result<Vec<u8>, FetchFailure> {
        let req = FetchRequest {
            content_hash: self.content_hash.clone(),
            block_index: job.block_index,
            offset: job.offset,
            length: job.length,
        };
        let data = self.fetcher.fetch(&req).await?;
        if data.len() as u64 != job.length {
            return Err(FetchFailure::Length {
                expected: job.length,
                actual: data.len() as u64,
            });
        }
        let actual = format!("{:x}", md5::compute(&data));
        if actual != job.hash {
            return Err(FetchFailure::HashMismatch {
                expected: job.hash.clone(),
                actual,
            });
        }
        write_block(&self.target_path, job.offset, &data)
            .await
            .map_err(FetchFailure::Write)?;
        Ok(data)
    }
}

async fn next_job(jobs: &JobQueue) -> Option<Job> {
    jobs.lock().await.recv().await
}

pub async fn write_block(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{MemoryFetcher, sample_bytes, temp_dir};

    fn job_for(data: &[u8], index: usize, block: usize) -> Job {
        let start = index * block;
        let end = (start + block).min(data.len());
        Job {
            block_index: index,
            offset: start as u64,
            length: (end - start) as u64,
            hash: format!("{:x}", md5::compute(&data[start..end])),
        }
    }

    fn spawn_worker(
        target: PathBuf,
        fetcher: Arc<dyn BlockFetcher>,
    ) -> (
        mpsc::Sender<Job>,
        mpsc::Receiver<WorkResult>,
        oneshot::Sender<()>,
        tokio::task::JoinHandle<WorkerStats>,
    ) {
        let (job_tx, job_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = Worker::new(7, "0123456789abcdef0123456789abcdef", target, fetcher);
        let join = tokio::spawn(worker.run(Arc::new(Mutex::new(job_rx)), result_tx, stop_rx));
        (job_tx, result_rx, stop_tx, join)
    }

    #[tokio::test]
    async fn verified_block_is_written_at_its_offset() {
        let root = temp_dir("worker-write");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let target = root.join("out.bin");
        let data = sample_bytes(300);
        let fetcher = Arc::new(MemoryFetcher::new(data.clone()));

        let (job_tx, mut result_rx, stop_tx, join) = spawn_worker(target.clone(), fetcher);
        job_tx.send(job_for(&data, 1, 128)).await.expect("send job");
        let result = result_rx.recv().await.expect("result");
        assert!(result.is_success());
        assert_eq!(result.worker_id, 7);
        assert_eq!(result.block_index, 1);
        assert_eq!(result.data, data[128..256].to_vec());

        let written = tokio::fs::read(&target).await.expect("read target");
        assert_eq!(&written[128..256], &data[128..256]);

        let _ = stop_tx.send(());
        let stats = join.await.expect("join");
        assert_eq!(stats.total_bytes, 128);
        assert_eq!(stats.error_count, 0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn hash_mismatch_yields_empty_payload() {
        let root = temp_dir("worker-mismatch");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let data = sample_bytes(256);
        let fetcher = Arc::new(MemoryFetcher::new(data.clone()));

        let (job_tx, mut result_rx, stop_tx, join) = spawn_worker(root.join("out.bin"), fetcher);
        let mut job = job_for(&data, 0, 128);
        job.hash = "ffffffffffffffffffffffffffffffff".to_string();
        job_tx.send(job).await.expect("send job");
        let result = result_rx.recv().await.expect("result");
        assert!(!result.is_success());

        let _ = stop_tx.send(());
        let stats = join.await.expect("join");
        assert_eq!(stats.error_count, 1);
        assert!(!root.join("out.bin").exists());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn fetch_failure_is_reported_not_raised() {
        let root = temp_dir("worker-fail");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let data = sample_bytes(256);
        let fetcher = Arc::new(MemoryFetcher::new(data.clone()).failing_first(0, 1));

        let (job_tx, mut result_rx, _stop_tx, join) = spawn_worker(root.join("out.bin"), fetcher);
        job_tx.send(job_for(&data, 0, 128)).await.expect("send 1");
        assert!(!result_rx.recv().await.expect("result 1").is_success());
        job_tx.send(job_for(&data, 0, 128)).await.expect("send 2");
        assert!(result_rx.recv().await.expect("result 2").is_success());

        drop(job_tx);
        let stats = join.await.expect("join");
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.total_bytes, 128);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn stop_signal_ends_idle_worker() {
        let root = temp_dir("worker-stop");
        let fetcher = Arc::new(MemoryFetcher::new(sample_bytes(16)));
        let (_job_tx, _result_rx, stop_tx, join) = spawn_worker(root.join("out.bin"), fetcher);
        stop_tx.send(()).expect("stop");
        let stats = tokio::time::timeout(Duration::from_secs(2), join)
            .await
            .expect("worker exits")
            .expect("join");
        assert_eq!(stats, WorkerStats::default());
    }
}
