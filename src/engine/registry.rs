//! Process-wide set of file tasks, backed by the catalog file.

use crate::engine::catalog::{CATALOG_VERSION, Catalog, CatalogEntry, StorageRole};
use crate::engine::descriptor::TaskState;
use crate::engine::errors::EngineError;
use crate::engine::fetch::BlockFetcher;
use crate::engine::layout::{SHARE_DIR, StorageLayout, remove_path};
use crate::engine::manifest::Manifest;
use crate::engine::policy::FetchPolicy;
use crate::engine::task::{FileTask, TaskContext, TaskStatus};
use crate::logging::redact_hex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub root: PathBuf,
    pub max_file_num: usize,
    pub max_workers_per_file: usize,
    pub policy: FetchPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub version: String,
    pub max_file_num: usize,
    pub current_file_num: usize,
}

struct Inner {
    catalog: Catalog,
    tasks: HashMap<String, Arc<FileTask>>,
}

impl Inner {
    fn knows(&self, content_hash: &str) -> bool {
        self.tasks.contains_key(content_hash) || self.catalog.contains(content_hash)
    }
}

pub struct Registry {
    ctx: Arc<TaskContext>,
    max_file_num: usize,
    max_workers_per_file: usize,
    inner: RwLock<Inner>,
}

impl Registry {
    /// Loads the catalog and reattaches every task it lists.
    ///
    /// Download entries are started again (paused ones stay paused); share
    /// entries are only registered. An entry whose task cannot be opened is
    /// logged and left out.
    pub async fn create(cfg: RegistryConfig, fetcher: Arc<dyn BlockFetcher>) -> Result<Self> {
        let layout = StorageLayout::new(cfg.root);
        layout.ensure_dirs().await?;
        let catalog = Catalog::load_or_create(&layout.catalog_path()).await?;

        let ctx = Arc::new(TaskContext {
            layout,
            policy: cfg.policy,
            fetcher,
        });
        let mut tasks = HashMap::new();
        for entry in &catalog.entries {
            match Self::reattach(&ctx, entry, cfg.max_workers_per_file).await {
                Ok(task) => {
                    tasks.insert(entry.content_hash.clone(), Arc::new(task));
                }
                Err(err) => {
                    tracing::warn!(
                        content_hash = %redact_hex(&entry.content_hash),
                        file = %entry.file_name,
                        error = %err,
                        "skipping catalog entry"
                    );
                }
            }
        }
        tracing::info!(
            root = %ctx.layout.root().display(),
            tasks = tasks.len(),
            catalog_entries = catalog.entries.len(),
            "registry loaded"
        );

        Ok(Self {
            ctx,
            max_file_num: cfg.max_file_num,
            max_workers_per_file: cfg.max_workers_per_file,
            inner: RwLock::new(Inner { catalog, tasks }),
        })
    }

    async fn reattach(
        ctx: &Arc<TaskContext>,
        entry: &CatalogEntry,
        max_workers: usize,
    ) -> Result<FileTask> {
        let task = FileTask::open(Arc::clone(ctx), &entry.content_hash).await?;
        if entry.role() == Some(StorageRole::Download) && task.status().state != TaskState::Pause {
            let path = ctx
                .layout
                .root()
                .join(&entry.path)
                .join(&entry.file_name);
            task.start(max_workers, &path).await?;
        }
        Ok(task)
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.ctx.layout
    }

    /// Registers a file already present under `<root>/share`.
    pub async fn create_share_task(&self, manifest_bytes: &[u8]) -> Result<(String, String)> {
        let manifest = Manifest::parse(manifest_bytes)?;
        let mut inner = self.inner.write().await;
        self.admit(&inner, manifest.content_hash())?;

        let created = async {
            let (file_name, hash) =
                FileTask::create_share_task(&self.ctx.layout, manifest_bytes).await?;
            let task = FileTask::open(Arc::clone(&self.ctx), &hash).await?;
            self.append_entry(
                &mut inner,
                CatalogEntry {
                    file_name: file_name.clone(),
                    path: SHARE_DIR.to_string(),
                    content_hash: hash.clone(),
                },
            )
            .await?;
            Ok::<_, EngineError>((file_name, hash, task))
        }
        .await;
        let (file_name, hash, task) = match created {
            Ok(created) => created,
            Err(err) => {
                self.discard_task_dir(manifest.content_hash()).await;
                return Err(err);
            }
        };
        let task = Arc::new(task);
        inner.tasks.insert(hash.clone(), Arc::clone(&task));
        drop(inner);

        task.start(self.max_workers_per_file, &self.ctx.layout.share_dir().join(&file_name))
            .await?;
        Ok((file_name, hash))
    }

    /// Registers and starts a download into `<root>/downloads/<dest_rel>`.
    pub async fn create_download_task(
        &self,
        content_hash: &str,
        dest_rel: &str,
        manifest_bytes: &[u8],
    ) -> Result<()> {
        let content_hash = content_hash.to_ascii_lowercase();
        let dest_dir = self.ctx.layout.download_dir_for(dest_rel).ok_or_else(|| {
            EngineError::Validation(format!("download path '{dest_rel}' leaves the downloads dir"))
        })?;
        let mut inner = self.inner.write().await;
        self.admit(&inner, &content_hash)?;

        let created = async {
            FileTask::create_download_task(
                &self.ctx.layout,
                self.max_workers_per_file,
                &content_hash,
                &dest_dir,
                manifest_bytes,
            )
            .await?;
            let task = FileTask::open(Arc::clone(&self.ctx), &content_hash).await?;
            let file_name = task.status().file_name;
            self.append_entry(
                &mut inner,
                CatalogEntry {
                    file_name: file_name.clone(),
                    path: self.ctx.layout.placement_of(&dest_dir),
                    content_hash: content_hash.clone(),
                },
            )
            .await?;
            Ok::<_, EngineError>((file_name, task))
        }
        .await;
        let (file_name, task) = match created {
            Ok(created) => created,
            Err(err) => {
                self.discard_task_dir(&content_hash).await;
                return Err(err);
            }
        };
        let task = Arc::new(task);
        inner.tasks.insert(content_hash, Arc::clone(&task));
        drop(inner);

        task.start(self.max_workers_per_file, &dest_dir.join(file_name))
            .await
    }

    fn admit(&self, inner: &Inner, content_hash: &str) -> Result<()> {
        if inner.knows(content_hash) {
            return Err(EngineError::Duplicate(content_hash.to_string()));
        }
        if inner.tasks.len() >= self.max_file_num {
            return Err(EngineError::Capacity(self.max_file_num));
        }
        Ok(())
    }

    /// Drops the metadata of a task that never made it into the catalog.
    /// Only called for hashes `admit` has just accepted.
    async fn discard_task_dir(&self, content_hash: &str) {
        if let Err(err) = remove_path(&self.ctx.layout.task_dir(content_hash), true).await {
            tracing::warn!(
                content_hash = %redact_hex(content_hash),
                error = %err,
                "failed to clean up after rejected task"
            );
        }
    }

    async fn append_entry(&self, inner: &mut Inner, entry: CatalogEntry) -> Result<()> {
        inner.catalog.entries.push(entry);
        if let Err(err) = inner.catalog.save(&self.ctx.layout.catalog_path()).await {
            inner.catalog.entries.pop();
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn get_stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        RegistryStats {
            version: CATALOG_VERSION.to_string(),
            max_file_num: self.max_file_num,
            current_file_num: inner.tasks.len(),
        }
    }

    pub async fn list(&self) -> Vec<TaskStatus> {
        let inner = self.inner.read().await;
        let mut out: Vec<TaskStatus> = inner.tasks.values().map(|t| t.status()).collect();
        out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        out
    }

    pub async fn task(&self, content_hash: &str) -> Result<Arc<FileTask>> {
        let key = content_hash.to_ascii_lowercase();
        self.inner
            .read()
            .await
            .tasks
            .get(&key)
            .cloned()
            .ok_or(EngineError::UnknownTask(key))
    }

    /// Starts a stopped task at the location recorded in the catalog.
    pub async fn start(&self, content_hash: &str) -> Result<()> {
        let task = self.task(content_hash).await?;
        let path = {
            let inner = self.inner.read().await;
            let entry = inner
                .catalog
                .entries
                .iter()
                .find(|e| e.content_hash == task.content_hash())
                .ok_or_else(|| EngineError::UnknownTask(task.content_hash().to_string()))?;
            self.ctx
                .layout
                .root()
                .join(&entry.path)
                .join(&entry.file_name)
        };
        task.start(self.max_workers_per_file, &path).await
    }

    pub async fn pause(&self, content_hash: &str) -> Result<()> {
        self.task(content_hash).await?.pause().await
    }

    pub async fn resume(&self, content_hash: &str) -> Result<()> {
        self.task(content_hash).await?.resume().await
    }

    pub async fn stop(&self, content_hash: &str) -> Result<()> {
        self.task(content_hash).await?.stop().await
    }

    /// Stops a task and forgets it. Its data file is kept unless `delete_files`.
    ///
    /// The pipeline is joined and the files are deleted before the catalog
    /// entry goes, so a failed removal leaves the task registered and the
    /// call can be repeated.
    pub async fn remove_task(&self, content_hash: &str, delete_files: bool) -> Result<()> {
        let key = content_hash.to_ascii_lowercase();
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get(&key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTask(key.clone()))?;
        task.stop_and_remove(delete_files).await?;

        let removed = inner.catalog.remove(&key);
        if let Err(err) = inner.catalog.save(&self.ctx.layout.catalog_path()).await {
            if let Some(entry) = removed {
                inner.catalog.entries.push(entry);
            }
            return Err(err.into());
        }
        inner.tasks.remove(&key);
        tracing::info!(content_hash = %redact_hex(&key), delete_files, "task removed");
        Ok(())
    }

    pub async fn read_block(&self, content_hash: &str, index: usize) -> Result<Vec<u8>> {
        self.task(content_hash).await?.read_block(index).await
    }

    /// Stops every running task. Called once on process exit.
    pub async fn shutdown(&self) {
        let tasks: Vec<Arc<FileTask>> = self.inner.read().await.tasks.values().cloned().collect();
        for task in tasks {
            if !task.status().running {
                continue;
            }
            if let Err(err) = task.stop().await {
                tracing::warn!(
                    content_hash = %redact_hex(task.content_hash()),
                    error = %err,
                    "failed to stop task on shutdown"
                );
            }
        }
        tracing::info!("registry shut down");
    }
}
