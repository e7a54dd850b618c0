pub mod catalog;
pub mod descriptor;
pub mod errors;
pub mod fetch;
pub mod layout;
pub mod manifest;
pub mod policy;
pub mod registry;
pub mod task;
pub mod worker;

pub use catalog::{CATALOG_VERSION, Catalog, CatalogEntry, StorageRole};
pub use descriptor::{Block, BlockState, FileDescriptor, PersistedBlockFlag, TaskState};
pub use errors::{EngineError, ErrorKind, StoreError};
pub use fetch::{BlockFetcher, FetchFailure, FetchFuture, FetchRequest, HttpBlockFetcher};
pub use layout::{CATALOG_DIR, StorageLayout};
pub use manifest::Manifest;
pub use policy::{FetchPolicy, StopMode};
pub use registry::{Registry, RegistryConfig, RegistryStats};
pub use task::{FileTask, TaskStatus};
pub use worker::{Job, WorkResult, Worker, WorkerStats};
