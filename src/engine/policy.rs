use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What `stop` does with the pipeline it tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Signal workers and the collector, return without waiting.
    Immediate,
    /// Signal, then join every worker and the collector.
    Graceful,
}

/// Scheduling and retry knobs shared by every task of a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    pub schedule_every: Duration,
    pub jobs_per_tick: usize,
    /// Failures allowed inside one `fail_window` before a block is held back.
    pub fail_ceiling: u32,
    pub fail_window: Duration,
    /// Total failures after which a block is given up on. `None` retries forever.
    pub max_block_failures: Option<u32>,
    pub stop_mode: StopMode,
    /// Upper bound for `workers * block_size`. `0` disables the bound.
    pub max_mem_per_task: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            schedule_every: Duration::from_secs(1),
            jobs_per_tick: 1,
            fail_ceiling: 10,
            fail_window: Duration::from_secs(60),
            max_block_failures: None,
            stop_mode: StopMode::Immediate,
            max_mem_per_task: 32 * 1024 * 1024,
        }
    }
}

impl FetchPolicy {
    /// Worker count for a file, clamped by the per-task memory budget. Never below one.
    pub fn effective_workers(&self, requested: usize, block_size: u64) -> usize {
        let requested = requested.max(1);
        if self.max_mem_per_task == 0 || block_size == 0 {
            return requested;
        }
        let by_mem = (self.max_mem_per_task / block_size).max(1);
        requested.min(usize::try_from(by_mem).unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_budget_clamps_worker_count() {
        let policy = FetchPolicy::default();
        // 32 MiB budget with 512 KiB blocks allows 64 in flight.
        assert_eq!(policy.effective_workers(32, 512 * 1024), 32);
        assert_eq!(policy.effective_workers(128, 512 * 1024), 64);
        // A block larger than the whole budget still gets one worker.
        assert_eq!(policy.effective_workers(8, 64 * 1024 * 1024), 1);
        assert_eq!(policy.effective_workers(0, 1024), 1);
    }

    #[test]
    fn zero_budget_means_unbounded() {
        let policy = FetchPolicy {
            max_mem_per_task: 0,
            ..FetchPolicy::default()
        };
        assert_eq!(policy.effective_workers(500, 1 << 30), 500);
    }
}
