mod admin;
mod peer;

pub(crate) use admin::{remove_task, stats, task_action, tasks};
pub(crate) use peer::{block, download, hello, share_resource};
