use std::{fmt, io, sync::Arc};

use crate::error::{Result, ScanError};

/// One Hillis–Steele stage: every index at or past `stride` combines with the
/// value `stride` positions behind it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Stage {
    pub index: u32,
    pub stride: usize,
}

/// Called for every index of every stage, right before its value is computed.
pub type IndexHook = Arc<dyn Fn(Stage, usize) + Send + Sync>;

/// CPU scan engine: a fixed pool of workers that every scan fans out over.
pub struct Engine {
    pub(crate) pool: rayon::ThreadPool,
    pub(crate) workers: usize,
    pub(crate) hook: Option<IndexHook>,
}

impl Engine {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("scan-worker-{i}"))
            .build()
            .map_err(|e| ScanError::resource("building scan worker pool", io::Error::other(e)))?;

        Ok(Self {
            pool,
            workers,
            hook: None,
        })
    }

    pub fn with_index_hook(mut self, hook: IndexHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("workers", &self.workers)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}
