use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use threadpool::ThreadPool;
use tracing::warn;

use crate::Error;

/// Options for recursive collection and synchronization.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncOptions {
    /// Number of worker threads. Defaults to the number of CPUs.
    pub threads: Option<usize>,
}

/// A bounded pool of worker threads, collecting the errors of its tasks.
///
/// Clones submit into the same pool, so tasks can queue more tasks.
#[derive(Clone)]
pub(crate) struct WorkPool {
    threads: ThreadPool,
    errors: Arc<Mutex<Vec<Error>>>,
}

impl WorkPool {
    pub(crate) fn new(options: &SyncOptions) -> Self {
        let mut builder = threadpool::Builder::new().thread_name("vfs-worker".to_string());
        if let Some(threads) = options.threads {
            builder = builder.num_threads(threads.max(1));
        }
        Self {
            threads: builder.build(),
            errors: Default::default(),
        }
    }

    pub(crate) fn execute<F>(&self, task: F)
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        let errors = self.errors.clone();
        self.threads.execute(move || {
            if let Err(e) = task() {
                warn!(err = %e, "task failed");
                errors.lock().push(e);
            }
        });
    }

    /// Waits for every task, including the ones queued by other tasks.
    ///
    /// Must not be called from inside a task.
    pub(crate) fn join(&self) -> Result<(), Error> {
        self.threads.join();

        let mut errors = std::mem::take(&mut *self.errors.lock());
        let panicked = self.threads.panic_count();
        if panicked > 0 {
            errors.push(Error::InvalidState(format!("{} task(s) panicked", panicked)));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::SynchronizationFailed(errors))
        }
    }
}
