//! The scheduling loop connections and processors run on.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::error;

/// Owns the runtime a service runs on, or borrows the ambient one.
///
/// When [`Scheduler::create`] is called from inside a tokio runtime, that
/// runtime is used. Otherwise a multi-thread runtime with `max_threads`
/// workers is built and owned until [`Scheduler::release`].
pub(crate) struct Scheduler {
    handle: SchedulerHandle,
    runtime: Option<Runtime>,
}

impl Scheduler {
    pub(crate) fn create(max_threads: usize) -> std::io::Result<Self> {
        let max_threads = max_threads.max(1);
        let (handle, runtime) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(max_threads)
                    .thread_name("slib-http-worker")
                    .enable_all()
                    .build()?;
                (runtime.handle().clone(), Some(runtime))
            }
        };
        Ok(Self {
            handle: SchedulerHandle {
                handle,
                workers: Arc::new(Semaphore::new(max_threads)),
            },
            runtime,
        })
    }

    pub(crate) fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    /// Stops handing out worker permits and shuts down an owned runtime.
    pub(crate) fn release(self) {
        self.handle.workers.close();
        if let Some(runtime) = self.runtime {
            runtime.shutdown_background();
        }
    }
}

/// Cheap, cloneable access to a [`Scheduler`].
#[derive(Debug, Clone)]
pub(crate) struct SchedulerHandle {
    handle: Handle,
    workers: Arc<Semaphore>,
}

impl SchedulerHandle {
    pub(crate) fn runtime(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs `job` on a blocking worker once a worker permit is free.
    ///
    /// If the scheduler is released before a permit is granted the job is
    /// dropped without running.
    pub(crate) fn spawn_processing<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let workers = Arc::clone(&self.workers);
        self.handle.spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                error!(error = %e, "request processing worker failed");
            }
        });
    }
}
