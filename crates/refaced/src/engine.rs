use reface_core::{CancelFlag, JobOutput, JobRequest, JobRunner};
use reface_models::{LoadState, ModelResourceManager, OnnxCapabilities};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine workers exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the worker pool.
enum EngineRequest {
    Process {
        request: JobRequest,
        cancel: CancelFlag,
        reply: oneshot::Sender<JobOutput>,
    },
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Jobs currently queued or running, by id. Callers may reuse an id, so
/// each id maps to every submission carrying it.
#[derive(Default)]
struct InFlight {
    next: AtomicU64,
    jobs: Mutex<HashMap<String, Vec<(u64, CancelFlag)>>>,
}

impl InFlight {
    fn register(self: &Arc<Self>, job_id: &str, cancel: CancelFlag) -> Registration {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        let mut jobs = lock(&self.jobs);
        let entries = jobs.entry(job_id.to_string()).or_default();
        entries.push((token, cancel));
        if entries.len() > 1 {
            tracing::warn!(job_id, submissions = entries.len(), "job id already in flight");
        }
        Registration {
            registry: self.clone(),
            job_id: job_id.to_string(),
            token,
        }
    }

    fn cancel(&self, job_id: &str) -> usize {
        lock(&self.jobs).get(job_id).map_or(0, |entries| {
            for (_, flag) in entries {
                flag.cancel();
            }
            entries.len()
        })
    }

    fn cancel_all(&self) -> usize {
        let jobs = lock(&self.jobs);
        let mut cancelled = 0;
        for (_, flag) in jobs.values().flatten() {
            flag.cancel();
            cancelled += 1;
        }
        cancelled
    }

    fn len(&self) -> usize {
        lock(&self.jobs).values().map(Vec::len).sum()
    }
}

/// Removes one submission from [`InFlight`] when dropped, including when
/// the caller's future is dropped before the job finishes.
struct Registration {
    registry: Arc<InFlight>,
    job_id: String,
    token: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut jobs = lock(&self.registry.jobs);
        if let Some(entries) = jobs.get_mut(&self.job_id) {
            entries.retain(|(token, _)| *token != self.token);
            if entries.is_empty() {
                jobs.remove(&self.job_id);
            }
        }
    }
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    in_flight: Arc<InFlight>,
    manager: Arc<ModelResourceManager>,
    workers: usize,
}

impl EngineHandle {
    /// Queue `request` and wait for its output. A missing job id is filled
    /// in so the job can be cancelled while it runs.
    pub async fn process(&self, mut request: JobRequest) -> Result<JobOutput, EngineError> {
        let job_id = request
            .job_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let cancel = CancelFlag::new();
        let _registration = self.in_flight.register(&job_id, cancel.clone());

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .tx
            .send(EngineRequest::Process {
                request,
                cancel,
                reply: reply_tx,
            })
            .await;
        match sent {
            Ok(()) => reply_rx.await.map_err(|_| EngineError::ChannelClosed),
            Err(_) => Err(EngineError::ChannelClosed),
        }
    }

    /// Request cancellation of every queued or running job with this id.
    /// Returns whether any was known.
    pub fn cancel(&self, job_id: &str) -> bool {
        let cancelled = self.in_flight.cancel(job_id);
        if cancelled > 0 {
            tracing::info!(job_id, jobs = cancelled, "cancellation requested");
        }
        cancelled > 0
    }

    /// Cancel everything in flight.
    pub fn cancel_all(&self) -> usize {
        self.in_flight.cancel_all()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn model_states(&self) -> BTreeMap<String, LoadState> {
        self.manager.snapshot()
    }
}

/// Spawn `workers` OS threads running jobs against `caps`.
///
/// Every worker pulls from the same queue, so at most `workers` jobs run at
/// once and at most `queue_depth` more wait before callers block.
pub fn spawn_engine(
    caps: Arc<OnnxCapabilities>,
    workers: usize,
    queue_depth: usize,
) -> Result<EngineHandle, EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let workers = workers.max(1);

    for n in 0..workers {
        let rx = rx.clone();
        let caps = caps.clone();
        std::thread::Builder::new()
            .name(format!("reface-worker-{n}"))
            .spawn(move || worker_loop(n, &rx, &caps))?;
    }
    tracing::info!(workers, queue_depth, "engine workers started");

    Ok(EngineHandle {
        tx,
        in_flight: Arc::default(),
        manager: caps.manager().clone(),
        workers,
    })
}

fn worker_loop(n: usize, rx: &Mutex<mpsc::Receiver<EngineRequest>>, caps: &OnnxCapabilities) {
    tracing::debug!(worker = n, "worker started");
    loop {
        // Only the receive holds the lock; jobs run unlocked.
        let next = lock(rx).blocking_recv();
        let Some(req) = next else { break };
        match req {
            EngineRequest::Process {
                request,
                cancel,
                reply,
            } => {
                let output = JobRunner::new(caps.capabilities()).run(&request, Some(&cancel));
                if reply.send(output).is_err() {
                    tracing::warn!(worker = n, "caller went away before the job finished");
                }
            }
        }
    }
    tracing::debug!(worker = n, "worker exiting");
}
