//! Lazy, shared model lifecycle.
//!
//! Each model name moves through `Unloaded → Loading → Ready | Failed` once
//! per process. Concurrent first requests for the same model block on its
//! slot lock; exactly one of them performs the load. Failure is sticky: the
//! model is not retried until the process restarts.
//!
//! Inference is bounded process-wide by a [`TokenPool`] (a tokio semaphore)
//! shared by every handle, and each model instance is additionally
//! serialized by its own mutex.

use crate::locator::{LocatorError, ModelLocator};
use reface_core::CapabilityError;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

pub const DEFAULT_INFERENCE_PERMITS: usize = 1;
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("model {name} not found: {reason}")]
    NotFound { name: String, reason: String },
    #[error("model {name} failed to load: {reason}")]
    LoadFailed { name: String, reason: String },
    #[error("no inference slot for {name} after {waited:?}")]
    ResourceExhausted { name: String, waited: Duration },
}

impl From<ModelError> for CapabilityError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::NotFound { .. } | ModelError::LoadFailed { .. } => {
                CapabilityError::ModelMissing(e.to_string())
            }
            ModelError::ResourceExhausted { .. } => CapabilityError::ResourceExhausted(e.to_string()),
        }
    }
}

/// Builds a model instance from a resolved file.
pub trait ModelLoader {
    type Model: Send + 'static;

    fn load(&self, path: &Path) -> Result<Self::Model, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Concurrent inference calls allowed across all models.
    pub permits: usize,
    /// How long to wait for a permit; `None` waits forever.
    pub token_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            permits: DEFAULT_INFERENCE_PERMITS,
            token_timeout: Some(DEFAULT_TOKEN_TIMEOUT),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking inference must not take the model down with it.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

const PERMIT_BACKOFF_START: Duration = Duration::from_millis(1);
const PERMIT_BACKOFF_MAX: Duration = Duration::from_millis(20);

/// Process-wide inference permits.
///
/// Callers are synchronous worker threads, some of them running inside a
/// tokio runtime, so permits are taken with `try_acquire_owned` and a short
/// backoff instead of awaiting.
#[derive(Debug, Clone)]
pub struct TokenPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl TokenPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take a permit, waiting up to `timeout` (forever if `None`).
    /// Returns `None` on timeout.
    pub fn acquire(&self, timeout: Option<Duration>) -> Option<OwnedSemaphorePermit> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut backoff = PERMIT_BACKOFF_START;
        loop {
            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => return Some(permit),
                Err(TryAcquireError::Closed) => return None,
                Err(TryAcquireError::NoPermits) => {}
            }
            let pause = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return None;
                    }
                    backoff.min(left)
                }
                None => backoff,
            };
            std::thread::sleep(pause);
            backoff = (backoff * 2).min(PERMIT_BACKOFF_MAX);
        }
    }
}

/// A loaded model plus its access controls.
#[derive(Debug)]
pub struct ModelHandle<M> {
    pub name: String,
    pub path: PathBuf,
    model: Mutex<M>,
    tokens: TokenPool,
    timeout: Option<Duration>,
}

impl<M> ModelHandle<M> {
    /// Run `f` with exclusive access to the model, holding an inference
    /// permit for the duration.
    pub fn run<R>(&self, f: impl FnOnce(&mut M) -> R) -> Result<R, ModelError> {
        let started = Instant::now();
        let _permit = self.tokens.acquire(self.timeout).ok_or_else(|| {
            tracing::warn!(model = %self.name, waited = ?started.elapsed(), "inference permit wait timed out");
            ModelError::ResourceExhausted {
                name: self.name.clone(),
                waited: started.elapsed(),
            }
        })?;
        let mut model = lock(&self.model);
        Ok(f(&mut *model))
    }
}

enum SlotState {
    Unloaded,
    Ready(Arc<dyn Any + Send + Sync>),
    Failed(ModelError),
}

struct Slot {
    state: Mutex<SlotState>,
}

pub struct ModelResourceManager {
    locator: ModelLocator,
    tokens: TokenPool,
    timeout: Option<Duration>,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl ModelResourceManager {
    pub fn new(locator: ModelLocator, config: ManagerConfig) -> Self {
        tracing::info!(
            roots = ?locator.roots(),
            permits = config.permits,
            timeout = ?config.token_timeout,
            "model manager initialized"
        );
        Self {
            locator,
            tokens: TokenPool::new(config.permits),
            timeout: config.token_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn locator(&self) -> &ModelLocator {
        &self.locator
    }

    pub fn tokens(&self) -> &TokenPool {
        &self.tokens
    }

    fn slot(&self, name: &str) -> Arc<Slot> {
        lock(&self.slots)
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    state: Mutex::new(SlotState::Unloaded),
                })
            })
            .clone()
    }

    /// Get the handle for `name`, loading it with `loader` on first use.
    pub fn acquire<L: ModelLoader>(
        &self,
        name: &str,
        loader: &L,
    ) -> Result<Arc<ModelHandle<L::Model>>, ModelError> {
        let slot = self.slot(name);
        // Held across the load; concurrent callers for this model wait here.
        let mut state = lock(&slot.state);

        match &*state {
            SlotState::Ready(any) => return downcast::<L::Model>(name, any.clone()),
            SlotState::Failed(e) => return Err(e.clone()),
            SlotState::Unloaded => {}
        }

        let started = Instant::now();
        let result = self.load(name, loader);
        match result {
            Ok(handle) => {
                tracing::info!(
                    model = name,
                    path = %handle.path.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model loaded"
                );
                *state = SlotState::Ready(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                tracing::error!(model = name, error = %e, "model unavailable for this process");
                *state = SlotState::Failed(e.clone());
                Err(e)
            }
        }
    }

    fn load<L: ModelLoader>(&self, name: &str, loader: &L) -> Result<Arc<ModelHandle<L::Model>>, ModelError> {
        let path = self.locator.locate(name).map_err(|e| match e {
            LocatorError::NotFound { .. } => ModelError::NotFound {
                name: name.to_string(),
                reason: e.to_string(),
            },
        })?;

        let model = loader.load(&path).map_err(|reason| ModelError::LoadFailed {
            name: name.to_string(),
            reason,
        })?;

        Ok(Arc::new(ModelHandle {
            name: name.to_string(),
            path,
            model: Mutex::new(model),
            tokens: self.tokens.clone(),
            timeout: self.timeout,
        }))
    }

    /// Current state of `name`. A slot whose lock is held is loading.
    pub fn state(&self, name: &str) -> LoadState {
        let Some(slot) = lock(&self.slots).get(name).cloned() else {
            return LoadState::Unloaded;
        };
        let state = match slot.state.try_lock() {
            Ok(guard) => state_of(&guard),
            Err(TryLockError::Poisoned(p)) => state_of(&p.into_inner()),
            Err(TryLockError::WouldBlock) => LoadState::Loading,
        };
        state
    }

    /// Load state of every model requested so far.
    pub fn snapshot(&self) -> BTreeMap<String, LoadState> {
        let names: Vec<String> = lock(&self.slots).keys().cloned().collect();
        names
            .into_iter()
            .map(|n| {
                let s = self.state(&n);
                (n, s)
            })
            .collect()
    }
}

fn state_of(state: &SlotState) -> LoadState {
    match state {
        SlotState::Unloaded => LoadState::Unloaded,
        SlotState::Ready(_) => LoadState::Ready,
        SlotState::Failed(_) => LoadState::Failed,
    }
}

fn downcast<M: Send + 'static>(
    name: &str,
    any: Arc<dyn Any + Send + Sync>,
) -> Result<Arc<ModelHandle<M>>, ModelError> {
    any.downcast::<ModelHandle<M>>().map_err(|_| ModelError::LoadFailed {
        name: name.to_string(),
        reason: "model already loaded with a different loader".into(),
    })
}
