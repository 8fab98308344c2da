//! Debounced persistence on top of [`Storage`]
//!
//! A `Store` owns one storage key. Besides direct `load`/`save` it offers
//! `delay_save`: callers hand over a closure producing the data, and the
//! write happens once no further `delay_save` call has arrived for the
//! given delay. Every call replaces the pending closure and restarts the
//! window, so a burst of changes turns into a single write of the latest
//! state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::storage::{Storable, Storage, StorageFile, StorageResult};

type DataFn<T> = Box<dyn FnOnce() -> T + Send>;

/// Pending write state, guarded by a mutex
struct Pending<T> {
    /// Bumped on every schedule/flush; a timer only fires for its own generation
    generation: u64,
    data_fn: Option<DataFn<T>>,
    /// The one live delay timer, if any
    timer: Option<AbortHandle>,
}

impl<T> Pending<T> {
    /// Supersede whatever is scheduled and hand back its data producer
    fn cancel(&mut self) -> Option<DataFn<T>> {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.data_fn.take()
    }
}

struct StoreInner<T> {
    storage: Arc<Storage>,
    pending: Mutex<Pending<T>>,
    /// Held across producing and writing data, so an older snapshot never
    /// lands after a newer one and flush sees in-flight writes complete
    write_lock: tokio::sync::Mutex<()>,
    writes: AtomicU64,
}

impl<T: Storable> StoreInner<T> {
    fn pending(&self) -> MutexGuard<'_, Pending<T>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Caller must hold `write_lock`
    async fn write_locked(&self, data: T) -> StorageResult<()> {
        let file = StorageFile::new(T::KEY, data, T::VERSION, T::MINOR_VERSION);
        self.storage.save(&file).await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn fire(&self, generation: u64) {
        let _guard = self.write_lock.lock().await;
        let data_fn = {
            let mut pending = self.pending();
            if pending.generation != generation {
                // Superseded by a later schedule or flush
                return;
            }
            pending.timer = None;
            pending.data_fn.take()
        };

        if let Some(data_fn) = data_fn {
            if let Err(e) = self.write_locked(data_fn()).await {
                error!("Error writing delayed save for {}: {}", T::KEY, e);
            } else {
                debug!("Wrote delayed save for {}", T::KEY);
            }
        }
    }
}

/// Versioned, debounced storage for one `Storable` type
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Store<T>
where
    T: Storable + Send + Sync + 'static,
{
    /// Create a store for `T::KEY` in the given storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                storage,
                pending: Mutex::new(Pending {
                    generation: 0,
                    data_fn: None,
                    timer: None,
                }),
                write_lock: tokio::sync::Mutex::new(()),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Load the stored data, `None` on first run
    pub async fn load(&self) -> StorageResult<Option<StorageFile<T>>> {
        self.inner.storage.load_storable::<T>().await
    }

    /// Write `data` immediately
    ///
    /// A pending delayed save is superseded by this write.
    pub async fn save(&self, data: T) -> StorageResult<()> {
        let _guard = self.inner.write_lock.lock().await;
        drop(self.inner.pending().cancel());
        self.inner.write_locked(data).await
    }

    /// Schedule a write of `data_fn()` after `delay` of inactivity
    ///
    /// Each call replaces the previous timer. Must be called from within a
    /// tokio runtime for the timer to start; outside a runtime the data is
    /// kept pending until [`Store::flush`].
    pub fn delay_save<F>(&self, data_fn: F, delay: Duration)
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let mut pending = self.inner.pending();
        pending.cancel();
        pending.data_fn = Some(Box::new(data_fn));
        let generation = pending.generation;

        match Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                let task = handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.fire(generation).await;
                });
                pending.timer = Some(task.abort_handle());
            }
            Err(_) => {
                warn!(
                    "No async runtime available, save of {} deferred until flush",
                    T::KEY
                );
            }
        }
    }

    /// Write pending data now and cancel the running timer
    ///
    /// Waits for a delayed write already in progress. Returns `Ok(false)`
    /// when nothing was pending.
    pub async fn flush(&self) -> StorageResult<bool> {
        let _guard = self.inner.write_lock.lock().await;
        let data_fn = self.inner.pending().cancel();

        match data_fn {
            Some(data_fn) => {
                self.inner.write_locked(data_fn()).await?;
                debug!("Flushed pending save for {}", T::KEY);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether a delayed save is waiting to be written
    pub fn has_pending(&self) -> bool {
        self.inner.pending().data_fn.is_some()
    }

    /// Number of completed writes since creation
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }
}
