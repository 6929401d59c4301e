use std::{sync::Mutex, time::Duration};

use tokio::task::JoinHandle;

/// Per-entry garbage collection timer.
///
/// Armed the instant the last subscriber detaches, cancelled when a new one
/// arrives before it fires. A gc time of `None` means the entry is never
/// collected automatically.
pub(crate) struct GarbageCollector {
    gc_time: Mutex<Option<Duration>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GarbageCollector {
    pub(crate) fn new(gc_time: Option<Duration>) -> Self {
        Self {
            gc_time: Mutex::new(gc_time),
            handle: Mutex::new(None),
        }
    }

    /// Keep max gc time across all observers of the entry.
    /// `None` means never collect, which dominates any finite time.
    pub(crate) fn update_gc_time(&self, gc_time: Option<Duration>) {
        let mut current = self.gc_time.lock().expect("gc_time lock");
        *current = match (*current, gc_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
    }

    /// Arm the collection timer. `evict` runs once the timer fires.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn enable_gc(&self, evict: impl FnOnce() + Send + 'static) {
        let mut handle = self.handle.lock().expect("gc handle lock");
        if handle.is_some() {
            return;
        }

        let gc_time = *self.gc_time.lock().expect("gc_time lock");
        if let Some(gc_time) = gc_time {
            *handle = Some(tokio::spawn(async move {
                tokio::time::sleep(gc_time).await;
                evict();
            }));
        }
    }

    /// Cancel a pending collection, if any.
    pub(crate) fn disable_gc(&self) {
        if let Some(handle) = self.handle.lock().expect("gc handle lock").take() {
            handle.abort();
        }
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.disable_gc();
    }
}
