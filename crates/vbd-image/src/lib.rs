#![forbid(unsafe_code)]
//! Image context: the shared state every I/O operation runs against.
//!
//! An [`ImageCtx`] holds the image's logical size (readable under a shared
//! lock because resize can run concurrently with I/O), an optional backing
//! [`DataStore`], an optional completion-event channel for native
//! asynchronous delivery, and a trace toggle.
//!
//! Locking discipline: the size lock is a reader-writer lock whose read side
//! is held only for the duration of a single extent comparison — never
//! across dispatch submission or a completion wait.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use vbd_completion::CompletionEvent;
use vbd_store::DataStore;

/// Shared per-image state.
#[derive(Debug)]
pub struct ImageCtx {
    name: String,
    size: RwLock<u64>,
    store: RwLock<Option<Arc<dyn DataStore>>>,
    event_channel: Mutex<Option<Sender<CompletionEvent>>>,
    trace_all: AtomicBool,
}

impl ImageCtx {
    /// Image with a logical size and no backing store.
    ///
    /// Every I/O against it fails the readiness gate until a store is
    /// attached.
    #[must_use]
    pub fn new(name: impl Into<String>, size: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            size: RwLock::new(size),
            store: RwLock::new(None),
            event_channel: Mutex::new(None),
            trace_all: AtomicBool::new(false),
        })
    }

    /// Image backed by `store`, sized to the store's length.
    #[must_use]
    pub fn with_store(name: impl Into<String>, store: Arc<dyn DataStore>) -> Arc<Self> {
        let size = store.len_bytes();
        let image = Self::new(name, size);
        *image.store.write() = Some(store);
        image
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current logical size, read under the shared lock.
    #[must_use]
    pub fn size(&self) -> u64 {
        *self.size.read()
    }

    /// Change the logical size. Takes the write lock; in-flight operations
    /// that already clipped keep their snapshot.
    pub fn resize(&self, new_size: u64) {
        let mut size = self.size.write();
        tracing::debug!(image = %self.name, old = *size, new = new_size, "resize");
        *size = new_size;
    }

    /// The backing data store, if one is attached.
    #[must_use]
    pub fn data_store(&self) -> Option<Arc<dyn DataStore>> {
        self.store.read().clone()
    }

    pub fn attach_store(&self, store: Arc<dyn DataStore>) {
        *self.store.write() = Some(store);
    }

    pub fn detach_store(&self) {
        *self.store.write() = None;
    }

    /// Channel completions push wake events into when native asynchronous
    /// delivery is armed. `None` means the channel is inactive.
    #[must_use]
    pub fn event_channel(&self) -> Option<Sender<CompletionEvent>> {
        self.event_channel.lock().clone()
    }

    pub fn set_event_channel(&self, channel: Option<Sender<CompletionEvent>>) {
        *self.event_channel.lock() = channel;
    }

    /// Whether per-operation trace spans are enabled.
    #[must_use]
    pub fn trace_all(&self) -> bool {
        self.trace_all.load(Ordering::Relaxed)
    }

    pub fn set_trace_all(&self, enabled: bool) {
        self.trace_all.store(enabled, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbd_store::MemoryDataStore;

    #[test]
    fn new_image_has_no_store() {
        let image = ImageCtx::new("img", 1000);
        assert_eq!(image.size(), 1000);
        assert!(image.data_store().is_none());
    }

    #[test]
    fn with_store_sizes_from_store_length() {
        let store = Arc::new(MemoryDataStore::new(4096));
        let image = ImageCtx::with_store("img", store);
        assert_eq!(image.size(), 4096);
        assert!(image.data_store().is_some());
    }

    #[test]
    fn resize_updates_size() {
        let image = ImageCtx::new("img", 1000);
        image.resize(500);
        assert_eq!(image.size(), 500);
        image.resize(2000);
        assert_eq!(image.size(), 2000);
    }

    #[test]
    fn attach_and_detach_store() {
        let image = ImageCtx::new("img", 100);
        image.attach_store(Arc::new(MemoryDataStore::new(100)));
        assert!(image.data_store().is_some());
        image.detach_store();
        assert!(image.data_store().is_none());
    }

    #[test]
    fn event_channel_starts_inactive() {
        let image = ImageCtx::new("img", 100);
        assert!(image.event_channel().is_none());

        let (tx, _rx) = std::sync::mpsc::channel();
        image.set_event_channel(Some(tx));
        assert!(image.event_channel().is_some());
    }
}
