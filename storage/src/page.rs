//! Page module — the in-memory bytes of one version of a block.

use std::sync::{Arc, Weak};
use std::thread;

use log::error;
use parking_lot::Mutex;

use crate::drainer::Drainer;
use crate::serializer::{BlockId, BlockToken, IoAccount, Serializer, SerializerError};
use crate::signal::Signal;

/// Everything a background load needs from the cache that requested it.
#[derive(Clone)]
pub(crate) struct LoadContext {
    pub(crate) serializer: Arc<Serializer>,
    pub(crate) reads_account: IoAccount,
    pub(crate) drainer: Arc<Drainer>,
}

/// In-memory bytes of one version of a block, possibly still being fetched
/// from durable storage.
///
/// A page with outstanding snapshot references is never mutated in place; the
/// write path in [`crate::current_page`] duplicates it first via
/// [`Page::make_copy`].
pub struct Page {
    loaded: Signal,
    inner: Mutex<PageInner>,
}

struct PageInner {
    buf: Option<Vec<u8>>,
    block_token: Option<BlockToken>,
    /// Number of detached snapshot acquirers observing this page.
    snapshot_refcount: usize,
}

impl Page {
    /// Creates a page that is immediately ready, from bytes already in
    /// memory. Used for freshly allocated blocks and copy-on-write copies.
    pub(crate) fn from_buf(buf: Vec<u8>) -> Arc<Page> {
        let loaded = Signal::new();
        loaded.pulse();
        Arc::new(Page {
            loaded,
            inner: Mutex::new(PageInner {
                buf: Some(buf),
                block_token: None,
                snapshot_refcount: 0,
            }),
        })
    }

    /// Creates a page bound to `block_id` and spawns the background load that
    /// will fill it from durable storage.
    ///
    /// The loader holds only a [`Weak`] handle: if every strong holder drops
    /// the page while the read is still in flight, the upgrade fails and the
    /// result is discarded instead of being installed into freed state. After
    /// a successful upgrade the install runs with no further blocking.
    pub(crate) fn load(block_id: BlockId, context: &LoadContext) -> Arc<Page> {
        let page = Arc::new(Page {
            loaded: Signal::new(),
            inner: Mutex::new(PageInner {
                buf: None,
                block_token: None,
                snapshot_refcount: 0,
            }),
        });
        spawn_load(Arc::downgrade(&page), block_id, context.clone());
        page
    }

    /// The load-completion signal. Pages created from a buffer are born
    /// pulsed.
    pub fn loaded_signal(&self) -> &Signal {
        &self.loaded
    }

    /// Runs `f` over the page's bytes, waiting for the load to complete
    /// first.
    pub fn with_buf<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.loaded.wait();
        let inner = self.inner.lock();
        f(inner.buf.as_deref().expect("loaded page has no bytes"))
    }

    /// Runs `f` over the page's bytes mutably. Callers must hold exclusive
    /// write access per the queue protocol; the page itself does not arbitrate.
    pub fn with_buf_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.loaded.wait();
        let mut inner = self.inner.lock();
        f(inner.buf.as_deref_mut().expect("loaded page has no bytes"))
    }

    /// Where the page's bytes are persisted, if it was loaded from storage
    /// and not modified since. Fresh and copied pages have no token.
    pub fn block_token(&self) -> Option<BlockToken> {
        self.inner.lock().block_token.clone()
    }

    /// Returns a ready page holding an independent copy of the current
    /// bytes, with no snapshot references. Used for copy-on-write.
    pub fn make_copy(&self) -> Arc<Page> {
        self.loaded.wait();
        let inner = self.inner.lock();
        Page::from_buf(inner.buf.clone().expect("loaded page has no bytes"))
    }

    pub(crate) fn add_snapshotter(&self) {
        self.inner.lock().snapshot_refcount += 1;
    }

    pub(crate) fn remove_snapshotter(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.snapshot_refcount > 0, "snapshot refcount underflow");
        inner.snapshot_refcount -= 1;
    }

    /// True while any detached snapshot acquirer still observes this page;
    /// gates copy-on-write in the write path.
    pub fn has_snapshot_references(&self) -> bool {
        self.inner.lock().snapshot_refcount > 0
    }

    /// Publishes the load result. Installing twice is a usage error.
    fn install(&self, block_token: BlockToken, buf: Vec<u8>) {
        {
            let mut inner = self.inner.lock();
            assert!(
                inner.buf.is_none() && inner.block_token.is_none(),
                "load result installed twice"
            );
            inner.buf = Some(buf);
            inner.block_token = Some(block_token);
        }
        self.loaded.pulse();
    }
}

/// Fetches the block's persisted bytes on the serializer's worker thread and
/// installs them, unless the page was destroyed or the owning cache started
/// draining while the read was in flight.
fn spawn_load(page: Weak<Page>, block_id: BlockId, context: LoadContext) {
    // The guard must exist before the thread does, or a concurrent cache
    // drain could return while this load is still about to start.
    let guard = context.drainer.guard();

    thread::Builder::new()
        .name(format!("page-load-{block_id}"))
        .spawn(move || {
            let result = context.serializer.read_index(block_id).and_then(|token| {
                let buf = context.serializer.allocate_buffer();
                let buf = context
                    .serializer
                    .read_block(token.clone(), buf, &context.reads_account)?;
                Ok((token, buf))
            });

            // The cache is tearing down; nothing wants the result anymore.
            if guard.is_draining() {
                return;
            }
            // The page was destroyed while the read was in flight.
            let Some(page) = page.upgrade() else {
                return;
            };

            match result {
                Ok((token, buf)) => page.install(token, buf),
                Err(SerializerError::MissingBlock(id)) => {
                    panic!("no persisted data for block {id}")
                }
                Err(e) => error!("failed to load block {block_id}: {e}"),
            }
        })
        .expect("failed to spawn page load thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::IoPriority;
    use crate::serializer::test_device::MemDevice;
    use std::time::Duration;

    const BLOCK_SIZE: usize = 64;

    fn load_context(serializer: Arc<Serializer>, drainer: Arc<Drainer>) -> LoadContext {
        let reads_account = serializer.create_io_account(IoPriority(90));
        LoadContext {
            serializer,
            reads_account,
            drainer,
        }
    }

    #[test]
    fn page_from_buf_is_immediately_ready() {
        let page = Page::from_buf(vec![0x42; BLOCK_SIZE]);
        assert!(page.loaded_signal().is_pulsed());
        page.with_buf(|buf| assert_eq!(buf, vec![0x42; BLOCK_SIZE]));
        assert!(page.block_token().is_none());
    }

    #[test]
    fn load_installs_bytes_from_the_store() {
        let mut device = MemDevice::new(BLOCK_SIZE);
        device.put_block(5, 0xA5);
        let serializer = Arc::new(Serializer::start(device));
        let drainer = Arc::new(Drainer::new());
        let context = load_context(serializer, drainer.clone());

        let page = Page::load(5, &context);
        page.with_buf(|buf| assert_eq!(buf, vec![0xA5; BLOCK_SIZE]));
        assert!(page.block_token().is_some());

        drainer.drain();
    }

    #[test]
    fn destroying_a_loading_page_discards_the_result() {
        let (mut device, gate) = MemDevice::gated(BLOCK_SIZE);
        device.put_block(5, 0xA5);
        let served = device.served_handle();
        let serializer = Arc::new(Serializer::start(device));
        let drainer = Arc::new(Drainer::new());
        let context = load_context(serializer, drainer.clone());

        let page = Page::load(5, &context);
        let weak = Arc::downgrade(&page);

        // Destroy the page while its read is still parked at the gate.
        drop(page);
        thread::sleep(Duration::from_millis(50));
        assert!(weak.upgrade().is_none());
        gate.send(()).unwrap();

        // Let the loader run its destroyed-check before draining starts, so
        // the discard is decided by the dead page handle alone.
        while served.lock().is_empty() {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(50));

        // The loader must finish without installing into freed state.
        drainer.drain();
        assert_eq!(*served.lock(), vec![5]);
    }

    #[test]
    fn make_copy_is_independent_of_the_original() {
        let original = Page::from_buf(vec![1; BLOCK_SIZE]);
        let copy = original.make_copy();

        copy.with_buf_mut(|buf| buf.fill(2));

        original.with_buf(|buf| assert_eq!(buf, vec![1; BLOCK_SIZE]));
        copy.with_buf(|buf| assert_eq!(buf, vec![2; BLOCK_SIZE]));
        assert!(!copy.has_snapshot_references());
    }

    #[test]
    fn snapshot_refcount_tracks_holders() {
        let page = Page::from_buf(vec![0; BLOCK_SIZE]);
        assert!(!page.has_snapshot_references());

        page.add_snapshotter();
        page.add_snapshotter();
        assert!(page.has_snapshot_references());

        page.remove_snapshotter();
        assert!(page.has_snapshot_references());
        page.remove_snapshotter();
        assert!(!page.has_snapshot_references());
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn removing_a_missing_snapshotter_panics() {
        let page = Page::from_buf(vec![0; BLOCK_SIZE]);
        page.remove_snapshotter();
    }

    #[test]
    #[should_panic(expected = "installed twice")]
    fn installing_over_a_ready_page_panics() {
        let page = Page::from_buf(vec![0; BLOCK_SIZE]);
        page.install(BlockToken { offset: 0 }, vec![0; BLOCK_SIZE]);
    }
}
