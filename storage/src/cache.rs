//! Cache module — per-data-file registry of current pages.
//!
//! One [`PageCache`] per open data file. It maps block ids to their
//! [`CurrentPage`] arbitration points, owns the serializer handle and the two
//! io scheduling accounts all cache traffic is tagged with, and bounds every
//! in-flight background load to its own lifetime.

use std::sync::Arc;

use dashmap::DashMap;

use crate::current_page::CurrentPage;
use crate::drainer::Drainer;
use crate::free_list::FreeList;
use crate::page::{LoadContext, Page};
use crate::serializer::{BlockId, IoAccount, IoPriority, Serializer};

/// Priority of the account cache reads are issued through. Reads sit above
/// writes so a page fault is not stuck behind a flush backlog.
const CACHE_READS_IO_PRIORITY: IoPriority = IoPriority(90);
/// Priority of the account cache writes are issued through.
const CACHE_WRITES_IO_PRIORITY: IoPriority = IoPriority(50);

/// Registry of every block's [`CurrentPage`], growing on demand.
///
/// A handed-out [`CurrentPage`] keeps its identity for the life of the cache,
/// so callers may hold it across acquisitions of the same block id.
pub struct PageCache {
    serializer: Arc<Serializer>,
    free_list: FreeList,
    current_pages: DashMap<BlockId, Arc<CurrentPage>>,
    drainer: Arc<Drainer>,
    reads_io_account: Option<IoAccount>,
    writes_io_account: Option<IoAccount>,
}

impl PageCache {
    /// Creates a cache over the store behind `serializer`.
    ///
    /// The io accounts are created on the serializer's worker thread here and
    /// released there again on drop, never anywhere else.
    pub fn new(serializer: Arc<Serializer>) -> PageCache {
        let reads_io_account = serializer.create_io_account(CACHE_READS_IO_PRIORITY);
        let writes_io_account = serializer.create_io_account(CACHE_WRITES_IO_PRIORITY);
        let free_list = FreeList::new(&serializer);
        PageCache {
            serializer,
            free_list,
            current_pages: DashMap::new(),
            drainer: Arc::new(Drainer::new()),
            reads_io_account: Some(reads_io_account),
            writes_io_account: Some(writes_io_account),
        }
    }

    /// Returns the [`CurrentPage`] for `block_id`, creating it backed by the
    /// block id (content not yet loaded) on first reference. Repeated calls
    /// with the same id return the identical instance.
    pub fn page_for_block_id(&self, block_id: BlockId) -> Arc<CurrentPage> {
        self.current_pages
            .entry(block_id)
            .or_insert_with(|| {
                Arc::new(CurrentPage::with_backing(block_id, self.load_context()))
            })
            .clone()
    }

    /// Allocates a fresh block id and returns its [`CurrentPage`], whose page
    /// is immediately ready with a zeroed buffer, bypassing the load path
    /// entirely.
    pub fn page_for_new_block_id(&self) -> (Arc<CurrentPage>, BlockId) {
        let block_id = self.free_list.acquire_block_id();
        let page = Page::from_buf(self.serializer.allocate_buffer());
        let current_page = Arc::new(CurrentPage::with_page(page));
        let previous = self.current_pages.insert(block_id, current_page.clone());
        assert!(
            previous.is_none(),
            "fresh block id {block_id} already had a current page"
        );
        (current_page, block_id)
    }

    /// The serializer this cache reads and writes through.
    pub fn serializer(&self) -> &Arc<Serializer> {
        &self.serializer
    }

    /// The account the write-back path should tag its io with.
    pub fn writes_io_account(&self) -> &IoAccount {
        self.writes_io_account
            .as_ref()
            .expect("cache is shutting down")
    }

    fn load_context(&self) -> LoadContext {
        LoadContext {
            serializer: self.serializer.clone(),
            reads_account: self
                .reads_io_account
                .clone()
                .expect("cache is shutting down"),
            drainer: self.drainer.clone(),
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        // First make sure no load task can touch a page after this point.
        self.drainer.drain();

        // Entries must be idle by now; acquirers outliving the cache are a
        // usage error.
        for entry in self.current_pages.iter() {
            entry.value().assert_no_acquirers();
        }
        self.current_pages.clear();

        // Io accounts are released on the worker thread they were created on.
        if let Some(account) = self.reads_io_account.take() {
            self.serializer.release_io_account(account);
        }
        if let Some(account) = self.writes_io_account.take() {
            self.serializer.release_io_account(account);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::current_page::{AccessMode, CurrentPageAcquisition};
    use crate::serializer::test_device::MemDevice;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    const BLOCK_SIZE: usize = 64;

    fn cache_over(device: MemDevice) -> PageCache {
        let _ = env_logger::builder().is_test(true).try_init();
        PageCache::new(Arc::new(Serializer::start(device)))
    }

    #[test]
    fn page_for_block_id_is_idempotent() {
        let cache = cache_over(MemDevice::new(BLOCK_SIZE));

        let first = cache.page_for_block_id(5);
        let second = cache.page_for_block_id(5);
        assert!(Arc::ptr_eq(&first, &second));

        let other = cache.page_for_block_id(6);
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn fresh_blocks_get_monotonic_ids_and_ready_pages() {
        let mut device = MemDevice::new(BLOCK_SIZE);
        device.put_block(0, 1);
        device.put_block(1, 2);
        let cache = cache_over(device);

        let (page_one, id_one) = cache.page_for_new_block_id();
        let (_page_two, id_two) = cache.page_for_new_block_id();
        assert_eq!(id_one, 2);
        assert_eq!(id_two, 3);

        // No asynchronous wait: the acquisition is ready at once and the
        // buffer is zeroed.
        let write = CurrentPageAcquisition::new(page_one.clone(), AccessMode::Write);
        assert!(write.read_ready_signal().is_pulsed());
        assert!(write.write_ready_signal().is_pulsed());
        write.page_for_write().with_buf(|buf| assert_eq!(buf, vec![0; BLOCK_SIZE]));
        drop(write);

        // The registry knows the fresh block under its id.
        assert!(Arc::ptr_eq(&page_one, &cache.page_for_block_id(id_one)));
    }

    #[test]
    fn read_acquisition_loads_the_block_from_the_store() {
        let mut device = MemDevice::new(BLOCK_SIZE);
        device.put_block(5, 0xA5);
        let cache = cache_over(device);

        let page = cache.page_for_block_id(5);
        let read = CurrentPageAcquisition::new(page, AccessMode::Read);
        read.page_for_read()
            .with_buf(|buf| assert_eq!(buf, vec![0xA5; BLOCK_SIZE]));
    }

    #[test]
    fn load_completes_only_once_the_store_serves_it() {
        let (mut device, gate) = MemDevice::gated(BLOCK_SIZE);
        device.put_block(5, 0xA5);
        let cache = cache_over(device);

        let page = cache.page_for_block_id(5);
        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let done = done.clone();
            thread::spawn(move || {
                let read = CurrentPageAcquisition::new(page, AccessMode::Read);
                read.page_for_read()
                    .with_buf(|buf| assert_eq!(buf, vec![0xA5; BLOCK_SIZE]));
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst), "read finished before the store served it");

        gate.send(()).unwrap();
        reader.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn cache_drop_waits_for_in_flight_loads() {
        let (mut device, gate) = MemDevice::gated(BLOCK_SIZE);
        device.put_block(5, 0xA5);
        let served = device.served_handle();
        let cache = cache_over(device);

        // Start the load, then abandon the acquisition so only the load
        // itself keeps the cache busy.
        {
            let page = cache.page_for_block_id(5);
            let read = CurrentPageAcquisition::new(page, AccessMode::Read);
            let _loading = read.page_for_read();
        }

        let done = Arc::new(AtomicBool::new(false));
        let dropper = {
            let done = done.clone();
            thread::spawn(move || {
                drop(cache);
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst), "cache dropped with a load still in flight");

        gate.send(()).unwrap();
        dropper.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(*served.lock(), vec![5]);
    }
}
