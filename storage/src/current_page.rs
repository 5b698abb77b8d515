//! CurrentPage module — per-block arbitration of concurrent page acquisitions.
//!
//! Acquirers queue in strict arrival order. Readers at the front of the queue
//! share read access; a writer gets exclusive access only once it reaches the
//! head, and nothing is granted past a writer. A reader that declares itself
//! snapshotted detaches from the queue with a pinned reference to the page it
//! saw, so long-lived readers never hold up writers behind them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::page::{LoadContext, Page};
use crate::serializer::BlockId;
use crate::signal::Signal;

/// Requested access mode of a [`CurrentPageAcquisition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// The arbitration point for the latest version of one block.
///
/// Handed out by [`crate::cache::PageCache`]; one instance per block id for
/// the life of the cache, so callers may hold on to it across acquisitions.
pub struct CurrentPage {
    state: Mutex<CurrentPageState>,
}

struct CurrentPageState {
    /// Present until the first access materializes the page; conversion
    /// happens at most once.
    backing: Option<Backing>,
    page: Option<Arc<Page>>,
    /// Outstanding acquirers in arrival order. Never reordered.
    queue: VecDeque<Arc<AcquisitionState>>,
}

struct Backing {
    block_id: BlockId,
    load_context: LoadContext,
}

/// The part of an acquisition shared between its handle and the queue.
struct AcquisitionState {
    access: AccessMode,
    declared_snapshotted: AtomicBool,
    read_signal: Signal,
    write_signal: Signal,
    /// The pinned page, set when a snapshotted reader detaches from the
    /// queue.
    snapshot: Mutex<Option<Arc<Page>>>,
}

impl AcquisitionState {
    fn declared_snapshotted(&self) -> bool {
        self.declared_snapshotted.load(Ordering::Relaxed)
    }
}

fn position(queue: &VecDeque<Arc<AcquisitionState>>, acquisition: &Arc<AcquisitionState>) -> Option<usize> {
    queue.iter().position(|member| Arc::ptr_eq(member, acquisition))
}

impl CurrentPage {
    /// A current page backed only by its block id; the page itself is
    /// materialized (and its load started) on first access.
    pub(crate) fn with_backing(block_id: BlockId, load_context: LoadContext) -> CurrentPage {
        CurrentPage {
            state: Mutex::new(CurrentPageState {
                backing: Some(Backing { block_id, load_context }),
                page: None,
                queue: VecDeque::new(),
            }),
        }
    }

    /// A current page that is materialized from the start. Used for freshly
    /// allocated blocks, which never load anything.
    pub(crate) fn with_page(page: Arc<Page>) -> CurrentPage {
        CurrentPage {
            state: Mutex::new(CurrentPageState {
                backing: None,
                page: Some(page),
                queue: VecDeque::new(),
            }),
        }
    }

    fn add_acquirer(&self, acquisition: &Arc<AcquisitionState>) {
        let mut state = self.state.lock();
        state.queue.push_back(acquisition.clone());
        let index = state.queue.len() - 1;
        Self::pulse_pulsables(&mut state, index);
    }

    fn remove_acquirer(&self, acquisition: &Arc<AcquisitionState>) {
        let mut state = self.state.lock();
        // A snapshotted acquirer already left the queue when it detached.
        let Some(index) = position(&state.queue, acquisition) else {
            return;
        };
        state.queue.remove(index);
        // Removing a blocker may unblock the successor.
        if index < state.queue.len() {
            Self::pulse_pulsables(&mut state, index);
        }
    }

    fn declare_snapshotted(&self, acquisition: &Arc<AcquisitionState>) {
        let mut state = self.state.lock();
        acquisition.declared_snapshotted.store(true, Ordering::Relaxed);
        if let Some(index) = position(&state.queue, acquisition) {
            Self::pulse_pulsables(&mut state, index);
        }
    }

    /// Grants readiness down the queue starting at `start`, enforcing the
    /// coexistence rule: readers share, a writer is exclusive, and nothing
    /// propagates past a writer.
    fn pulse_pulsables(state: &mut CurrentPageState, start: usize) {
        // Nothing to pulse unless the previous member is a reader already
        // holding read access; the head of the queue is always eligible.
        if start > 0 {
            let previous = &state.queue[start - 1];
            if !(previous.access == AccessMode::Read && previous.read_signal.is_pulsed()) {
                return;
            }
        }

        // Avoid re-pulsing an already granted chain, except when the starting
        // reader has since declared itself snapshotted and still has to be
        // detached.
        {
            let acquisition = &state.queue[start];
            if acquisition.access == AccessMode::Read
                && acquisition.read_signal.is_pulsed()
                && !acquisition.declared_snapshotted()
            {
                return;
            }
        }

        let mut index = start;
        while index < state.queue.len() {
            let acquisition = state.queue[index].clone();

            match acquisition.access {
                AccessMode::Read => {
                    if acquisition.declared_snapshotted() {
                        // Snapshotters leave the queue to make way for write
                        // acquirers; they pin the page they were granted. The
                        // pin must be published before the signal fires, or a
                        // waiter could wake and read past a copy-on-write.
                        let page = Self::materialized_page(state);
                        page.add_snapshotter();
                        *acquisition.snapshot.lock() = Some(page);
                        state.queue.remove(index);
                        acquisition.read_signal.pulse_if_not_pulsed();
                        // The next member now sits at `index`.
                    } else {
                        acquisition.read_signal.pulse_if_not_pulsed();
                        index += 1;
                    }
                }
                AccessMode::Write => {
                    // A write acquirer gets read access too, but exclusive
                    // write access only as the head of the queue.
                    acquisition.read_signal.pulse_if_not_pulsed();
                    if index == 0 {
                        acquisition.write_signal.pulse_if_not_pulsed();
                    }
                    break;
                }
            }
        }
    }

    /// Converts from the bare block id into a materialized [`Page`] on first
    /// access; at most once, and a no-op when re-entered.
    fn materialized_page(state: &mut CurrentPageState) -> Arc<Page> {
        if let Some(page) = &state.page {
            return page.clone();
        }
        let backing = state
            .backing
            .take()
            .expect("current page has neither page nor backing");
        let page = Page::load(backing.block_id, &backing.load_context);
        state.page = Some(page.clone());
        page
    }

    pub(crate) fn latest_page_for_read(&self) -> Arc<Page> {
        let mut state = self.state.lock();
        Self::materialized_page(&mut state)
    }

    pub(crate) fn latest_page_for_write(&self) -> Arc<Page> {
        let page = {
            let mut state = self.state.lock();
            Self::materialized_page(&mut state)
        };
        if !page.has_snapshot_references() {
            return page;
        }
        // Copy-on-write: detached snapshotters keep observing the old bytes.
        let copy = page.make_copy();
        self.state.lock().page = Some(copy.clone());
        copy
    }

    /// Destroying a cache with acquirers still attached is a usage error.
    pub(crate) fn assert_no_acquirers(&self) {
        assert!(
            self.state.lock().queue.is_empty(),
            "current page destroyed with acquirers still attached"
        );
    }
}

impl Drop for CurrentPage {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        assert!(
            state.queue.is_empty(),
            "current page destroyed with acquirers still attached"
        );
    }
}

/// A single caller's scoped request for the current version of one block.
///
/// Dropping the acquisition releases it: it leaves the queue it still
/// occupies (re-pulsing its successor) and lets go of any pinned snapshot,
/// whether or not the acquisition ever completed.
pub struct CurrentPageAcquisition {
    current_page: Arc<CurrentPage>,
    state: Arc<AcquisitionState>,
}

impl CurrentPageAcquisition {
    /// Enqueues a new acquisition on `current_page`.
    pub fn new(current_page: Arc<CurrentPage>, access: AccessMode) -> CurrentPageAcquisition {
        let state = Arc::new(AcquisitionState {
            access,
            declared_snapshotted: AtomicBool::new(false),
            read_signal: Signal::new(),
            write_signal: Signal::new(),
            snapshot: Mutex::new(None),
        });
        current_page.add_acquirer(&state);
        CurrentPageAcquisition { current_page, state }
    }

    /// Detaches this read acquisition from queue arbitration as soon as read
    /// access is granted; it keeps observing the page it pinned indefinitely.
    /// Idempotent.
    pub fn declare_snapshotted(&self) {
        assert_eq!(
            self.state.access,
            AccessMode::Read,
            "only read acquisitions can be snapshotted"
        );
        self.current_page.declare_snapshotted(&self.state);
    }

    /// Fires once this acquisition holds read access.
    pub fn read_ready_signal(&self) -> &Signal {
        &self.state.read_signal
    }

    /// Fires once this acquisition holds exclusive write access.
    pub fn write_ready_signal(&self) -> &Signal {
        assert_eq!(
            self.state.access,
            AccessMode::Write,
            "read acquisitions have no write signal"
        );
        &self.state.write_signal
    }

    /// Blocks until read access is granted, then returns the pinned snapshot
    /// page if this acquisition detached, else the current page's
    /// materialized page.
    pub fn page_for_read(&self) -> Arc<Page> {
        self.state.read_signal.wait();
        if let Some(page) = self.state.snapshot.lock().as_ref() {
            return page.clone();
        }
        self.current_page.latest_page_for_read()
    }

    /// Blocks until exclusive write access is granted. If any snapshotter
    /// still references the current page, it is duplicated first so no
    /// snapshot ever observes the coming mutation.
    pub fn page_for_write(&self) -> Arc<Page> {
        assert_eq!(
            self.state.access,
            AccessMode::Write,
            "read acquisitions cannot take the write path"
        );
        self.state.write_signal.wait();
        self.current_page.latest_page_for_write()
    }
}

impl Drop for CurrentPageAcquisition {
    fn drop(&mut self) {
        self.current_page.remove_acquirer(&self.state);
        if let Some(page) = self.state.snapshot.lock().take() {
            page.remove_snapshotter();
        }
    }
}
