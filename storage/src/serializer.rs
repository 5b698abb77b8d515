//! Serializer module — handle over the durable block store and its io worker thread.
//!
//! All device access, io account creation and io account destruction happen on
//! the worker thread the serializer spawns at startup; callers submit requests
//! over a channel and block on a per-request reply. Read and write requests
//! are staged and serviced highest-account-priority first, account management
//! and index lookups are executed as they arrive.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use log::info;
use thiserror::Error;

/// Type representing block id, should be used instead of bare `u64`.
pub type BlockId = u64;

/// Relative priority of an [`IoAccount`]; higher is serviced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IoPriority(pub u8);

/// Opaque locator of a block's current persisted bytes, produced by
/// [`Serializer::read_index`] and consumed by [`Serializer::read_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockToken {
    pub(crate) offset: u64,
}

/// Scheduling account tagging io traffic with a priority class.
///
/// Accounts are created and released on the worker thread; issuing a request
/// through a released account is a fatal usage error.
#[derive(Debug, Clone)]
pub struct IoAccount {
    id: u64,
    priority: IoPriority,
}

/// Error for block store related operations.
#[derive(Debug, Error)]
pub enum SerializerError {
    /// The store has no persisted bytes for the requested block.
    #[error("no persisted data for block {0}")]
    MissingBlock(BlockId),
    /// File used for backing the store has invalid format.
    #[error("block store has invalid format: {0}")]
    InvalidFileFormat(String),
    /// Underlying io module returned error.
    #[error("io error occurred: {0}")]
    IoError(#[from] io::Error),
}

/// The durable store the worker thread drives. Implemented by
/// [`crate::block_file::BlockFile`] in production and by in-memory devices in
/// tests.
pub trait BlockDevice: Send + 'static {
    /// Size in bytes of every block in this store.
    fn block_size(&self) -> usize;

    /// Number of block ids with persisted (or at least reserved) bytes.
    fn block_count(&self) -> u64;

    /// Locates the current persisted bytes of `block_id`.
    fn read_index(&mut self, block_id: BlockId) -> Result<BlockToken, SerializerError>;

    /// Fills `buf` (exactly one block long) from the location `token` names.
    fn read_block(&mut self, token: &BlockToken, buf: &mut [u8]) -> Result<(), SerializerError>;

    /// Persists `buf` as the current bytes of `block_id`.
    fn write_block(&mut self, block_id: BlockId, buf: &[u8]) -> Result<BlockToken, SerializerError>;
}

enum IoRequest {
    CreateAccount {
        priority: IoPriority,
        reply: Sender<IoAccount>,
    },
    ReleaseAccount {
        account: IoAccount,
        reply: Sender<()>,
    },
    ReadIndex {
        block_id: BlockId,
        reply: Sender<Result<BlockToken, SerializerError>>,
    },
    ReadBlock {
        token: BlockToken,
        buf: Vec<u8>,
        account: IoAccount,
        reply: Sender<Result<Vec<u8>, SerializerError>>,
    },
    WriteBlock {
        block_id: BlockId,
        buf: Vec<u8>,
        account: IoAccount,
        reply: Sender<Result<BlockToken, SerializerError>>,
    },
}

impl IoRequest {
    /// Priority of a staged data request. Control requests are never staged.
    fn priority(&self) -> IoPriority {
        match self {
            IoRequest::ReadBlock { account, .. } | IoRequest::WriteBlock { account, .. } => {
                account.priority
            }
            _ => unreachable!("control requests are executed on receipt"),
        }
    }
}

/// Handle to the durable block store. The block size and block count are
/// captured from the device at startup, before any request is accepted.
pub struct Serializer {
    requests: Option<Sender<IoRequest>>,
    worker: Option<thread::JoinHandle<()>>,
    block_size: usize,
    block_count: u64,
}

impl Serializer {
    /// Takes exclusive ownership of `device` and spawns the worker thread that
    /// will service all requests against it.
    pub fn start(device: impl BlockDevice) -> Serializer {
        let block_size = device.block_size();
        let block_count = device.block_count();
        let (request_tx, request_rx) = channel::unbounded();

        let worker = SerializerWorker {
            device,
            requests: request_rx,
            accounts: HashMap::new(),
            next_account_id: 0,
            pending: Vec::new(),
        };
        let handle = thread::Builder::new()
            .name("serializer-io".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn serializer io thread");

        Serializer {
            requests: Some(request_tx),
            worker: Some(handle),
            block_size,
            block_count,
        }
    }

    /// Size in bytes of every block in the store.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of persisted blocks at the time the store was opened. Ids at or
    /// beyond this count have not been persisted yet.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Returns a caller-owned zeroed buffer sized to the store's block size.
    pub fn allocate_buffer(&self) -> Vec<u8> {
        vec![0; self.block_size]
    }

    /// Creates a scheduling account on the worker thread.
    pub fn create_io_account(&self, priority: IoPriority) -> IoAccount {
        self.submit(|reply| IoRequest::CreateAccount { priority, reply })
    }

    /// Releases a scheduling account on the worker thread. Releasing twice is
    /// a fatal usage error.
    pub fn release_io_account(&self, account: IoAccount) {
        self.submit(|reply| IoRequest::ReleaseAccount { account, reply })
    }

    /// Locates the current persisted bytes of `block_id`; reports
    /// [`SerializerError::MissingBlock`] if the store has none.
    pub fn read_index(&self, block_id: BlockId) -> Result<BlockToken, SerializerError> {
        self.submit(|reply| IoRequest::ReadIndex { block_id, reply })
    }

    /// Fills the pre-allocated `buf` from the location `token` names and hands
    /// it back. Scheduled through `account`.
    pub fn read_block(
        &self,
        token: BlockToken,
        buf: Vec<u8>,
        account: &IoAccount,
    ) -> Result<Vec<u8>, SerializerError> {
        assert_eq!(buf.len(), self.block_size, "destination buffer must be one block long");
        let account = account.clone();
        self.submit(|reply| IoRequest::ReadBlock { token, buf, account, reply })
    }

    /// Persists `buf` as the current bytes of `block_id`. Scheduled through
    /// `account`.
    pub fn write_block(
        &self,
        block_id: BlockId,
        buf: Vec<u8>,
        account: &IoAccount,
    ) -> Result<BlockToken, SerializerError> {
        assert_eq!(buf.len(), self.block_size, "source buffer must be one block long");
        let account = account.clone();
        self.submit(|reply| IoRequest::WriteBlock { block_id, buf, account, reply })
    }

    fn submit<T>(&self, request: impl FnOnce(Sender<T>) -> IoRequest) -> T {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.requests
            .as_ref()
            .expect("serializer is shutting down")
            .send(request(reply_tx))
            .expect("serializer io thread is gone");
        reply_rx.recv().expect("serializer io thread dropped a request")
    }
}

impl Drop for Serializer {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish staged work and exit.
        drop(mem::take(&mut self.requests));
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Runs on the worker thread; exclusively owns the device.
struct SerializerWorker<D> {
    device: D,
    requests: Receiver<IoRequest>,
    /// Live accounts by id. Requests naming an unknown id are a usage error.
    accounts: HashMap<u64, IoPriority>,
    next_account_id: u64,
    /// Staged data requests, serviced highest account priority first.
    pending: Vec<IoRequest>,
}

impl<D: BlockDevice> SerializerWorker<D> {
    fn run(mut self) {
        info!("serializer io thread started");
        loop {
            if self.pending.is_empty() {
                match self.requests.recv() {
                    Ok(request) => self.stage(request),
                    Err(_) => break,
                }
            }
            // Pull in everything already submitted so priorities can compete.
            while let Ok(request) = self.requests.try_recv() {
                self.stage(request);
            }
            if let Some(request) = self.pop_most_urgent() {
                self.execute(request);
            }
        }
        info!("serializer io thread shutting down");
    }

    fn stage(&mut self, request: IoRequest) {
        match request {
            IoRequest::CreateAccount { priority, reply } => {
                let id = self.next_account_id;
                self.next_account_id += 1;
                self.accounts.insert(id, priority);
                let _ = reply.send(IoAccount { id, priority });
            }
            IoRequest::ReleaseAccount { account, reply } => {
                let released = self.accounts.remove(&account.id).is_some();
                assert!(released, "io account {} released twice", account.id);
                let _ = reply.send(());
            }
            IoRequest::ReadIndex { block_id, reply } => {
                let _ = reply.send(self.device.read_index(block_id));
            }
            request @ (IoRequest::ReadBlock { .. } | IoRequest::WriteBlock { .. }) => {
                self.pending.push(request);
            }
        }
    }

    /// Picks the highest-priority staged request, oldest first among equals.
    fn pop_most_urgent(&mut self) -> Option<IoRequest> {
        let index = self
            .pending
            .iter()
            .enumerate()
            .max_by_key(|(index, request)| (request.priority(), Reverse(*index)))
            .map(|(index, _)| index)?;
        Some(self.pending.remove(index))
    }

    fn execute(&mut self, request: IoRequest) {
        match request {
            IoRequest::ReadBlock { token, mut buf, account, reply } => {
                self.check_account(&account);
                let result = self.device.read_block(&token, &mut buf).map(|()| buf);
                let _ = reply.send(result);
            }
            IoRequest::WriteBlock { block_id, buf, account, reply } => {
                self.check_account(&account);
                let _ = reply.send(self.device.write_block(block_id, &buf));
            }
            _ => unreachable!("control requests are executed on receipt"),
        }
    }

    fn check_account(&self, account: &IoAccount) {
        assert!(
            self.accounts.contains_key(&account.id),
            "io request issued through released account {}",
            account.id
        );
    }
}

#[cfg(test)]
pub(crate) mod test_device {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// In-memory [`BlockDevice`] whose reads can be gated: every
    /// [`BlockDevice::read_block`] call first waits for one token from the
    /// gate sender, letting tests hold loads in flight and release them at a
    /// chosen moment. Dropping the sender opens the gate permanently.
    pub(crate) struct MemDevice {
        block_size: usize,
        blocks: HashMap<BlockId, Vec<u8>>,
        block_count: u64,
        gate: Option<Receiver<()>>,
        served: Arc<Mutex<Vec<BlockId>>>,
    }

    impl MemDevice {
        pub(crate) fn new(block_size: usize) -> MemDevice {
            MemDevice {
                block_size,
                blocks: HashMap::new(),
                block_count: 0,
                gate: None,
                served: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn gated(block_size: usize) -> (MemDevice, Sender<()>) {
            let (gate_tx, gate_rx) = channel::unbounded();
            let mut device = MemDevice::new(block_size);
            device.gate = Some(gate_rx);
            (device, gate_tx)
        }

        /// Seeds a block with `byte` repeated, without going through the
        /// serializer.
        pub(crate) fn put_block(&mut self, block_id: BlockId, byte: u8) {
            self.blocks.insert(block_id, vec![byte; self.block_size]);
            self.block_count = self.block_count.max(block_id + 1);
        }

        /// Handle observing the order in which block reads were served.
        pub(crate) fn served_handle(&self) -> Arc<Mutex<Vec<BlockId>>> {
            self.served.clone()
        }

        fn block_id_of(&self, token: &BlockToken) -> BlockId {
            token.offset / self.block_size as u64
        }
    }

    impl BlockDevice for MemDevice {
        fn block_size(&self) -> usize {
            self.block_size
        }

        fn block_count(&self) -> u64 {
            self.block_count
        }

        fn read_index(&mut self, block_id: BlockId) -> Result<BlockToken, SerializerError> {
            if !self.blocks.contains_key(&block_id) {
                return Err(SerializerError::MissingBlock(block_id));
            }
            Ok(BlockToken { offset: block_id * self.block_size as u64 })
        }

        fn read_block(&mut self, token: &BlockToken, buf: &mut [u8]) -> Result<(), SerializerError> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            let block_id = self.block_id_of(token);
            self.served.lock().push(block_id);
            let block = self
                .blocks
                .get(&block_id)
                .unwrap_or_else(|| panic!("read of unseeded block {block_id}"));
            buf.copy_from_slice(block);
            Ok(())
        }

        fn write_block(&mut self, block_id: BlockId, buf: &[u8]) -> Result<BlockToken, SerializerError> {
            self.blocks.insert(block_id, buf.to_vec());
            self.block_count = self.block_count.max(block_id + 1);
            Ok(BlockToken { offset: block_id * self.block_size as u64 })
        }
    }
}
