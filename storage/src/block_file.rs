//! BlockFile module — file-backed durable block store.
//!
//! The file is divided into fixed-size blocks. Slot 0 is reserved for a
//! [`FileHeader`]; block id `b` lives at byte offset `(b + 1) * block_size`.
//! The header records how many block ids have persisted bytes, so a read of a
//! never-written id can be reported as missing instead of handing out
//! garbage.

use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::serializer::{BlockDevice, BlockId, BlockToken, SerializerError};

/// Block size used when the caller has no reason to pick another one.
pub const DEFAULT_BLOCK_SIZE: usize = 4096; // 4 kB

/// Stored in slot 0 of the file. Everything [`BlockFile`] needs to validate
/// and address the rest of the file.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FileHeader {
    magic_number: [u8; 4],
    version: u32,
    block_size: u32,
    _reserved: u32,
    /// Ids below this count have persisted (or zero-filled) bytes.
    block_count: u64,
}

impl FileHeader {
    const MAGIC_NUMBER: [u8; 4] = *b"BLKS";
    const VERSION: u32 = 1;
}

/// Responsible for managing a single on-disk block file. Only this structure
/// should be communicating with the disk directly.
pub struct BlockFile {
    handle: fs::File,
    header: FileHeader,
}

impl BlockFile {
    /// Opens the block file at `file_path`, creating it when it does not
    /// exist yet. An existing file must carry a valid header recording the
    /// same `block_size`.
    pub fn new<P>(file_path: P, block_size: usize) -> Result<BlockFile, SerializerError>
    where
        P: AsRef<Path>,
    {
        assert!(
            block_size >= size_of::<FileHeader>(),
            "block size {block_size} cannot hold the file header"
        );
        assert!(block_size <= u32::MAX as usize, "block size {block_size} out of range");

        let exists = file_path.as_ref().try_exists()?;
        match exists {
            true => {
                let file = fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&file_path)?;
                BlockFile::load(file, block_size)
            }
            false => {
                if let Some(parent) = file_path.as_ref().parent() {
                    fs::create_dir_all(parent)?;
                }

                let file = fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&file_path)?;
                let header = FileHeader {
                    magic_number: FileHeader::MAGIC_NUMBER,
                    version: FileHeader::VERSION,
                    block_size: block_size as u32,
                    _reserved: 0,
                    block_count: 0,
                };
                let mut block_file = BlockFile { handle: file, header };
                block_file.update_size()?;
                block_file.sync_header()?;
                Ok(block_file)
            }
        }
    }

    /// Loads an existing file, validating its header against `block_size`.
    fn load(mut file: fs::File, block_size: usize) -> Result<BlockFile, SerializerError> {
        let mut header_bytes = [0u8; size_of::<FileHeader>()];
        file.seek(io::SeekFrom::Start(0))?;
        file.read_exact(&mut header_bytes)?;

        let header: FileHeader = bytemuck::pod_read_unaligned(&header_bytes);
        if header.magic_number != FileHeader::MAGIC_NUMBER {
            return Err(SerializerError::InvalidFileFormat(format!(
                "invalid magic number ('{:?}')",
                header.magic_number
            )));
        }
        if header.version != FileHeader::VERSION {
            return Err(SerializerError::InvalidFileFormat(format!(
                "unsupported version ({})",
                header.version
            )));
        }
        if header.block_size as usize != block_size {
            return Err(SerializerError::InvalidFileFormat(format!(
                "file has block size {}, expected {}",
                header.block_size, block_size
            )));
        }

        Ok(BlockFile { handle: file, header })
    }

    /// Byte offset of `block_id`, accounting for the header slot.
    fn block_offset(&self, block_id: BlockId) -> u64 {
        (block_id + 1) * self.header.block_size as u64
    }

    /// Writes the in-memory header back into slot 0.
    fn sync_header(&mut self) -> Result<(), SerializerError> {
        self.handle.seek(io::SeekFrom::Start(0))?;
        self.handle.write_all(bytemuck::bytes_of(&self.header))?;
        Ok(())
    }

    /// Grows the file to hold every block below `block_count`, so ids written
    /// out of order leave zero-filled holes rather than short reads.
    fn update_size(&mut self) -> Result<(), SerializerError> {
        let new_size = (self.header.block_count + 1) * self.header.block_size as u64;
        self.handle.set_len(new_size)?;
        Ok(())
    }
}

impl BlockDevice for BlockFile {
    fn block_size(&self) -> usize {
        self.header.block_size as usize
    }

    fn block_count(&self) -> u64 {
        self.header.block_count
    }

    fn read_index(&mut self, block_id: BlockId) -> Result<BlockToken, SerializerError> {
        if block_id >= self.header.block_count {
            return Err(SerializerError::MissingBlock(block_id));
        }
        Ok(BlockToken { offset: self.block_offset(block_id) })
    }

    fn read_block(&mut self, token: &BlockToken, buf: &mut [u8]) -> Result<(), SerializerError> {
        assert_eq!(buf.len(), self.block_size(), "destination buffer must be one block long");
        self.handle.seek(io::SeekFrom::Start(token.offset))?;
        self.handle.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&mut self, block_id: BlockId, buf: &[u8]) -> Result<BlockToken, SerializerError> {
        assert_eq!(buf.len(), self.block_size(), "source buffer must be one block long");

        if block_id >= self.header.block_count {
            self.header.block_count = block_id + 1;
            self.update_size()?;
            self.sync_header()?;
        }

        let offset = self.block_offset(block_id);
        self.handle.seek(io::SeekFrom::Start(offset))?;
        self.handle.write_all(buf)?;
        Ok(BlockToken { offset })
    }
}
