use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use hashbrown::HashMap;

use crate::{error::validation, Error};

/// Positive block-storage address. Ids start at 1; 0 is never a valid block.
pub type BlockId = i32;

const ENOSPC: i32 = 28;

/// Transactional block storage, addressed by `block_id * block_size` byte
/// offsets. Each block holds up to `block_size` payload bytes and remembers
/// the exact length written into it.
///
/// Mutations performed between [`begin`](Self::begin) and
/// [`commit`](Self::commit) can be undone with [`rollback`](Self::rollback);
/// mutations outside a transaction apply immediately.
pub trait BlockStorage {
    /// Usable payload bytes per block.
    fn block_size(&self) -> usize;

    /// Allocates a fresh block id, recycling freed ids first.
    fn reserve(&mut self) -> Result<BlockId, Error>;

    /// First write into a reserved block.
    fn write(&mut self, id: BlockId, data: &[u8]) -> Result<(), Error>;

    /// Rewrites a block that already holds data.
    fn update(&mut self, id: BlockId, data: &[u8]) -> Result<(), Error>;

    /// Length of the data last written to `id`.
    fn data_length(&self, id: BlockId) -> Result<usize, Error>;

    /// Reads the block's data into `buf` (replacing its contents).
    fn read(&self, id: BlockId, buf: &mut Vec<u8>) -> Result<(), Error>;

    /// Releases the block for reuse.
    fn free(&mut self, id: BlockId) -> Result<(), Error>;

    fn begin(&mut self) -> Result<(), Error>;
    fn commit(&mut self) -> Result<(), Error>;
    fn rollback(&mut self) -> Result<(), Error>;
}

#[derive(Debug, Clone, Default)]
struct Journal {
    /// Pre-images of touched blocks; `None` = block didn't exist yet.
    touched: HashMap<BlockId, Option<Vec<u8>>>,
    prior_count: BlockId,
    prior_free: Vec<BlockId>,
}

/// In-memory block storage, for tests and ephemeral indices.
#[derive(Debug, Default)]
pub struct MemStorage {
    block_size: usize,
    blocks: Vec<Option<Vec<u8>>>,
    free_ids: Vec<BlockId>,
    txn: Option<Journal>,
}

impl MemStorage {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            ..Default::default()
        }
    }

    fn slot(&self, id: BlockId) -> Result<&Option<Vec<u8>>, Error> {
        usize::try_from(id - 1)
            .ok()
            .and_then(|i| self.blocks.get(i))
            .ok_or_else(|| validation!("block {id} was never reserved"))
    }

    fn check_len(&self, id: BlockId, data: &[u8]) -> Result<(), Error> {
        if data.len() > self.block_size {
            return Err(validation!(
                "data length {} exceeds block size {} for block {id}",
                data.len(),
                self.block_size
            ));
        }
        Ok(())
    }

    fn journal_block(&mut self, id: BlockId) {
        if let Some(txn) = &mut self.txn {
            if id <= txn.prior_count {
                let prior = self.blocks[(id - 1) as usize].clone();
                txn.touched.entry(id).or_insert(prior);
            }
        }
    }
}

impl BlockStorage for MemStorage {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn reserve(&mut self) -> Result<BlockId, Error> {
        if let Some(id) = self.free_ids.pop() {
            return Ok(id);
        }
        self.blocks.push(None);
        Ok(self.blocks.len() as BlockId)
    }

    fn write(&mut self, id: BlockId, data: &[u8]) -> Result<(), Error> {
        self.check_len(id, data)?;
        if self.slot(id)?.is_some() {
            return Err(validation!("block {id} already written, use update"));
        }
        self.journal_block(id);
        self.blocks[(id - 1) as usize] = Some(data.to_vec());
        Ok(())
    }

    fn update(&mut self, id: BlockId, data: &[u8]) -> Result<(), Error> {
        self.check_len(id, data)?;
        if self.slot(id)?.is_none() {
            return Err(validation!("block {id} holds no data to update"));
        }
        self.journal_block(id);
        self.blocks[(id - 1) as usize] = Some(data.to_vec());
        Ok(())
    }

    fn data_length(&self, id: BlockId) -> Result<usize, Error> {
        match self.slot(id)? {
            Some(data) => Ok(data.len()),
            None => Err(validation!("block {id} holds no data")),
        }
    }

    fn read(&self, id: BlockId, buf: &mut Vec<u8>) -> Result<(), Error> {
        match self.slot(id)? {
            Some(data) => {
                buf.clear();
                buf.try_reserve_exact(data.len())?;
                buf.extend_from_slice(data);
                Ok(())
            }
            None => Err(validation!("block {id} holds no data")),
        }
    }

    fn free(&mut self, id: BlockId) -> Result<(), Error> {
        self.slot(id)?;
        self.journal_block(id);
        self.blocks[(id - 1) as usize] = None;
        self.free_ids.push(id);
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        if self.txn.is_some() {
            return Err(validation!("transaction already open"));
        }
        self.txn = Some(Journal {
            touched: Default::default(),
            prior_count: self.blocks.len() as BlockId,
            prior_free: self.free_ids.clone(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.txn
            .take()
            .map(|_| ())
            .ok_or_else(|| validation!("no open transaction"))
    }

    fn rollback(&mut self) -> Result<(), Error> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| validation!("no open transaction"))?;
        self.blocks.truncate(txn.prior_count as usize);
        for (id, prior) in txn.touched {
            self.blocks[(id - 1) as usize] = prior;
        }
        self.free_ids = txn.prior_free;
        Ok(())
    }
}

/// Positioned file I/O, portable across unix and windows.
pub(crate) trait FileExt {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;
}

impl FileExt for File {
    #[cfg(unix)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match std::os::windows::fs::FileExt::seek_read(self, buf, offset) {
                Ok(0) => break,
                Ok(n) => {
                    let tmp = buf;
                    buf = &mut tmp[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if !buf.is_empty() {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ))
        } else {
            Ok(())
        }
    }

    #[cfg(unix)]
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match std::os::windows::fs::FileExt::seek_write(self, buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    ));
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Block storage over a regular file.
///
/// Each block occupies a fixed frame of `4 + block_size` bytes at offset
/// `(id - 1) * frame`: a little endian length prefix followed by the payload.
/// Rollback replays in-memory pre-images; the free list is not persisted, so
/// a reopened file only recycles blocks freed during its own session.
#[derive(Debug)]
pub struct FileStorage {
    file: File,
    path: PathBuf,
    block_size: usize,
    count: BlockId,
    free_ids: Vec<BlockId>,
    txn: Option<Journal>,
}

impl FileStorage {
    const LEN_PREFIX: usize = 4;

    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let frame = (Self::LEN_PREFIX + block_size) as u64;
        let file_len = file.metadata()?.len();
        if file_len % frame != 0 {
            return Err(validation!(
                "file length {file_len} is not a multiple of the {frame} byte frame"
            ));
        }
        Ok(Self {
            file,
            path,
            block_size,
            count: (file_len / frame) as BlockId,
            free_ids: Vec::new(),
            txn: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn frame(&self) -> usize {
        Self::LEN_PREFIX + self.block_size
    }

    fn offset(&self, id: BlockId) -> u64 {
        (id - 1) as u64 * self.frame() as u64
    }

    fn check_id(&self, id: BlockId) -> Result<(), Error> {
        if id < 1 || id > self.count {
            return Err(validation!("block {id} was never reserved"));
        }
        Ok(())
    }

    fn read_frame(&self, id: BlockId) -> Result<(usize, Vec<u8>), Error> {
        self.check_id(id)?;
        let mut frame = vec![0u8; self.frame()];
        self.file
            .read_exact_at(&mut frame, self.offset(id))
            .map_err(map_io)?;
        let len = u32::from_le_bytes(frame[..Self::LEN_PREFIX].try_into().unwrap()) as usize;
        if len > self.block_size {
            return Err(validation!("block {id} holds no data"));
        }
        Ok((len, frame))
    }

    fn write_frame(&mut self, id: BlockId, data: &[u8]) -> Result<(), Error> {
        let mut frame = vec![0u8; self.frame()];
        frame[..Self::LEN_PREFIX].copy_from_slice(&(data.len() as u32).to_le_bytes());
        frame[Self::LEN_PREFIX..Self::LEN_PREFIX + data.len()].copy_from_slice(data);
        self.file
            .write_all_at(&frame, self.offset(id))
            .map_err(map_io)
    }

    /// Marker length meaning "no data": frames are zeroed on reserve, but a
    /// freed block must not read back as an empty write.
    const FREED: u32 = u32::MAX;

    fn journal_block(&mut self, id: BlockId) -> Result<(), Error> {
        if self.txn.is_some() && id <= self.txn.as_ref().unwrap().prior_count {
            if !self.txn.as_ref().unwrap().touched.contains_key(&id) {
                let prior = match self.data_len(id)? {
                    Some(len) => {
                        let (_, frame) = self.read_frame(id)?;
                        Some(frame[Self::LEN_PREFIX..Self::LEN_PREFIX + len].to_vec())
                    }
                    None => None,
                };
                self.txn.as_mut().unwrap().touched.insert(id, prior);
            }
        }
        Ok(())
    }

    fn data_len(&self, id: BlockId) -> Result<Option<usize>, Error> {
        self.check_id(id)?;
        let mut prefix = [0u8; Self::LEN_PREFIX];
        self.file
            .read_exact_at(&mut prefix, self.offset(id))
            .map_err(map_io)?;
        let len = u32::from_le_bytes(prefix);
        if len == Self::FREED || len as usize > self.block_size {
            Ok(None)
        } else {
            Ok(Some(len as usize))
        }
    }
}

fn map_io(e: io::Error) -> Error {
    if e.raw_os_error() == Some(ENOSPC) {
        Error::NoSpace
    } else {
        Error::Io(e)
    }
}

impl BlockStorage for FileStorage {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn reserve(&mut self) -> Result<BlockId, Error> {
        if let Some(id) = self.free_ids.pop() {
            return Ok(id);
        }
        self.count += 1;
        let id = self.count;
        // freshly reserved frames read back as freed until written
        let mut frame = vec![0u8; self.frame()];
        frame[..Self::LEN_PREFIX].copy_from_slice(&Self::FREED.to_le_bytes());
        self.file
            .write_all_at(&frame, self.offset(id))
            .map_err(map_io)?;
        Ok(id)
    }

    fn write(&mut self, id: BlockId, data: &[u8]) -> Result<(), Error> {
        if data.len() > self.block_size {
            return Err(validation!(
                "data length {} exceeds block size {} for block {id}",
                data.len(),
                self.block_size
            ));
        }
        if self.data_len(id)?.is_some() {
            return Err(validation!("block {id} already written, use update"));
        }
        self.journal_block(id)?;
        self.write_frame(id, data)
    }

    fn update(&mut self, id: BlockId, data: &[u8]) -> Result<(), Error> {
        if data.len() > self.block_size {
            return Err(validation!(
                "data length {} exceeds block size {} for block {id}",
                data.len(),
                self.block_size
            ));
        }
        if self.data_len(id)?.is_none() {
            return Err(validation!("block {id} holds no data to update"));
        }
        self.journal_block(id)?;
        self.write_frame(id, data)
    }

    fn data_length(&self, id: BlockId) -> Result<usize, Error> {
        self.data_len(id)?
            .ok_or_else(|| validation!("block {id} holds no data"))
    }

    fn read(&self, id: BlockId, buf: &mut Vec<u8>) -> Result<(), Error> {
        let (len, frame) = self.read_frame(id)?;
        buf.clear();
        buf.try_reserve_exact(len)?;
        buf.extend_from_slice(&frame[Self::LEN_PREFIX..Self::LEN_PREFIX + len]);
        Ok(())
    }

    fn free(&mut self, id: BlockId) -> Result<(), Error> {
        self.check_id(id)?;
        self.journal_block(id)?;
        let mut prefix = [0u8; Self::LEN_PREFIX];
        prefix.copy_from_slice(&Self::FREED.to_le_bytes());
        self.file
            .write_all_at(&prefix, self.offset(id))
            .map_err(map_io)?;
        self.free_ids.push(id);
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        if self.txn.is_some() {
            return Err(validation!("transaction already open"));
        }
        self.txn = Some(Journal {
            touched: Default::default(),
            prior_count: self.count,
            prior_free: self.free_ids.clone(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.txn
            .take()
            .ok_or_else(|| validation!("no open transaction"))?;
        self.file.sync_data().map_err(map_io)
    }

    fn rollback(&mut self) -> Result<(), Error> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| validation!("no open transaction"))?;
        for (&id, prior) in &txn.touched {
            match prior {
                Some(data) => self.write_frame(id, data)?,
                None => {
                    let mut prefix = [0u8; Self::LEN_PREFIX];
                    prefix.copy_from_slice(&Self::FREED.to_le_bytes());
                    self.file
                        .write_all_at(&prefix, self.offset(id))
                        .map_err(map_io)?;
                }
            }
        }
        self.count = txn.prior_count;
        self.free_ids = txn.prior_free;
        self.file
            .set_len(self.count as u64 * self.frame() as u64)
            .map_err(map_io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(storage: &mut dyn BlockStorage) {
        let a = storage.reserve().unwrap();
        let b = storage.reserve().unwrap();
        assert_ne!(a, b);
        storage.write(a, b"hello").unwrap();
        storage.write(b, b"world!").unwrap();
        assert_eq!(storage.data_length(a).unwrap(), 5);
        assert_eq!(storage.data_length(b).unwrap(), 6);

        let mut buf = Vec::new();
        storage.read(a, &mut buf).unwrap();
        assert_eq!(buf, b"hello");

        // write twice is an error, update isn't
        assert!(storage.write(a, b"again").is_err());
        storage.update(a, b"rewritten").unwrap();
        storage.read(a, &mut buf).unwrap();
        assert_eq!(buf, b"rewritten");

        // freed ids are recycled
        storage.free(a).unwrap();
        assert!(storage.read(a, &mut buf).is_err());
        assert_eq!(storage.reserve().unwrap(), a);
        storage.write(a, b"back").unwrap();

        // rollback undoes updates, writes and reserves
        storage.begin().unwrap();
        storage.update(a, b"dirty").unwrap();
        let c = storage.reserve().unwrap();
        storage.write(c, b"new").unwrap();
        storage.rollback().unwrap();
        storage.read(a, &mut buf).unwrap();
        assert_eq!(buf, b"back");
        assert!(storage.data_length(c).is_err());

        // commit keeps them
        storage.begin().unwrap();
        storage.update(a, b"durable").unwrap();
        storage.commit().unwrap();
        storage.read(a, &mut buf).unwrap();
        assert_eq!(buf, b"durable");
    }

    #[test]
    fn mem_storage() {
        exercise(&mut MemStorage::new(64));
    }

    #[test]
    fn file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        exercise(&mut FileStorage::open(&path, 64).unwrap());

        // reopen sees committed data
        let storage = FileStorage::open(&path, 64).unwrap();
        let mut buf = Vec::new();
        storage.read(1, &mut buf).unwrap();
        assert_eq!(buf, b"durable");
    }
}
