#![allow(unsafe_code)]
//! Shared frame buffers backed by a memory-mapped file.
//!
//! The receiver creates one region holding a fixed header followed by
//! `num_buffers` equally sized slots. The processor attaches to the same
//! region by name and recomputes every slot address from the header alone,
//! so both sides agree on the layout without any other coordination.
//!
//! # Layout
//!
//! ```text
//! +--------------------+----------+----------+-----+
//! | header (32 bytes)  | slot 0   | slot 1   | ... |
//! +--------------------+----------+----------+-----+
//! ```
//!
//! Slot `i` starts at `HEADER_SIZE + i * buffer_size`.
//!
//! # Ownership
//!
//! The region itself carries no locks. At any time a slot is written only by
//! the party that owns its buffer id: the decoder while the frame is being
//! assembled, nobody once it has been handed to the processor. Slot ownership
//! moves with the frame-ready and frame-release notifications.

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Magic number identifying a shared buffer region.
const MAGIC: u64 = 0x0D1D_0DA7_A5B0_0001;

/// Size of the region header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Region header, stored as little-endian u64s.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SharedBufferHeader {
    magic: u64,
    manager_id: u64,
    num_buffers: u64,
    buffer_size: u64,
}

const _: () = assert!(
    std::mem::size_of::<SharedBufferHeader>() == HEADER_SIZE,
    "SharedBufferHeader size must equal HEADER_SIZE"
);

impl SharedBufferHeader {
    fn into_le(self) -> Self {
        Self {
            magic: self.magic.to_le(),
            manager_id: self.manager_id.to_le(),
            num_buffers: self.num_buffers.to_le(),
            buffer_size: self.buffer_size.to_le(),
        }
    }

    fn into_native(self) -> Self {
        Self {
            magic: u64::from_le(self.magic),
            manager_id: u64::from_le(self.manager_id),
            num_buffers: u64::from_le(self.num_buffers),
            buffer_size: u64::from_le(self.buffer_size),
        }
    }
}

/// Default backing path for a region name: `/dev/shm/<name>` when available,
/// else the system temp directory.
#[must_use]
pub fn default_path(name: &str) -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.join(name)
    } else {
        std::env::temp_dir().join(name)
    }
}

/// A mapped shared buffer region.
///
/// # Safety
/// Holds a raw pointer into the mapping. The pointer stays valid for as long
/// as the mapping is alive, which is the lifetime of this value.
pub struct SharedBufferManager {
    name: String,
    path: PathBuf,

    #[expect(
        dead_code,
        reason = "mmap must be kept alive to maintain memory mapping validity"
    )]
    mmap: MmapMut,

    /// SAFETY: start of the mapping, valid while `mmap` exists
    base: *mut u8,

    manager_id: u64,
    num_buffers: usize,
    buffer_size: usize,
    remove_on_drop: bool,
}

// SAFETY: the mapping is owned by the manager and never remapped. Slot
// writes go through `buffer_mut`, whose contract requires exclusive slot
// ownership, so moving the manager between threads cannot introduce races.
unsafe impl Send for SharedBufferManager {}

// SAFETY: shared access only hands out slot slices. Mutable slot access is
// `unsafe` and requires the caller to own the slot's buffer id.
unsafe impl Sync for SharedBufferManager {}

impl SharedBufferManager {
    /// Create a region called `name` at its default path.
    pub fn create(name: &str, shared_mem_size: usize, buffer_size: usize) -> ShmResult<Self> {
        let mut manager = Self::create_at(&default_path(name), shared_mem_size, buffer_size)?;
        manager.name = name.to_string();
        Ok(manager)
    }

    /// Create a region at an explicit path, replacing any existing file.
    pub fn create_at(path: &Path, shared_mem_size: usize, buffer_size: usize) -> ShmResult<Self> {
        if buffer_size == 0 || shared_mem_size.saturating_sub(HEADER_SIZE) < buffer_size {
            return Err(ShmError::TooSmall {
                shared_mem_size,
                buffer_size,
            });
        }
        let num_buffers = (shared_mem_size - HEADER_SIZE) / buffer_size;
        let total_size = HEADER_SIZE + num_buffers * buffer_size;

        let io_err = |source| ShmError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(io_err)?;
        file.set_len(total_size as u64).map_err(io_err)?;

        // SAFETY: the file was just created with the requested length and is
        // not mapped anywhere else by this process.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file).map_err(io_err)? };
        debug_assert!(mmap.len() >= total_size, "mmap shorter than requested size");

        // Random so a recreated region is distinguishable from the last one,
        // also across receiver restarts.
        let manager_id = rand::random::<u64>();
        let header = SharedBufferHeader {
            magic: MAGIC,
            manager_id,
            num_buffers: num_buffers as u64,
            buffer_size: buffer_size as u64,
        };
        let base = mmap.as_mut_ptr();
        // SAFETY: the mapping is at least HEADER_SIZE bytes long.
        unsafe {
            std::ptr::write_unaligned(base.cast::<SharedBufferHeader>(), header.into_le());
        }

        info!(
            path = %path.display(),
            manager_id,
            num_buffers,
            buffer_size,
            "Created shared buffer region"
        );

        Ok(Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            mmap,
            base,
            manager_id,
            num_buffers,
            buffer_size,
            remove_on_drop: true,
        })
    }

    /// Attach to the region called `name` at its default path.
    pub fn open(name: &str) -> ShmResult<Self> {
        let mut manager = Self::open_at(&default_path(name))?;
        manager.name = name.to_string();
        Ok(manager)
    }

    /// Attach to an existing region at an explicit path.
    pub fn open_at(path: &Path) -> ShmResult<Self> {
        let io_err = |source| ShmError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)?;

        // SAFETY: the region is only resized by its creator, before any
        // attach can observe a valid header.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file).map_err(io_err)? };
        if mmap.len() < HEADER_SIZE {
            return Err(ShmError::BadHeader(format!(
                "region is {} bytes, smaller than the header",
                mmap.len()
            )));
        }

        let base = mmap.as_mut_ptr();
        // SAFETY: the mapping is at least HEADER_SIZE bytes long.
        let header =
            unsafe { std::ptr::read_unaligned(base.cast::<SharedBufferHeader>()) }.into_native();
        if header.magic != MAGIC {
            return Err(ShmError::BadHeader(format!(
                "bad magic {:#018x}",
                header.magic
            )));
        }

        let bad_layout = || {
            ShmError::BadHeader(format!(
                "header describes {} x {} bytes but region is {} bytes",
                header.num_buffers,
                header.buffer_size,
                mmap.len()
            ))
        };
        let num_buffers = usize::try_from(header.num_buffers).map_err(|_| bad_layout())?;
        let buffer_size = usize::try_from(header.buffer_size).map_err(|_| bad_layout())?;
        let required = num_buffers
            .checked_mul(buffer_size)
            .and_then(|slots| slots.checked_add(HEADER_SIZE))
            .ok_or_else(bad_layout)?;
        if buffer_size == 0 || mmap.len() < required {
            return Err(ShmError::BadHeader(format!(
                "header describes {num_buffers} x {buffer_size} bytes but region is {} bytes",
                mmap.len()
            )));
        }

        debug!(
            path = %path.display(),
            manager_id = header.manager_id,
            num_buffers,
            buffer_size,
            "Attached to shared buffer region"
        );

        Ok(Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            mmap,
            base,
            manager_id: header.manager_id,
            num_buffers,
            buffer_size,
            remove_on_drop: false,
        })
    }

    /// Region name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identifier written by the creator.
    #[must_use]
    pub fn manager_id(&self) -> u64 {
        self.manager_id
    }

    /// Number of slots.
    #[must_use]
    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    /// Size of each slot in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Byte offset of slot `id` from the start of the region.
    pub fn buffer_address(&self, id: usize) -> ShmResult<usize> {
        self.check_id(id)?;
        Ok(HEADER_SIZE + id * self.buffer_size)
    }

    /// Read-only view of slot `id`.
    pub fn buffer(&self, id: usize) -> ShmResult<&[u8]> {
        let offset = self.buffer_address(id)?;
        // SAFETY: `offset + buffer_size` lies within the mapping (checked at
        // construction), and the slice covers this slot only.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset), self.buffer_size) })
    }

    /// Mutable view of slot `id`.
    ///
    /// # Safety
    /// The caller must own buffer `id`: no other reference to this slot, in
    /// this process or another, may be used while the returned slice lives.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn buffer_mut(&self, id: usize) -> ShmResult<&mut [u8]> {
        let offset = self.buffer_address(id)?;
        // SAFETY: bounds as in `buffer`; exclusivity is the caller's contract.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), self.buffer_size) })
    }

    /// Whether the backing file is deleted when this manager is dropped.
    #[must_use]
    pub fn remove_on_drop(&self) -> bool {
        self.remove_on_drop
    }

    fn check_id(&self, id: usize) -> ShmResult<()> {
        if id < self.num_buffers {
            Ok(())
        } else {
            Err(ShmError::InvalidBuffer {
                id,
                num_buffers: self.num_buffers,
            })
        }
    }
}

impl std::fmt::Debug for SharedBufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBufferManager")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("manager_id", &self.manager_id)
            .field("num_buffers", &self.num_buffers)
            .field("buffer_size", &self.buffer_size)
            .field("base", &format!("{:p}", self.base))
            .finish()
    }
}

impl Drop for SharedBufferManager {
    fn drop(&mut self) {
        if self.remove_on_drop {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), "Failed to remove shared buffer file: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_computes_buffer_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shm");
        let manager = SharedBufferManager::create_at(&path, HEADER_SIZE + 1000, 300).unwrap();

        assert_eq!(manager.num_buffers(), 3);
        assert_eq!(manager.buffer_size(), 300);
        assert_eq!(manager.buffer_address(0).unwrap(), HEADER_SIZE);
        assert_eq!(manager.buffer_address(2).unwrap(), HEADER_SIZE + 600);
        assert!(manager.remove_on_drop());
    }

    #[test]
    fn test_too_small_region() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shm");
        assert!(matches!(
            SharedBufferManager::create_at(&path, 100, 200),
            Err(ShmError::TooSmall { .. })
        ));
        assert!(matches!(
            SharedBufferManager::create_at(&path, 100, 0),
            Err(ShmError::TooSmall { .. })
        ));
    }

    #[test]
    fn test_open_recomputes_addresses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shm");
        let owner = SharedBufferManager::create_at(&path, HEADER_SIZE + 4 * 64, 64).unwrap();

        // SAFETY: the test owns every slot.
        unsafe {
            owner.buffer_mut(2).unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
        }

        let reader = SharedBufferManager::open_at(&path).unwrap();
        assert_eq!(reader.manager_id(), owner.manager_id());
        assert_eq!(reader.num_buffers(), 4);
        assert_eq!(reader.buffer_size(), 64);
        assert_eq!(reader.buffer_address(3).unwrap(), owner.buffer_address(3).unwrap());
        assert_eq!(&reader.buffer(2).unwrap()[..4], &[1, 2, 3, 4]);
        assert!(!reader.remove_on_drop());
    }

    #[test]
    fn test_invalid_buffer_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shm");
        let manager = SharedBufferManager::create_at(&path, HEADER_SIZE + 128, 64).unwrap();
        assert!(matches!(
            manager.buffer(2),
            Err(ShmError::InvalidBuffer { id: 2, num_buffers: 2 })
        ));
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-shm");
        fs::write(&path, vec![0xFFu8; 128]).unwrap();
        assert!(matches!(
            SharedBufferManager::open_at(&path),
            Err(ShmError::BadHeader(_))
        ));
    }

    fn write_header(path: &Path, num_buffers: u64, buffer_size: u64) {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + 64);
        for field in [MAGIC, 7, num_buffers, buffer_size] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        bytes.resize(HEADER_SIZE + 64, 0);
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_open_rejects_overflowing_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overflow");
        write_header(&path, 1 << 63, 2);
        assert!(matches!(
            SharedBufferManager::open_at(&path),
            Err(ShmError::BadHeader(_))
        ));

        write_header(&path, u64::MAX, u64::MAX);
        assert!(matches!(
            SharedBufferManager::open_at(&path),
            Err(ShmError::BadHeader(_))
        ));
    }

    #[test]
    fn test_open_rejects_layout_beyond_region() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short");
        write_header(&path, 2, 64);
        assert!(matches!(
            SharedBufferManager::open_at(&path),
            Err(ShmError::BadHeader(_))
        ));

        write_header(&path, 1, 64);
        let manager = SharedBufferManager::open_at(&path).unwrap();
        assert_eq!(manager.manager_id(), 7);
        assert_eq!(manager.num_buffers(), 1);
    }

    #[test]
    fn test_owner_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shm");
        {
            let _owner = SharedBufferManager::create_at(&path, HEADER_SIZE + 64, 64).unwrap();
            let _reader = SharedBufferManager::open_at(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_manager_ids_are_unique() {
        let dir = tempdir().unwrap();
        let a = SharedBufferManager::create_at(&dir.path().join("a"), HEADER_SIZE + 64, 64).unwrap();
        let b = SharedBufferManager::create_at(&dir.path().join("b"), HEADER_SIZE + 64, 64).unwrap();
        assert_ne!(a.manager_id(), b.manager_id());
    }
}
