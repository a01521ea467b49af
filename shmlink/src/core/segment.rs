//! Named shared-memory segments.
//!
//! A segment is a file-backed memory map living in a segment directory
//! (`/dev/shm/shmlink` on Linux). The creating process owns the segment and is
//! the only one allowed to release it; any process that knows the name can
//! attach to the same bytes.
//!
//! ```text
//! owner                          attacher
//! ┌──────────────┐  name   ┌──────────────┐
//! │ create(size) │ ──────→ │ attach(name) │
//! │ write/read   │         │ write/read   │
//! │ release()    │         └──────────────┘
//! └──────┬───────┘
//!        ▼
//!   file unlinked
//! ```
//!
//! Reads and writes take `&self`. Segments do not lock their bytes: callers
//! must only touch ranges they were granted by a coordinator (the replay
//! buffer's cursor reservations or a replica's ring slot).

use crate::error::{Error, Result};
use memmap2::MmapRaw;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::AtomicU64;

const NAME_PREFIX: &str = "shm_";

/// Factory for named segments rooted at one directory.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
}

impl SegmentStore {
    /// Open (creating if needed) a segment directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Default directory: tmpfs-backed on Linux, the temp dir elsewhere.
    pub fn default_dir() -> PathBuf {
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            shm.join("shmlink")
        } else {
            std::env::temp_dir().join("shmlink")
        }
    }

    /// Segment directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a new owned segment of at least `size` bytes.
    pub fn create(&self, size: usize) -> Result<Segment> {
        let name = format!("{}{}", NAME_PREFIX, uuid::Uuid::new_v4().simple());
        let path = self.dir.join(&name);
        // Zero-length maps are rejected by the OS.
        let len = size.max(1);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::segment(&name, e))?;
        file.set_len(len as u64).map_err(|e| Error::segment(&name, e))?;
        let map = MmapRaw::map_raw(&file).map_err(|e| Error::segment(&name, e))?;

        log::debug!("created segment {} ({} bytes)", name, len);
        Ok(Segment {
            name,
            path,
            map,
            owner: true,
        })
    }

    /// Attach to an existing segment by name.
    pub fn attach(&self, name: &str) -> Result<Segment> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(Error::segment(name, "invalid segment name"));
        }
        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::segment(name, e))?;
        let map = MmapRaw::map_raw(&file).map_err(|e| Error::segment(name, e))?;
        Ok(Segment {
            name: name.to_string(),
            path,
            map,
            owner: false,
        })
    }

    /// Whether a segment with this name currently exists.
    pub fn exists(&self, name: &str) -> bool {
        self.dir.join(name).is_file()
    }

    /// Release an owned segment, freeing its backing memory.
    ///
    /// Existing attachments keep their mapping until dropped, new attaches fail.
    pub fn release(&self, segment: Segment) -> Result<()> {
        if !segment.owner {
            return Err(Error::segment(&segment.name, "only the owner may release"));
        }
        let Segment { name, path, map, .. } = segment;
        drop(map);
        fs::remove_file(&path).map_err(|e| Error::segment(&name, e))?;
        log::debug!("released segment {}", name);
        Ok(())
    }
}

/// A mapped view of a named segment.
pub struct Segment {
    name: String,
    path: PathBuf,
    map: MmapRaw,
    owner: bool,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("owner", &self.owner)
            .finish()
    }
}

impl Segment {
    /// Segment name, usable with [`SegmentStore::attach`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Always false: segments are at least one byte.
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Whether this handle created the segment.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(Error::segment(
                &self.name,
                format!("range {}..{} out of bounds ({})", offset, offset.saturating_add(len), self.len()),
            )),
        }
    }

    /// Copy `data` into the segment at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: the range is in bounds of the live mapping; concurrent
        // writers to the same range are excluded by the coordinator protocol.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.map.as_mut_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        // SAFETY: in-bounds read from the live mapping.
        unsafe {
            ptr::copy_nonoverlapping(self.map.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Read `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Fill `len` bytes at `offset` with a repeating pattern.
    pub fn fill(&self, offset: usize, len: usize, pattern: &[u8]) -> Result<()> {
        self.check(offset, len)?;
        if pattern.is_empty() {
            return Ok(());
        }
        let chunk: Vec<u8> = pattern.iter().copied().cycle().take(len).collect();
        self.write(offset, &chunk)
    }

    /// Atomic view of the 8 bytes at `offset`.
    ///
    /// `offset` must be 8-byte aligned; mappings are page aligned.
    pub fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64> {
        self.check(offset, 8)?;
        if offset % 8 != 0 {
            return Err(Error::segment(&self.name, format!("unaligned atomic offset {}", offset)));
        }
        // SAFETY: aligned, in bounds and valid for the lifetime of `self`.
        Ok(unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU64) })
    }
}
