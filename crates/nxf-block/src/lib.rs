#![forbid(unsafe_code)]
//! Byte-addressed device I/O and the page-cache seam used by the volume core.
//!
//! The core never touches a device directly: every metadata record, bitmap
//! byte and data cluster goes through a [`PageCache`], which maps a byte range
//! into a [`MappedBuffer`] and writes it back on [`PageCache::mark_dirty`].
//! [`DevicePageCache`] is the write-through implementation over any
//! [`ByteDevice`].

use nxf_error::{NxfError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

fn checked_end(offset: u64, len: usize, device_len: u64, op: &str) -> Result<u64> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| NxfError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| NxfError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(NxfError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(end)
}

// ── File-backed device ──────────────────────────────────────────────────────

/// File-backed byte device using positioned reads and writes.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, falling back to read-only when the file is not
    /// writable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image of exactly `len` zero bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_end(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(NxfError::ReadOnly);
        }
        checked_end(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ── In-memory device ────────────────────────────────────────────────────────

/// In-memory device. Clones share the same bytes, so a test can keep a handle
/// for inspection and fault injection after handing one to a volume.
#[derive(Debug, Clone, Default)]
pub struct MemByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
    faults: Arc<Mutex<Vec<Range<u64>>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
            faults: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make every write overlapping `range` fail with `EIO` until
    /// [`Self::clear_faults`] is called.
    pub fn fail_writes_in(&self, range: Range<u64>) {
        self.faults.lock().push(range);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Copy of the whole device contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let end = checked_end(offset, buf.len(), len, "read")?;
        let (start, end) = (usize_of(offset)?, usize_of(end)?);
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let write_end = offset.saturating_add(u64::try_from(buf.len()).unwrap_or(u64::MAX));
        if self
            .faults
            .lock()
            .iter()
            .any(|fault| fault.start < write_end && offset < fault.end)
        {
            return Err(NxfError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        let mut bytes = self.bytes.lock();
        let len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let end = checked_end(offset, buf.len(), len, "write")?;
        let (start, end) = (usize_of(offset)?, usize_of(end)?);
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

fn usize_of(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| NxfError::Format("offset overflow".into()))
}

// ── Page cache seam ─────────────────────────────────────────────────────────

/// A byte range of the backing store checked out for reading or editing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedBuffer {
    offset: u64,
    bytes: Vec<u8>,
}

impl MappedBuffer {
    #[must_use]
    pub fn new(offset: u64, bytes: Vec<u8>) -> Self {
        Self { offset, bytes }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Backing-store access used for raw metadata-record, bitmap and data bytes.
///
/// Persistence timing belongs to the implementation; the core only promises
/// to call [`PageCache::mark_dirty`] for every buffer it modified.
pub trait PageCache: Send + Sync {
    /// Map `len` bytes starting at `offset`.
    fn map_bytes(&self, offset: u64, len: usize) -> Result<MappedBuffer>;

    /// Publish the contents of `buf` back to its range.
    fn mark_dirty(&self, buf: &MappedBuffer) -> Result<()>;

    /// Size of the backing store in bytes.
    fn len_bytes(&self) -> u64;

    /// Flush everything marked dirty.
    fn sync(&self) -> Result<()>;
}

/// Write-through [`PageCache`] over a [`ByteDevice`].
#[derive(Debug)]
pub struct DevicePageCache<D: ByteDevice> {
    device: D,
}

impl<D: ByteDevice> DevicePageCache<D> {
    #[must_use]
    pub fn new(device: D) -> Self {
        Self { device }
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: ByteDevice> PageCache for DevicePageCache<D> {
    fn map_bytes(&self, offset: u64, len: usize) -> Result<MappedBuffer> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| NxfError::OutOfMemory)?;
        bytes.resize(len, 0);
        self.device.read_exact_at(offset, &mut bytes)?;
        trace!(offset, len, "page_cache_map");
        Ok(MappedBuffer::new(offset, bytes))
    }

    fn mark_dirty(&self, buf: &MappedBuffer) -> Result<()> {
        trace!(offset = buf.offset(), len = buf.len(), "page_cache_write_back");
        self.device.write_all_at(buf.offset(), buf.as_slice())
    }

    fn len_bytes(&self) -> u64 {
        self.device.len_bytes()
    }

    fn sync(&self) -> Result<()> {
        self.device.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemByteDevice::new(4096);
        dev.write_all_at(100, &[7_u8; 16]).expect("write");
        let mut buf = [0_u8; 16];
        dev.read_exact_at(100, &mut buf).expect("read");
        assert_eq!(buf, [7_u8; 16]);
        assert!(dev.read_exact_at(4090, &mut buf).is_err());
    }

    #[test]
    fn mem_device_clones_share_bytes() {
        let dev = MemByteDevice::new(64);
        let other = dev.clone();
        other.write_all_at(0, b"FILE").expect("write");
        assert_eq!(&dev.snapshot()[..4], b"FILE");
    }

    #[test]
    fn injected_write_fault_hits_overlapping_writes_only() {
        let dev = MemByteDevice::new(4096);
        dev.fail_writes_in(1024..2048);

        let err = dev.write_all_at(1000, &[1_u8; 100]).unwrap_err();
        assert_eq!(err.to_errno(), libc::EIO);
        dev.write_all_at(0, &[1_u8; 1024]).expect("below fault range");
        dev.write_all_at(2048, &[1_u8; 16]).expect("above fault range");

        dev.clear_faults();
        dev.write_all_at(1000, &[1_u8; 100]).expect("fault cleared");
    }

    #[test]
    fn page_cache_maps_and_writes_back() {
        let dev = MemByteDevice::new(8192);
        let cache = DevicePageCache::new(dev.clone());

        let mut buf = cache.map_bytes(4096, 512).expect("map");
        assert_eq!(buf.len(), 512);
        buf.as_mut_slice()[..3].copy_from_slice(b"abc");
        cache.mark_dirty(&buf).expect("dirty");

        assert_eq!(&dev.snapshot()[4096..4099], b"abc");
        assert_eq!(cache.len_bytes(), 8192);
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.nxf");
        let dev = FileByteDevice::create(&path, 65536).expect("create");
        dev.write_all_at(512, b"FILE").expect("write");
        dev.sync().expect("sync");

        let reopened = FileByteDevice::open(&path).expect("open");
        assert!(reopened.is_writable());
        assert_eq!(reopened.len_bytes(), 65536);
        let mut magic = [0_u8; 4];
        reopened.read_exact_at(512, &mut magic).expect("read");
        assert_eq!(&magic, b"FILE");
        assert!(reopened.read_exact_at(65534, &mut magic).is_err());
    }
}
