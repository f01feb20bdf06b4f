#![forbid(unsafe_code)]
//! Backing data stores for virtual block device images.
//!
//! A [`DataStore`] is the byte-addressed storage an image dispatches I/O
//! against. The trait carries the full operation vocabulary of the dispatch
//! pipeline (read, write, discard, write-same, compare-and-write, flush) so
//! the pipeline's execution step is a straight per-kind delegation.
//!
//! Two implementations:
//! - [`MemoryDataStore`]: `Mutex<Vec<u8>>`-backed, used by tests and demos.
//! - [`FileDataStore`]: file-backed via `pread`/`pwrite`
//!   (`std::os::unix::fs::FileExt`), thread-safe without a shared seek
//!   position.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use vbd_error::{Result, VbdError};

/// Byte-addressed backing store for one image.
pub trait DataStore: Send + Sync + std::fmt::Debug {
    /// Total store length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read up to `len` bytes from `off`.
    ///
    /// Reads that overrun the end of the store return the available prefix;
    /// a read starting at or beyond the end returns an empty buffer. Extent
    /// policy against the *image* size lives above this trait.
    fn read_at(&self, off: u64, len: u64) -> Result<Vec<u8>>;

    /// Write all of `data` at `off`. The range must lie within the store.
    fn write_at(&self, off: u64, data: &[u8]) -> Result<()>;

    /// Discard `[off, off + len)`.
    ///
    /// `granularity` is a hint for stores that can deallocate: ranges
    /// smaller than a granule may be zeroed instead of deallocated. The
    /// default implementation zeroes the full range.
    fn discard(&self, off: u64, len: u64, granularity: u32) -> Result<()> {
        let _ = granularity;
        let len = usize::try_from(len)
            .map_err(|_| VbdError::InvalidArgument("discard length overflows usize".to_owned()))?;
        self.write_at(off, &vec![0_u8; len])
    }

    /// Fill `[off, off + len)` with repetitions of `pattern`.
    ///
    /// `pattern` must be non-empty and `len` must be a multiple of
    /// `pattern.len()`.
    fn write_same(&self, off: u64, len: u64, pattern: &[u8]) -> Result<()> {
        let buf = replicate_pattern(len, pattern)?;
        self.write_at(off, &buf)
    }

    /// Compare `cmp` against the store contents at `off`; on a full match
    /// write `data` there and return `None`, otherwise write nothing and
    /// return the relative offset of the first differing byte.
    ///
    /// `cmp` and `data` must have equal lengths.
    fn compare_and_write(&self, off: u64, cmp: &[u8], data: &[u8]) -> Result<Option<u64>> {
        check_compare_lengths(cmp, data)?;
        let current = self.read_at(off, data.len() as u64)?;
        if current.len() < cmp.len() {
            return Err(VbdError::InvalidExtent {
                off,
                len: data.len() as u64,
                size: self.len_bytes(),
            });
        }
        if let Some(mismatch) = first_mismatch(cmp, &current) {
            return Ok(Some(mismatch));
        }
        self.write_at(off, data)?;
        Ok(None)
    }

    /// Flush pending writes to stable storage.
    fn flush(&self) -> Result<()>;
}

fn replicate_pattern(len: u64, pattern: &[u8]) -> Result<Vec<u8>> {
    if pattern.is_empty() {
        return Err(VbdError::InvalidArgument(
            "write-same pattern must be non-empty".to_owned(),
        ));
    }
    let pattern_len = pattern.len() as u64;
    if len % pattern_len != 0 {
        return Err(VbdError::InvalidArgument(format!(
            "write-same length {len} is not a multiple of pattern length {pattern_len}"
        )));
    }
    let len = usize::try_from(len)
        .map_err(|_| VbdError::InvalidArgument("write-same length overflows usize".to_owned()))?;
    let mut buf = Vec::with_capacity(len);
    while buf.len() < len {
        buf.extend_from_slice(pattern);
    }
    Ok(buf)
}

fn check_compare_lengths(cmp: &[u8], data: &[u8]) -> Result<()> {
    if cmp.len() != data.len() {
        return Err(VbdError::InvalidArgument(format!(
            "compare buffer length {} does not match write buffer length {}",
            cmp.len(),
            data.len()
        )));
    }
    Ok(())
}

fn first_mismatch(cmp: &[u8], current: &[u8]) -> Option<u64> {
    cmp.iter()
        .zip(current)
        .position(|(a, b)| a != b)
        .map(|pos| pos as u64)
}

fn check_write_range(off: u64, len: usize, store_len: u64) -> Result<()> {
    let end = off
        .checked_add(len as u64)
        .ok_or_else(|| VbdError::InvalidArgument("write range overflows u64".to_owned()))?;
    if end > store_len {
        return Err(VbdError::InvalidExtent {
            off,
            len: len as u64,
            size: store_len,
        });
    }
    Ok(())
}

/// In-memory data store.
#[derive(Debug)]
pub struct MemoryDataStore {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryDataStore {
    /// Zero-filled store of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Copy of the current contents, for test assertions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl DataStore for MemoryDataStore {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_at(&self, off: u64, len: u64) -> Result<Vec<u8>> {
        let bytes = self.bytes.lock();
        let Ok(start) = usize::try_from(off) else {
            return Ok(Vec::new());
        };
        if start >= bytes.len() {
            return Ok(Vec::new());
        }
        let avail = bytes.len() - start;
        let take = usize::try_from(len).unwrap_or(usize::MAX).min(avail);
        Ok(bytes[start..start + take].to_vec())
    }

    fn write_at(&self, off: u64, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_write_range(off, data.len(), bytes.len() as u64)?;
        let start = usize::try_from(off)
            .map_err(|_| VbdError::InvalidArgument("write offset overflows usize".to_owned()))?;
        bytes[start..start + data.len()].copy_from_slice(data);
        drop(bytes);
        Ok(())
    }

    fn compare_and_write(&self, off: u64, cmp: &[u8], data: &[u8]) -> Result<Option<u64>> {
        check_compare_lengths(cmp, data)?;
        // Lock held across compare and write: the pair is atomic here.
        let mut bytes = self.bytes.lock();
        check_write_range(off, data.len(), bytes.len() as u64)?;
        let start = usize::try_from(off)
            .map_err(|_| VbdError::InvalidArgument("offset overflows usize".to_owned()))?;
        let current = &bytes[start..start + cmp.len()];
        if let Some(mismatch) = first_mismatch(cmp, current) {
            return Ok(Some(mismatch));
        }
        bytes[start..start + data.len()].copy_from_slice(data);
        drop(bytes);
        Ok(None)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed data store using `pread`/`pwrite` style I/O.
///
/// Opens read-write when possible, falling back to read-only; writes against
/// a read-only store fail with [`VbdError::ReadOnly`].
#[derive(Debug, Clone)]
pub struct FileDataStore {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileDataStore {
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

    /// Open read-only regardless of file permissions. Writes fail with
    /// [`VbdError::ReadOnly`].
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: false,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl DataStore for FileDataStore {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, off: u64, len: u64) -> Result<Vec<u8>> {
        if off >= self.len {
            return Ok(Vec::new());
        }
        let take = len.min(self.len - off);
        let take = usize::try_from(take)
            .map_err(|_| VbdError::InvalidArgument("read length overflows usize".to_owned()))?;
        let mut buf = vec![0_u8; take];
        self.file.read_exact_at(&mut buf, off)?;
        Ok(buf)
    }

    fn write_at(&self, off: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(VbdError::ReadOnly);
        }
        check_write_range(off, data.len(), self.len)?;
        self.file.write_all_at(data, off)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn memory_store_read_write_round_trip() {
        let store = MemoryDataStore::new(1024);
        store.write_at(100, &[7_u8; 16]).expect("write");
        assert_eq!(store.read_at(100, 16).expect("read"), vec![7_u8; 16]);
    }

    #[test]
    fn memory_store_read_clips_to_store_end() {
        let store = MemoryDataStore::from_vec(vec![5_u8; 100]);
        assert_eq!(store.read_at(90, 50).expect("read").len(), 10);
        assert!(store.read_at(100, 10).expect("read").is_empty());
        assert!(store.read_at(200, 10).expect("read").is_empty());
    }

    #[test]
    fn memory_store_write_out_of_bounds_fails() {
        let store = MemoryDataStore::new(100);
        match store.write_at(95, &[0_u8; 10]) {
            Err(VbdError::InvalidExtent { off: 95, len: 10, size: 100 }) => {}
            other => panic!("expected InvalidExtent, got {other:?}"),
        }
    }

    #[test]
    fn discard_zeroes_range() {
        let store = MemoryDataStore::from_vec(vec![0xff_u8; 64]);
        store.discard(16, 32, 0).expect("discard");

        let snapshot = store.snapshot();
        assert_eq!(&snapshot[..16], &[0xff_u8; 16]);
        assert_eq!(&snapshot[16..48], &[0_u8; 32]);
        assert_eq!(&snapshot[48..], &[0xff_u8; 16]);
    }

    #[test]
    fn write_same_replicates_pattern() {
        let store = MemoryDataStore::new(64);
        store.write_same(0, 12, &[1, 2, 3]).expect("write_same");
        assert_eq!(
            store.read_at(0, 12).expect("read"),
            vec![1, 2, 3, 1, 2, 3, 1, 2, 3, 1, 2, 3]
        );
    }

    #[test]
    fn write_same_rejects_bad_pattern() {
        let store = MemoryDataStore::new(64);
        assert!(matches!(
            store.write_same(0, 12, &[]),
            Err(VbdError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.write_same(0, 10, &[1, 2, 3]),
            Err(VbdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn compare_and_write_match_applies_write() {
        let store = MemoryDataStore::from_vec(vec![9_u8; 32]);
        let outcome = store
            .compare_and_write(8, &[9_u8; 8], &[1_u8; 8])
            .expect("caw");
        assert_eq!(outcome, None);
        assert_eq!(store.read_at(8, 8).expect("read"), vec![1_u8; 8]);
    }

    #[test]
    fn compare_and_write_mismatch_leaves_data_untouched() {
        let store = MemoryDataStore::from_vec(vec![9_u8; 32]);
        let mut cmp = vec![9_u8; 8];
        cmp[5] = 0;
        let outcome = store
            .compare_and_write(8, &cmp, &[1_u8; 8])
            .expect("caw");
        assert_eq!(outcome, Some(5));
        assert_eq!(store.read_at(8, 8).expect("read"), vec![9_u8; 8]);
    }

    #[test]
    fn compare_and_write_rejects_length_mismatch() {
        let store = MemoryDataStore::new(32);
        assert!(matches!(
            store.compare_and_write(0, &[0_u8; 4], &[1_u8; 8]),
            Err(VbdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn file_store_round_trip() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&[0_u8; 4096]).expect("fill");
        tmp.flush().expect("flush");

        let store = FileDataStore::open(tmp.path()).expect("open");
        assert_eq!(store.len_bytes(), 4096);
        assert!(store.is_writable());

        store.write_at(1000, &[3_u8; 24]).expect("write");
        assert_eq!(store.read_at(1000, 24).expect("read"), vec![3_u8; 24]);
        store.flush().expect("flush");
    }

    #[test]
    fn file_store_read_only_rejects_writes() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&[6_u8; 128]).expect("fill");
        tmp.flush().expect("flush");

        let store = FileDataStore::open_read_only(tmp.path()).expect("open");
        assert!(!store.is_writable());
        assert_eq!(store.read_at(0, 8).expect("read"), vec![6_u8; 8]);
        assert!(matches!(
            store.write_at(0, &[1_u8; 8]),
            Err(VbdError::ReadOnly)
        ));
    }
}
