//! Shared segments: the one-shot mailbox between a requester and a compute task.
//!
//! A segment is a memory-mapped file named after its requester. The requester
//! holds a [`SegmentOwner`], the only handle that can create or destroy it.
//! The compute side holds an [`Attachment`], which can only read, write the
//! result and detach.
//!
//! The status word moves `AwaitingData -> DataReady -> ResultReady` through
//! compare-and-swap and is never reset. Values are published with release
//! ordering on the status word and observed with acquire ordering, so whoever
//! sees a status also sees every value written before it.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io,
    mem::size_of,
    path::{Path, PathBuf},
    ptr::NonNull,
    sync::atomic::{AtomicI32, AtomicU32, Ordering},
};

use memmap2::MmapMut;

use crate::{
    error::{Result, ScanError},
    wait::WaitPolicy,
};

/// Capacity of every segment.
pub const MAX_ELEMENTS: usize = 256;

const LIVE: u32 = 0x5343_414e;
const DESTROYED: u32 = 0xdead_dead;

#[repr(C)]
struct SegmentLayout {
    values: [AtomicI32; MAX_ELEMENTS],
    status: AtomicI32,
    element_count: AtomicU32,
    lifecycle: AtomicU32,
}

/// Size of the mapped region.
pub const SEGMENT_BYTES: usize = size_of::<SegmentLayout>();

/// Names the segment a request refers to. Requesters use their process id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequesterId(pub i32);

impl RequesterId {
    pub fn current_process() -> Self {
        Self(std::process::id() as i32)
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum Status {
    AwaitingData = 0,
    DataReady = 1,
    ResultReady = 2,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Status::AwaitingData),
            1 => Some(Status::DataReady),
            2 => Some(Status::ResultReady),
            _ => None,
        }
    }
}

/// Directory holding the backing files of every live segment.
#[derive(Clone, Debug)]
pub struct SegmentStore {
    dir: PathBuf,
}

impl SegmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: RequesterId) -> PathBuf {
        self.dir.join(format!("prefix-scan-{}.seg", id.0))
    }

    /// Creates the segment for `id`, sized for `capacity` values.
    ///
    /// A file left behind under the same id (a requester killed before it
    /// could destroy its segment) is replaced.
    pub fn create(&self, id: RequesterId, capacity: usize) -> Result<SegmentOwner> {
        if capacity == 0 || capacity > MAX_ELEMENTS {
            return Err(ScanError::input(format!(
                "segment capacity {capacity} outside 1..={MAX_ELEMENTS}"
            )));
        }

        let path = self.path_for(id);
        let file = create_fresh(&path)?;

        let sized = file
            .set_len(SEGMENT_BYTES as u64)
            .map_err(|e| ScanError::resource(format!("sizing segment {}", path.display()), e))
            .and_then(|()| Mapping::new(&file, path.clone(), id));
        let mapping = match sized {
            Ok(mapping) => mapping,
            Err(err) => {
                let _ = std::fs::remove_file(&path);
                return Err(err);
            }
        };

        let layout = mapping.layout();
        layout.element_count.store(capacity as u32, Ordering::Relaxed);
        layout.status.store(Status::AwaitingData.code(), Ordering::Relaxed);
        layout.lifecycle.store(LIVE, Ordering::Release);

        tracing::debug!(requester = %id, capacity, "segment created");

        Ok(SegmentOwner {
            mapping,
            destroyed: false,
        })
    }

    /// Attaches to the segment a requester created under `id`.
    pub fn attach(&self, id: RequesterId) -> Result<Attachment> {
        let path = self.path_for(id);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ScanError::NotFound(id)),
            Err(e) => {
                return Err(ScanError::resource(
                    format!("opening segment {}", path.display()),
                    e,
                ))
            }
        };

        let mapping = Mapping::new(&file, path, id)?;
        mapping.ensure_live()?;

        let len = mapping.len();
        if len == 0 || len > MAX_ELEMENTS {
            return Err(mapping.corrupt(format!("element count {len}")));
        }

        tracing::debug!(requester = %id, len, "segment attached");

        Ok(Attachment { mapping })
    }
}

/// Attempts at replacing a stale segment file before giving up.
const CREATE_ATTEMPTS: usize = 2;

fn create_fresh(path: &Path) -> Result<File> {
    for attempt in 1..=CREATE_ATTEMPTS {
        let err = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => return Ok(file),
            Err(e) => e,
        };

        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(ScanError::resource(
                format!("creating segment {}", path.display()),
                err,
            ));
        }

        tracing::warn!(path = %path.display(), attempt, "removing stale segment");
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ScanError::resource(
                    format!("removing segment {}", path.display()),
                    e,
                ))
            }
        }
    }

    Err(ScanError::resource(
        format!(
            "creating segment {} ({CREATE_ATTEMPTS} attempts)",
            path.display()
        ),
        io::ErrorKind::AlreadyExists.into(),
    ))
}

struct Mapping {
    // Keeps the region mapped; every access goes through `ptr`.
    _map: MmapMut,
    ptr: NonNull<SegmentLayout>,
    path: PathBuf,
    id: RequesterId,
}

// SAFETY: the mapped layout consists only of atomics.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn new(file: &File, path: PathBuf, id: RequesterId) -> Result<Self> {
        let file_len = file
            .metadata()
            .map_err(|e| ScanError::resource(format!("inspecting segment {}", path.display()), e))?
            .len();
        if file_len < SEGMENT_BYTES as u64 {
            return Err(ScanError::CorruptSegment {
                path,
                reason: format!("{file_len} bytes, expected {SEGMENT_BYTES}"),
            });
        }

        // SAFETY: the file is only ever accessed through atomics of the
        // layout, by this process and the peer that shares it.
        let mut map = unsafe { MmapMut::map_mut(file) }
            .map_err(|e| ScanError::resource(format!("mapping segment {}", path.display()), e))?;

        // Mappings are page aligned, which satisfies the layout's alignment.
        let ptr = NonNull::new(map.as_mut_ptr().cast::<SegmentLayout>())
            .ok_or_else(|| ScanError::CorruptSegment {
                path: path.clone(),
                reason: "null mapping".into(),
            })?;

        Ok(Self {
            _map: map,
            ptr,
            path,
            id,
        })
    }

    fn layout(&self) -> &SegmentLayout {
        // SAFETY: `ptr` points into `_map`, which lives as long as `self` and
        // spans at least SEGMENT_BYTES.
        unsafe { self.ptr.as_ref() }
    }

    fn corrupt(&self, reason: String) -> ScanError {
        ScanError::CorruptSegment {
            path: self.path.clone(),
            reason,
        }
    }

    fn ensure_live(&self) -> Result<&SegmentLayout> {
        let layout = self.layout();
        match layout.lifecycle.load(Ordering::Acquire) {
            LIVE => Ok(layout),
            DESTROYED => Err(ScanError::UseAfterFree(self.id)),
            other => Err(self.corrupt(format!("lifecycle word {other:#x}"))),
        }
    }

    fn len(&self) -> usize {
        self.layout().element_count.load(Ordering::Relaxed) as usize
    }

    fn status(&self) -> Result<Status> {
        let code = self.ensure_live()?.status.load(Ordering::Acquire);
        Status::from_code(code).ok_or_else(|| self.corrupt(format!("status code {code}")))
    }

    fn expect_status(&self, expected: Status) -> Result<()> {
        let actual = self.status()?;
        if actual != expected {
            return Err(ScanError::WrongStatus { expected, actual });
        }
        Ok(())
    }

    fn transition(&self, from: Status, to: Status) -> Result<()> {
        let layout = self.ensure_live()?;
        layout
            .status
            .compare_exchange(from.code(), to.code(), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| match Status::from_code(actual) {
                Some(actual) => ScanError::InvalidTransition { from: actual, to },
                None => self.corrupt(format!("status code {actual}")),
            })?;
        tracing::trace!(requester = %self.id, ?from, ?to, "status transition");
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        let len = self.len();
        if index >= len {
            return Err(ScanError::Range { index, len });
        }
        Ok(())
    }

    fn load(&self, index: usize) -> Result<i32> {
        self.check_index(index)?;
        Ok(self.ensure_live()?.values[index].load(Ordering::Relaxed))
    }

    fn store(&self, index: usize, value: i32) -> Result<()> {
        self.check_index(index)?;
        self.ensure_live()?.values[index].store(value, Ordering::Relaxed);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<i32>> {
        let layout = self.ensure_live()?;
        Ok(layout.values[..self.len()]
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect())
    }

    fn store_all(&self, values: &[i32]) -> Result<()> {
        let len = self.len();
        if values.len() > len {
            return Err(ScanError::Range {
                index: len,
                len,
            });
        }
        if values.len() < len {
            return Err(ScanError::input(format!(
                "segment holds {len} values, got {}",
                values.len()
            )));
        }
        let layout = self.ensure_live()?;
        for (slot, &value) in layout.values.iter().zip(values) {
            slot.store(value, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Requester side of a segment: the only handle that creates and destroys it.
pub struct SegmentOwner {
    mapping: Mapping,
    destroyed: bool,
}

impl SegmentOwner {
    pub fn id(&self) -> RequesterId {
        self.mapping.id
    }

    pub fn element_count(&self) -> usize {
        self.mapping.len()
    }

    pub fn status(&self) -> Result<Status> {
        self.mapping.status()
    }

    /// Fills the whole segment. Only legal before the data is published.
    pub fn write_values(&self, values: &[i32]) -> Result<()> {
        self.mapping.expect_status(Status::AwaitingData)?;
        self.mapping.store_all(values)
    }

    pub fn write_value(&self, index: usize, value: i32) -> Result<()> {
        self.mapping.expect_status(Status::AwaitingData)?;
        self.mapping.store(index, value)
    }

    /// Refused while the compute side owns the values.
    pub fn read_values(&self) -> Result<Vec<i32>> {
        self.ensure_not_computing()?;
        self.mapping.load_all()
    }

    pub fn read_value(&self, index: usize) -> Result<i32> {
        self.ensure_not_computing()?;
        self.mapping.load(index)
    }

    fn ensure_not_computing(&self) -> Result<()> {
        match self.mapping.status()? {
            Status::DataReady => Err(ScanError::WrongStatus {
                expected: Status::ResultReady,
                actual: Status::DataReady,
            }),
            _ => Ok(()),
        }
    }

    /// Hands the values to the compute side.
    pub fn publish_data(&self) -> Result<()> {
        self.mapping.transition(Status::AwaitingData, Status::DataReady)
    }

    /// Waits for the compute side to publish its result, then reads it.
    pub fn wait_for_result(&self, policy: &WaitPolicy) -> Result<Vec<i32>> {
        policy.wait_until(|| Ok(self.mapping.status()? == Status::ResultReady))?;
        self.mapping.load_all()
    }

    /// Invalidates every attachment and removes the backing file.
    pub fn destroy(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.mapping
            .layout()
            .lifecycle
            .store(DESTROYED, Ordering::Release);
        std::fs::remove_file(&self.mapping.path).map_err(|e| {
            ScanError::resource(
                format!("removing segment {}", self.mapping.path.display()),
                e,
            )
        })?;
        tracing::debug!(requester = %self.mapping.id, "segment destroyed");
        Ok(())
    }
}

impl Drop for SegmentOwner {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(requester = %self.mapping.id, %err, "segment cleanup failed");
        }
    }
}

impl fmt::Debug for SegmentOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentOwner")
            .field("id", &self.mapping.id)
            .field("path", &self.mapping.path)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Compute side of a segment. Dropping it detaches.
pub struct Attachment {
    mapping: Mapping,
}

impl Attachment {
    pub fn id(&self) -> RequesterId {
        self.mapping.id
    }

    pub fn element_count(&self) -> usize {
        self.mapping.len()
    }

    pub fn status(&self) -> Result<Status> {
        self.mapping.status()
    }

    pub fn read_values(&self) -> Result<Vec<i32>> {
        self.mapping.expect_status(Status::DataReady)?;
        self.mapping.load_all()
    }

    pub fn read_value(&self, index: usize) -> Result<i32> {
        self.mapping.expect_status(Status::DataReady)?;
        self.mapping.load(index)
    }

    /// Writes the result. Impossible once the result is published.
    pub fn write_values(&self, values: &[i32]) -> Result<()> {
        self.mapping.expect_status(Status::DataReady)?;
        self.mapping.store_all(values)
    }

    pub fn write_value(&self, index: usize, value: i32) -> Result<()> {
        self.mapping.expect_status(Status::DataReady)?;
        self.mapping.store(index, value)
    }

    pub fn publish_result(&self) -> Result<()> {
        self.mapping.transition(Status::DataReady, Status::ResultReady)
    }

    pub fn detach(self) {
        tracing::debug!(requester = %self.mapping.id, "segment detached");
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("id", &self.mapping.id)
            .field("path", &self.mapping.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SegmentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn layout_is_values_then_status() {
        assert_eq!(SEGMENT_BYTES, MAX_ELEMENTS * 4 + 12);
    }

    #[test]
    fn handoff_moves_values_both_ways() {
        let (_dir, store) = store();
        let id = RequesterId(41);

        let owner = store.create(id, 3).unwrap();
        owner.write_values(&[1, 2, 3]).unwrap();
        owner.publish_data().unwrap();

        let attachment = store.attach(id).unwrap();
        assert_eq!(attachment.element_count(), 3);
        assert_eq!(attachment.read_values().unwrap(), vec![1, 2, 3]);
        attachment.write_values(&[1, 3, 6]).unwrap();
        attachment.publish_result().unwrap();
        attachment.detach();

        assert_eq!(owner.wait_for_result(&WaitPolicy::busy()).unwrap(), vec![1, 3, 6]);
        owner.destroy().unwrap();
        assert!(!store.path_for(id).exists());
    }

    #[test]
    fn attach_missing_segment_is_not_found() {
        let (_dir, store) = store();
        let err = store.attach(RequesterId(7)).unwrap_err();
        assert!(matches!(err, ScanError::NotFound(RequesterId(7))));
    }

    #[test]
    fn create_twice_is_a_resource_error() {
        let (_dir, store) = store();
        let _owner = store.create(RequesterId(3), 4).unwrap();
        let err = store.create(RequesterId(3), 4).unwrap_err();
        assert!(matches!(err, ScanError::Resource { .. }));
    }

    #[test]
    fn capacity_is_validated() {
        let (_dir, store) = store();
        assert!(matches!(store.create(RequesterId(1), 0), Err(ScanError::Input(_))));
        assert!(matches!(
            store.create(RequesterId(1), MAX_ELEMENTS + 1),
            Err(ScanError::Input(_))
        ));
        assert!(store.create(RequesterId(1), MAX_ELEMENTS).is_ok());
    }

    #[test]
    fn indices_are_bounds_checked() {
        let (_dir, store) = store();
        let owner = store.create(RequesterId(5), 2).unwrap();
        owner.write_value(1, 9).unwrap();
        assert!(matches!(
            owner.write_value(2, 9),
            Err(ScanError::Range { index: 2, len: 2 })
        ));
        assert!(matches!(
            owner.write_values(&[1, 2, 3]),
            Err(ScanError::Range { .. })
        ));
        assert!(matches!(owner.read_value(5), Err(ScanError::Range { .. })));
    }

    #[test]
    fn status_never_regresses() {
        let (_dir, store) = store();
        let id = RequesterId(9);
        let owner = store.create(id, 1).unwrap();

        assert!(matches!(
            store.attach(id).unwrap().publish_result(),
            Err(ScanError::InvalidTransition { from: Status::AwaitingData, .. })
        ));

        owner.write_values(&[4]).unwrap();
        owner.publish_data().unwrap();
        assert!(owner.publish_data().is_err());
        assert!(matches!(owner.write_value(0, 1), Err(ScanError::WrongStatus { .. })));
        assert!(matches!(owner.read_values(), Err(ScanError::WrongStatus { .. })));

        let attachment = store.attach(id).unwrap();
        attachment.publish_result().unwrap();
        assert!(attachment.publish_result().is_err());
        assert!(matches!(
            attachment.write_value(0, 1),
            Err(ScanError::WrongStatus { actual: Status::ResultReady, .. })
        ));
        assert_eq!(owner.status().unwrap(), Status::ResultReady);
    }

    #[test]
    fn destroy_invalidates_attachments() {
        let (_dir, store) = store();
        let id = RequesterId(11);
        let owner = store.create(id, 2).unwrap();
        owner.write_values(&[1, 2]).unwrap();
        owner.publish_data().unwrap();

        let attachment = store.attach(id).unwrap();
        owner.destroy().unwrap();

        assert!(matches!(attachment.read_values(), Err(ScanError::UseAfterFree(_))));
        assert!(matches!(attachment.publish_result(), Err(ScanError::UseAfterFree(_))));
        assert!(matches!(store.attach(id), Err(ScanError::NotFound(_))));
    }

    #[test]
    fn dropping_the_owner_removes_the_segment() {
        let (_dir, store) = store();
        let id = RequesterId(12);
        drop(store.create(id, 1).unwrap());
        assert!(!store.path_for(id).exists());
    }

    #[test]
    fn leftover_segment_is_replaced() {
        let (_dir, store) = store();
        let id = RequesterId(13);

        let leaked = store.create(id, 3).unwrap();
        leaked.write_values(&[7, 8, 9]).unwrap();
        leaked.publish_data().unwrap();
        std::mem::forget(leaked);
        assert!(store.path_for(id).exists());

        let owner = store.create(id, 2).unwrap();
        assert_eq!(owner.status().unwrap(), Status::AwaitingData);
        assert_eq!(owner.element_count(), 2);
        assert_eq!(owner.read_values().unwrap(), vec![0, 0]);

        owner.destroy().unwrap();
        assert!(!store.path_for(id).exists());
    }

    #[test]
    fn undeletable_leftover_is_a_resource_error() {
        let (_dir, store) = store();
        let id = RequesterId(14);
        // A directory in place of the segment cannot be removed as a file.
        std::fs::create_dir(store.path_for(id)).unwrap();

        assert!(matches!(store.create(id, 1), Err(ScanError::Resource { .. })));
        assert!(store.path_for(id).is_dir());
    }
}
