pub mod btree_internal_page;
pub mod btree_leaf_page;
pub mod btree_page;
pub mod header_page;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

pub const PAGE_SIZE: usize = 4096;

/// Persistent identifier of a page. Negative values are sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub i32);

pub const INVALID_PAGE_ID: PageId = PageId(-1);

/// Page 0 holds the table of `(index_name, root_page_id)` records.
pub const HEADER_PAGE_ID: PageId = PageId(0);

impl PageId {
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The raw bytes of one page.
pub struct PageData([u8; PAGE_SIZE]);

impl PageData {
    fn zeroed() -> Self {
        Self([0u8; PAGE_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.0
    }
}

impl Deref for PageData {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Shared latch on a page's content. Owning, so it can be stored in a page
/// set across function boundaries during tree descent.
pub type PageReadLatch = ArcRwLockReadGuard<RawRwLock, PageData>;

/// Exclusive latch on a page's content.
pub type PageWriteLatch = ArcRwLockWriteGuard<RawRwLock, PageData>;

/// One buffer-pool frame's worth of page state.
///
/// The byte content is guarded by the page's reader-writer latch, which is
/// distinct from any lock-manager lock and from the buffer pool's internal
/// mutex. The runtime metadata (`pin_count`, `is_dirty`, the resident page
/// id) is only mutated while the buffer pool's mutex is held.
pub struct Page {
    page_id: AtomicI32,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
    data: Arc<RwLock<PageData>>,
}

impl Page {
    pub(crate) fn new() -> Self {
        Self {
            page_id: AtomicI32::new(INVALID_PAGE_ID.0),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: Arc::new(RwLock::new(PageData::zeroed())),
        }
    }

    pub fn page_id(&self) -> PageId {
        PageId(self.page_id.load(Ordering::SeqCst))
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::SeqCst)
    }

    /// Acquires the page latch in shared mode, blocking until available.
    pub fn read_latch(&self) -> PageReadLatch {
        self.data.read_arc()
    }

    /// Acquires the page latch in exclusive mode, blocking until available.
    pub fn write_latch(&self) -> PageWriteLatch {
        self.data.write_arc()
    }

    pub(crate) fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.0, Ordering::SeqCst);
    }

    pub(crate) fn set_pin_count(&self, count: u32) {
        self.pin_count.store(count, Ordering::SeqCst);
    }

    pub(crate) fn increment_pin_count(&self) {
        self.pin_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_pin_count(&self) -> u32 {
        self.pin_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        self.page_id.store(INVALID_PAGE_ID.0, Ordering::SeqCst);
        self.pin_count.store(0, Ordering::SeqCst);
        self.is_dirty.store(false, Ordering::SeqCst);
        self.data.write().0.fill(0);
    }
}
