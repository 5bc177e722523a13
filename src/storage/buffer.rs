pub mod lru_k;
pub mod page_table;
pub mod replacer;

use crate::storage::disk::DiskManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{Page, PageId};
use log::{error, info, trace};
use lru_k::LruKReplacer;
use page_table::ExtendibleHashTable;
use parking_lot::Mutex;
use replacer::{FrameId, Replacer};
use std::collections::VecDeque;
use std::sync::Arc;

const PAGE_TABLE_BUCKET_SIZE: usize = 4;

/// Fixed-size cache of disk pages.
///
/// Maps page ids to in-memory frames, pinning pages while callers use them
/// and writing dirty victims back on eviction. One internal mutex serializes
/// every public operation; page content latches are separate and are the
/// caller's concern. Callers must release a page's latch before dropping its
/// last pin, so an eviction victim (pin count zero) can never be latched and
/// the pool may latch it briefly without risking a cycle.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<Arc<Page>>,
    inner: Mutex<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: ExtendibleHashTable<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruKReplacer,
    disk_manager: DiskManager,
    next_page_id: i32,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, replacer_k: usize, disk_manager: DiskManager) -> Self {
        let frames = (0..pool_size).map(|_| Arc::new(Page::new())).collect();
        let free_list = (0..pool_size).collect();

        Self {
            pool_size,
            frames,
            inner: Mutex::new(BufferPoolInner {
                page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
                free_list,
                replacer: LruKReplacer::new(pool_size, replacer_k),
                disk_manager,
                next_page_id: 0,
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocates a fresh page id and pins it into a frame. Fails with
    /// [`StorageError::BufferPoolFull`] when every frame is pinned.
    pub fn new_page(&self) -> StorageResult<(PageId, Arc<Page>)> {
        let mut inner = self.inner.lock();

        let frame_id = self.acquire_frame(&mut inner)?;
        let page_id = PageId(inner.next_page_id);
        inner.next_page_id += 1;

        let page = &self.frames[frame_id];
        page.set_page_id(page_id);
        page.set_pin_count(1);
        page.set_dirty(false);

        inner.page_table.insert(page_id, frame_id);
        inner.replacer.record_access(frame_id);
        inner.replacer.set_evictable(frame_id, false);

        trace!("new page {} in frame {}", page_id, frame_id);
        Ok((page_id, Arc::clone(page)))
    }

    /// Pins the page, reading it from disk if it is not resident.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<Arc<Page>> {
        if !page_id.is_valid() {
            return Err(StorageError::PageNotFound(page_id));
        }
        let mut inner = self.inner.lock();

        if let Some(frame_id) = inner.page_table.find(&page_id) {
            inner.replacer.record_access(frame_id);
            inner.replacer.set_evictable(frame_id, false);
            self.frames[frame_id].increment_pin_count();
            return Ok(Arc::clone(&self.frames[frame_id]));
        }

        let frame_id = self.acquire_frame(&mut inner)?;
        let page = &self.frames[frame_id];
        {
            let mut data = page.write_latch();
            inner
                .disk_manager
                .read_page(page_id, data.as_bytes_mut())
                .map_err(io_error)?;
        }
        page.set_page_id(page_id);
        page.set_pin_count(1);
        page.set_dirty(false);

        inner.page_table.insert(page_id, frame_id);
        inner.replacer.record_access(frame_id);
        inner.replacer.set_evictable(frame_id, false);

        trace!("fetched page {} into frame {}", page_id, frame_id);
        Ok(Arc::clone(page))
    }

    /// Drops one pin. Fails (returns false) if the page is not resident or
    /// was not pinned. When the pin count reaches zero the frame becomes a
    /// candidate for eviction.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock();

        let Some(frame_id) = inner.page_table.find(&page_id) else {
            return false;
        };
        let page = &self.frames[frame_id];
        if page.pin_count() == 0 {
            info!("unpin of page {} with zero pin count", page_id);
            return false;
        }
        if page.decrement_pin_count() == 0 {
            inner.replacer.set_evictable(frame_id, true);
        }
        if is_dirty {
            page.set_dirty(true);
        }
        true
    }

    /// Writes the page back if dirty. Returns false for non-resident pages.
    pub fn flush_page(&self, page_id: PageId) -> bool {
        if !page_id.is_valid() {
            return false;
        }
        let mut inner = self.inner.lock();

        let Some(frame_id) = inner.page_table.find(&page_id) else {
            return false;
        };
        self.flush_frame(&mut inner, frame_id)
    }

    /// Writes every dirty resident page back to disk.
    pub fn flush_all(&self) {
        let mut inner = self.inner.lock();
        for frame_id in 0..self.pool_size {
            if self.frames[frame_id].page_id().is_valid() {
                self.flush_frame(&mut inner, frame_id);
            }
        }
    }

    /// Unmaps the page and returns its frame to the free list. Fails only
    /// when the page is pinned; deleting a non-resident page vacuously
    /// succeeds.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut inner = self.inner.lock();

        let Some(frame_id) = inner.page_table.find(&page_id) else {
            return true;
        };
        let page = &self.frames[frame_id];
        if page.pin_count() != 0 {
            return false;
        }

        inner.page_table.remove(&page_id);
        inner.replacer.remove(frame_id);
        inner.free_list.push_back(frame_id);
        page.reset();
        inner.disk_manager.deallocate_page(page_id);
        true
    }

    /// Picks a usable frame: the free list first, then an evicted victim
    /// (written back if dirty and unmapped).
    fn acquire_frame(&self, inner: &mut BufferPoolInner) -> StorageResult<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = inner.replacer.evict() else {
            return Err(StorageError::BufferPoolFull);
        };
        let page = &self.frames[frame_id];
        let old_page_id = page.page_id();
        trace!("evicting page {} from frame {}", old_page_id, frame_id);

        if page.is_dirty() {
            let data = page.read_latch();
            inner
                .disk_manager
                .write_page(old_page_id, data.as_bytes())
                .map_err(io_error)?;
        }
        inner.page_table.remove(&old_page_id);
        page.reset();
        Ok(frame_id)
    }

    fn flush_frame(&self, inner: &mut BufferPoolInner, frame_id: FrameId) -> bool {
        let page = &self.frames[frame_id];
        if page.is_dirty() {
            let data = page.read_latch();
            if let Err(e) = inner.disk_manager.write_page(page.page_id(), data.as_bytes()) {
                error!("failed to flush page {}: {:#}", page.page_id(), e);
                return false;
            }
            page.set_dirty(false);
        }
        true
    }

    #[cfg(test)]
    fn is_resident(&self, page_id: PageId) -> bool {
        self.inner.lock().page_table.find(&page_id).is_some()
    }
}

fn io_error(e: anyhow::Error) -> StorageError {
    StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_pool(dir: &tempfile::TempDir, pool_size: usize, k: usize) -> BufferPoolManager {
        let file_path = dir.path().join("test.db");
        let disk_manager = DiskManager::create(&file_path).unwrap();
        BufferPoolManager::new(pool_size, k, disk_manager)
    }

    #[test]
    fn test_new_page_and_fetch() {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir, 10, 2);

        let (page_id, page) = pool.new_page().unwrap();
        assert_eq!(page_id, PageId(0));
        assert_eq!(page.pin_count(), 1);
        {
            let mut data = page.write_latch();
            data[0] = 42;
            data[1] = 43;
        }
        assert!(pool.unpin_page(page_id, true));

        let page = pool.fetch_page(page_id).unwrap();
        let data = page.read_latch();
        assert_eq!(data[0], 42);
        assert_eq!(data[1], 43);
        drop(data);
        assert!(pool.unpin_page(page_id, false));
    }

    #[test]
    fn test_page_ids_are_monotonic() {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir, 10, 2);

        for expected in 0..5 {
            let (page_id, _page) = pool.new_page().unwrap();
            assert_eq!(page_id, PageId(expected));
            pool.unpin_page(page_id, false);
        }
    }

    #[test]
    fn test_all_pinned_exhausts_pool() {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir, 3, 2);

        let mut pages = Vec::new();
        for _ in 0..3 {
            pages.push(pool.new_page().unwrap());
        }
        assert!(matches!(
            pool.new_page(),
            Err(StorageError::BufferPoolFull)
        ));

        // Unpinning one frame makes the allocation succeed again.
        let (page_id, _) = pages.pop().unwrap();
        assert!(pool.unpin_page(page_id, false));
        assert!(pool.new_page().is_ok());
    }

    #[test]
    fn test_unpin_below_zero_fails() {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir, 3, 2);

        let (page_id, _page) = pool.new_page().unwrap();
        assert!(pool.unpin_page(page_id, false));
        assert!(!pool.unpin_page(page_id, false));
        assert!(!pool.unpin_page(PageId(99), false));
    }

    #[test]
    fn test_eviction_writes_back_dirty_page() {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir, 1, 2);

        let (p0, page) = pool.new_page().unwrap();
        {
            let mut data = page.write_latch();
            data[0] = 7;
        }
        pool.unpin_page(p0, true);

        // The only frame is reused; p0 must have been written back.
        let (p1, _page) = pool.new_page().unwrap();
        pool.unpin_page(p1, false);

        let page = pool.fetch_page(p0).unwrap();
        assert_eq!(page.read_latch()[0], 7);
        pool.unpin_page(p0, false);
    }

    #[test]
    fn test_lru_k_eviction_prefers_history_queue() {
        // With K = 2 and a pool of 3: p1 and p2 reach K accesses and
        // graduate to the cache queue; p3 stays below K in the history
        // queue, so the next allocation evicts p3.
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir, 3, 2);

        let (p1, _) = pool.new_page().unwrap();
        pool.unpin_page(p1, false);
        let (p2, _) = pool.new_page().unwrap();
        pool.unpin_page(p2, false);
        let (p3, _) = pool.new_page().unwrap();
        pool.unpin_page(p3, false);

        pool.fetch_page(p1).unwrap();
        pool.unpin_page(p1, false);
        pool.fetch_page(p2).unwrap();
        pool.unpin_page(p2, false);

        let (_p4, _) = pool.new_page().unwrap();

        assert!(pool.is_resident(p1));
        assert!(pool.is_resident(p2));
        assert!(!pool.is_resident(p3));
    }

    #[test]
    fn test_delete_page() {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir, 3, 2);

        let (page_id, _page) = pool.new_page().unwrap();

        // Pinned pages cannot be deleted.
        assert!(!pool.delete_page(page_id));

        pool.unpin_page(page_id, false);
        assert!(pool.delete_page(page_id));
        assert!(!pool.is_resident(page_id));

        // Deleting a non-resident page vacuously succeeds.
        assert!(pool.delete_page(PageId(42)));
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test.db");

        let page_id = {
            let disk_manager = DiskManager::create(&file_path).unwrap();
            let pool = BufferPoolManager::new(4, 2, disk_manager);
            let (page_id, page) = pool.new_page().unwrap();
            {
                let mut data = page.write_latch();
                data[100] = 99;
            }
            pool.unpin_page(page_id, true);
            pool.flush_all();
            page_id
        };

        let disk_manager = DiskManager::open(&file_path).unwrap();
        let pool = BufferPoolManager::new(4, 2, disk_manager);
        let page = pool.fetch_page(page_id).unwrap();
        assert_eq!(page.read_latch()[100], 99);
        pool.unpin_page(page_id, false);
    }

    #[test]
    fn test_fetch_then_unpin_is_repeatable() {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir, 3, 2);

        let (page_id, _page) = pool.new_page().unwrap();
        pool.unpin_page(page_id, false);

        for _ in 0..3 {
            let page = pool.fetch_page(page_id).unwrap();
            assert_eq!(page.pin_count(), 1);
            assert!(pool.unpin_page(page_id, false));
        }
    }
}
