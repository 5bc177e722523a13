pub mod iterator;
pub mod key;

use self::iterator::IndexIterator;
use self::key::{GenericKey, KeyComparator};
use crate::access::Rid;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::btree_internal_page::{BTreeInternalPage, BTreeInternalPageMut};
use crate::storage::page::btree_leaf_page::{BTreeLeafPage, BTreeLeafPageMut};
use crate::storage::page::btree_page::{self, BTREE_PAGE_HEADER_SIZE};
use crate::storage::page::header_page::HeaderPage;
use crate::storage::page::{
    PageId, PageReadLatch, PageWriteLatch, HEADER_PAGE_ID, INVALID_PAGE_ID, PAGE_SIZE,
};
use anyhow::{Context, Result};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::path::Path;
use std::sync::Arc;

/// On-disk B+ tree index over fixed-width keys. Unique keys only.
///
/// Pages are owned by the buffer pool and reached exclusively through
/// fetch + pin; parent/child relationships exist only as page ids. The root
/// pointer has its own reader-writer latch, taken in the mode of the
/// operation and released as soon as latch crabbing proves the root can no
/// longer be affected.
pub struct BPlusTree<const N: usize, C: KeyComparator<N>> {
    index_name: String,
    root_page_id: RwLock<PageId>,
    buffer_pool: Arc<BufferPoolManager>,
    comparator: C,
    leaf_max_size: usize,
    internal_max_size: usize,
}

/// A page held with its exclusive latch during a structural operation.
struct LatchedPage {
    page_id: PageId,
    guard: PageWriteLatch,
}

/// Everything a mutating operation has latched so far: the root pointer
/// latch (until a safe node releases it), the chain of latched pages, and
/// pages scheduled for deletion once all latches are gone.
struct WriteContext<'a> {
    root_latch: Option<RwLockWriteGuard<'a, PageId>>,
    pages: Vec<LatchedPage>,
    deleted: Vec<PageId>,
}

impl WriteContext<'_> {
    fn root_id(&self) -> PageId {
        **self
            .root_latch
            .as_ref()
            .expect("root latch already released")
    }

    fn set_root_id(&mut self, page_id: PageId) {
        **self
            .root_latch
            .as_mut()
            .expect("root latch must be held to move the root") = page_id;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOp {
    Insert,
    Delete,
}

#[derive(Clone, Copy)]
enum LeafTarget<'a, const N: usize> {
    Leftmost,
    Rightmost,
    Key(&'a GenericKey<N>),
}

impl<const N: usize, C: KeyComparator<N>> BPlusTree<N, C> {
    /// Creates a handle on a (possibly not yet existing) index. The header
    /// page (page 0) must already be allocated in the pool's file.
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        assert!(leaf_max_size >= 2 && internal_max_size >= 3);
        Self {
            index_name: index_name.into(),
            root_page_id: RwLock::new(INVALID_PAGE_ID),
            buffer_pool,
            comparator,
            leaf_max_size,
            internal_max_size,
        }
    }

    /// Opens an existing index, recovering its root from the header page.
    pub fn open(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let tree = Self::new(index_name, buffer_pool, comparator, leaf_max_size, internal_max_size);
        let page = tree
            .buffer_pool
            .fetch_page(HEADER_PAGE_ID)
            .context("cannot fetch header page")?;
        let root = {
            let mut guard = page.write_latch();
            HeaderPage::new(guard.as_bytes_mut()).get_root_id(&tree.index_name)
        };
        tree.buffer_pool.unpin_page(HEADER_PAGE_ID, false);
        if let Some(root) = root {
            *tree.root_page_id.write() = root;
        }
        Ok(tree)
    }

    /// Largest key counts that still fit a page, minus the headroom the
    /// split protocol needs.
    pub fn default_leaf_max_size() -> usize {
        (PAGE_SIZE - BTREE_PAGE_HEADER_SIZE) / (N + Rid::SIZE) - 1
    }

    pub fn default_internal_max_size() -> usize {
        (PAGE_SIZE - BTREE_PAGE_HEADER_SIZE) / (N + 4) - 2
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id.read().is_valid()
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Point lookup. Descends with shared latches, releasing each parent as
    /// soon as its child is latched.
    pub fn get_value(&self, key: &GenericKey<N>) -> Result<Option<Rid>> {
        let Some((page_id, guard)) = self.find_leaf_read(LeafTarget::Key(key))? else {
            return Ok(None);
        };
        let result = BTreeLeafPage::<N>::new(guard.as_bytes()).lookup(key, &self.comparator);
        drop(guard);
        self.buffer_pool.unpin_page(page_id, false);
        Ok(result)
    }

    /// Inserts a key/value pair. Returns false if the key already exists.
    pub fn insert(&self, key: &GenericKey<N>, rid: Rid) -> Result<bool> {
        let mut root_latch = self.root_page_id.write();
        if !root_latch.is_valid() {
            self.start_new_tree(&mut root_latch, key, rid)?;
            return Ok(true);
        }

        let mut ctx = WriteContext {
            root_latch: Some(root_latch),
            pages: Vec::new(),
            deleted: Vec::new(),
        };
        let result = self.insert_into_leaf(&mut ctx, key, rid);
        self.release_write_set(&mut ctx);
        result
    }

    /// Removes a key. Absent keys are ignored.
    pub fn remove(&self, key: &GenericKey<N>) -> Result<()> {
        let root_latch = self.root_page_id.write();
        if !root_latch.is_valid() {
            return Ok(());
        }

        let mut ctx = WriteContext {
            root_latch: Some(root_latch),
            pages: Vec::new(),
            deleted: Vec::new(),
        };
        let result = self.remove_from_leaf(&mut ctx, key);
        self.release_write_set(&mut ctx);
        result
    }

    /// Iterator positioned at the first entry of the leftmost leaf.
    pub fn begin(&self) -> Result<IndexIterator<N>> {
        match self.find_leaf_read(LeafTarget::Leftmost)? {
            Some((page_id, guard)) => Ok(IndexIterator::new(
                Arc::clone(&self.buffer_pool),
                page_id,
                guard,
                0,
            )),
            None => Ok(IndexIterator::exhausted(Arc::clone(&self.buffer_pool))),
        }
    }

    /// Iterator positioned at the first entry with key `>= key`.
    pub fn begin_from(&self, key: &GenericKey<N>) -> Result<IndexIterator<N>> {
        match self.find_leaf_read(LeafTarget::Key(key))? {
            Some((page_id, guard)) => {
                let index =
                    BTreeLeafPage::<N>::new(guard.as_bytes()).key_index(key, &self.comparator);
                Ok(IndexIterator::new(
                    Arc::clone(&self.buffer_pool),
                    page_id,
                    guard,
                    index,
                ))
            }
            None => Ok(IndexIterator::exhausted(Arc::clone(&self.buffer_pool))),
        }
    }

    /// Iterator positioned one past the last entry of the rightmost leaf.
    pub fn end(&self) -> Result<IndexIterator<N>> {
        match self.find_leaf_read(LeafTarget::Rightmost)? {
            Some((page_id, guard)) => {
                let index = BTreeLeafPage::<N>::new(guard.as_bytes()).size();
                Ok(IndexIterator::new(
                    Arc::clone(&self.buffer_pool),
                    page_id,
                    guard,
                    index,
                ))
            }
            None => Ok(IndexIterator::exhausted(Arc::clone(&self.buffer_pool))),
        }
    }

    /// Reads whitespace-separated integer keys from a file and inserts each
    /// one, with a row id synthesized from the key.
    pub fn insert_from_file(&self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read key file {:?}", path))?;
        for token in contents.split_whitespace() {
            let key: i64 = token
                .parse()
                .with_context(|| format!("invalid key {:?}", token))?;
            self.insert(&GenericKey::from_i64(key), Rid::from_key(key))?;
        }
        Ok(())
    }

    /// Reads whitespace-separated integer keys from a file and removes each
    /// one.
    pub fn remove_from_file(&self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read key file {:?}", path))?;
        for token in contents.split_whitespace() {
            let key: i64 = token
                .parse()
                .with_context(|| format!("invalid key {:?}", token))?;
            self.remove(&GenericKey::from_i64(key))?;
        }
        Ok(())
    }

    // ---- read-side descent ----

    fn find_leaf_read(
        &self,
        target: LeafTarget<'_, N>,
    ) -> Result<Option<(PageId, PageReadLatch)>> {
        let root_latch = self.root_page_id.read();
        let mut current_id = *root_latch;
        if !current_id.is_valid() {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page(current_id)?.read_latch();
        // Reads never restructure the tree: the root pointer latch is no
        // longer needed once the root page itself is latched.
        drop(root_latch);

        loop {
            if btree_page::is_leaf(guard.as_bytes()) {
                return Ok(Some((current_id, guard)));
            }
            let child_id = {
                let internal = BTreeInternalPage::<N>::new(guard.as_bytes());
                match target {
                    LeafTarget::Leftmost => internal.child_at(0),
                    LeafTarget::Rightmost => internal.child_at(internal.size() - 1),
                    LeafTarget::Key(key) => internal.lookup_child(key, &self.comparator),
                }
            };
            let child_guard = match self.buffer_pool.fetch_page(child_id) {
                Ok(page) => page.read_latch(),
                Err(e) => {
                    drop(guard);
                    self.buffer_pool.unpin_page(current_id, false);
                    return Err(e).context("tree descent failed");
                }
            };
            drop(guard);
            self.buffer_pool.unpin_page(current_id, false);
            current_id = child_id;
            guard = child_guard;
        }
    }

    // ---- write-side descent ----

    fn fetch_page_write(&self, page_id: PageId) -> Result<LatchedPage> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        let guard = page.write_latch();
        Ok(LatchedPage { page_id, guard })
    }

    fn allocate_page(&self) -> Result<(PageId, LatchedPage)> {
        let (page_id, page) = self
            .buffer_pool
            .new_page()
            .context("b+tree page allocation failed")?;
        let guard = page.write_latch();
        Ok((page_id, LatchedPage { page_id, guard }))
    }

    /// Whether an operation on this node can no longer propagate to its
    /// ancestors, allowing their latches to be released.
    fn is_safe(data: &[u8; PAGE_SIZE], op: WriteOp) -> bool {
        let size = btree_page::size(data);
        let max_size = btree_page::max_size(data);
        let is_leaf = btree_page::is_leaf(data);
        match op {
            // A leaf splits once an insert makes it reach max_size.
            WriteOp::Insert => {
                if is_leaf {
                    size + 1 < max_size
                } else {
                    size < max_size
                }
            }
            WriteOp::Delete => {
                if btree_page::is_root(data) {
                    // The root collapses when a leaf empties or an internal
                    // node drops to a single child.
                    if is_leaf {
                        size > 1
                    } else {
                        size > 2
                    }
                } else if is_leaf {
                    size > max_size / 2
                } else {
                    size > (max_size + 1) / 2
                }
            }
        }
    }

    /// Descends to the leaf responsible for `key` holding exclusive
    /// latches, releasing all ancestors whenever the just-latched child is
    /// safe (pessimistic crabbing).
    fn crab_to_leaf_write(
        &self,
        ctx: &mut WriteContext<'_>,
        key: &GenericKey<N>,
        op: WriteOp,
    ) -> Result<()> {
        let mut current_id = ctx.root_id();
        loop {
            let latched = self.fetch_page_write(current_id)?;
            let safe = Self::is_safe(latched.guard.as_bytes(), op);
            ctx.pages.push(latched);
            if safe {
                self.release_ancestors(ctx);
            }

            let (is_leaf, child_id) = {
                let data = ctx.pages.last().unwrap().guard.as_bytes();
                if btree_page::is_leaf(data) {
                    (true, INVALID_PAGE_ID)
                } else {
                    let internal = BTreeInternalPage::<N>::new(data);
                    (false, internal.lookup_child(key, &self.comparator))
                }
            };
            if is_leaf {
                return Ok(());
            }
            current_id = child_id;
        }
    }

    /// Releases every latched ancestor of the most recently latched page,
    /// along with the root pointer latch.
    fn release_ancestors(&self, ctx: &mut WriteContext<'_>) {
        ctx.root_latch = None;
        let keep = ctx.pages.pop().expect("no page latched");
        for latched in ctx.pages.drain(..) {
            let LatchedPage { page_id, guard } = latched;
            drop(guard);
            self.buffer_pool.unpin_page(page_id, true);
        }
        ctx.pages.push(keep);
    }

    /// Unlatches and unpins everything, then reclaims pages scheduled for
    /// deletion (only possible once their latches and pins are gone).
    fn release_write_set(&self, ctx: &mut WriteContext<'_>) {
        ctx.root_latch = None;
        for latched in ctx.pages.drain(..) {
            let LatchedPage { page_id, guard } = latched;
            drop(guard);
            self.buffer_pool.unpin_page(page_id, true);
        }
        for page_id in ctx.deleted.drain(..) {
            self.buffer_pool.delete_page(page_id);
        }
    }

    // ---- insert ----

    fn start_new_tree(
        &self,
        root_latch: &mut RwLockWriteGuard<'_, PageId>,
        key: &GenericKey<N>,
        rid: Rid,
    ) -> Result<()> {
        let (page_id, page) = self
            .buffer_pool
            .new_page()
            .context("cannot allocate root leaf")?;
        {
            let mut guard = page.write_latch();
            let mut leaf = BTreeLeafPageMut::<N>::init(
                guard.as_bytes_mut(),
                page_id,
                INVALID_PAGE_ID,
                self.leaf_max_size,
            );
            leaf.insert(key, rid, &self.comparator);
        }
        self.buffer_pool.unpin_page(page_id, true);
        **root_latch = page_id;
        self.update_root_record(page_id)
    }

    fn insert_into_leaf(
        &self,
        ctx: &mut WriteContext<'_>,
        key: &GenericKey<N>,
        rid: Rid,
    ) -> Result<bool> {
        self.crab_to_leaf_write(ctx, key, WriteOp::Insert)?;
        let leaf_index = ctx.pages.len() - 1;

        {
            let leaf = BTreeLeafPage::<N>::new(ctx.pages[leaf_index].guard.as_bytes());
            if leaf.lookup(key, &self.comparator).is_some() {
                return Ok(false);
            }
        }
        {
            let mut leaf = BTreeLeafPageMut::<N>::new(ctx.pages[leaf_index].guard.as_bytes_mut());
            leaf.insert(key, rid, &self.comparator);
        }

        let size = btree_page::size(ctx.pages[leaf_index].guard.as_bytes());
        if size >= self.leaf_max_size {
            let (split_key, new_page_id) = self.split_leaf(ctx, leaf_index)?;
            self.insert_into_parent(ctx, leaf_index, split_key, new_page_id)?;
        }
        Ok(true)
    }

    /// Splits a full leaf, linking the new right sibling into the chain.
    /// Returns the separator to propagate and the new page's id.
    fn split_leaf(
        &self,
        ctx: &mut WriteContext<'_>,
        leaf_index: usize,
    ) -> Result<(GenericKey<N>, PageId)> {
        let parent_id = btree_page::parent_page_id(ctx.pages[leaf_index].guard.as_bytes());
        let (new_page_id, mut new_latched) = self.allocate_page()?;

        let split_key = {
            let mut new_leaf = BTreeLeafPageMut::<N>::init(
                new_latched.guard.as_bytes_mut(),
                new_page_id,
                parent_id,
                self.leaf_max_size,
            );
            let mut old_leaf =
                BTreeLeafPageMut::<N>::new(ctx.pages[leaf_index].guard.as_bytes_mut());
            old_leaf.split_into(&mut new_leaf);
            new_leaf.as_ref().key_at(0)
        };
        ctx.pages.push(new_latched);
        Ok((split_key, new_page_id))
    }

    /// Splits an overfull internal page. Returns the promoted separator and
    /// the new page's id.
    fn split_internal(
        &self,
        ctx: &mut WriteContext<'_>,
        index: usize,
    ) -> Result<(GenericKey<N>, PageId)> {
        let parent_id = btree_page::parent_page_id(ctx.pages[index].guard.as_bytes());
        let (new_page_id, mut new_latched) = self.allocate_page()?;

        let (promoted, moved_children) = {
            let mut new_internal = BTreeInternalPageMut::<N>::init(
                new_latched.guard.as_bytes_mut(),
                new_page_id,
                parent_id,
                self.internal_max_size,
            );
            let mut old_internal =
                BTreeInternalPageMut::<N>::new(ctx.pages[index].guard.as_bytes_mut());
            let moved = old_internal.split_into(&mut new_internal);
            (new_internal.as_ref().key_at(0), moved)
        };
        ctx.pages.push(new_latched);

        for child_id in moved_children {
            self.set_parent_pointer(ctx, child_id, new_page_id)?;
        }
        Ok((promoted, new_page_id))
    }

    /// Installs `(key, new_child_id)` into the parent of the page at
    /// `child_index`, growing a new root or splitting the parent as needed.
    fn insert_into_parent(
        &self,
        ctx: &mut WriteContext<'_>,
        child_index: usize,
        key: GenericKey<N>,
        new_child_id: PageId,
    ) -> Result<()> {
        let (child_id, child_is_root) = {
            let data = ctx.pages[child_index].guard.as_bytes();
            (btree_page::page_id(data), btree_page::is_root(data))
        };

        if child_is_root {
            let (root_id, mut root_latched) = self.allocate_page()?;
            {
                let mut root = BTreeInternalPageMut::<N>::init(
                    root_latched.guard.as_bytes_mut(),
                    root_id,
                    INVALID_PAGE_ID,
                    self.internal_max_size,
                );
                root.populate_new_root(child_id, &key, new_child_id);
            }
            ctx.pages.push(root_latched);
            self.set_parent_pointer(ctx, child_id, root_id)?;
            self.set_parent_pointer(ctx, new_child_id, root_id)?;
            ctx.set_root_id(root_id);
            return self.update_root_record(root_id);
        }

        let parent_index = child_index
            .checked_sub(1)
            .expect("parent latch missing during split propagation");
        {
            let data = ctx.pages[parent_index].guard.as_bytes();
            assert_eq!(
                btree_page::page_id(data),
                btree_page::parent_page_id(ctx.pages[child_index].guard.as_bytes()),
                "latched ancestor chain out of order"
            );
        }
        {
            let mut parent =
                BTreeInternalPageMut::<N>::new(ctx.pages[parent_index].guard.as_bytes_mut());
            parent.insert(&key, new_child_id, &self.comparator);
        }

        let parent_size = btree_page::size(ctx.pages[parent_index].guard.as_bytes());
        if parent_size > self.internal_max_size {
            let (promoted, new_internal_id) = self.split_internal(ctx, parent_index)?;
            self.insert_into_parent(ctx, parent_index, promoted, new_internal_id)?;
        }
        Ok(())
    }

    /// Rewrites a child's parent pointer, reusing the latch if the child is
    /// already part of this operation's page set.
    fn set_parent_pointer(
        &self,
        ctx: &mut WriteContext<'_>,
        child_id: PageId,
        parent_id: PageId,
    ) -> Result<()> {
        if let Some(pos) = ctx.pages.iter().position(|lp| lp.page_id == child_id) {
            btree_page::set_parent_page_id(ctx.pages[pos].guard.as_bytes_mut(), parent_id);
            return Ok(());
        }
        let page = self.buffer_pool.fetch_page(child_id)?;
        {
            let mut guard = page.write_latch();
            btree_page::set_parent_page_id(guard.as_bytes_mut(), parent_id);
        }
        self.buffer_pool.unpin_page(child_id, true);
        Ok(())
    }

    // ---- delete ----

    fn remove_from_leaf(&self, ctx: &mut WriteContext<'_>, key: &GenericKey<N>) -> Result<()> {
        self.crab_to_leaf_write(ctx, key, WriteOp::Delete)?;
        let leaf_index = ctx.pages.len() - 1;

        {
            let leaf = BTreeLeafPage::<N>::new(ctx.pages[leaf_index].guard.as_bytes());
            if leaf.lookup(key, &self.comparator).is_none() {
                return Ok(());
            }
        }
        self.delete_entry(ctx, leaf_index, key)
    }

    /// Removes `key` from the page at `index` and rebalances: root collapse,
    /// borrow from a sibling, or merge and recurse into the parent.
    fn delete_entry(
        &self,
        ctx: &mut WriteContext<'_>,
        index: usize,
        key: &GenericKey<N>,
    ) -> Result<()> {
        let is_leaf = btree_page::is_leaf(ctx.pages[index].guard.as_bytes());
        if is_leaf {
            let mut leaf = BTreeLeafPageMut::<N>::new(ctx.pages[index].guard.as_bytes_mut());
            leaf.remove(key, &self.comparator);
        } else {
            let mut internal =
                BTreeInternalPageMut::<N>::new(ctx.pages[index].guard.as_bytes_mut());
            internal.remove(key, &self.comparator);
        }

        let (page_id, size, max_size, is_root) = {
            let data = ctx.pages[index].guard.as_bytes();
            (
                btree_page::page_id(data),
                btree_page::size(data),
                btree_page::max_size(data),
                btree_page::is_root(data),
            )
        };

        if is_root {
            if is_leaf && size == 0 {
                // The last key is gone: the tree is empty again.
                ctx.set_root_id(INVALID_PAGE_ID);
                ctx.deleted.push(page_id);
                return self.update_root_record(INVALID_PAGE_ID);
            }
            if !is_leaf && size == 1 {
                // A single child left: promote it to root.
                let child_id = {
                    let internal = BTreeInternalPage::<N>::new(ctx.pages[index].guard.as_bytes());
                    internal.child_at(0)
                };
                self.set_parent_pointer(ctx, child_id, INVALID_PAGE_ID)?;
                ctx.set_root_id(child_id);
                ctx.deleted.push(page_id);
                return self.update_root_record(child_id);
            }
            return Ok(());
        }

        let min_size = if is_leaf {
            max_size / 2
        } else {
            (max_size + 1) / 2
        };
        if size >= min_size {
            return Ok(());
        }
        self.coalesce_or_redistribute(ctx, index, is_leaf)
    }

    fn coalesce_or_redistribute(
        &self,
        ctx: &mut WriteContext<'_>,
        index: usize,
        is_leaf: bool,
    ) -> Result<()> {
        let current_id = ctx.pages[index].page_id;
        let parent_index = index
            .checked_sub(1)
            .expect("parent latch missing during rebalance");

        let (left_id, right_id) = {
            let parent = BTreeInternalPage::<N>::new(ctx.pages[parent_index].guard.as_bytes());
            assert_eq!(
                parent.page_id(),
                btree_page::parent_page_id(ctx.pages[index].guard.as_bytes()),
                "latched ancestor chain out of order"
            );
            (
                parent.left_sibling_of(current_id),
                parent.right_sibling_of(current_id),
            )
        };

        let left_index = if left_id.is_valid() {
            ctx.pages.push(self.fetch_page_write(left_id)?);
            Some(ctx.pages.len() - 1)
        } else {
            None
        };
        let right_index = if right_id.is_valid() {
            ctx.pages.push(self.fetch_page_write(right_id)?);
            Some(ctx.pages.len() - 1)
        } else {
            None
        };

        let current_size = btree_page::size(ctx.pages[index].guard.as_bytes());
        let sibling_size = |i: Option<usize>, ctx: &WriteContext<'_>| {
            i.map(|i| btree_page::size(ctx.pages[i].guard.as_bytes()))
        };
        let left_size = sibling_size(left_index, ctx);
        let right_size = sibling_size(right_index, ctx);

        // Borrow keeps both pages above minimum; merge needs the combined
        // entries to fit (internal merges also rotate the separator down).
        let threshold = {
            let max_size = btree_page::max_size(ctx.pages[index].guard.as_bytes());
            if is_leaf {
                max_size
            } else {
                max_size + 1
            }
        };

        if let (Some(left_index), Some(left_size)) = (left_index, left_size) {
            if left_size + current_size >= threshold {
                return self.borrow_from_left(ctx, index, left_index, parent_index, is_leaf);
            }
        }
        if let (Some(right_index), Some(right_size)) = (right_index, right_size) {
            if right_size + current_size >= threshold {
                return self.borrow_from_right(ctx, index, right_index, parent_index, is_leaf);
            }
        }
        if let Some(left_index) = left_index {
            return self.merge_into_left(ctx, index, left_index, parent_index, is_leaf);
        }
        if let Some(right_index) = right_index {
            return self.merge_from_right(ctx, index, right_index, parent_index, is_leaf);
        }
        unreachable!("non-root page {} has no siblings", current_id);
    }

    /// Steals the left sibling's last entry; the stolen key becomes the new
    /// separator in the parent.
    fn borrow_from_left(
        &self,
        ctx: &mut WriteContext<'_>,
        index: usize,
        left_index: usize,
        parent_index: usize,
        is_leaf: bool,
    ) -> Result<()> {
        let current_id = ctx.pages[index].page_id;

        let stolen_key = if is_leaf {
            let (key, rid) = {
                let mut left =
                    BTreeLeafPageMut::<N>::new(ctx.pages[left_index].guard.as_bytes_mut());
                left.pop_last()
            };
            let mut current = BTreeLeafPageMut::<N>::new(ctx.pages[index].guard.as_bytes_mut());
            current.push_front(&key, rid);
            key
        } else {
            let (key, child) = {
                let mut left =
                    BTreeInternalPageMut::<N>::new(ctx.pages[left_index].guard.as_bytes_mut());
                left.pop_last()
            };
            {
                let mut current =
                    BTreeInternalPageMut::<N>::new(ctx.pages[index].guard.as_bytes_mut());
                current.push_front(&key, child);
            }
            self.set_parent_pointer(ctx, child, current_id)?;
            key
        };

        let mut parent =
            BTreeInternalPageMut::<N>::new(ctx.pages[parent_index].guard.as_bytes_mut());
        let slot = parent
            .as_ref()
            .child_index(current_id)
            .expect("page missing from its parent");
        parent.set_key_at(slot, &stolen_key);
        Ok(())
    }

    /// Steals the right sibling's first entry; for internal pages the old
    /// separator rotates down and the sibling's first key rotates up.
    fn borrow_from_right(
        &self,
        ctx: &mut WriteContext<'_>,
        index: usize,
        right_index: usize,
        parent_index: usize,
        is_leaf: bool,
    ) -> Result<()> {
        let right_id = ctx.pages[right_index].page_id;
        let current_id = ctx.pages[index].page_id;

        let slot_of_right = {
            let parent = BTreeInternalPage::<N>::new(ctx.pages[parent_index].guard.as_bytes());
            parent
                .child_index(right_id)
                .expect("page missing from its parent")
        };

        let new_separator = if is_leaf {
            let (key, rid) = {
                let mut right =
                    BTreeLeafPageMut::<N>::new(ctx.pages[right_index].guard.as_bytes_mut());
                right.pop_first()
            };
            {
                let mut current =
                    BTreeLeafPageMut::<N>::new(ctx.pages[index].guard.as_bytes_mut());
                current.push_back(&key, rid);
            }
            let right = BTreeLeafPage::<N>::new(ctx.pages[right_index].guard.as_bytes());
            right.key_at(0)
        } else {
            let old_separator = {
                let parent = BTreeInternalPage::<N>::new(ctx.pages[parent_index].guard.as_bytes());
                parent.key_at(slot_of_right)
            };
            let (first_key, first_child) = {
                let mut right =
                    BTreeInternalPageMut::<N>::new(ctx.pages[right_index].guard.as_bytes_mut());
                right.pop_first()
            };
            {
                let mut current =
                    BTreeInternalPageMut::<N>::new(ctx.pages[index].guard.as_bytes_mut());
                current.push_back(&old_separator, first_child);
            }
            self.set_parent_pointer(ctx, first_child, current_id)?;
            first_key
        };

        let mut parent =
            BTreeInternalPageMut::<N>::new(ctx.pages[parent_index].guard.as_bytes_mut());
        parent.set_key_at(slot_of_right, &new_separator);
        Ok(())
    }

    /// Appends this page onto its left sibling, then deletes the separator
    /// from the parent.
    fn merge_into_left(
        &self,
        ctx: &mut WriteContext<'_>,
        index: usize,
        left_index: usize,
        parent_index: usize,
        is_leaf: bool,
    ) -> Result<()> {
        let current_id = ctx.pages[index].page_id;
        let left_id = ctx.pages[left_index].page_id;

        let separator = {
            let parent = BTreeInternalPage::<N>::new(ctx.pages[parent_index].guard.as_bytes());
            let slot = parent
                .child_index(current_id)
                .expect("page missing from its parent");
            parent.key_at(slot)
        };

        let adopted = {
            let (current_lp, left_lp) = two_pages_mut(&mut ctx.pages, index, left_index);
            if is_leaf {
                let mut left = BTreeLeafPageMut::<N>::new(left_lp.guard.as_bytes_mut());
                let mut current = BTreeLeafPageMut::<N>::new(current_lp.guard.as_bytes_mut());
                left.merge_from_right(&mut current);
                Vec::new()
            } else {
                let mut left = BTreeInternalPageMut::<N>::new(left_lp.guard.as_bytes_mut());
                let mut current = BTreeInternalPageMut::<N>::new(current_lp.guard.as_bytes_mut());
                left.merge_from_right(&mut current, &separator)
            }
        };
        for child_id in adopted {
            self.set_parent_pointer(ctx, child_id, left_id)?;
        }

        ctx.deleted.push(current_id);
        self.delete_entry(ctx, parent_index, &separator)
    }

    /// Appends the right sibling onto this page, then deletes the sibling's
    /// separator from the parent.
    fn merge_from_right(
        &self,
        ctx: &mut WriteContext<'_>,
        index: usize,
        right_index: usize,
        parent_index: usize,
        is_leaf: bool,
    ) -> Result<()> {
        let current_id = ctx.pages[index].page_id;
        let right_id = ctx.pages[right_index].page_id;

        let separator = {
            let parent = BTreeInternalPage::<N>::new(ctx.pages[parent_index].guard.as_bytes());
            let slot = parent
                .child_index(right_id)
                .expect("page missing from its parent");
            parent.key_at(slot)
        };

        let adopted = {
            let (current_lp, right_lp) = two_pages_mut(&mut ctx.pages, index, right_index);
            if is_leaf {
                let mut current = BTreeLeafPageMut::<N>::new(current_lp.guard.as_bytes_mut());
                let mut right = BTreeLeafPageMut::<N>::new(right_lp.guard.as_bytes_mut());
                current.merge_from_right(&mut right);
                Vec::new()
            } else {
                let mut current = BTreeInternalPageMut::<N>::new(current_lp.guard.as_bytes_mut());
                let mut right = BTreeInternalPageMut::<N>::new(right_lp.guard.as_bytes_mut());
                current.merge_from_right(&mut right, &separator)
            }
        };
        for child_id in adopted {
            self.set_parent_pointer(ctx, child_id, current_id)?;
        }

        ctx.deleted.push(right_id);
        self.delete_entry(ctx, parent_index, &separator)
    }

    // ---- header page ----

    /// Records the index's root in the header page so the tree can be
    /// reopened later.
    fn update_root_record(&self, root_id: PageId) -> Result<()> {
        let page = self
            .buffer_pool
            .fetch_page(HEADER_PAGE_ID)
            .context("cannot fetch header page")?;
        {
            let mut guard = page.write_latch();
            let mut header = HeaderPage::new(guard.as_bytes_mut());
            if !header.update_record(&self.index_name, root_id) {
                header.insert_record(&self.index_name, root_id);
            }
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }
}

/// Mutable access to two distinct entries of the page set. `i` must be less
/// than `j`.
fn two_pages_mut(
    pages: &mut [LatchedPage],
    i: usize,
    j: usize,
) -> (&mut LatchedPage, &mut LatchedPage) {
    debug_assert!(i < j);
    let (head, tail) = pages.split_at_mut(j);
    (&mut head[i], &mut tail[0])
}
