use crate::access::btree::key::GenericKey;
use crate::access::Rid;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::btree_leaf_page::BTreeLeafPage;
use crate::storage::page::{PageId, PageReadLatch};
use std::sync::Arc;

struct LeafCursor {
    page_id: PageId,
    guard: PageReadLatch,
    index: usize,
}

/// Forward scan over the leaf chain.
///
/// Holds a shared latch on exactly one leaf at a time; hopping to the next
/// leaf releases and unpins the current one first. The iterator therefore
/// pins at most one page and never blocks readers.
pub struct IndexIterator<const N: usize> {
    buffer_pool: Arc<BufferPoolManager>,
    position: Option<LeafCursor>,
}

impl<const N: usize> IndexIterator<N> {
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        page_id: PageId,
        guard: PageReadLatch,
        index: usize,
    ) -> Self {
        Self {
            buffer_pool,
            position: Some(LeafCursor {
                page_id,
                guard,
                index,
            }),
        }
    }

    /// An iterator with nothing left to yield (empty tree).
    pub(crate) fn exhausted(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            position: None,
        }
    }

    /// True once the iterator is past the last entry of the rightmost leaf.
    pub fn is_end(&self) -> bool {
        match &self.position {
            None => true,
            Some(cursor) => {
                let leaf = BTreeLeafPage::<N>::new(cursor.guard.as_bytes());
                cursor.index >= leaf.size() && !leaf.next_page_id().is_valid()
            }
        }
    }

    fn release_current(&mut self) {
        if let Some(cursor) = self.position.take() {
            let page_id = cursor.page_id;
            drop(cursor.guard);
            self.buffer_pool.unpin_page(page_id, false);
        }
    }
}

impl<const N: usize> Iterator for IndexIterator<N> {
    type Item = (GenericKey<N>, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cursor = self.position.as_mut()?;
            let leaf = BTreeLeafPage::<N>::new(cursor.guard.as_bytes());

            if cursor.index < leaf.size() {
                let item = (leaf.key_at(cursor.index), leaf.rid_at(cursor.index));
                cursor.index += 1;
                return Some(item);
            }

            let next_id = leaf.next_page_id();
            self.release_current();
            if !next_id.is_valid() {
                return None;
            }

            let Ok(page) = self.buffer_pool.fetch_page(next_id) else {
                return None;
            };
            let guard = page.read_latch();
            self.position = Some(LeafCursor {
                page_id: next_id,
                guard,
                index: 0,
            });
        }
    }
}

impl<const N: usize> PartialEq for IndexIterator<N> {
    /// Two iterators are equal when they sit on the same slot of the same
    /// leaf, or when both are past the end of the chain.
    fn eq(&self, other: &Self) -> bool {
        if self.is_end() || other.is_end() {
            return self.is_end() && other.is_end();
        }
        match (&self.position, &other.position) {
            (Some(a), Some(b)) => a.page_id == b.page_id && a.index == b.index,
            _ => false,
        }
    }
}

impl<const N: usize> Drop for IndexIterator<N> {
    fn drop(&mut self) {
        self.release_current();
    }
}
