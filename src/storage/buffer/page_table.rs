use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// In-memory extendible hash table, used by the buffer pool to map resident
/// page ids to frame ids.
///
/// A directory of `2^global_depth` slots points into a pool of buckets; a
/// bucket overflow splits the bucket, doubling the directory when the
/// bucket's local depth catches up with the global depth. The table itself
/// is unsynchronized: the buffer pool serializes access under its own mutex.
pub struct ExtendibleHashTable<K, V> {
    global_depth: usize,
    bucket_size: usize,
    /// Indexes into `buckets`; multiple directory slots may share a bucket.
    directory: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
}

struct Bucket<K, V> {
    local_depth: usize,
    items: Vec<(K, V)>,
}

impl<K: Hash + Eq + Clone, V: Clone> ExtendibleHashTable<K, V> {
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size >= 1);
        Self {
            global_depth: 0,
            bucket_size,
            directory: vec![0],
            buckets: vec![Bucket {
                local_depth: 0,
                items: Vec::new(),
            }],
        }
    }

    pub fn global_depth(&self) -> usize {
        self.global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> usize {
        self.buckets[self.directory[dir_index]].local_depth
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let bucket = &self.buckets[self.bucket_index(key)];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Inserts or overwrites the value for `key`.
    pub fn insert(&mut self, key: K, value: V) {
        loop {
            let bucket_index = self.bucket_index(&key);
            let bucket = &mut self.buckets[bucket_index];

            if let Some(slot) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = value;
                return;
            }
            if bucket.items.len() < self.bucket_size {
                bucket.items.push((key, value));
                return;
            }
            self.split_bucket(bucket_index);
        }
    }

    pub fn remove(&mut self, key: &K) -> bool {
        let bucket_index = self.bucket_index(key);
        let bucket = &mut self.buckets[bucket_index];
        match bucket.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                bucket.items.remove(pos);
                true
            }
            None => false,
        }
    }

    fn bucket_index(&self, key: &K) -> usize {
        self.directory[self.dir_index(key)]
    }

    fn dir_index(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & ((1 << self.global_depth) - 1)
    }

    fn split_bucket(&mut self, bucket_index: usize) {
        let local_depth = self.buckets[bucket_index].local_depth;

        if local_depth == self.global_depth {
            // Double the directory; the new half mirrors the old.
            let mirrored = self.directory.clone();
            self.directory.extend(mirrored);
            self.global_depth += 1;
        }

        let new_depth = local_depth + 1;
        let new_bucket_index = self.buckets.len();
        self.buckets.push(Bucket {
            local_depth: new_depth,
            items: Vec::new(),
        });
        self.buckets[bucket_index].local_depth = new_depth;

        // Directory slots whose new depth bit is set move to the new bucket.
        let high_bit = 1 << local_depth;
        for slot in 0..self.directory.len() {
            if self.directory[slot] == bucket_index && slot & high_bit != 0 {
                self.directory[slot] = new_bucket_index;
            }
        }

        // Rehash the overflowing bucket's items across the pair.
        let items = std::mem::take(&mut self.buckets[bucket_index].items);
        for (key, value) in items {
            let target = self.bucket_index(&key);
            self.buckets[target].items.push((key, value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let mut table: ExtendibleHashTable<i32, usize> = ExtendibleHashTable::new(4);

        table.insert(1, 10);
        table.insert(2, 20);
        assert_eq!(table.find(&1), Some(10));
        assert_eq!(table.find(&2), Some(20));
        assert_eq!(table.find(&3), None);

        assert!(table.remove(&1));
        assert!(!table.remove(&1));
        assert_eq!(table.find(&1), None);
    }

    #[test]
    fn test_insert_overwrites() {
        let mut table: ExtendibleHashTable<i32, usize> = ExtendibleHashTable::new(4);
        table.insert(1, 10);
        table.insert(1, 11);
        assert_eq!(table.find(&1), Some(11));
    }

    #[test]
    fn test_growth_under_load() {
        let mut table: ExtendibleHashTable<i32, i32> = ExtendibleHashTable::new(2);

        for i in 0..256 {
            table.insert(i, i * 2);
        }
        assert!(table.num_buckets() > 1);
        assert!(table.global_depth() > 0);

        for i in 0..256 {
            assert_eq!(table.find(&i), Some(i * 2));
        }
    }

    #[test]
    fn test_remove_after_growth() {
        let mut table: ExtendibleHashTable<i32, i32> = ExtendibleHashTable::new(2);

        for i in 0..64 {
            table.insert(i, i);
        }
        for i in (0..64).step_by(2) {
            assert!(table.remove(&i));
        }
        for i in 0..64 {
            assert_eq!(table.find(&i), if i % 2 == 0 { None } else { Some(i) });
        }
    }
}
