use super::replacer::{FrameId, Replacer};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy)]
struct FrameEntry {
    hit_count: usize,
    evictable: bool,
}

#[derive(Debug, Default)]
struct LruKState {
    /// Frames with fewer than K accesses, ordered by first access.
    history: VecDeque<FrameId>,
    /// Frames with at least K accesses, ordered by most recent access
    /// (least recently used at the front).
    cache: VecDeque<FrameId>,
    entries: HashMap<FrameId, FrameEntry>,
    /// Count of evictable frames across both queues.
    curr_size: usize,
}

/// LRU-K eviction policy.
///
/// Frames that never reached K accesses are preferred victims, in FIFO order
/// of their first access; frames with K or more accesses fall back to plain
/// LRU order. A single mutex serializes all operations.
pub struct LruKReplacer {
    state: Mutex<LruKState>,
    num_frames: usize,
    k: usize,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1);
        Self {
            state: Mutex::new(LruKState::default()),
            num_frames,
            k,
        }
    }

    fn check_frame(&self, frame_id: FrameId) {
        assert!(
            frame_id < self.num_frames,
            "frame id {} out of range (pool size {})",
            frame_id,
            self.num_frames
        );
    }
}

impl Replacer for LruKReplacer {
    fn record_access(&self, frame_id: FrameId) {
        self.check_frame(frame_id);
        let mut state = self.state.lock();

        match state.entries.get_mut(&frame_id) {
            Some(entry) => {
                entry.hit_count += 1;
                let hits = entry.hit_count;
                if hits == self.k {
                    // Graduates from the history queue into the cache queue.
                    let pos = state
                        .history
                        .iter()
                        .position(|&f| f == frame_id)
                        .expect("frame below K accesses must be in the history queue");
                    state.history.remove(pos);
                    state.cache.push_back(frame_id);
                } else if hits > self.k {
                    let pos = state
                        .cache
                        .iter()
                        .position(|&f| f == frame_id)
                        .expect("frame at K or more accesses must be in the cache queue");
                    state.cache.remove(pos);
                    state.cache.push_back(frame_id);
                }
            }
            None => {
                state.entries.insert(
                    frame_id,
                    FrameEntry {
                        hit_count: 1,
                        evictable: false,
                    },
                );
                state.history.push_back(frame_id);
            }
        }
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        self.check_frame(frame_id);
        let mut state = self.state.lock();

        if let Some(entry) = state.entries.get_mut(&frame_id) {
            if entry.evictable != evictable {
                entry.evictable = evictable;
                if evictable {
                    state.curr_size += 1;
                } else {
                    state.curr_size -= 1;
                }
            }
        }
    }

    fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();

        // History queue first: classical LRU-K prefers frames that never
        // reached K accesses.
        for queue_is_history in [true, false] {
            let queue = if queue_is_history {
                &state.history
            } else {
                &state.cache
            };
            let found = queue
                .iter()
                .position(|f| state.entries[f].evictable)
                .map(|pos| (pos, queue[pos]));
            if let Some((pos, frame_id)) = found {
                if queue_is_history {
                    state.history.remove(pos);
                } else {
                    state.cache.remove(pos);
                }
                state.entries.remove(&frame_id);
                state.curr_size -= 1;
                return Some(frame_id);
            }
        }
        None
    }

    fn remove(&self, frame_id: FrameId) {
        self.check_frame(frame_id);
        let mut state = self.state.lock();

        let Some(entry) = state.entries.get(&frame_id) else {
            return;
        };
        assert!(
            entry.evictable,
            "removing non-evictable frame {} from the replacer",
            frame_id
        );
        let below_k = entry.hit_count < self.k;
        state.entries.remove(&frame_id);
        let queue = if below_k {
            &mut state.history
        } else {
            &mut state.cache
        };
        if let Some(pos) = queue.iter().position(|&f| f == frame_id) {
            queue.remove(pos);
        }
        state.curr_size -= 1;
    }

    fn size(&self) -> usize {
        self.state.lock().curr_size
    }
}
