/// Index of a buffer pool frame, in `[0, pool_size)`.
pub type FrameId = usize;

/// Eviction policy over buffer pool frames.
///
/// A frame must be tracked (via `record_access`) and marked evictable before
/// `evict` may return it.
pub trait Replacer: Send + Sync {
    /// Notes an access to `frame_id`, inserting it if unknown.
    fn record_access(&self, frame_id: FrameId);

    /// Marks a frame as eligible or ineligible for eviction. Unknown frames
    /// are ignored.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Selects a victim frame and removes it from the replacer.
    fn evict(&self) -> Option<FrameId>;

    /// Drops a frame from the replacer entirely. Panics if the frame is
    /// tracked but not evictable: that indicates a pin accounting bug.
    fn remove(&self, frame_id: FrameId);

    /// Number of evictable frames currently tracked.
    fn size(&self) -> usize;
}
