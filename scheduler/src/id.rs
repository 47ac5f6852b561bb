// id.rs — Stable identifiers for stream-graph nodes
//
// Stream nodes live in an arena owned by `StreamGraph`; a `StreamId` is the
// node's index in that arena. IDs are allocated in construction order, which
// is bottom-up (children before parents), so they are deterministic for a
// given graph description.

use std::fmt;

use serde::Serialize;

/// Stable identifier for a stream node (filter or container).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamId(pub u32);

impl StreamId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Allocator for stream IDs. Produces monotonically increasing IDs in
/// allocation order.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_stream: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_stream(&mut self) -> StreamId {
        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        id
    }

    /// Number of IDs handed out so far.
    pub fn allocated(&self) -> usize {
        self.next_stream as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_monotonic() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.alloc_stream(), StreamId(0));
        assert_eq!(ids.alloc_stream(), StreamId(1));
        assert_eq!(ids.allocated(), 2);
        assert_eq!(StreamId(7).to_string(), "s7");
    }
}
