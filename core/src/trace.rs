//! Decision trace ring.
//!
//! A small wrapping buffer of governor transitions, cheap enough to
//! leave on in production and dumped whole when something goes wrong.

use alloc::vec::Vec;
use spin::Mutex;

/// Ring capacity; must stay a power of two.
pub const TRACE_CAPACITY: usize = 0x100;

/// What a trace entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventKind {
    /// CPU committed to a level.
    CpuEnter,
    /// CPU came back from idle.
    CpuExit,
    /// Cluster hardware committed to a level.
    ClusterEnter,
    /// Cluster hardware restored to default.
    ClusterExit,
    /// Cluster configure abandoned after revalidation.
    ClusterAbort,
}

/// One governor transition.
#[derive(Debug, Clone, Copy)]
pub struct TraceEvent {
    /// What happened.
    pub kind: TraceEventKind,
    /// When, microseconds.
    pub time_us: u64,
    /// Acting CPU, or the arena index of the cluster.
    pub actor: u32,
    /// Kind-specific payload.
    pub args: [u64; 4],
}

#[derive(Debug)]
struct TraceInner {
    events: Vec<TraceEvent>,
    next: usize,
    total: u64,
}

/// Shared wrapping buffer of [`TraceEvent`]s.
#[derive(Debug)]
pub struct TraceBuffer {
    inner: Mutex<TraceInner>,
}

impl TraceBuffer {
    /// Empty ring.
    pub fn new() -> Self {
        TraceBuffer {
            inner: Mutex::new(TraceInner {
                events: Vec::with_capacity(TRACE_CAPACITY),
                next: 0,
                total: 0,
            }),
        }
    }

    /// Append one event, overwriting the oldest once full.
    pub fn record(&self, kind: TraceEventKind, time_us: u64, actor: u32, args: [u64; 4]) {
        let ev = TraceEvent {
            kind,
            time_us,
            actor,
            args,
        };
        let mut inner = self.inner.lock();
        if inner.events.len() < TRACE_CAPACITY {
            inner.events.push(ev);
        } else {
            let at = inner.next;
            inner.events[at] = ev;
        }
        inner.next = (inner.next + 1) & (TRACE_CAPACITY - 1);
        inner.total += 1;
    }

    /// Events recorded since creation, including overwritten ones.
    pub fn total(&self) -> u64 {
        self.inner.lock().total
    }

    /// Copy of the ring, oldest first.
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.events.len());
        if inner.events.len() < TRACE_CAPACITY {
            out.extend_from_slice(&inner.events);
        } else {
            out.extend_from_slice(&inner.events[inner.next..]);
            out.extend_from_slice(&inner.events[..inner.next]);
        }
        out
    }
}

impl Default for TraceBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_in_order() {
        let t = TraceBuffer::new();
        for i in 0..4 {
            t.record(TraceEventKind::CpuEnter, i, 0, [i, 0, 0, 0]);
        }
        let snap = t.snapshot();
        assert_eq!(snap.len(), 4);
        assert!(snap.windows(2).all(|w| w[0].time_us < w[1].time_us));
    }

    #[test]
    fn test_wraps_keeping_newest() {
        let t = TraceBuffer::new();
        for i in 0..(TRACE_CAPACITY as u64 + 16) {
            t.record(TraceEventKind::CpuExit, i, 1, [0; 4]);
        }
        let snap = t.snapshot();
        assert_eq!(snap.len(), TRACE_CAPACITY);
        assert_eq!(snap[0].time_us, 16);
        assert_eq!(snap[TRACE_CAPACITY - 1].time_us, TRACE_CAPACITY as u64 + 15);
        assert_eq!(t.total(), TRACE_CAPACITY as u64 + 16);
    }
}
