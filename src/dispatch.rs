#![allow(clippy::arithmetic_side_effects)]

// batches chain heads into frames per destination node and hands them to the
// downstream graph

use {
    crate::{
        buffer::BufferHandle,
        chain::ChainHead,
        device::{DeviceId, NextNode},
        pool::BufferPool,
        trace_log::{TraceEvent, TraceLog},
        FRAME_SIZE,
    },
    std::sync::Arc,
};

/// the downstream graph's batched-enqueue contract. ownership of every head
/// moves to the graph, which frees the chains through the pool (or a
/// [`crate::pool::Recycler`]) once it is done with them.
pub trait Graph {
    fn enqueue_batch(&mut self, pool: &mut BufferPool, next: NextNode, heads: &[BufferHandle]);
}

impl<F> Graph for F
where
    F: FnMut(&mut BufferPool, NextNode, &[BufferHandle]),
{
    fn enqueue_batch(&mut self, pool: &mut BufferPool, next: NextNode, heads: &[BufferHandle]) {
        self(pool, next, heads)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub frames: u64,
    pub chains: u64,
    pub traced: u64,
}

pub struct Dispatcher {
    frame_size: usize,
    next: NextNode,
    heads: Vec<BufferHandle>,
    trace: Arc<TraceLog>,
    trace_budget: u32,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(trace: Arc<TraceLog>) -> Self {
        Self::with_frame_size(FRAME_SIZE, trace)
    }

    pub fn with_frame_size(frame_size: usize, trace: Arc<TraceLog>) -> Self {
        assert!(frame_size > 0, "frame size must be non-zero");
        Self {
            frame_size,
            next: NextNode::EthernetInput,
            heads: Vec::with_capacity(frame_size),
            trace,
            trace_budget: 0,
            stats: DispatchStats::default(),
        }
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// heads still accepted before the current frame is flushed
    #[inline]
    pub fn room(&self) -> usize {
        self.frame_size - self.heads.len()
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.heads.len()
    }

    pub fn trace(&self) -> &Arc<TraceLog> {
        &self.trace
    }

    /// number of upcoming chains to trace
    pub fn set_trace_budget(&mut self, n: u32) {
        self.trace_budget = n;
    }

    pub fn trace_budget(&self) -> u32 {
        self.trace_budget
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// queue one chain for `next`. a change of destination flushes the frame
    /// in progress first; a full frame is flushed right away.
    pub fn enqueue(
        &mut self,
        pool: &mut BufferPool,
        graph: &mut dyn Graph,
        next: NextNode,
        device: DeviceId,
        chain: &ChainHead,
    ) {
        if !self.heads.is_empty() && self.next != next {
            self.flush(pool, graph);
        }
        self.next = next;

        if self.trace_budget > 0 && self.trace.is_enabled() {
            self.trace_budget -= 1;
            self.stats.traced += 1;
            self.trace.log(
                TraceEvent::RxChain as u32,
                device.0 as u64,
                (u64::from(chain.head.as_u32()) << 32) | chain.length as u64,
            );
        }

        self.heads.push(chain.head);
        self.stats.chains += 1;

        if self.heads.len() >= self.frame_size {
            self.flush(pool, graph);
        }
    }

    pub fn flush(&mut self, pool: &mut BufferPool, graph: &mut dyn Graph) {
        if self.heads.is_empty() {
            return;
        }
        graph.enqueue_batch(pool, self.next, &self.heads);
        self.heads.clear();
        self.stats.frames += 1;
    }
}
