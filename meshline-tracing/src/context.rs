//! Execution-context keyed "current span" bookkeeping.
//!
//! Each execution context (an OS thread for [`Tracer`](crate::Tracer), a logical task for
//! [`AsyncTracer`](crate::AsyncTracer)) owns a stack of open span contexts. Entries are removed
//! as soon as their stack empties or their owner releases them. Task entries are released by a
//! drop guard; a thread that exits with spans still open keeps its entry until
//! [`Tracer::release_current_thread`](crate::Tracer::release_current_thread) runs on it.

use dashmap::DashMap;
use meshline_core::{SpanContext, SpanId};
use std::thread::ThreadId;

/// Identifies the execution context a span was opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    Thread(ThreadId),
    Task(u64),
    /// Span opened outside any tracked context; never becomes "current".
    Detached,
}

#[derive(Debug, Default)]
pub(crate) struct ContextTable {
    stacks: DashMap<ContextKey, Vec<SpanContext>>,
}

impl ContextTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, key: ContextKey, context: SpanContext) {
        if key == ContextKey::Detached {
            return;
        }
        self.stacks.entry(key).or_default().push(context);
    }

    /// Removes `span_id` from the stack of `key`, restoring whatever was current before it.
    pub(crate) fn remove(&self, key: ContextKey, span_id: SpanId) {
        if key == ContextKey::Detached {
            return;
        }
        // Ends usually happen in LIFO order, but a span may also be ended out of order.
        self.stacks.remove_if_mut(&key, |_, stack| {
            if let Some(pos) = stack.iter().rposition(|c| c.span_id == span_id) {
                stack.remove(pos);
            }
            stack.is_empty()
        });
    }

    pub(crate) fn current(&self, key: ContextKey) -> Option<SpanContext> {
        self.stacks
            .get(&key)
            .and_then(|stack| stack.last().cloned())
    }

    /// Drops every entry of `key`. Returns the number of span contexts that were still open.
    pub(crate) fn release(&self, key: ContextKey) -> usize {
        self.stacks
            .remove(&key)
            .map(|(_, stack)| stack.len())
            .unwrap_or(0)
    }

    /// Number of execution contexts with at least one open span.
    pub(crate) fn len(&self) -> usize {
        self.stacks.len()
    }
}
