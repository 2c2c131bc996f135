//! Dispatch decisions
//!
//! Everything in this module runs under the producer's state mutex and does
//! no I/O. A flush classifies every registered consumer into
//! send-immediately, queue, or block; the resulting [`SendPlan`]s are
//! executed by the caller after the lock is released.
//!
//! Usage accounting: each decision duplicates the chunk's lease exactly
//! once. Sends hand their lease to the writer task (dropped when the write
//! completes), queued entries hold theirs in the queue, blocked entries in
//! the block slot. Drops release immediately.

use tokio::sync::{mpsc, oneshot};
use weir_protocol::{DistributionClass, MemoryLocation, SlownessPolicy};

use crate::registry::{BlockedSend, ConsumerEntry, Outgoing, Pending, Registry};

/// Picks the shared consumer for a dispatch, overriding load balancing
pub type SelectorFn = dyn Fn(&[String]) -> Option<String> + Send + Sync;

/// A send decision to execute once the state lock is released
pub(crate) struct SendPlan {
    pub consumer_id: String,
    pub writer: mpsc::Sender<Outgoing>,
    pub outgoing: Outgoing,
}

/// Everything a flush produced under the lock
#[derive(Default)]
pub(crate) struct DispatchOutcome {
    pub plans: Vec<SendPlan>,
    /// Wait-policy deliveries the flush future must wait for
    pub waiters: Vec<oneshot::Receiver<()>>,
}

/// Build the send plan for one consumer entry, marking it busy
fn plan_send(entry: &mut ConsumerEntry, pending: Pending) -> SendPlan {
    entry.ready = false;
    let local = entry.memory_location == MemoryLocation::Local;
    if local {
        // Pin the chunk until the consumer acknowledges; it reads the pool
        // directly, so the write completing is not enough.
        entry.held_local.push(pending.lease.clone());
    }
    entry.metrics.record_sent();
    SendPlan {
        consumer_id: entry.id.clone(),
        writer: entry.writer.clone(),
        outgoing: Outgoing { pending, local },
    }
}

/// Append to a bounded queue, evicting the oldest non-end-of-stream entry
///
/// End-of-stream markers are never dropped; a queue holding only markers
/// grows past its bound rather than lose one.
fn queue_with_drop(queue: &mut std::collections::VecDeque<Pending>, max: usize, pending: Pending) {
    if queue.len() >= max {
        if let Some(pos) = queue.iter().position(|p| !p.end_of_stream) {
            queue.remove(pos);
        }
    }
    queue.push_back(pending);
}

/// Classify every registered consumer for one just-flushed chunk
///
/// Runs under the state lock; returns the plans to execute and the waiters
/// the flush future must resolve. The passed-in `pending` is the flush's own
/// reference and is released when this function returns.
pub(crate) fn plan_dispatch(
    registry: &mut Registry,
    pending: Pending,
    no_input_shared: SlownessPolicy,
    shared_queue_cap: usize,
    selector: Option<&SelectorFn>,
) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();
    let end_of_stream = pending.end_of_stream;

    // Copy consumers: every one of them gets the chunk.
    for entry in registry
        .consumers
        .values_mut()
        .filter(|e| e.class == DistributionClass::Copy)
    {
        let share = pending.duplicate();
        if entry.ready {
            outcome.plans.push(plan_send(entry, share));
            continue;
        }

        // End-of-stream must never be dropped; auto-upgrade to queueDrop.
        let policy = match entry.policy {
            SlownessPolicy::Drop if end_of_stream => SlownessPolicy::QueueDrop,
            policy => policy,
        };
        match policy {
            SlownessPolicy::Drop => {
                entry.metrics.record_dropped();
                tracing::debug!(consumer = %entry.id, "dropping chunk for slow copy consumer");
            }
            SlownessPolicy::QueueDrop => {
                entry.metrics.record_queued();
                queue_with_drop(&mut entry.queue, entry.max_queue_length, share);
            }
            SlownessPolicy::Wait => {
                let (done, waiter) = oneshot::channel();
                entry.blocked.push_back(BlockedSend {
                    pending: share,
                    done,
                });
                outcome.waiters.push(waiter);
            }
        }
    }

    // Shared consumers: exactly one receives data; all receive end-of-stream.
    let shared_ids = registry.shared_ids();
    if shared_ids.is_empty() {
        return outcome;
    }

    if end_of_stream {
        // The marker goes to every shared consumer. Whoever drains the
        // shared pending queue sees it after the in-flight entries, because
        // the private queue is served after the shared one.
        for id in &shared_ids {
            let Some(entry) = registry.consumers.get_mut(id) else {
                continue;
            };
            let share = pending.duplicate();
            if entry.ready {
                let plan = plan_send(entry, share);
                registry.remove_from_share_next(id);
                outcome.plans.push(plan);
            } else {
                entry.metrics.record_queued();
                entry.queue.push_back(share);
            }
        }
        return outcome;
    }

    // Pick the target: explicit selector, else load-balanced ready-queue.
    let target = match selector {
        Some(pick) => pick(&shared_ids).filter(|id| {
            registry
                .consumers
                .get(id)
                .map(|e| e.class == DistributionClass::Shared && e.ready)
                .unwrap_or(false)
        }),
        None => loop {
            match registry.share_next.pop_front() {
                Some(id) => {
                    if registry
                        .consumers
                        .get(&id)
                        .map(|e| e.ready)
                        .unwrap_or(false)
                    {
                        break Some(id);
                    }
                    // Stale entry from a consumer that left; skip it.
                }
                None => break None,
            }
        },
    };

    match target {
        Some(id) => {
            registry.remove_from_share_next(&id);
            // Present in `shared_ids`, so the entry exists.
            if let Some(entry) = registry.consumers.get_mut(&id) {
                outcome.plans.push(plan_send(entry, pending));
            }
        }
        None => match no_input_shared {
            SlownessPolicy::Drop => {
                tracing::debug!("dropping chunk, no shared consumer available");
            }
            SlownessPolicy::QueueDrop => {
                queue_with_drop(&mut registry.shared_pending, shared_queue_cap, pending);
            }
            SlownessPolicy::Wait => {
                let (done, waiter) = oneshot::channel();
                registry.shared_blocked.push_back(BlockedSend { pending, done });
                outcome.waiters.push(waiter);
            }
        },
    }

    outcome
}

/// One-shot dispatch attempt when a consumer reports readiness
///
/// Called on hello and on every update, under the state lock. Serves, in
/// order: this consumer's blocked sends, then (for shared consumers) the
/// shared block slot and pending queue, then the consumer's private queue.
/// If nothing is pending the consumer is marked ready.
///
/// Returns at most one plan, preserving at-most-one-send-in-flight.
pub(crate) fn on_consumer_ready(registry: &mut Registry, id: &str) -> Option<SendPlan> {
    let entry = registry.consumers.get_mut(id)?;

    // A previous same-pool send is acknowledged by this readiness report.
    entry.held_local.clear();

    if let Some(blocked) = entry.blocked.pop_front() {
        let plan = plan_send(entry, blocked.pending);
        let _ = blocked.done.send(());
        return Some(plan);
    }

    if entry.class == DistributionClass::Shared {
        if let Some(blocked) = registry.shared_blocked.pop_front() {
            let entry = registry.consumers.get_mut(id)?;
            let plan = plan_send(entry, blocked.pending);
            let _ = blocked.done.send(());
            return Some(plan);
        }
        if let Some(pending) = registry.shared_pending.pop_front() {
            let entry = registry.consumers.get_mut(id)?;
            return Some(plan_send(entry, pending));
        }
    }

    let entry = registry.consumers.get_mut(id)?;
    if let Some(pending) = entry.queue.pop_front() {
        return Some(plan_send(entry, pending));
    }

    entry.ready = true;
    if entry.class == DistributionClass::Shared && !registry.share_next.iter().any(|x| x == id) {
        registry.share_next.push_back(id.to_string());
    }
    None
}

/// Evict one queued chunk to free a pool slot
///
/// Walks the shared queue and every consumer's private queue, dropping the
/// oldest non-end-of-stream entry found. Returns false when nothing is
/// evictable (only markers or in-flight sends remain).
pub(crate) fn evict_one(registry: &mut Registry) -> bool {
    if let Some(pos) = registry.shared_pending.iter().position(|p| !p.end_of_stream) {
        registry.shared_pending.remove(pos);
        return true;
    }
    for entry in registry.consumers.values_mut() {
        if let Some(pos) = entry.queue.iter().position(|p| !p.end_of_stream) {
            entry.queue.remove(pos);
            entry.metrics.record_dropped();
            return true;
        }
    }
    false
}
