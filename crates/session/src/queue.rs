//! The per-session prompt queue.
//!
//! FIFO with one prompt in flight. `collect` fuses same-scope prompts
//! inside the binding's debounce window; `steer` jumps the queue after
//! the running prompt is aborted. Persistence row ids ride along so the
//! holder can delete rows when prompts finish.

use berth_core::protocol::{QueueMode, QueuedPrompt};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// What `enqueue` decided to do with the prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended to the tail (or head, for steer) at this queue depth.
    Queued { depth: usize },
    /// Fused into an existing queued prompt with the same scope key.
    Coalesced,
    /// Placed at the head; the caller must abort the in-flight prompt.
    SteerQueued,
}

#[derive(Debug)]
struct QueueItem {
    prompt: QueuedPrompt,
    /// Persistence row, absent for replayed prompts already re-persisted.
    row_id: Option<i64>,
    enqueued_at: Instant,
}

/// One session's prompt queue. All methods are called from the holder
/// actor, so no interior locking.
#[derive(Debug, Default)]
pub struct PromptQueue {
    items: VecDeque<QueueItem>,
    in_flight: Option<QueueItem>,
}

impl PromptQueue {
    pub fn new() -> Self {
        PromptQueue::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight(&self) -> Option<&QueuedPrompt> {
        self.in_flight.as_ref().map(|item| &item.prompt)
    }

    /// Row ids of every queued and in-flight prompt (for persistence
    /// bookkeeping).
    pub fn row_ids(&self) -> Vec<i64> {
        self.items
            .iter()
            .chain(self.in_flight.as_ref())
            .filter_map(|item| item.row_id)
            .collect()
    }

    /// Enqueue a prompt under its queue mode.
    ///
    /// For `collect`, the prompt fuses into the newest queued prompt
    /// with the same scope key when that prompt was enqueued within
    /// `debounce`. The fused prompt keeps its position and row id; the
    /// caller re-persists it.
    pub fn enqueue(
        &mut self,
        prompt: QueuedPrompt,
        debounce: Duration,
        now: Instant,
    ) -> EnqueueOutcome {
        match prompt.queue_mode {
            QueueMode::Steer => {
                self.items.push_front(QueueItem {
                    prompt,
                    row_id: None,
                    enqueued_at: now,
                });
                EnqueueOutcome::SteerQueued
            }
            QueueMode::Collect => {
                if let Some(target) = self.collect_target(&prompt, debounce, now) {
                    let item = &mut self.items[target];
                    item.prompt.content.push_str("\n\n");
                    item.prompt.content.push_str(&prompt.content);
                    item.enqueued_at = now;
                    return EnqueueOutcome::Coalesced;
                }
                self.push_back(prompt, now)
            }
            QueueMode::Followup => self.push_back(prompt, now),
        }
    }

    fn push_back(&mut self, prompt: QueuedPrompt, now: Instant) -> EnqueueOutcome {
        self.items.push_back(QueueItem {
            prompt,
            row_id: None,
            enqueued_at: now,
        });
        EnqueueOutcome::Queued {
            depth: self.items.len(),
        }
    }

    /// Newest queued prompt sharing the scope key, still inside the
    /// debounce window.
    fn collect_target(
        &self,
        prompt: &QueuedPrompt,
        debounce: Duration,
        now: Instant,
    ) -> Option<usize> {
        let scope = prompt.scope_key.as_deref()?;
        self.items
            .iter()
            .enumerate()
            .rev()
            .find(|(_, item)| {
                item.prompt.scope_key.as_deref() == Some(scope)
                    && now.duration_since(item.enqueued_at) <= debounce
            })
            .map(|(idx, _)| idx)
    }

    /// Attach a persistence row id to the most recently touched item for
    /// this scope/content (called right after enqueue persists).
    pub fn set_last_row_id(&mut self, row_id: i64) {
        if let Some(item) = self
            .items
            .iter_mut()
            .filter(|item| item.row_id.is_none())
            .next_back()
        {
            item.row_id = Some(row_id);
        }
    }

    /// Row id of the queued item at `index`, if persisted.
    pub fn row_id_at(&self, index: usize) -> Option<i64> {
        self.items.get(index).and_then(|item| item.row_id)
    }

    /// The prompt most recently enqueued without a persistence row.
    pub fn newest_unpersisted(&self) -> Option<QueuedPrompt> {
        self.items
            .iter()
            .filter(|item| item.row_id.is_none())
            .next_back()
            .map(|item| item.prompt.clone())
    }

    /// The queued prompt most recently fused (head of its scope). Used
    /// to re-persist after coalescing.
    pub fn queued_for_scope(&self, scope_key: &str) -> Option<(&QueuedPrompt, Option<i64>)> {
        self.items
            .iter()
            .rev()
            .find(|item| item.prompt.scope_key.as_deref() == Some(scope_key))
            .map(|item| (&item.prompt, item.row_id))
    }

    /// Restore a persisted prompt during holder re-init.
    pub fn restore(&mut self, prompt: QueuedPrompt, row_id: i64) {
        self.items.push_back(QueueItem {
            prompt,
            row_id: Some(row_id),
            enqueued_at: Instant::now(),
        });
    }

    /// Take the next prompt for dispatch. Only one prompt may be in
    /// flight at a time.
    pub fn next_ready(&mut self) -> Option<&QueuedPrompt> {
        if self.in_flight.is_some() {
            return None;
        }
        let item = self.items.pop_front()?;
        self.in_flight = Some(item);
        self.in_flight.as_ref().map(|item| &item.prompt)
    }

    /// The in-flight prompt finished; returns its persistence row for
    /// deletion.
    pub fn finish_in_flight(&mut self) -> Option<i64> {
        self.in_flight.take().and_then(|item| item.row_id)
    }

    /// Abort the in-flight prompt (steer, client abort). The prompt is
    /// dropped; its persistence row is returned for deletion.
    pub fn abort_in_flight(&mut self) -> Option<i64> {
        self.in_flight.take().and_then(|item| item.row_id)
    }

    /// Put the in-flight prompt back at the head. Used on runner
    /// supersession: the replacement runner never saw the prompt.
    pub fn requeue_in_flight(&mut self) {
        if let Some(item) = self.in_flight.take() {
            self.items.push_front(item);
        }
    }

    /// Queued prompt contents, head first (for snapshots/tests).
    pub fn queued_contents(&self) -> Vec<&str> {
        self.items
            .iter()
            .map(|item| item.prompt.content.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(content: &str, mode: QueueMode, scope: Option<&str>) -> QueuedPrompt {
        let mut p = QueuedPrompt::text(content, mode);
        p.scope_key = scope.map(|s| s.to_string());
        p
    }

    #[test]
    fn followup_is_fifo_with_single_flight() {
        let mut queue = PromptQueue::new();
        let now = Instant::now();
        queue.enqueue(prompt("a", QueueMode::Followup, None), Duration::ZERO, now);
        queue.enqueue(prompt("b", QueueMode::Followup, None), Duration::ZERO, now);

        assert_eq!(queue.next_ready().unwrap().content, "a");
        // One in flight: nothing else dispatches.
        assert!(queue.next_ready().is_none());
        queue.finish_in_flight();
        assert_eq!(queue.next_ready().unwrap().content, "b");
    }

    #[test]
    fn collect_fuses_same_scope_within_window() {
        let mut queue = PromptQueue::new();
        let now = Instant::now();
        let debounce = Duration::from_millis(2000);
        queue.enqueue(
            prompt("first", QueueMode::Collect, Some("user:u:telegram:1")),
            debounce,
            now,
        );
        let outcome = queue.enqueue(
            prompt("second", QueueMode::Collect, Some("user:u:telegram:1")),
            debounce,
            now + Duration::from_millis(500),
        );
        assert_eq!(outcome, EnqueueOutcome::Coalesced);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.queued_contents(), ["first\n\nsecond"]);
    }

    #[test]
    fn collect_outside_window_behaves_as_followup() {
        let mut queue = PromptQueue::new();
        let now = Instant::now();
        let debounce = Duration::from_millis(100);
        queue.enqueue(
            prompt("first", QueueMode::Collect, Some("k")),
            debounce,
            now,
        );
        let outcome = queue.enqueue(
            prompt("late", QueueMode::Collect, Some("k")),
            debounce,
            now + Duration::from_millis(500),
        );
        assert_eq!(outcome, EnqueueOutcome::Queued { depth: 2 });
    }

    #[test]
    fn collect_across_scopes_never_fuses() {
        let mut queue = PromptQueue::new();
        let now = Instant::now();
        let debounce = Duration::from_secs(10);
        queue.enqueue(prompt("a", QueueMode::Collect, Some("k1")), debounce, now);
        let outcome = queue.enqueue(prompt("b", QueueMode::Collect, Some("k2")), debounce, now);
        assert_eq!(outcome, EnqueueOutcome::Queued { depth: 2 });
    }

    #[test]
    fn steer_jumps_ahead_of_earlier_queued_prompts() {
        let mut queue = PromptQueue::new();
        let now = Instant::now();
        queue.enqueue(prompt("followup", QueueMode::Followup, None), Duration::ZERO, now);
        let outcome = queue.enqueue(prompt("steer", QueueMode::Steer, None), Duration::ZERO, now);
        assert_eq!(outcome, EnqueueOutcome::SteerQueued);
        assert_eq!(queue.queued_contents(), ["steer", "followup"]);
        assert_eq!(queue.next_ready().unwrap().content, "steer");
    }

    #[test]
    fn abort_clears_the_flight_slot() {
        let mut queue = PromptQueue::new();
        let now = Instant::now();
        queue.enqueue(prompt("a", QueueMode::Followup, None), Duration::ZERO, now);
        queue.enqueue(prompt("b", QueueMode::Followup, None), Duration::ZERO, now);
        queue.next_ready();
        queue.abort_in_flight();
        assert_eq!(queue.next_ready().unwrap().content, "b");
    }

    #[test]
    fn restore_preserves_order_and_row_ids() {
        let mut queue = PromptQueue::new();
        queue.restore(prompt("a", QueueMode::Followup, None), 11);
        queue.restore(prompt("b", QueueMode::Followup, None), 12);
        assert_eq!(queue.row_ids(), [11, 12]);
        queue.next_ready();
        assert_eq!(queue.finish_in_flight(), Some(11));
    }

    #[test]
    fn set_last_row_id_targets_newest_unpersisted() {
        let mut queue = PromptQueue::new();
        let now = Instant::now();
        queue.enqueue(prompt("a", QueueMode::Followup, None), Duration::ZERO, now);
        queue.set_last_row_id(5);
        queue.enqueue(prompt("b", QueueMode::Followup, None), Duration::ZERO, now);
        queue.set_last_row_id(6);
        assert_eq!(queue.row_id_at(0), Some(5));
        assert_eq!(queue.row_id_at(1), Some(6));
    }
}
