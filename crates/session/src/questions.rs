//! Pending-question board.
//!
//! Expiry is checked on every client connect and by the holder's
//! periodic sweep; both paths funnel through [`QuestionBoard::sweep_expired`].

use berth_core::question::PendingQuestion;
use std::collections::HashMap;
use time::OffsetDateTime;

#[derive(Debug, Default)]
pub struct QuestionBoard {
    pending: HashMap<String, PendingQuestion>,
}

impl QuestionBoard {
    pub fn new() -> Self {
        QuestionBoard::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Store a question the runner just asked. Re-asking with the same
    /// id replaces the previous entry.
    pub fn ask(&mut self, question: PendingQuestion) {
        self.pending.insert(question.question_id.clone(), question);
    }

    /// Resolve a question by answer; returns it for routing to the runner.
    pub fn answer(&mut self, question_id: &str) -> Option<PendingQuestion> {
        self.pending.remove(question_id)
    }

    /// Remove and return every expired question.
    pub fn sweep_expired(&mut self, now: OffsetDateTime) -> Vec<PendingQuestion> {
        let expired_ids: Vec<String> = self
            .pending
            .values()
            .filter(|q| q.is_expired(now))
            .map(|q| q.question_id.clone())
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    /// Snapshot in id order (stable for clients and tests).
    pub fn list(&self) -> Vec<PendingQuestion> {
        let mut questions: Vec<PendingQuestion> = self.pending.values().cloned().collect();
        questions.sort_by(|a, b| a.question_id.cmp(&b.question_id));
        questions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn question(id: &str, expires_in: Option<Duration>) -> PendingQuestion {
        PendingQuestion {
            question_id: id.into(),
            text: "ok to proceed?".into(),
            options: None,
            expires_at: expires_in.map(|d| OffsetDateTime::now_utc() + d),
            channel_type: None,
            channel_id: None,
        }
    }

    #[test]
    fn answer_removes_the_question() {
        let mut board = QuestionBoard::new();
        board.ask(question("q1", None));
        assert!(board.answer("q1").is_some());
        assert!(board.answer("q1").is_none());
        assert!(board.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let mut board = QuestionBoard::new();
        board.ask(question("expired", Some(Duration::seconds(-5))));
        board.ask(question("live", Some(Duration::hours(1))));
        board.ask(question("forever", None));

        let expired = board.sweep_expired(OffsetDateTime::now_utc());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].question_id, "expired");
        assert_eq!(board.len(), 2);
    }

    #[test]
    fn reask_replaces() {
        let mut board = QuestionBoard::new();
        board.ask(question("q1", None));
        let mut updated = question("q1", None);
        updated.text = "updated".into();
        board.ask(updated);
        assert_eq!(board.len(), 1);
        assert_eq!(board.list()[0].text, "updated");
    }
}
