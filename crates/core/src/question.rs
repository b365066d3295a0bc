//! Pending questions: the runner asks, a client or channel answers.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A question the agent is waiting on. Lifecycle: asked, then answered or
/// expired; either way it leaves the pending list and a status event
/// announces the transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuestion {
    #[serde(rename = "questionId")]
    pub question_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option",
        rename = "expiresAt"
    )]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelType")]
    pub channel_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelId")]
    pub channel_id: Option<String>,
}

impl PendingQuestion {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let now = OffsetDateTime::now_utc();
        let q = PendingQuestion {
            question_id: "q1".into(),
            text: "continue?".into(),
            options: None,
            expires_at: Some(now),
            channel_type: None,
            channel_id: None,
        };
        assert!(q.is_expired(now));
        assert!(!q.is_expired(now - Duration::seconds(1)));
    }

    #[test]
    fn questions_without_deadline_never_expire() {
        let q = PendingQuestion {
            question_id: "q1".into(),
            text: "pick one".into(),
            options: Some(vec!["a".into(), "b".into()]),
            expires_at: None,
            channel_type: None,
            channel_id: None,
        };
        assert!(!q.is_expired(OffsetDateTime::now_utc() + Duration::days(365)));
    }
}
