//! Sequenced toast queue: at most one toast is visible at a time.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Toast {
    pub id: u64,
    pub message: String,
    pub severity: ToastSeverity,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ToastQueue {
    visible: Option<Toast>,
    /// When the visible toast was promoted, for expiry.
    shown_at: Option<DateTime<Utc>>,
    pending: VecDeque<Toast>,
    ttl: Duration,
    next_id: u64,
}

impl Default for ToastQueue {
    fn default() -> Self {
        ToastQueue::new(Duration::seconds(4))
    }
}

impl ToastQueue {
    pub fn new(ttl: Duration) -> Self {
        ToastQueue {
            visible: None,
            shown_at: None,
            pending: VecDeque::new(),
            ttl,
            next_id: 1,
        }
    }

    /// Enqueue a toast; it becomes visible immediately if nothing is shown.
    pub fn push(
        &mut self,
        message: impl Into<String>,
        severity: ToastSeverity,
        now: DateTime<Utc>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let toast = Toast {
            id,
            message: message.into(),
            severity,
            created_at: now,
        };
        if self.visible.is_none() {
            self.visible = Some(toast);
            self.shown_at = Some(now);
        } else {
            self.pending.push_back(toast);
        }
        id
    }

    pub fn current(&self) -> Option<&Toast> {
        self.visible.as_ref()
    }

    /// Dismiss the visible toast and promote the next one.
    pub fn dismiss(&mut self, now: DateTime<Utc>) {
        self.visible = self.pending.pop_front();
        self.shown_at = self.visible.is_some().then_some(now);
    }

    /// Advance the queue: expire the visible toast once its TTL elapses.
    /// Called from the UI tick loop.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        if let Some(shown_at) = self.shown_at
            && now - shown_at >= self.ttl
        {
            self.dismiss(now);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn first_toast_is_visible_immediately() {
        let mut q = ToastQueue::default();
        q.push("saved", ToastSeverity::Success, t0());
        assert_eq!(q.current().unwrap().message, "saved");
        assert_eq!(q.pending_len(), 0);
    }

    #[test]
    fn later_toasts_queue_behind_the_visible_one() {
        let mut q = ToastQueue::default();
        q.push("one", ToastSeverity::Info, t0());
        q.push("two", ToastSeverity::Info, t0());
        assert_eq!(q.current().unwrap().message, "one");
        assert_eq!(q.pending_len(), 1);

        q.dismiss(t0());
        assert_eq!(q.current().unwrap().message, "two");
        q.dismiss(t0());
        assert!(q.current().is_none());
    }

    #[test]
    fn advance_expires_by_ttl() {
        let mut q = ToastQueue::new(Duration::seconds(4));
        q.push("one", ToastSeverity::Info, t0());
        q.push("two", ToastSeverity::Warning, t0());

        q.advance(t0() + Duration::seconds(3));
        assert_eq!(q.current().unwrap().message, "one");

        q.advance(t0() + Duration::seconds(4));
        assert_eq!(q.current().unwrap().message, "two");
    }

    #[test]
    fn expiry_clock_restarts_per_toast() {
        let mut q = ToastQueue::new(Duration::seconds(4));
        q.push("one", ToastSeverity::Info, t0());
        q.push("two", ToastSeverity::Info, t0());
        q.advance(t0() + Duration::seconds(5));
        // "two" was promoted at t+5 and must get its own full window.
        q.advance(t0() + Duration::seconds(8));
        assert_eq!(q.current().unwrap().message, "two");
        q.advance(t0() + Duration::seconds(9));
        assert!(q.current().is_none());
    }
}
