//! Client-side reconciliation for optimistic sends, plus the reconnect
//! backoff controller.
//!
//! Every outgoing send carries a client-generated `local_id`. The server
//! echoes it back, only to the originating connection, on the matching
//! `message-created` broadcast. Matching is strict `local_id` equality —
//! never content or timestamp heuristics, since identical content can be
//! sent twice legitimately.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use rand::distr::Alphanumeric;

/// State of one optimistic send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendState {
    /// Rendered locally, not yet acknowledged by the server
    Pending,
    /// Replaced by the server-confirmed message with this id
    Confirmed(i64),
    /// The server returned a scoped error for this send
    Failed,
}

#[derive(Debug, Clone)]
struct PendingSend {
    room_id: i64,
    content: String,
    state: SendState,
}

/// Tracks in-flight optimistic sends keyed by `local_id`.
#[derive(Debug, Default)]
pub struct Outbox {
    sends: HashMap<String, PendingSend>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new optimistic send and return its `local_id`.
    /// A local_id is never reused while a send with that id is tracked.
    pub fn begin_send(&mut self, room_id: i64, content: &str) -> String {
        let local_id = loop {
            let candidate = new_local_id();
            if !self.sends.contains_key(&candidate) {
                break candidate;
            }
        };
        self.sends.insert(
            local_id.clone(),
            PendingSend {
                room_id,
                content: content.to_string(),
                state: SendState::Pending,
            },
        );
        local_id
    }

    /// The server broadcast arrived with a matching local_id: the pending
    /// entry becomes confirmed, preserving its list position client-side.
    /// Returns false for unknown or already-resolved ids.
    pub fn confirm(&mut self, local_id: &str, server_id: i64) -> bool {
        match self.sends.get_mut(local_id) {
            Some(send) if send.state == SendState::Pending => {
                send.state = SendState::Confirmed(server_id);
                true
            }
            _ => false,
        }
    }

    /// A scoped error arrived for this send; the optimistic entry is
    /// removed from the UI but kept here as Failed for "tap to retry".
    pub fn fail(&mut self, local_id: &str) -> bool {
        match self.sends.get_mut(local_id) {
            Some(send) if send.state == SendState::Pending => {
                send.state = SendState::Failed;
                true
            }
            _ => false,
        }
    }

    /// Re-issue a failed send under a fresh local_id. Returns None if the
    /// id is unknown or not in the Failed state.
    pub fn retry(&mut self, local_id: &str) -> Option<String> {
        let send = self.sends.get(local_id)?;
        if send.state != SendState::Failed {
            return None;
        }
        let (room_id, content) = (send.room_id, send.content.clone());
        self.sends.remove(local_id);
        Some(self.begin_send(room_id, &content))
    }

    pub fn state(&self, local_id: &str) -> Option<&SendState> {
        self.sends.get(local_id).map(|s| &s.state)
    }

    pub fn pending_count(&self) -> usize {
        self.sends
            .values()
            .filter(|s| s.state == SendState::Pending)
            .count()
    }
}

fn new_local_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Bounded exponential backoff for gateway reconnection.
///
/// Presence flips offline while the socket is down, so clients retry with
/// doubling delays up to `max_delay`, giving up after `max_attempts`.
#[derive(Debug)]
pub struct ReconnectBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or None once the terminal error
    /// state is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self
            .base_delay
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.max_delay);
        self.attempt += 1;
        Some(delay)
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// A successful connection resets the schedule.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_matches_by_local_id_not_content() {
        let mut outbox = Outbox::new();
        // Identical content sent twice is legitimate; ids must differ.
        let a = outbox.begin_send(1, "hello");
        let b = outbox.begin_send(1, "hello");
        assert_ne!(a, b);

        assert!(outbox.confirm(&a, 100));
        assert_eq!(outbox.state(&a), Some(&SendState::Confirmed(100)));
        assert_eq!(outbox.state(&b), Some(&SendState::Pending));
    }

    #[test]
    fn confirm_unknown_or_resolved_is_rejected() {
        let mut outbox = Outbox::new();
        assert!(!outbox.confirm("nope", 1));

        let id = outbox.begin_send(1, "x");
        assert!(outbox.confirm(&id, 5));
        // Second confirmation of the same send must not succeed
        assert!(!outbox.confirm(&id, 6));
        assert!(!outbox.fail(&id));
    }

    #[test]
    fn failed_send_can_be_retried_with_fresh_id() {
        let mut outbox = Outbox::new();
        let id = outbox.begin_send(2, "retry me");
        assert!(outbox.fail(&id));
        assert_eq!(outbox.state(&id), Some(&SendState::Failed));

        let fresh = outbox.retry(&id).unwrap();
        assert_ne!(fresh, id);
        assert_eq!(outbox.state(&fresh), Some(&SendState::Pending));
        assert!(outbox.state(&id).is_none());

        // Pending sends cannot be retried
        assert!(outbox.retry(&fresh).is_none());
    }

    #[test]
    fn backoff_doubles_and_terminates() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(100), Duration::from_secs(5), 4);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(800)));
        assert_eq!(backoff.next_delay(), None);
        assert!(backoff.exhausted());

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(3), 10);
        backoff.next_delay(); // 1s
        backoff.next_delay(); // 2s
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(3)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(3)));
    }
}
