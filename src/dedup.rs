//! Announcement dedup - "have I reported this recently in this channel?"
//!
//! One time-windowed queue per (channel, entity kind). Queues are created on
//! first use with the cooldown the channel has at that moment; the window of
//! an existing queue does not follow later configuration changes.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// What a dedup entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Bug,
    Attachment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Bug => "bug",
            EntityKind::Attachment => "attachment",
        }
    }
}

/// Ids seen within a fixed window.
#[derive(Debug)]
pub struct TimeoutQueue {
    window: Duration,
    seen: HashMap<String, Instant>,
}

impl TimeoutQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn window(&self) -> Duration {
        self.window
    }

    /// Whether `id` was inserted no more than `window` before `now`.
    pub fn contains_at(&mut self, id: &str, now: Instant) -> bool {
        self.expire(now);
        self.seen.contains_key(id)
    }

    pub fn insert_at(&mut self, id: &str, now: Instant) {
        self.seen.insert(id.to_string(), now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }

    fn expire(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, inserted| now.saturating_duration_since(*inserted) <= window);
    }
}

/// Per-channel dedup queues, owned by the notification engine.
#[derive(Debug, Default)]
pub struct DedupRegistry {
    queues: HashMap<(String, EntityKind), TimeoutQueue>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-and-set: true if `id` has not been reported in `channel` within
    /// the cooldown, in which case it is recorded as reported now.
    pub fn should_report(
        &mut self,
        channel: &str,
        kind: EntityKind,
        id: &str,
        cooldown: Duration,
    ) -> bool {
        self.should_report_at(channel, kind, id, cooldown, Instant::now())
    }

    /// [`Self::should_report`] with an explicit clock, for tests.
    pub fn should_report_at(
        &mut self,
        channel: &str,
        kind: EntityKind,
        id: &str,
        cooldown: Duration,
        now: Instant,
    ) -> bool {
        let queue = self
            .queues
            .entry((channel.to_lowercase(), kind))
            .or_insert_with(|| TimeoutQueue::new(cooldown));

        if queue.contains_at(id, now) {
            debug!(
                channel = %channel,
                kind = kind.as_str(),
                id = %id,
                "Already reported within cooldown"
            );
            return false;
        }
        queue.insert_at(id, now);
        true
    }

    #[cfg(test)]
    fn window(&self, channel: &str, kind: EntityKind) -> Option<Duration> {
        self.queues
            .get(&(channel.to_lowercase(), kind))
            .map(TimeoutQueue::window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(300);

    #[test]
    fn test_second_check_within_window_is_suppressed() {
        let mut dedup = DedupRegistry::new();
        let start = Instant::now();

        assert!(dedup.should_report_at("#dev", EntityKind::Bug, "42", COOLDOWN, start));
        assert!(!dedup.should_report_at("#dev", EntityKind::Bug, "42", COOLDOWN, start));
        // exactly one cooldown later it still counts as recent
        assert!(!dedup.should_report_at("#dev", EntityKind::Bug, "42", COOLDOWN, start + COOLDOWN));
        assert!(dedup.should_report_at(
            "#dev",
            EntityKind::Bug,
            "42",
            COOLDOWN,
            start + COOLDOWN + Duration::from_millis(1)
        ));
    }

    #[test]
    fn test_channels_and_kinds_are_independent() {
        let mut dedup = DedupRegistry::new();
        let now = Instant::now();

        assert!(dedup.should_report_at("#dev", EntityKind::Bug, "1", COOLDOWN, now));
        assert!(dedup.should_report_at("#qa", EntityKind::Bug, "1", COOLDOWN, now));
        assert!(dedup.should_report_at("#dev", EntityKind::Attachment, "1", COOLDOWN, now));
        assert!(!dedup.should_report_at("#DEV", EntityKind::Bug, "1", COOLDOWN, now));
    }

    #[test]
    fn test_window_fixed_at_queue_creation() {
        let mut dedup = DedupRegistry::new();
        let now = Instant::now();

        dedup.should_report_at("#dev", EntityKind::Bug, "1", Duration::from_secs(10), now);
        // a later, longer cooldown does not stretch the existing queue
        assert!(dedup.should_report_at(
            "#dev",
            EntityKind::Bug,
            "1",
            Duration::from_secs(600),
            now + Duration::from_secs(11)
        ));
        assert_eq!(
            dedup.window("#dev", EntityKind::Bug),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let mut queue = TimeoutQueue::new(Duration::from_millis(50));
        let now = Instant::now();
        queue.insert_at("a", now);
        queue.insert_at("b", now);
        assert_eq!(queue.len(), 2);

        assert!(!queue.contains_at("a", now + Duration::from_millis(60)));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_wall_clock_window_expiry() {
        let mut dedup = DedupRegistry::new();
        let window = Duration::from_millis(100);

        assert!(dedup.should_report("#dev", EntityKind::Bug, "9", window));
        assert!(!dedup.should_report("#dev", EntityKind::Bug, "9", window));
        std::thread::sleep(Duration::from_millis(150));
        assert!(dedup.should_report("#dev", EntityKind::Bug, "9", window));
    }
}
