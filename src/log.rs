//! Append-only event log — the audit record behind the debug timeline.
//!
//! `local_seq` is assigned strictly by arrival order at this consumer,
//! independent of the producer's timestamps. The log keeps the full
//! history for the subscription's lifetime; windowed rendering is the
//! UI's business.

use crate::event::StreamEvent;

/// One logged envelope, tagged with its arrival sequence number.
#[derive(Debug, Clone)]
pub struct LoggedEvent {
    pub local_seq: u64,
    pub event: StreamEvent,
}

#[derive(Debug, Default)]
pub struct EventLog {
    entries: Vec<LoggedEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event and return its assigned sequence number.
    pub fn append(&mut self, event: StreamEvent) -> u64 {
        let local_seq = self.entries.len() as u64;
        self.entries.push(LoggedEvent { local_seq, event });
        local_seq
    }

    pub fn entries(&self) -> &[LoggedEvent] {
        &self.entries
    }

    /// The most recent `n` entries, for windowed rendering.
    pub fn tail(&self, n: usize) -> &[LoggedEvent] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StreamEvent;

    #[test]
    fn seq_follows_arrival_order_not_timestamps() {
        let mut log = EventLog::new();
        let mut late = StreamEvent::agent_start("A");
        let mut early = StreamEvent::agent_complete("A");
        late.timestamp = chrono::DateTime::from_timestamp_millis(2_000).unwrap();
        early.timestamp = chrono::DateTime::from_timestamp_millis(1_000).unwrap();

        assert_eq!(log.append(late), 0);
        assert_eq!(log.append(early), 1);
        assert_eq!(log.entries()[0].local_seq, 0);
        assert_eq!(log.entries()[1].local_seq, 1);
        // Arrival order wins even though timestamps disagree
        assert!(log.entries()[0].event.timestamp > log.entries()[1].event.timestamp);
    }

    #[test]
    fn duplicates_are_kept() {
        let mut log = EventLog::new();
        log.append(StreamEvent::agent_complete("A"));
        log.append(StreamEvent::agent_complete("A"));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn tail_windows_the_end() {
        let mut log = EventLog::new();
        for name in ["A", "B", "C", "D"] {
            log.append(StreamEvent::agent_start(name));
        }
        let tail = log.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].local_seq, 2);
        assert_eq!(tail[1].local_seq, 3);
        // Oversized window returns everything
        assert_eq!(log.tail(100).len(), 4);
    }
}
