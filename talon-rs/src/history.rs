//! Command history.
//!
//! Each dispatched command's argument list is recorded (unless the caller
//! passed `no_history` or history is disabled) in a bounded ring buffer,
//! newest first.

use std::collections::VecDeque;

use crate::script::value::{merge_list, Value};

/// One recorded command.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Script level the command ran at.
    pub level: usize,
    /// Command as a well-formed list.
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct CommandHistory {
    /// Newest entry first.
    entries: VecDeque<HistoryEntry>,
    max_size: usize,
}

impl CommandHistory {
    pub fn new(max_size: usize) -> Self {
        Self { entries: VecDeque::new(), max_size: max_size.max(1) }
    }

    pub fn record(&mut self, level: usize, arguments: &[Value]) {
        let words: Vec<String> = arguments.iter().map(Value::to_string).collect();
        self.entries.push_front(HistoryEntry { level, command: merge_list(&words) });
        self.entries.truncate(self.max_size);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Change the capacity, dropping the oldest entries if needed.
    pub fn set_max_size(&mut self, n: usize) {
        self.max_size = n.max(1);
        self.entries.truncate(self.max_size);
    }

    /// Entries oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().rev()
    }

    /// The `n`th most recent entry (0 = newest).
    pub fn get(&self, n: usize) -> Option<&HistoryEntry> {
        self.entries.get(n)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(words: &[&str]) -> Vec<Value> {
        words.iter().map(|&w| Value::from(w)).collect()
    }

    #[test]
    fn records_newest_first_as_lists() {
        let mut h = CommandHistory::new(10);
        h.record(1, &args(&["set", "a", "x y"]));
        h.record(2, &args(&["puts", "hi"]));
        assert_eq!(h.get(0).unwrap().command, "puts hi");
        assert_eq!(h.get(1).unwrap().command, "set a {x y}");
        let oldest: Vec<_> = h.entries().map(|e| e.level).collect();
        assert_eq!(oldest, vec![1, 2]);
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut h = CommandHistory::new(2);
        for i in 0..5 {
            h.record(1, &[Value::from(i)]);
        }
        assert_eq!(h.len(), 2);
        assert_eq!(h.get(1).unwrap().command, "3");
        h.set_max_size(1);
        assert_eq!(h.len(), 1);
        assert_eq!(h.get(0).unwrap().command, "4");
    }
}
