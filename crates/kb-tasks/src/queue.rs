//! Bounded, priority-aware in-process admission queue. `kb-metadata`'s task
//! table remains the durable source of truth (spec §5); this structure is
//! only the ordering hint a [`crate::WorkerPool`] consults before calling
//! `claim_next_task`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use kb_core::TaskKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for QueuePriority {
    fn default() -> Self {
        QueuePriority::Normal
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task_id: Uuid,
    pub kind: TaskKind,
    pub priority: QueuePriority,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum QueueError {
    Full { max: usize },
    DuplicateId(Uuid),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full { max } => write!(f, "queue is full (max {max})"),
            QueueError::DuplicateId(id) => write!(f, "duplicate queue entry: {id}"),
        }
    }
}

impl std::error::Error for QueueError {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub max: usize,
    pub by_priority: BTreeMap<String, usize>,
}

/// `dequeue` returns the highest-priority entry first; among entries of
/// equal priority the oldest (FIFO) one is returned.
pub struct TaskQueue {
    entries: Vec<QueuedTask>,
    max_size: usize,
}

impl TaskQueue {
    pub fn new(max_size: usize) -> Self {
        TaskQueue {
            entries: Vec::new(),
            max_size,
        }
    }

    pub fn enqueue(&mut self, entry: QueuedTask) -> Result<(), QueueError> {
        if self.entries.len() >= self.max_size {
            return Err(QueueError::Full { max: self.max_size });
        }
        if self.entries.iter().any(|e| e.task_id == entry.task_id) {
            return Err(QueueError::DuplicateId(entry.task_id));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<QueuedTask> {
        if self.entries.is_empty() {
            return None;
        }
        let max_pri = self.entries.iter().map(|e| e.priority).max().unwrap();
        let idx = self.entries.iter().position(|e| e.priority == max_pri).unwrap();
        Some(self.entries.remove(idx))
    }

    pub fn peek(&self) -> Option<&QueuedTask> {
        let max_pri = self.entries.iter().map(|e| e.priority).max()?;
        self.entries.iter().find(|e| e.priority == max_pri)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    pub fn remove(&mut self, task_id: Uuid) -> Option<QueuedTask> {
        let pos = self.entries.iter().position(|e| e.task_id == task_id)?;
        Some(self.entries.remove(pos))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> QueueStats {
        let mut by_priority = BTreeMap::new();
        for entry in &self.entries {
            let key = match entry.priority {
                QueuePriority::Low => "low",
                QueuePriority::Normal => "normal",
                QueuePriority::High => "high",
                QueuePriority::Critical => "critical",
            };
            *by_priority.entry(key.to_string()).or_insert(0usize) += 1;
        }
        QueueStats {
            total: self.entries.len(),
            max: self.max_size,
            by_priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(priority: QueuePriority) -> QueuedTask {
        QueuedTask {
            task_id: Uuid::new_v4(),
            kind: TaskKind::IngestDocument,
            priority,
            queued_at: Utc::now(),
        }
    }

    #[test]
    fn dequeues_highest_priority_first() {
        let mut q = TaskQueue::new(10);
        let low = entry(QueuePriority::Low);
        let critical = entry(QueuePriority::Critical);
        q.enqueue(low.clone()).unwrap();
        q.enqueue(critical.clone()).unwrap();
        assert_eq!(q.dequeue().unwrap().task_id, critical.task_id);
        assert_eq!(q.dequeue().unwrap().task_id, low.task_id);
    }

    #[test]
    fn fifo_within_same_priority() {
        let mut q = TaskQueue::new(10);
        let first = entry(QueuePriority::Normal);
        let second = entry(QueuePriority::Normal);
        q.enqueue(first.clone()).unwrap();
        q.enqueue(second.clone()).unwrap();
        assert_eq!(q.dequeue().unwrap().task_id, first.task_id);
        assert_eq!(q.dequeue().unwrap().task_id, second.task_id);
    }

    #[test]
    fn rejects_past_capacity() {
        let mut q = TaskQueue::new(1);
        q.enqueue(entry(QueuePriority::Normal)).unwrap();
        let err = q.enqueue(entry(QueuePriority::Normal)).unwrap_err();
        assert!(matches!(err, QueueError::Full { max: 1 }));
    }

    #[test]
    fn rejects_duplicate_task_id() {
        let mut q = TaskQueue::new(10);
        let e = entry(QueuePriority::Normal);
        q.enqueue(e.clone()).unwrap();
        let err = q.enqueue(e).unwrap_err();
        assert!(matches!(err, QueueError::DuplicateId(_)));
    }
}
