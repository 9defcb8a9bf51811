//! Per-handler counters and their aggregated snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by one message handler (one per worker)
#[derive(Debug, Default)]
pub struct HandlerStats {
    total_processed: AtomicU64,
    total_failed: AtomicU64,
    total_retries: AtomicU64,
    total_normal_received: AtomicU64,
    total_priority_received: AtomicU64,
    last_processed: Mutex<Option<DateTime<Utc>>>,
}

impl HandlerStats {
    pub fn record_received(&self, priority: bool) {
        if priority {
            self.total_priority_received.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_normal_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_processed(&self) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_failed(&self) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_retry(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_processed(&self) -> Option<DateTime<Utc>> {
        self.last_processed.lock().ok().and_then(|last| *last)
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_processed.lock() {
            *last = Some(Utc::now());
        }
    }

    pub fn snapshot(&self, name: &str) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            name: name.to_string(),
            total_messages_processed: self.total_processed.load(Ordering::Relaxed),
            total_messages_failed: self.total_failed.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            total_normal_messages_received: self.total_normal_received.load(Ordering::Relaxed),
            total_priority_messages_received: self
                .total_priority_received
                .load(Ordering::Relaxed),
            total_notifications: 0,
            last_message_processed: self.last_processed(),
        }
    }
}

/// Point-in-time copy of [`HandlerStats`], summable across workers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HandlerStatsSnapshot {
    pub name: String,
    pub total_messages_processed: u64,
    pub total_messages_failed: u64,
    pub total_retries: u64,
    pub total_normal_messages_received: u64,
    pub total_priority_messages_received: u64,
    /// Wake-up notifications delivered to the worker
    pub total_notifications: u64,
    pub last_message_processed: Option<DateTime<Utc>>,
}

impl HandlerStatsSnapshot {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Accumulate another snapshot, keeping the latest processed timestamp
    pub fn add(&mut self, other: &HandlerStatsSnapshot) {
        self.total_messages_processed += other.total_messages_processed;
        self.total_messages_failed += other.total_messages_failed;
        self.total_retries += other.total_retries;
        self.total_normal_messages_received += other.total_normal_messages_received;
        self.total_priority_messages_received += other.total_priority_messages_received;
        self.total_notifications += other.total_notifications;
        self.last_message_processed = match (self.last_message_processed, other.last_message_processed) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

impl fmt::Display for HandlerStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "STATS for {}:", self.name)?;
        writeln!(f)?;
        writeln!(f, "  TotalNormalMessagesReceived:    {}", self.total_normal_messages_received)?;
        writeln!(f, "  TotalPriorityMessagesReceived:  {}", self.total_priority_messages_received)?;
        writeln!(f, "  TotalProcessed:                 {}", self.total_messages_processed)?;
        writeln!(f, "  TotalRetries:                   {}", self.total_retries)?;
        writeln!(f, "  TotalFailed:                    {}", self.total_messages_failed)?;
        writeln!(f, "  TotalNotifications:             {}", self.total_notifications)?;
        match self.last_message_processed {
            Some(at) => writeln!(f, "  LastMessageProcessed:           {}", at.to_rfc3339()),
            None => writeln!(f, "  LastMessageProcessed:           never"),
        }
    }
}
