//! In-memory journal of recent job events, served by the admin logs view.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::{TracingWorkerReporter, WorkerEvent, WorkerReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub source_id: Option<String>,
    pub job_id: Option<Uuid>,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Minimum level included.
    pub level: Option<LogLevel>,
    pub source_id: Option<String>,
    pub limit: usize,
}

/// Bounded ring buffer; the oldest entries are dropped first.
#[derive(Debug)]
pub struct JobJournal {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl JobJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    pub fn record(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Matching entries, newest first.
    pub fn query(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        entries
            .iter()
            .rev()
            .filter(|e| filter.level.is_none_or(|min| e.level >= min))
            .filter(|e| {
                filter
                    .source_id
                    .as_deref()
                    .is_none_or(|s| e.source_id.as_deref() == Some(s))
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobJournal {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Converts a worker event into a journal entry. Polling is not journaled.
fn entry_for(event: &WorkerEvent<'_>) -> Option<LogEntry> {
    let at = Utc::now();
    let entry = |level, source: Option<&str>, job_id, message: String| LogEntry {
        at,
        level,
        source_id: source.map(str::to_string),
        job_id,
        message,
    };
    Some(match event {
        WorkerEvent::Started { worker_id } => {
            entry(LogLevel::Info, None, None, format!("worker {worker_id} started"))
        }
        WorkerEvent::Polling => return None,
        WorkerEvent::JobEnqueued { job } => entry(
            LogLevel::Info,
            Some(job.source_id.as_str()),
            Some(job.id),
            format!("{} job enqueued (attempt {})", job.trigger, job.attempt),
        ),
        WorkerEvent::JobStarted { job } => entry(
            LogLevel::Info,
            Some(job.source_id.as_str()),
            Some(job.id),
            format!("job started (attempt {}/{})", job.attempt, job.max_attempts),
        ),
        WorkerEvent::JobCompleted { job, summary } => entry(
            LogLevel::Info,
            Some(job.source_id.as_str()),
            Some(job.id),
            format!(
                "job succeeded: {} observations, {} rows skipped",
                summary.observations, summary.skipped_rows
            ),
        ),
        WorkerEvent::JobFailed {
            job,
            error,
            code,
            will_retry,
        } => entry(
            LogLevel::Error,
            Some(job.source_id.as_str()),
            Some(job.id),
            format!(
                "job failed [{code}]: {error}{}",
                if *will_retry { " (retry scheduled)" } else { "" }
            ),
        ),
        WorkerEvent::JobShortCircuited {
            job,
            retry_after_secs,
        } => entry(
            LogLevel::Warn,
            Some(job.source_id.as_str()),
            Some(job.id),
            format!("circuit open, job failed without running (retry after {retry_after_secs}s)"),
        ),
        WorkerEvent::JobCancelled { job } => entry(
            LogLevel::Warn,
            Some(job.source_id.as_str()),
            Some(job.id),
            "job cancelled, results discarded".to_string(),
        ),
        WorkerEvent::BreakerChanged { source_id, state } => entry(
            LogLevel::Warn,
            Some(*source_id),
            None,
            format!("circuit breaker now {state}"),
        ),
        WorkerEvent::ShuttingDown { worker_id } => {
            entry(LogLevel::Info, None, None, format!("worker {worker_id} shutting down"))
        }
        WorkerEvent::Stopped { worker_id } => {
            entry(LogLevel::Info, None, None, format!("worker {worker_id} stopped"))
        }
    })
}

/// Reporter that journals events and forwards them to an inner reporter.
#[derive(Debug, Clone)]
pub struct JournalReporter<R = TracingWorkerReporter> {
    journal: Arc<JobJournal>,
    inner: R,
}

impl<R: WorkerReporter> JournalReporter<R> {
    pub fn new(journal: Arc<JobJournal>, inner: R) -> Self {
        Self { journal, inner }
    }

    pub fn journal(&self) -> &Arc<JobJournal> {
        &self.journal
    }
}

impl<R: WorkerReporter> WorkerReporter for JournalReporter<R> {
    fn report(&self, event: WorkerEvent<'_>) {
        if let Some(entry) = entry_for(&event) {
            self.journal.record(entry);
        }
        self.inner.report(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: LogLevel, source: &str, message: &str) -> LogEntry {
        LogEntry {
            at: Utc::now(),
            level,
            source_id: Some(source.into()),
            job_id: None,
            message: message.into(),
        }
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let journal = JobJournal::new(2);
        journal.record(entry(LogLevel::Info, "a", "one"));
        journal.record(entry(LogLevel::Info, "a", "two"));
        journal.record(entry(LogLevel::Info, "a", "three"));

        let all = journal.query(&LogFilter::default());
        assert_eq!(journal.len(), 2);
        assert_eq!(all[0].message, "three");
        assert_eq!(all[1].message, "two");
    }

    #[test]
    fn test_query_filters_level_and_source() {
        let journal = JobJournal::default();
        journal.record(entry(LogLevel::Info, "hal", "ok"));
        journal.record(entry(LogLevel::Error, "hal", "boom"));
        journal.record(entry(LogLevel::Error, "tzob", "down"));

        let errors = journal.query(&LogFilter {
            level: Some(LogLevel::Warn),
            source_id: Some("hal".into()),
            limit: 10,
        });
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "boom");
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Error > LogLevel::Info);
    }
}
