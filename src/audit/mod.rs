//! Append-only audit trail for load and execution activity.
//!
//! Events are immutable once appended. The in-memory log is a bounded ring
//! with a per-subject index for cheap history lookups; an optional sink
//! receives every event for durability. Per subject, timestamps never go
//! backwards: an append that would regress is clamped to the subject's
//! previous stamp, so audit history always reads in causal order.

mod sink;

pub use sink::{AuditError, AuditSink, JsonlSink};

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Load,
    Execution,
    SecurityViolation,
    CacheHit,
    CacheMiss,
    ResourceUsage,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Load => "load",
            AuditEventType::Execution => "execution",
            AuditEventType::SecurityViolation => "security_violation",
            AuditEventType::CacheHit => "cache_hit",
            AuditEventType::CacheMiss => "cache_miss",
            AuditEventType::ResourceUsage => "resource_usage",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    High,
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// Strategy identifier the event is about.
    pub subject: String,
    pub severity: AuditSeverity,
    /// Free-form structured detail; shape varies by event type.
    pub payload: Value,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        subject: impl Into<String>,
        severity: AuditSeverity,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            subject: subject.into(),
            severity,
            payload,
        }
    }
}

/// Filter for [`AuditLog::query`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub event_type: Option<AuditEventType>,
    pub subject: Option<String>,
    pub min_severity: Option<AuditSeverity>,
    /// Result-count ceiling; unlimited when absent.
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: AuditEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn min_severity(mut self, severity: AuditSeverity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(event_type) = self.event_type {
            if event.event_type != event_type {
                return false;
            }
        }
        if let Some(subject) = &self.subject {
            if &event.subject != subject {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if event.severity < min {
                return false;
            }
        }
        true
    }
}

/// Aggregates over the retained window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditSummary {
    pub total: usize,
    pub by_type: BTreeMap<String, u64>,
    /// Load/execution/security events at Info severity.
    pub passed: u64,
    /// Load/execution/security events above Info severity.
    pub failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Counters that survive ring eviction.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AuditLogStats {
    pub appended: u64,
    pub retained: usize,
    pub subjects: usize,
    pub sink_failures: u64,
}

const PER_SUBJECT_CAPACITY: usize = 128;

/// Bounded in-memory audit log with optional durable sink.
pub struct AuditLog {
    ring: Mutex<VecDeque<AuditEvent>>,
    by_subject: DashMap<String, VecDeque<AuditEvent>>,
    last_stamp: DashMap<String, DateTime<Utc>>,
    capacity: usize,
    sink: Option<Box<dyn AuditSink>>,
    appended: AtomicU64,
    sink_failures: AtomicU64,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::new()),
            by_subject: DashMap::new(),
            last_stamp: DashMap::new(),
            capacity: capacity.max(1),
            sink: None,
            appended: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Append one event. The ring lock is the total-order point; per
    /// subject, the timestamp is clamped so it never precedes the
    /// subject's previous event.
    pub fn append(&self, mut event: AuditEvent) {
        counter!("strategy_loader_audit_events", 1, "type" => event.event_type.as_str());
        {
            let mut ring = self.ring.lock();
            if let Some(prev) = self.last_stamp.get(&event.subject) {
                if event.timestamp < *prev {
                    event.timestamp = *prev;
                }
            }
            self.last_stamp
                .insert(event.subject.clone(), event.timestamp);

            if ring.len() >= self.capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());

            let mut history = self.by_subject.entry(event.subject.clone()).or_default();
            if history.len() >= PER_SUBJECT_CAPACITY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        self.appended.fetch_add(1, Ordering::Relaxed);

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append(&event) {
                self.sink_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    subject = %event.subject,
                    event_type = %event.event_type,
                    error = %e,
                    "audit sink append failed; event retained in memory only"
                );
            }
        }
    }

    /// Convenience constructor plus append.
    pub fn record(
        &self,
        event_type: AuditEventType,
        subject: impl Into<String>,
        severity: AuditSeverity,
        payload: Value,
    ) {
        self.append(AuditEvent::new(event_type, subject, severity, payload));
    }

    /// Events matching the filter, oldest first.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let ring = self.ring.lock();
        let matching = ring.iter().filter(|e| query.matches(e));
        match query.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }

    /// Retained history for one subject, oldest first.
    pub fn for_subject(&self, subject: &str) -> Vec<AuditEvent> {
        self.by_subject
            .get(subject)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Aggregate the retained window, optionally for one subject.
    pub fn summarize(&self, subject: Option<&str>) -> AuditSummary {
        let ring = self.ring.lock();
        let mut summary = AuditSummary::default();
        for event in ring.iter() {
            if let Some(subject) = subject {
                if event.subject != subject {
                    continue;
                }
            }
            summary.total += 1;
            *summary
                .by_type
                .entry(event.event_type.as_str().to_string())
                .or_default() += 1;
            match event.event_type {
                AuditEventType::CacheHit => summary.cache_hits += 1,
                AuditEventType::CacheMiss => summary.cache_misses += 1,
                AuditEventType::Load
                | AuditEventType::Execution
                | AuditEventType::SecurityViolation => {
                    if event.severity == AuditSeverity::Info {
                        summary.passed += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
                AuditEventType::ResourceUsage => {}
            }
        }
        summary
    }

    /// Drop one subject's retained events, history, and ordering stamp.
    pub fn clear_subject(&self, subject: &str) {
        let mut ring = self.ring.lock();
        ring.retain(|event| event.subject != subject);
        self.by_subject.remove(subject);
        self.last_stamp.remove(subject);
    }

    /// Drop everything retained in memory. Cumulative counters survive.
    pub fn clear_all(&self) {
        let mut ring = self.ring.lock();
        ring.clear();
        self.by_subject.clear();
        self.last_stamp.clear();
    }

    pub fn stats(&self) -> AuditLogStats {
        AuditLogStats {
            appended: self.appended.load(Ordering::Relaxed),
            retained: self.ring.lock().len(),
            subjects: self.by_subject.len(),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }
}
