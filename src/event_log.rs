//! Bounded in-memory event log
//!
//! Keeps the most recent service and API events for the `/events` endpoint.
//! Component events are also written through the `log` facade.

use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use strum_macros::{AsRefStr, Display};

use crate::common_utils::{generate_event_id, get_current_timestamp_ms};

pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventCategory {
    Service,
    Api,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEntry {
    pub id: String,
    pub timestamp: i64,
    pub category: EventCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<EventLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

pub struct EventLog {
    entries: Mutex<VecDeque<EventEntry>>,
    max_entries: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LOG_CAPACITY)
    }
}

impl EventLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_entries.min(1024))),
            max_entries: max_entries.max(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<EventEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, entry: EventEntry) -> EventEntry {
        let mut entries = self.entries();
        entries.push_back(entry.clone());
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
        entry
    }

    /// Record a service event and log it at the matching level
    pub fn component(
        &self,
        component: &str,
        level: EventLevel,
        message: impl Into<String>,
        metadata: Option<Value>,
    ) -> EventEntry {
        let message = message.into();
        match level {
            EventLevel::Info => log::info!("[{}] {}", component, message),
            EventLevel::Warn => log::warn!("[{}] {}", component, message),
            EventLevel::Error => log::error!("[{}] {}", component, message),
        }
        self.record(EventEntry {
            id: generate_event_id(),
            timestamp: get_current_timestamp_ms(),
            category: EventCategory::Service,
            component: Some(component.to_string()),
            level: Some(level),
            method: None,
            path: None,
            status: None,
            message,
            metadata,
        })
    }

    /// Record an API request outcome
    pub fn api(
        &self,
        method: &str,
        path: &str,
        status: u16,
        message: impl Into<String>,
        metadata: Option<Value>,
    ) -> EventEntry {
        self.record(EventEntry {
            id: generate_event_id(),
            timestamp: get_current_timestamp_ms(),
            category: EventCategory::Api,
            component: None,
            level: None,
            method: Some(method.to_string()),
            path: Some(path.to_string()),
            status: Some(status),
            message: message.into(),
            metadata,
        })
    }

    /// All retained entries, oldest first
    pub fn all(&self) -> Vec<EventEntry> {
        self.entries().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}
