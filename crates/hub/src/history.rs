//! Append-only event history, kept in SQLite. Small and synchronous; the
//! callers are not latency sensitive here.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};

use drover_core::{Event, EventReader, EventWriter, InstanceId};

pub trait HistoryStore: Send + Sync {
    fn append(&self, instance: &InstanceId, event: &Event) -> Result<()>;
    /// Events for the instance in timestamp order, ties broken by insertion;
    /// at most `limit` of the most recent when given.
    fn events_for(&self, instance: &InstanceId, limit: Option<usize>) -> Result<Vec<Event>>;
}

pub struct SqliteHistory {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteHistory {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("DROVER_DB_PATH").unwrap_or_else(|_| "drover.db".to_string());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS events (
                instance TEXT NOT NULL,
                started  INTEGER NOT NULL,
                body     BLOB NOT NULL
            )",
            [],
        )
        .context("creating events table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_instance_started ON events(instance, started DESC)",
            [],
        )
        .ok();
        let me = SqliteHistory { db: Mutex::new(db) };
        histogram!("history_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }
}

impl HistoryStore for SqliteHistory {
    fn append(&self, instance: &InstanceId, event: &Event) -> Result<()> {
        let body = serde_json::to_vec(event).context("serialising event")?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO events(instance, started, body) VALUES (?1, ?2, ?3)",
            (instance.as_str(), event.started_at.timestamp_millis(), &body),
        )?;
        counter!("history_append_total", 1u64);
        Ok(())
    }

    fn events_for(&self, instance: &InstanceId, limit: Option<usize>) -> Result<Vec<Event>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT body FROM events WHERE instance = ?1
             ORDER BY started DESC, rowid DESC LIMIT ?2",
        )?;
        let cap = limit.map(|l| l as i64).unwrap_or(-1);
        let mut rows = stmt.query((instance.as_str(), cap))?;
        let mut out: Vec<Event> = Vec::new();
        while let Some(row) = rows.next()? {
            let body: Vec<u8> = row.get(0)?;
            out.push(serde_json::from_slice(&body).context("parsing stored event")?);
        }
        // Read newest-first for the limit, returned oldest-first.
        out.reverse();
        Ok(out)
    }
}

/// One instance's view of the history, implementing the event seams.
#[derive(Clone)]
pub struct EventReadWriter {
    instance: InstanceId,
    store: Arc<dyn HistoryStore>,
}

impl EventReadWriter {
    pub fn new(instance: InstanceId, store: Arc<dyn HistoryStore>) -> Self {
        EventReadWriter { instance, store }
    }
}

#[async_trait]
impl EventWriter for EventReadWriter {
    async fn log_event(&self, event: Event) -> Result<()> {
        self.store.append(&self.instance, &event)
    }
}

#[async_trait]
impl EventReader for EventReadWriter {
    async fn events(&self, limit: Option<usize>) -> Result<Vec<Event>> {
        self.store.events_for(&self.instance, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use drover_core::{EventKind, LogLevel};

    fn event_at(secs: i64) -> Event {
        Event {
            service_ids: vec!["a/x".parse().unwrap()],
            kind: EventKind::Release,
            started_at: Utc.timestamp_opt(secs, 0).unwrap(),
            ended_at: Utc.timestamp_opt(secs + 1, 0).unwrap(),
            log_level: LogLevel::Info,
            metadata: None,
        }
    }

    fn temp_db() -> String {
        let dir = tempfile::tempdir().unwrap();
        // Keep the directory alive for the duration of the test process.
        let path = dir.path().join("history.db").to_string_lossy().to_string();
        std::mem::forget(dir);
        path
    }

    #[test]
    fn events_come_back_in_timestamp_order_per_instance() {
        let store = SqliteHistory::open(&temp_db()).unwrap();
        let inst = "tenant-1".to_string();
        store.append(&inst, &event_at(30)).unwrap();
        store.append(&inst, &event_at(10)).unwrap();
        store.append(&inst, &event_at(20)).unwrap();
        store.append(&"tenant-2".to_string(), &event_at(5)).unwrap();

        let events = store.events_for(&inst, None).unwrap();
        let starts: Vec<i64> = events.iter().map(|e| e.started_at.timestamp()).collect();
        assert_eq!(starts, vec![10, 20, 30]);
    }

    #[test]
    fn limit_keeps_the_most_recent() {
        let store = SqliteHistory::open(&temp_db()).unwrap();
        let inst = "tenant-1".to_string();
        for secs in [10, 20, 30] {
            store.append(&inst, &event_at(secs)).unwrap();
        }
        let events = store.events_for(&inst, Some(2)).unwrap();
        let starts: Vec<i64> = events.iter().map(|e| e.started_at.timestamp()).collect();
        assert_eq!(starts, vec![20, 30]);
    }

    #[test]
    fn timestamp_ties_break_by_insertion() {
        let store = SqliteHistory::open(&temp_db()).unwrap();
        let inst = "tenant-1".to_string();
        let mut first = event_at(10);
        first.service_ids = vec!["a/first".parse().unwrap()];
        let mut second = event_at(10);
        second.service_ids = vec!["a/second".parse().unwrap()];
        store.append(&inst, &first).unwrap();
        store.append(&inst, &second).unwrap();

        let events = store.events_for(&inst, None).unwrap();
        assert_eq!(events[0].service_ids[0].to_string(), "a/first");
        assert_eq!(events[1].service_ids[0].to_string(), "a/second");
    }
}
