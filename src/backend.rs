//! Хранилище строк с realtime-уведомлениями.
//!
//! Приложение работает с внешним backend-as-a-service; здесь описан только
//! узкий контракт, который нужен для сигналинга, и его реализация в памяти.

use crate::error::BackendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Нетипизированная строка таблицы
pub type Row = Map<String, Value>;

/// Подписка на изменения одной строки. Отписка происходит при drop.
pub struct RowSubscription {
    updates: mpsc::UnboundedReceiver<Row>,
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl RowSubscription {
    pub fn new(
        updates: mpsc::UnboundedReceiver<Row>,
        unsubscribe: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            updates,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Следующее обновление строки; None когда подписка закрыта
    pub async fn recv(&mut self) -> Option<Row> {
        self.updates.recv().await
    }
}

impl Drop for RowSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn read_row(&self, table: &str, id: &str) -> Result<Row, BackendError>;

    /// Обновляет только перечисленные поля
    async fn update_row(&self, table: &str, id: &str, fields: Row) -> Result<(), BackendError>;

    fn subscribe_to_row(&self, table: &str, id: &str) -> Result<RowSubscription, BackendError>;
}

type RowKey = (String, String);

#[derive(Default)]
struct MemoryState {
    rows: HashMap<RowKey, Row>,
    subscribers: HashMap<RowKey, Vec<(u64, mpsc::UnboundedSender<Row>)>>,
}

/// Backend в памяти: push после каждого коммита, внедрение сбоев для тестов
#[derive(Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    next_sub: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Создаёт или заменяет строку целиком (без уведомлений)
    pub fn insert_row(&self, table: &str, id: &str, row: Row) {
        self.state
            .lock()
            .rows
            .insert((table.to_string(), id.to_string()), row);
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Row> {
        self.state
            .lock()
            .rows
            .get(&(table.to_string(), id.to_string()))
            .cloned()
    }

    pub fn subscriber_count(&self, table: &str, id: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(&(table.to_string(), id.to_string()))
            .map_or(0, Vec::len)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataBackend for MemoryBackend {
    async fn read_row(&self, table: &str, id: &str) -> Result<Row, BackendError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("read rejected".into()));
        }
        self.row(table, id).ok_or_else(|| BackendError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        })
    }

    async fn update_row(&self, table: &str, id: &str, fields: Row) -> Result<(), BackendError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("write rejected".into()));
        }
        let key = (table.to_string(), id.to_string());
        let mut state = self.state.lock();
        let Some(row) = state.rows.get_mut(&key) else {
            return Err(BackendError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        };
        row.extend(fields);
        let committed = row.clone();

        if let Some(subs) = state.subscribers.get_mut(&key) {
            subs.retain(|(_, tx)| tx.send(committed.clone()).is_ok());
            debug!(table, id, delivered = subs.len(), "Row update pushed");
        }
        Ok(())
    }

    fn subscribe_to_row(&self, table: &str, id: &str) -> Result<RowSubscription, BackendError> {
        let key = (table.to_string(), id.to_string());
        let sub_id = self.next_sub.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .entry(key.clone())
            .or_default()
            .push((sub_id, tx));

        let state = Arc::downgrade(&self.state);
        Ok(RowSubscription::new(rx, move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.lock();
            if let Some(subs) = state.subscribers.get_mut(&key) {
                subs.retain(|(id, _)| *id != sub_id);
                if subs.is_empty() {
                    state.subscribers.remove(&key);
                }
            } else {
                warn!(table = %key.0, id = %key.1, "Unsubscribe for unknown row");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn update_merges_and_pushes_full_row() {
        let backend = MemoryBackend::new();
        backend.insert_row("appointments", "apt-1", fields(json!({"call_status": "requested"})));
        let mut sub = backend.subscribe_to_row("appointments", "apt-1").unwrap();

        backend
            .update_row("appointments", "apt-1", fields(json!({"patient_peer_id": "p1"})))
            .await
            .unwrap();

        let pushed = sub.recv().await.unwrap();
        assert_eq!(pushed["patient_peer_id"], "p1");
        assert_eq!(pushed["call_status"], "requested");
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let backend = MemoryBackend::new();
        backend.insert_row("appointments", "apt-1", Row::new());
        let sub = backend.subscribe_to_row("appointments", "apt-1").unwrap();
        assert_eq!(backend.subscriber_count("appointments", "apt-1"), 1);
        drop(sub);
        assert_eq!(backend.subscriber_count("appointments", "apt-1"), 0);
    }

    #[tokio::test]
    async fn missing_row_and_injected_failures() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.read_row("appointments", "nope").await,
            Err(BackendError::NotFound { .. })
        ));

        backend.insert_row("appointments", "apt-1", Row::new());
        backend.set_fail_writes(true);
        assert!(backend
            .update_row("appointments", "apt-1", Row::new())
            .await
            .is_err());
        backend.set_fail_reads(true);
        assert!(backend.read_row("appointments", "apt-1").await.is_err());
    }
}
