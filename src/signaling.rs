use crate::backend::{DataBackend, Row, RowSubscription};
use crate::config::CallConfig;
use crate::error::{BackendError, Error, Result};
use crate::peer::types::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Роль участника. Фиксирована договорённостью: врач звонит, пациент ждёт.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Caller => Role::Callee,
            Role::Callee => Role::Caller,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Caller => f.write_str("caller"),
            Role::Callee => f.write_str("callee"),
        }
    }
}

/// Статус звонка в общей записи
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    Requested,
    Confirmed,
    Ended,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Requested => "requested",
            RecordStatus::Confirmed => "confirmed",
            RecordStatus::Ended => "ended",
        }
    }
}

/// Общая запись звонка: идентификаторы обоих участников и статус
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SharedCallRecord {
    pub session_id: String,
    pub caller: Option<PeerId>,
    pub callee: Option<PeerId>,
    pub status: RecordStatus,
}

impl SharedCallRecord {
    pub fn identity(&self, role: Role) -> Option<&PeerId> {
        match role {
            Role::Caller => self.caller.as_ref(),
            Role::Callee => self.callee.as_ref(),
        }
    }
}

/// Имена полей строки, в которых лежит запись
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    pub table: String,
    pub caller_field: String,
    pub callee_field: String,
    pub status_field: String,
}

impl RecordLayout {
    pub fn field(&self, role: Role) -> &str {
        match role {
            Role::Caller => &self.caller_field,
            Role::Callee => &self.callee_field,
        }
    }

    pub fn parse(&self, session_id: &str, row: &Row) -> Result<SharedCallRecord> {
        let peer = |field: &str| -> Result<Option<PeerId>> {
            match row.get(field) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) if s.is_empty() => Ok(None),
                Some(Value::String(s)) => Ok(Some(PeerId(s.clone()))),
                Some(other) => Err(Error::SignalingRead(format!(
                    "field {field} is not a string: {other}"
                ))),
            }
        };
        let status = match row.get(&self.status_field) {
            None | Some(Value::Null) => RecordStatus::default(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                Error::SignalingRead(format!("field {}: {e}", self.status_field))
            })?,
        };

        Ok(SharedCallRecord {
            session_id: session_id.to_string(),
            caller: peer(&self.caller_field)?,
            callee: peer(&self.callee_field)?,
            status,
        })
    }
}

impl From<&CallConfig> for RecordLayout {
    fn from(config: &CallConfig) -> Self {
        Self {
            table: config.table.clone(),
            caller_field: config.caller_field.clone(),
            callee_field: config.callee_field.clone(),
            status_field: config.status_field.clone(),
        }
    }
}

/// Подписка на общую запись, возвращает уже разобранные записи
pub struct RecordSubscription {
    session_id: String,
    layout: RecordLayout,
    inner: RowSubscription,
}

impl RecordSubscription {
    /// Следующее изменение; ошибки разбора пропускаются с предупреждением
    pub async fn next(&mut self) -> Option<SharedCallRecord> {
        loop {
            let row = self.inner.recv().await?;
            match self.layout.parse(&self.session_id, &row) {
                Ok(record) => return Some(record),
                Err(e) => warn!(session = %self.session_id, "Skipping malformed record update: {e}"),
            }
        }
    }
}

/// Сигнальный канал поверх внешнего backend
#[derive(Clone)]
pub struct SignalingRelay {
    backend: Arc<dyn DataBackend>,
    layout: RecordLayout,
}

impl SignalingRelay {
    pub fn new(backend: Arc<dyn DataBackend>, layout: RecordLayout) -> Self {
        Self { backend, layout }
    }

    pub async fn read_session(&self, id: &str) -> Result<SharedCallRecord> {
        let row = self
            .backend
            .read_row(&self.layout.table, id)
            .await
            .map_err(read_error)?;
        let record = self.layout.parse(id, &row)?;
        debug!(session = id, ?record, "Session record read");
        Ok(record)
    }

    pub fn subscribe(&self, id: &str) -> Result<RecordSubscription> {
        let inner = self
            .backend
            .subscribe_to_row(&self.layout.table, id)
            .map_err(read_error)?;
        debug!(session = id, "Subscribed to session record");
        Ok(RecordSubscription {
            session_id: id.to_string(),
            layout: self.layout.clone(),
            inner,
        })
    }

    /// Пишет идентификатор только в поле своей роли
    pub async fn write_field(&self, id: &str, role: Role, identity: &PeerId) -> Result<()> {
        let mut fields = Row::new();
        fields.insert(
            self.layout.field(role).to_string(),
            Value::String(identity.0.clone()),
        );
        self.write(id, fields).await?;
        info!(session = id, %role, peer = %identity, "Identity published");
        Ok(())
    }

    pub async fn write_status(&self, id: &str, status: RecordStatus) -> Result<()> {
        let mut fields = Row::new();
        fields.insert(
            self.layout.status_field.clone(),
            Value::String(status.as_str().to_string()),
        );
        self.write(id, fields).await?;
        info!(session = id, status = status.as_str(), "Record status updated");
        Ok(())
    }

    /// Стирает поле своей роли, если в нём всё ещё лежит этот идентификатор.
    /// Идентификатор нового входа той же роли не трогается.
    pub async fn clear_field(&self, id: &str, role: Role, identity: &PeerId) -> Result<bool> {
        let record = self.read_session(id).await?;
        if record.identity(role) != Some(identity) {
            debug!(session = id, %role, peer = %identity, "Field already holds another identity");
            return Ok(false);
        }
        let mut fields = Row::new();
        fields.insert(self.layout.field(role).to_string(), Value::Null);
        self.write(id, fields).await?;
        info!(session = id, %role, peer = %identity, "Identity withdrawn");
        Ok(true)
    }

    async fn write(&self, id: &str, fields: Row) -> Result<()> {
        self.backend
            .update_row(&self.layout.table, id, fields)
            .await
            .map_err(|e| Error::SignalingWrite(e.to_string()))
    }
}

fn read_error(e: BackendError) -> Error {
    Error::SignalingRead(e.to_string())
}
