// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::{Error, Result};
use crate::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Переменная окружения с путём к JSON-конфигу
pub const CONFIG_ENV: &str = "CLINIC_CALL_CONFIG";

/// Дефолтные STUN сервера
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Какой транспорт использовать для звонка
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Loopback,
    Webrtc,
}

/// Настройки звонка
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Таблица с записями приёмов
    pub table: String,
    pub caller_field: String,
    pub callee_field: String,
    pub status_field: String,
    pub ice_servers: Vec<ServerConfig>,
    pub video: bool,
    pub audio: bool,
    pub transport: TransportKind,
    /// Сессия для демо-бинарника
    pub demo_session: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            table: "appointments".into(),
            caller_field: "doctor_peer_id".into(),
            callee_field: "patient_peer_id".into(),
            status_field: "call_status".into(),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            video: true,
            audio: true,
            transport: TransportKind::default(),
            demo_session: "apt-123".into(),
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CallConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Читает конфиг из файла в `CLINIC_CALL_CONFIG`, иначе дефолты
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => {
                info!(%path, "Loading call config");
                Self::from_file(path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            video: self.video,
            audio: self.audio,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for field in [
            &self.table,
            &self.caller_field,
            &self.callee_field,
            &self.status_field,
        ] {
            if field.is_empty() {
                return Err(Error::Config("table and field names must not be empty".into()));
            }
        }
        if self.caller_field == self.callee_field {
            return Err(Error::Config(
                "caller and callee fields must differ".into(),
            ));
        }

        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::Config("server URL cannot be empty".into()));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::Config(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }
}
