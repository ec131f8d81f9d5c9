use crate::media::MediaStream;
use crate::negotiator::CallStatus;
use crate::session::CallView;
use tokio::sync::watch;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Формат вывода логов: `CLINIC_CALL_LOG_FORMAT=json` для JSON
pub const LOG_FORMAT_ENV: &str = "CLINIC_CALL_LOG_FORMAT";

/// Установка глобального subscriber'а. Повторный вызов ничего не делает.
pub fn init() {
    // Проверяем конфигурацию логирования
    if !crate::config::LOGGING_ENABLED || !crate::config::dev::ENABLE_LOGGING {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };
    if result.is_ok() {
        debug!("Logging initialized");
    }
}

pub fn emit_status(view: &watch::Sender<CallView>, status: CallStatus) {
    view.send_modify(|v| {
        info!(role = %v.role, from = %v.status, to = %status, "Status changed");
        v.status = status;
    });
}

/// Локальный поток привязан к превью сразу после захвата
pub fn emit_local_preview(view: &watch::Sender<CallView>, stream: Option<MediaStream>) {
    view.send_modify(|v| v.local_preview = stream);
}

pub fn emit_connected(view: &watch::Sender<CallView>, remote: MediaStream) {
    view.send_modify(|v| {
        debug!(role = %v.role, stream = %remote.id(), "Remote stream bound");
        v.remote = Some(remote);
        if v.connected_at.is_none() {
            v.connected_at = Some(chrono::Utc::now());
        }
    });
}

pub fn emit_disconnected(view: &watch::Sender<CallView>) {
    view.send_modify(|v| {
        if v.remote.take().is_some() {
            debug!(role = %v.role, "Remote display cleared");
        }
    });
}
