use thiserror::Error;

/// Ошибки процесса установки звонка
#[derive(Debug, Error)]
pub enum Error {
    /// Транспорт не смог установить соединение (ICE / negotiation)
    #[error("call establishment failed: {0}")]
    CallEstablishment(String),

    #[error("signaling write failed: {0}")]
    SignalingWrite(String),

    #[error("signaling read failed: {0}")]
    SignalingRead(String),

    /// Не удалось упаковать или распаковать SDP
    #[error("payload codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Ошибки хранилища строк
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("row {id} not found in {table}")]
    NotFound { table: String, id: String },

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
