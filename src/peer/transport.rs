use crate::error::Result;
use crate::media::MediaStream;
use crate::peer::types::{CallId, PeerId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// События одного звонка, приходящие от транспорта
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Пришёл медиапоток удалённой стороны
    Stream(MediaStream),
    /// Ошибка установки соединения
    Error(String),
    /// Удалённая сторона закрыла звонок
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Реализация звонка внутри конкретного транспорта
#[async_trait]
pub trait CallLink: Send + Sync {
    async fn answer(&self, local: &MediaStream) -> Result<()>;
    async fn close(&self);
}

/// Хэндл звонка: исходящего (после `place_call`) или входящего предложения
pub struct CallHandle {
    id: CallId,
    remote: PeerId,
    direction: CallDirection,
    link: Arc<dyn CallLink>,
    events: Option<mpsc::UnboundedReceiver<CallEvent>>,
}

impl CallHandle {
    pub fn new(
        id: CallId,
        remote: PeerId,
        direction: CallDirection,
        link: Arc<dyn CallLink>,
        events: mpsc::UnboundedReceiver<CallEvent>,
    ) -> Self {
        Self {
            id,
            remote,
            direction,
            link,
            events: Some(events),
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// Поток событий звонка. Забрать можно только один раз.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        self.events.take()
    }

    pub async fn answer(&self, local: &MediaStream) -> Result<()> {
        self.link.answer(local).await
    }

    pub async fn close(&self) {
        self.link.close().await
    }

    /// Для фоновых задач, которым не нужен весь хэндл
    pub(crate) fn link(&self) -> Arc<dyn CallLink> {
        self.link.clone()
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .finish()
    }
}

/// Зарегистрированный участник транспорта
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    fn identity(&self) -> &PeerId;

    async fn place_call(&self, remote: &PeerId, local: &MediaStream) -> Result<CallHandle>;

    /// Освобождает идентификатор; повторный вызов безопасен
    async fn destroy(&self);
}

/// Результат `open()`: сам участник и очередь входящих звонков
pub struct OpenedPeer {
    pub endpoint: Arc<dyn PeerEndpoint>,
    pub incoming: mpsc::UnboundedReceiver<CallHandle>,
}

/// Транспорт peer-to-peer звонков
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn open(&self) -> Result<OpenedPeer>;
}
