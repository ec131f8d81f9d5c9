use crate::peer::types::PeerId;
use crate::utils::random_id;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Брокер идентификаторов: выдаёт участникам временные id
/// и доставляет сообщения в их входящие очереди.
pub struct PeerDirectory<M> {
    peers: Mutex<HashMap<PeerId, mpsc::UnboundedSender<M>>>,
}

impl<M: Send + 'static> PeerDirectory<M> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Регистрирует новый уникальный id и возвращает его очередь
    pub fn register(&self) -> (PeerId, mpsc::UnboundedReceiver<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut peers = self.peers.lock();
        let id = loop {
            let candidate = PeerId(random_id());
            if !peers.contains_key(&candidate) {
                break candidate;
            }
        };
        peers.insert(id.clone(), tx);
        debug!(peer = %id, total = peers.len(), "Registered peer identity");
        (id, rx)
    }

    pub fn unregister(&self, id: &PeerId) {
        if self.peers.lock().remove(id).is_some() {
            debug!(peer = %id, "Released peer identity");
        }
    }

    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.peers.lock().contains_key(id)
    }

    /// Отправка сообщения участнику. false если id неизвестен или очередь закрыта.
    pub fn send(&self, to: &PeerId, msg: M) -> bool {
        let tx = self.peers.lock().get(to).cloned();
        match tx {
            Some(tx) => tx.send(msg).is_ok(),
            None => {
                warn!(peer = %to, "Message for unknown peer dropped");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
