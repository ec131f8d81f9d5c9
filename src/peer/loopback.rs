use crate::error::{Error, Result};
use crate::media::MediaStream;
use crate::peer::directory::PeerDirectory;
use crate::peer::transport::{
    CallDirection, CallEvent, CallHandle, CallLink, OpenedPeer, PeerEndpoint, PeerTransport,
};
use crate::peer::types::{CallId, PeerId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Транспорт внутри процесса: оба участника делят один `LoopbackTransport`,
/// медиапотоки передаются напрямую.
pub struct LoopbackTransport {
    directory: Arc<PeerDirectory<CallHandle>>,
    fail_calls: Arc<AtomicBool>,
    placed: Arc<AtomicUsize>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            directory: PeerDirectory::new(),
            fail_calls: Arc::new(AtomicBool::new(false)),
            placed: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Все последующие исходящие звонки будут завершаться ошибкой ICE
    pub fn set_fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    /// Сколько раз вызывался `place_call`
    pub fn calls_placed(&self) -> usize {
        self.placed.load(Ordering::SeqCst)
    }

    pub fn registered_peers(&self) -> usize {
        self.directory.len()
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn open(&self) -> Result<OpenedPeer> {
        let (id, incoming) = self.directory.register();
        info!(peer = %id, "Loopback peer opened");
        Ok(OpenedPeer {
            endpoint: Arc::new(LoopbackEndpoint {
                id,
                directory: self.directory.clone(),
                fail_calls: self.fail_calls.clone(),
                placed: self.placed.clone(),
            }),
            incoming,
        })
    }
}

struct LoopbackEndpoint {
    id: PeerId,
    directory: Arc<PeerDirectory<CallHandle>>,
    fail_calls: Arc<AtomicBool>,
    placed: Arc<AtomicUsize>,
}

#[async_trait]
impl PeerEndpoint for LoopbackEndpoint {
    fn identity(&self) -> &PeerId {
        &self.id
    }

    async fn place_call(&self, remote: &PeerId, local: &MediaStream) -> Result<CallHandle> {
        self.placed.fetch_add(1, Ordering::SeqCst);
        if !self.directory.is_registered(remote) {
            return Err(Error::CallEstablishment(format!("peer {remote} unavailable")));
        }

        let id = CallId::new();
        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, callee_rx) = mpsc::unbounded_channel();
        let call = Arc::new(LoopbackCall {
            caller_stream: local.clone(),
            caller_tx,
            callee_tx,
            closed: AtomicBool::new(false),
        });

        let outbound = CallHandle::new(
            id,
            remote.clone(),
            CallDirection::Outbound,
            Arc::new(LoopbackLink {
                call: call.clone(),
                side: Side::Caller,
            }),
            caller_rx,
        );

        if self.fail_calls.load(Ordering::SeqCst) {
            warn!(call = %id, peer = %remote, "Simulating ICE failure");
            let _ = call.caller_tx.send(CallEvent::Error("ICE negotiation failed".into()));
            return Ok(outbound);
        }

        let inbound = CallHandle::new(
            id,
            self.id.clone(),
            CallDirection::Inbound,
            Arc::new(LoopbackLink {
                call,
                side: Side::Callee,
            }),
            callee_rx,
        );
        if !self.directory.send(remote, inbound) {
            return Err(Error::CallEstablishment(format!("peer {remote} unavailable")));
        }
        debug!(call = %id, from = %self.id, to = %remote, "Offer delivered");
        Ok(outbound)
    }

    async fn destroy(&self) {
        self.directory.unregister(&self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Caller,
    Callee,
}

struct LoopbackCall {
    caller_stream: MediaStream,
    caller_tx: mpsc::UnboundedSender<CallEvent>,
    callee_tx: mpsc::UnboundedSender<CallEvent>,
    closed: AtomicBool,
}

struct LoopbackLink {
    call: Arc<LoopbackCall>,
    side: Side,
}

#[async_trait]
impl CallLink for LoopbackLink {
    async fn answer(&self, local: &MediaStream) -> Result<()> {
        if self.side == Side::Caller {
            return Err(Error::Transport("outbound call cannot be answered".into()));
        }
        if self.call.closed.load(Ordering::SeqCst) {
            return Err(Error::CallEstablishment("call already closed".into()));
        }
        let _ = self.call.caller_tx.send(CallEvent::Stream(local.clone()));
        let _ = self
            .call
            .callee_tx
            .send(CallEvent::Stream(self.call.caller_stream.clone()));
        Ok(())
    }

    async fn close(&self) {
        if self.call.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let other = match self.side {
            Side::Caller => &self.call.callee_tx,
            Side::Callee => &self.call.caller_tx,
        };
        let _ = other.send(CallEvent::Closed);
    }
}
