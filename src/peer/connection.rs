use crate::error::{Error, Result};
use crate::media::{MediaStream, TrackKind};
use crate::peer::codec::{dec, enc};
use crate::peer::directory::PeerDirectory;
use crate::peer::transport::{
    CallDirection, CallEvent, CallHandle, CallLink, OpenedPeer, PeerEndpoint, PeerTransport,
};
use crate::peer::types::{CallId, PeerId, SdpPayload, ServerConfig};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Период ожидания восстановления после Disconnected
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Сообщения, которые участники пересылают друг другу через брокер
#[derive(Debug, Clone)]
pub enum SdpSignal {
    Offer {
        call: CallId,
        from: PeerId,
        payload: String,
    },
    Answer {
        call: CallId,
        payload: String,
    },
    Hangup {
        call: CallId,
    },
}

type CallMap = Arc<Mutex<HashMap<CallId, Arc<WebRtcCall>>>>;

/// Транспорт на настоящих RTCPeerConnection. SDP отправляется целиком
/// после завершения сбора ICE кандидатов (без trickle).
pub struct WebRtcTransport {
    directory: Arc<PeerDirectory<SdpSignal>>,
    ice_servers: Vec<ServerConfig>,
}

impl WebRtcTransport {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Arc<Self> {
        Self::with_directory(PeerDirectory::new(), ice_servers)
    }

    /// Несколько транспортов могут делить один брокер
    pub fn with_directory(
        directory: Arc<PeerDirectory<SdpSignal>>,
        ice_servers: Vec<ServerConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory,
            ice_servers,
        })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn open(&self) -> Result<OpenedPeer> {
        let (id, inbox) = self.directory.register();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let calls: CallMap = Arc::new(Mutex::new(HashMap::new()));

        let ctx = Arc::new(EndpointCtx {
            id: id.clone(),
            directory: self.directory.clone(),
            ice_servers: self.ice_servers.clone(),
            calls,
        });
        let pump = tokio::spawn(pump_signals(ctx.clone(), inbox, incoming_tx));
        info!(peer = %id, "WebRTC peer opened");

        Ok(OpenedPeer {
            endpoint: Arc::new(WebRtcEndpoint {
                ctx,
                pump: Mutex::new(Some(pump)),
            }),
            incoming,
        })
    }
}

struct EndpointCtx {
    id: PeerId,
    directory: Arc<PeerDirectory<SdpSignal>>,
    ice_servers: Vec<ServerConfig>,
    calls: CallMap,
}

struct WebRtcEndpoint {
    ctx: Arc<EndpointCtx>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl PeerEndpoint for WebRtcEndpoint {
    fn identity(&self) -> &PeerId {
        &self.ctx.id
    }

    async fn place_call(&self, remote: &PeerId, local: &MediaStream) -> Result<CallHandle> {
        let ctx = &self.ctx;
        if !ctx.directory.is_registered(remote) {
            return Err(Error::CallEstablishment(format!("peer {remote} unavailable")));
        }

        let id = CallId::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let call = WebRtcCall::new(id, remote.clone(), ctx, events_tx, None);

        let pc = new_peer(&ctx.ice_servers, local, Arc::downgrade(&call))
            .await
            .map_err(establishment)?;
        *call.pc.lock() = Some(pc.clone());

        debug!(call = %id, "Creating offer...");
        let offer = pc.create_offer(None).await.map_err(establishment)?;
        let payload = finish_local_description(&pc, offer, id).await?;

        ctx.calls.lock().insert(id, call.clone());
        let sent = ctx.directory.send(
            remote,
            SdpSignal::Offer {
                call: id,
                from: ctx.id.clone(),
                payload,
            },
        );
        if !sent {
            call.shutdown().await;
            return Err(Error::CallEstablishment(format!("peer {remote} unavailable")));
        }

        info!(call = %id, to = %remote, "Offer sent");
        Ok(CallHandle::new(
            id,
            remote.clone(),
            CallDirection::Outbound,
            call,
            events_rx,
        ))
    }

    async fn destroy(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let calls: Vec<_> = self.ctx.calls.lock().drain().map(|(_, c)| c).collect();
        for call in calls {
            call.close().await;
        }
        self.ctx.directory.unregister(&self.ctx.id);
    }
}

/// Входящие сигналы от брокера
async fn pump_signals(
    ctx: Arc<EndpointCtx>,
    mut inbox: mpsc::UnboundedReceiver<SdpSignal>,
    incoming: mpsc::UnboundedSender<CallHandle>,
) {
    while let Some(signal) = inbox.recv().await {
        match signal {
            SdpSignal::Offer {
                call,
                from,
                payload,
            } => {
                debug!(call = %call, from = %from, "Offer received");
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let link = WebRtcCall::new(call, from.clone(), &ctx, events_tx, Some(payload));
                ctx.calls.lock().insert(call, link.clone());
                let handle =
                    CallHandle::new(call, from, CallDirection::Inbound, link, events_rx);
                if incoming.send(handle).is_err() {
                    warn!(call = %call, "Nobody listens for incoming calls");
                }
            }
            SdpSignal::Answer { call, payload } => {
                let link = ctx.calls.lock().get(&call).cloned();
                match link {
                    Some(link) => link.apply_answer(&payload).await,
                    None => warn!(call = %call, "Answer for unknown call"),
                }
            }
            SdpSignal::Hangup { call } => {
                let link = ctx.calls.lock().remove(&call);
                if let Some(link) = link {
                    info!(call = %call, "Remote hung up");
                    link.closed.store(true, Ordering::SeqCst);
                    link.shutdown().await;
                    let _ = link.events.send(CallEvent::Closed);
                }
            }
        }
    }
}

struct WebRtcCall {
    me: Weak<WebRtcCall>,
    id: CallId,
    remote: PeerId,
    local_id: PeerId,
    directory: Arc<PeerDirectory<SdpSignal>>,
    ice_servers: Vec<ServerConfig>,
    calls: CallMap,
    events: mpsc::UnboundedSender<CallEvent>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    offer: Mutex<Option<String>>,
    remote_kinds: Mutex<Vec<TrackKind>>,
    reported: AtomicBool,
    closed: AtomicBool,
    grace: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcCall {
    fn new(
        id: CallId,
        remote: PeerId,
        ctx: &EndpointCtx,
        events: mpsc::UnboundedSender<CallEvent>,
        offer: Option<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id,
            remote,
            local_id: ctx.id.clone(),
            directory: ctx.directory.clone(),
            ice_servers: ctx.ice_servers.clone(),
            calls: ctx.calls.clone(),
            events,
            pc: Mutex::new(None),
            offer: Mutex::new(offer),
            remote_kinds: Mutex::new(Vec::new()),
            reported: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            grace: Mutex::new(None),
        })
    }

    fn fail(&self, reason: String) {
        error!(call = %self.id, %reason, "Call establishment failed");
        let _ = self.events.send(CallEvent::Error(reason));
    }

    async fn set_remote(&self, pc: &RTCPeerConnection, sdp: RTCSessionDescription) -> Result<()> {
        *self.remote_kinds.lock() = media_kinds(&sdp.sdp);
        pc.set_remote_description(sdp).await.map_err(establishment)
    }

    /// Caller: применяем ANSWER удалённой стороны
    async fn apply_answer(&self, payload: &str) {
        let pc = self.pc.lock().clone();
        let Some(pc) = pc else {
            warn!(call = %self.id, "Answer arrived without peer connection");
            return;
        };
        let result = match dec(payload) {
            Ok(answer) => self.set_remote(&pc, answer.sdp).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(call = %self.id, "Remote description set"),
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn on_state(&self, st: RTCPeerConnectionState) {
        debug!(call = %self.id, state = ?st, "Peer connection state changed");
        match st {
            RTCPeerConnectionState::Connected => {
                if let Some(handle) = self.grace.lock().take() {
                    debug!(call = %self.id, "Connection recovered during grace period");
                    handle.abort();
                }
                if !self.reported.swap(true, Ordering::SeqCst) {
                    let kinds = self.remote_kinds.lock().clone();
                    let _ = self.events.send(CallEvent::Stream(MediaStream::new(&kinds)));
                }
            }
            RTCPeerConnectionState::Failed => {
                if !self.reported.load(Ordering::SeqCst) {
                    self.fail("peer connection failed".into());
                } else if !self.closed.load(Ordering::SeqCst) {
                    let _ = self.events.send(CallEvent::Closed);
                }
            }
            RTCPeerConnectionState::Disconnected => {
                let mut grace = self.grace.lock();
                if grace.is_some() {
                    return;
                }
                let Some(call) = self.me.upgrade() else {
                    return;
                };
                *grace = Some(tokio::spawn(async move {
                    warn!(call = %call.id, "Connection lost, waiting {} s", GRACE_PERIOD.as_secs());
                    sleep(GRACE_PERIOD).await;
                    let pc = call.pc.lock().clone();
                    let recovered = pc
                        .map(|pc| pc.connection_state() == RTCPeerConnectionState::Connected)
                        .unwrap_or(false);
                    if !recovered && !call.closed.load(Ordering::SeqCst) {
                        let _ = call.events.send(CallEvent::Closed);
                    }
                }));
            }
            _ => {}
        }
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.grace.lock().take() {
            handle.abort();
        }
        let pc = self.pc.lock().take();
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                warn!(call = %self.id, "Failed to close peer connection: {e}");
            }
        }
    }
}

#[async_trait]
impl CallLink for WebRtcCall {
    /// Callee: создаём ANSWER на сохранённый OFFER
    async fn answer(&self, local: &MediaStream) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::CallEstablishment("call already closed".into()));
        }
        let encoded = self.offer.lock().take();
        let Some(encoded) = encoded else {
            return Err(Error::Transport("nothing to answer".into()));
        };
        let offer = dec(&encoded)?;

        let pc = new_peer(&self.ice_servers, local, self.me.clone())
            .await
            .map_err(establishment)?;
        *self.pc.lock() = Some(pc.clone());

        self.set_remote(&pc, offer.sdp).await?;
        let answer = pc.create_answer(None).await.map_err(establishment)?;
        let payload = finish_local_description(&pc, answer, self.id).await?;

        if !self.directory.send(
            &self.remote,
            SdpSignal::Answer {
                call: self.id,
                payload,
            },
        ) {
            return Err(Error::CallEstablishment(format!(
                "peer {} unavailable",
                self.remote
            )));
        }
        info!(call = %self.id, to = %self.remote, "Answer sent");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.calls.lock().remove(&self.id);
        self.directory
            .send(&self.remote, SdpSignal::Hangup { call: self.id });
        self.shutdown().await;
        debug!(call = %self.id, peer = %self.local_id, "Call closed locally");
    }
}

fn establishment(e: impl std::fmt::Display) -> Error {
    Error::CallEstablishment(e.to_string())
}

/// Ставим local description, ждём окончания сбора кандидатов и кодируем SDP
async fn finish_local_description(
    pc: &RTCPeerConnection,
    desc: RTCSessionDescription,
    id: CallId,
) -> Result<String> {
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(desc).await.map_err(establishment)?;
    let _ = gather_complete.recv().await;

    let sdp = pc
        .local_description()
        .await
        .ok_or_else(|| Error::CallEstablishment("local description missing".into()))?;
    enc(&SdpPayload {
        sdp,
        id: id.to_string(),
        ts: chrono::Utc::now().timestamp(),
    })
}

/// создаём Peer и добавляем в него дорожки локального потока
async fn new_peer(
    ice_servers: &[ServerConfig],
    local: &MediaStream,
    call: Weak<WebRtcCall>,
) -> std::result::Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(rtc_config(ice_servers)).await?);

    for (kind, track_id) in local.kinds().into_iter().zip(local.track_ids()) {
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track_id,
            local.id().to_owned(),
        ));
        pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
    }

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        if let Some(call) = call.upgrade() {
            call.on_state(st);
        }
        Box::pin(async {})
    }));

    Ok(pc)
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Типы медиа-секций в SDP (`m=audio`, `m=video`)
pub fn media_kinds(sdp: &str) -> Vec<TrackKind> {
    sdp.lines()
        .filter_map(|line| {
            if line.starts_with("m=audio") {
                Some(TrackKind::Audio)
            } else if line.starts_with("m=video") {
                Some(TrackKind::Video)
            } else {
                None
            }
        })
        .collect()
}
