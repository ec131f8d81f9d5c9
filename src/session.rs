//! Драйвер сессии одного участника.
//!
//! Всё, что происходит асинхронно (захват медиа, регистрация идентификатора,
//! push-обновления записи, события звонка), приходит в один mpsc-канал
//! `SessionEvent`. Драйвер переводит события во входы `Negotiator` и исполняет
//! его действия. Ресурсы сессии принадлежат `CallResources` и освобождаются
//! на любом пути выхода.

use crate::backend::DataBackend;
use crate::error::{Error, Result};
use crate::identity::IdentityManager;
use crate::logger;
use crate::media::{MediaAccessError, MediaConstraints, MediaDevices, MediaStream, TrackKind};
use crate::negotiator::{Action, CallPhase, CallStatus, EndReason, Input, Negotiator};
use crate::peer::transport::{CallEvent, CallHandle, OpenedPeer, PeerEndpoint, PeerTransport};
use crate::peer::types::{CallId, PeerId};
use crate::signaling::{RecordLayout, Role, SharedCallRecord, SignalingRelay};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::SendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Всё асинхронное, что может произойти с участником
pub enum SessionEvent {
    Media(std::result::Result<MediaStream, MediaAccessError>),
    Identity(Result<OpenedPeer>),
    Published(Result<()>),
    Record(Result<SharedCallRecord>),
    Placed(Result<CallHandle>),
    Incoming(CallHandle),
    Call(CallId, CallEvent),
    Answered(CallId, Result<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    HangUp,
    Exit,
    ToggleAudio,
    ToggleVideo,
}

/// Управление сессией из UI. Когда все клоны удалены, сессия завершается.
#[derive(Debug, Clone)]
pub struct CallControl {
    tx: mpsc::UnboundedSender<Command>,
}

impl CallControl {
    pub fn hang_up(&self) {
        self.send(Command::HangUp)
    }

    pub fn exit(&self) {
        self.send(Command::Exit)
    }

    pub fn toggle_audio(&self) {
        self.send(Command::ToggleAudio)
    }

    pub fn toggle_video(&self) {
        self.send(Command::ToggleVideo)
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!(?command, "Session already finished");
        }
    }
}

/// Снимок состояния для отображения
#[derive(Debug, Clone)]
pub struct CallView {
    pub role: Role,
    pub session_id: Option<String>,
    pub identity: Option<PeerId>,
    pub status: CallStatus,
    pub phase: CallPhase,
    pub local_preview: Option<MediaStream>,
    pub remote: Option<MediaStream>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallView {
    fn new(role: Role, session_id: Option<String>) -> Self {
        Self {
            role,
            session_id,
            identity: None,
            status: CallStatus::Initializing,
            phase: CallPhase::Idle,
            local_preview: None,
            remote: None,
            audio_enabled: false,
            video_enabled: false,
            connected_at: None,
        }
    }
}

/// Локальная сторона звонка
pub struct Participant {
    pub role: Role,
    pub session_id: Option<String>,
    local: Option<MediaStream>,
    endpoint: Option<Arc<dyn PeerEndpoint>>,
}

impl Participant {
    pub fn new(role: Role, session_id: Option<String>) -> Self {
        Self {
            role,
            session_id,
            local: None,
            endpoint: None,
        }
    }

    pub fn identity(&self) -> Option<&PeerId> {
        self.endpoint.as_ref().map(|e| e.identity())
    }
}

/// Всё, что сессия держит и обязана отпустить
pub struct CallResources {
    participant: Participant,
    /// Активный звонок и ещё не обработанные входящие предложения
    calls: HashMap<CallId, CallHandle>,
    remote: Option<MediaStream>,
    /// Фоновые задачи, в том числе пересылка подписки на запись
    tasks: Vec<JoinHandle<()>>,
    /// Куда был опубликован идентификатор
    record: Option<SignalingRelay>,
    released: bool,
}

impl CallResources {
    pub fn new(participant: Participant) -> Self {
        Self {
            participant,
            calls: HashMap::new(),
            remote: None,
            tasks: Vec::new(),
            record: None,
            released: false,
        }
    }

    pub fn with_record(mut self, relay: SignalingRelay) -> Self {
        self.record = Some(relay);
        self
    }

    /// Убирает свой идентификатор из записи, пока конечная точка ещё жива
    async fn withdraw_identity(&self) {
        let (Some(relay), Some(session), Some(identity)) = (
            &self.record,
            &self.participant.session_id,
            self.participant.identity(),
        ) else {
            return;
        };
        if let Err(e) = relay
            .clear_field(session, self.participant.role, identity)
            .await
        {
            warn!(session = %session, peer = %identity, "Failed to withdraw identity: {e}");
        }
    }

    /// Освобождение: задачи, звонки, захват, идентификатор. Повторный вызов ничего не делает.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let tasks: Vec<_> = self.tasks.drain(..).collect();
        for task in tasks {
            task.abort();
            // дожидаемся, чтобы подписка внутри задачи точно была удалена
            let _ = task.await;
        }
        let calls: Vec<_> = self.calls.drain().collect();
        for (call, handle) in calls {
            debug!(call = %call, "Closing call on release");
            handle.close().await;
        }
        self.remote = None;
        if let Some(local) = &self.participant.local {
            local.stop();
        }
        self.withdraw_identity().await;
        if let Some(endpoint) = self.participant.endpoint.take() {
            endpoint.destroy().await;
        }
        info!(role = %self.participant.role, "Session resources released");
    }
}

impl Drop for CallResources {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(role = %self.participant.role, "Session dropped without release");
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(local) = &self.participant.local {
            local.stop();
        }

        let calls: Vec<CallHandle> = self.calls.drain().map(|(_, h)| h).collect();
        let endpoint = self.participant.endpoint.take();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                for handle in calls {
                    handle.close().await;
                }
                if let Some(endpoint) = endpoint {
                    endpoint.destroy().await;
                }
            });
        }
    }
}

pub struct SessionParams {
    pub role: Role,
    /// Без id сессии идентификатор никуда не публикуется
    pub session_id: Option<String>,
    pub constraints: MediaConstraints,
}

/// Внешние зависимости сессии
#[derive(Clone)]
pub struct CallDeps {
    pub backend: Arc<dyn DataBackend>,
    pub transport: Arc<dyn PeerTransport>,
    pub devices: Arc<dyn MediaDevices>,
    pub layout: RecordLayout,
}

pub struct SessionHandle {
    pub control: CallControl,
    pub view: watch::Receiver<CallView>,
    task: JoinHandle<EndReason>,
}

impl SessionHandle {
    pub fn current(&self) -> CallView {
        self.view.borrow().clone()
    }

    /// Ждёт состояния, удовлетворяющего условию. None, если сессия завершилась раньше.
    pub async fn wait_for(&mut self, f: impl FnMut(&CallView) -> bool) -> Option<CallView> {
        self.view.wait_for(f).await.ok().map(|view| view.clone())
    }

    pub async fn wait_for_status(&mut self, status: CallStatus) -> Option<CallView> {
        self.wait_for(|v| v.status == status).await
    }

    pub async fn join(self) -> EndReason {
        self.task
            .await
            .unwrap_or_else(|e| EndReason::Failed(format!("session task: {e}")))
    }
}

pub struct CallSession {
    params: SessionParams,
    deps: CallDeps,
}

impl CallSession {
    pub fn new(params: SessionParams, deps: CallDeps) -> Self {
        Self { params, deps }
    }

    pub fn spawn(self) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(CallView::new(
            self.params.role,
            self.params.session_id.clone(),
        ));
        let task = tokio::spawn(self.run(commands_rx, view_tx));
        SessionHandle {
            control: CallControl { tx: commands_tx },
            view: view_rx,
            task,
        }
    }

    async fn run(
        self,
        commands: mpsc::UnboundedReceiver<Command>,
        view: watch::Sender<CallView>,
    ) -> EndReason {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let SessionParams {
            role,
            session_id,
            constraints,
        } = self.params;
        info!(%role, session = ?session_id, "Call session started");

        let relay = SignalingRelay::new(self.deps.backend.clone(), self.deps.layout.clone());
        let mut driver = Driver {
            role,
            negotiator: Negotiator::new(role, session_id.is_some()),
            resources: CallResources::new(Participant::new(role, session_id.clone()))
                .with_record(relay.clone()),
            relay,
            session_id,
            view,
            events: events_tx,
        };
        driver.start(&self.deps, constraints);
        let reason = driver.drive(commands, events_rx).await;
        driver.resources.release().await;
        info!(%role, ?reason, "Call session finished");
        reason
    }
}

struct Driver {
    role: Role,
    session_id: Option<String>,
    negotiator: Negotiator,
    relay: SignalingRelay,
    resources: CallResources,
    view: watch::Sender<CallView>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Driver {
    fn start(&mut self, deps: &CallDeps, constraints: MediaConstraints) {
        let publish_to = self.session_id.clone().map(|id| {
            // сначала подписка, потом однократное чтение: обновление между ними не теряется
            match self.relay.subscribe(&id) {
                Ok(mut subscription) => {
                    let events = self.events.clone();
                    self.resources.tasks.push(tokio::spawn(async move {
                        while let Some(record) = subscription.next().await {
                            if events.send(SessionEvent::Record(Ok(record))).is_err() {
                                break;
                            }
                        }
                    }));
                }
                Err(e) => {
                    let _ = self.events.send(SessionEvent::Record(Err(e)));
                }
            }

            let relay = self.relay.clone();
            let events = self.events.clone();
            let session = id.clone();
            self.resources.tasks.push(tokio::spawn(async move {
                let record = relay.read_session(&session).await;
                let _ = events.send(SessionEvent::Record(record));
            }));
            (self.relay.clone(), id)
        });

        let manager = IdentityManager {
            devices: deps.devices.clone(),
            transport: deps.transport.clone(),
            constraints,
            role: self.role,
            publish_to,
        };
        self.resources
            .tasks
            .extend(manager.start(self.events.clone()));
    }

    async fn drive(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> EndReason {
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if let Some(input) = self.on_event(event) {
                        self.apply(input).await;
                    }
                }
                command = commands.recv() => match command.unwrap_or(Command::Exit) {
                    Command::HangUp => self.apply(Input::HangUp).await,
                    Command::Exit => {
                        self.apply(Input::Exit).await;
                        break;
                    }
                    Command::ToggleAudio => self.toggle(TrackKind::Audio),
                    Command::ToggleVideo => self.toggle(TrackKind::Video),
                },
            }
        }

        // задачи, которые не успели отправить результат, сами освободят его
        events.close();
        while let Ok(event) = events.try_recv() {
            self.absorb(event);
        }

        match self.negotiator.phase() {
            CallPhase::Ended(reason) => reason.clone(),
            _ => EndReason::Exit,
        }
    }

    /// Ресурсы из необработанных событий переходят под освобождение
    fn absorb(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Media(Ok(stream)) => stream.stop(),
            SessionEvent::Identity(Ok(opened)) => {
                self.resources.participant.endpoint = Some(opened.endpoint);
            }
            SessionEvent::Placed(Ok(handle)) | SessionEvent::Incoming(handle) => {
                self.resources.calls.insert(handle.id(), handle);
            }
            _ => {}
        }
    }

    fn on_event(&mut self, event: SessionEvent) -> Option<Input> {
        match event {
            SessionEvent::Media(Ok(stream)) => {
                info!(role = %self.role, stream = %stream.id(), kinds = ?stream.kinds(), "Local media ready");
                self.resources.participant.local = Some(stream.clone());
                let audio = stream.is_enabled(TrackKind::Audio);
                let video = stream.is_enabled(TrackKind::Video);
                self.view.send_modify(|v| {
                    v.audio_enabled = audio;
                    v.video_enabled = video;
                });
                logger::emit_local_preview(&self.view, Some(stream.clone()));
                Some(Input::MediaReady(stream))
            }
            SessionEvent::Media(Err(e)) => Some(Input::MediaFailed(e)),
            SessionEvent::Identity(Ok(opened)) => {
                let OpenedPeer {
                    endpoint,
                    mut incoming,
                } = opened;
                let id = endpoint.identity().clone();
                self.resources.participant.endpoint = Some(endpoint);

                let events = self.events.clone();
                self.resources.tasks.push(tokio::spawn(async move {
                    while let Some(handle) = incoming.recv().await {
                        if let Err(SendError(SessionEvent::Incoming(handle))) =
                            events.send(SessionEvent::Incoming(handle))
                        {
                            handle.close().await;
                            break;
                        }
                    }
                }));

                let shown = id.clone();
                self.view.send_modify(|v| v.identity = Some(shown));
                Some(Input::IdentityReady(id))
            }
            SessionEvent::Identity(Err(e)) => Some(Input::IdentityFailed(e.to_string())),
            SessionEvent::Published(Ok(())) => None,
            SessionEvent::Published(Err(e)) => Some(Input::SignalingFailed(e.to_string())),
            SessionEvent::Record(Ok(record)) => Some(Input::RecordObserved(record)),
            SessionEvent::Record(Err(e)) => Some(Input::SignalingFailed(e.to_string())),
            SessionEvent::Placed(Ok(handle)) => Some(Input::CallPlaced(self.track_call(handle))),
            SessionEvent::Placed(Err(e)) => Some(Input::CallFailed {
                call: None,
                reason: e.to_string(),
            }),
            SessionEvent::Incoming(handle) => {
                let from = handle.remote().clone();
                let call = self.track_call(handle);
                Some(Input::IncomingCall { call, from })
            }
            SessionEvent::Call(call, CallEvent::Stream(stream)) => {
                Some(Input::RemoteStream { call, stream })
            }
            SessionEvent::Call(call, CallEvent::Error(reason)) => Some(Input::CallFailed {
                call: Some(call),
                reason,
            }),
            SessionEvent::Call(call, CallEvent::Closed) => {
                // удалённая сторона уже закрыла, повторно закрывать не нужно
                self.resources.calls.remove(&call);
                Some(Input::CallClosed(call))
            }
            SessionEvent::Answered(_, Ok(())) => None,
            SessionEvent::Answered(call, Err(e)) => Some(Input::CallFailed {
                call: Some(call),
                reason: e.to_string(),
            }),
        }
    }

    /// Запоминает хэндл и пересылает его события в общий канал
    fn track_call(&mut self, mut handle: CallHandle) -> CallId {
        let call = handle.id();
        debug!(call = %call, peer = %handle.remote(), direction = ?handle.direction(), "Tracking call");
        if let Some(mut rx) = handle.take_events() {
            let events = self.events.clone();
            self.resources.tasks.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if events.send(SessionEvent::Call(call, event)).is_err() {
                        break;
                    }
                }
            }));
        }
        self.resources.calls.insert(call, handle);
        call
    }

    async fn apply(&mut self, input: Input) {
        let actions = self.negotiator.handle(input);

        let phase = self.negotiator.phase().clone();
        self.view.send_if_modified(|v| {
            if v.phase == phase {
                return false;
            }
            v.phase = phase;
            true
        });

        for action in actions {
            self.perform(action).await;
        }
    }

    async fn perform(&mut self, action: Action) {
        match action {
            Action::PlaceCall { target, stream } => {
                let Some(endpoint) = self.resources.participant.endpoint.clone() else {
                    let _ = self.events.send(SessionEvent::Placed(Err(
                        Error::CallEstablishment("no registered identity".into()),
                    )));
                    return;
                };
                let events = self.events.clone();
                self.resources.tasks.push(tokio::spawn(async move {
                    let result = endpoint.place_call(&target, &stream).await;
                    if let Err(SendError(SessionEvent::Placed(Ok(handle)))) =
                        events.send(SessionEvent::Placed(result))
                    {
                        handle.close().await;
                    }
                }));
            }
            Action::Answer { call, stream } => match self.resources.calls.get(&call) {
                Some(handle) => {
                    let link = handle.link();
                    let events = self.events.clone();
                    self.resources.tasks.push(tokio::spawn(async move {
                        let result = link.answer(&stream).await;
                        let _ = events.send(SessionEvent::Answered(call, result));
                    }));
                }
                None => warn!(call = %call, "Answer requested for unknown call"),
            },
            Action::Reject(call) => {
                if let Some(handle) = self.resources.calls.remove(&call) {
                    info!(call = %call, from = %handle.remote(), "Incoming call rejected");
                    handle.close().await;
                }
            }
            Action::CloseCall(call) => {
                if let Some(handle) = self.resources.calls.remove(&call) {
                    handle.close().await;
                }
            }
            Action::BindRemote(stream) => {
                self.resources.remote = Some(stream.clone());
                logger::emit_connected(&self.view, stream);
            }
            Action::ClearRemote => {
                self.resources.remote = None;
                logger::emit_disconnected(&self.view);
            }
            Action::StopLocalMedia => {
                if let Some(local) = &self.resources.participant.local {
                    local.stop();
                }
                logger::emit_local_preview(&self.view, None);
            }
            Action::WriteRecordStatus(status) => {
                let Some(id) = &self.session_id else {
                    return;
                };
                if let Err(e) = self.relay.write_status(id, status).await {
                    warn!(session = %id, status = status.as_str(), "Failed to update record status: {e}");
                }
            }
            Action::Status(status) => logger::emit_status(&self.view, status),
        }
    }

    fn toggle(&mut self, kind: TrackKind) {
        let Some(local) = &self.resources.participant.local else {
            debug!(?kind, "No local media to toggle");
            return;
        };
        let enabled = local.toggle(kind);
        self.view.send_modify(|v| match kind {
            TrackKind::Audio => v.audio_enabled = enabled,
            TrackKind::Video => v.video_enabled = enabled,
        });
        info!(role = %self.role, ?kind, enabled, "Local track toggled");
    }
}
