//! Автомат установки звонка.
//!
//! `Negotiator` не выполняет ввод-вывод: на каждый входной сигнал он отвечает
//! списком действий, которые исполняет драйвер сессии (`session.rs`).
//! Это позволяет проверять любые порядки событий без транспорта и backend.
//!
//! Фазы: `Idle → WaitingForPeer → Dialing → Connected → Ended`,
//! плюс `Ringing` при входящем предложении.

use crate::join::Join;
use crate::media::{MediaAccessError, MediaStream};
use crate::peer::types::{CallId, PeerId};
use crate::signaling::{RecordStatus, Role, SharedCallRecord};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    HangUp,
    Exit,
    RemoteHangUp,
    Failed(String),
}

impl EndReason {
    fn releases_media(&self) -> bool {
        !matches!(self, EndReason::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    WaitingForPeer,
    /// `call` пуст, пока транспорт ещё не вернул хэндл
    Dialing { call: Option<CallId> },
    Ringing { call: CallId },
    Connected { call: CallId },
    Ended(EndReason),
}

impl CallPhase {
    fn active_call(&self) -> Option<CallId> {
        match self {
            CallPhase::Dialing { call } => *call,
            CallPhase::Ringing { call } | CallPhase::Connected { call } => Some(*call),
            _ => None,
        }
    }

    fn in_call(&self) -> bool {
        matches!(
            self,
            CallPhase::Dialing { .. } | CallPhase::Ringing { .. } | CallPhase::Connected { .. }
        )
    }

    fn is_ended(&self) -> bool {
        matches!(self, CallPhase::Ended(_))
    }
}

/// Строка статуса для пользователя
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Initializing,
    WaitingForPeer,
    Calling,
    Incoming,
    Connected,
    CallFailed,
    CallEnded,
    MediaError,
    SignalingError,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CallStatus::Initializing => "Initializing…",
            CallStatus::WaitingForPeer => "Waiting for other party…",
            CallStatus::Calling => "Calling…",
            CallStatus::Incoming => "Incoming call…",
            CallStatus::Connected => "Connected",
            CallStatus::CallFailed => "Call Failed",
            CallStatus::CallEnded => "Call Ended",
            CallStatus::MediaError => "Error accessing camera",
            CallStatus::SignalingError => "Signaling error",
        };
        f.write_str(text)
    }
}

/// Входные сигналы автомата
#[derive(Debug, Clone)]
pub enum Input {
    MediaReady(MediaStream),
    MediaFailed(MediaAccessError),
    IdentityReady(PeerId),
    IdentityFailed(String),
    /// Первичное чтение или push-обновление общей записи
    RecordObserved(SharedCallRecord),
    SignalingFailed(String),
    CallPlaced(CallId),
    IncomingCall { call: CallId, from: PeerId },
    RemoteStream { call: CallId, stream: MediaStream },
    CallFailed { call: Option<CallId>, reason: String },
    CallClosed(CallId),
    HangUp,
    Exit,
}

/// Действия для драйвера
#[derive(Debug, Clone)]
pub enum Action {
    PlaceCall { target: PeerId, stream: MediaStream },
    Answer { call: CallId, stream: MediaStream },
    /// Лишнее входящее предложение: закрыть, текущий звонок не трогать
    Reject(CallId),
    CloseCall(CallId),
    BindRemote(MediaStream),
    ClearRemote,
    StopLocalMedia,
    WriteRecordStatus(RecordStatus),
    Status(CallStatus),
}

pub struct Negotiator {
    role: Role,
    has_session: bool,
    phase: CallPhase,
    /// медиа + сетевой идентификатор
    local: Join<MediaStream, PeerId>,
    record_read: bool,
    queued_target: Option<PeerId>,
    media_failed: bool,
    signaling_failed: bool,
    last_record_status: Option<RecordStatus>,
    status: CallStatus,
}

impl Negotiator {
    pub fn new(role: Role, has_session: bool) -> Self {
        Self {
            role,
            has_session,
            phase: CallPhase::Idle,
            local: Join::new(),
            record_read: false,
            queued_target: None,
            media_failed: false,
            signaling_failed: false,
            last_record_status: None,
            status: CallStatus::Initializing,
        }
    }

    pub fn phase(&self) -> &CallPhase {
        &self.phase
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn queued_target(&self) -> Option<&PeerId> {
        self.queued_target.as_ref()
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        let mut out = Vec::new();
        match input {
            Input::MediaReady(stream) => match &self.phase {
                CallPhase::Ended(reason) if reason.releases_media() => {
                    debug!("Media arrived after the call ended, releasing");
                    out.push(Action::StopLocalMedia);
                }
                _ => {
                    if self.local.set_left(stream) {
                        self.on_local_ready(&mut out);
                    }
                    self.answer_ringing(&mut out);
                }
            },
            Input::MediaFailed(e) => {
                warn!(role = %self.role, "Media access failed: {e}");
                self.media_failed = true;
            }
            Input::IdentityReady(id) => {
                let ready = self.local.set_right(id);
                self.enter_waiting();
                if ready {
                    self.on_local_ready(&mut out);
                }
            }
            Input::IdentityFailed(reason) => {
                warn!(role = %self.role, %reason, "Identity registration failed");
                self.signaling_failed = true;
            }
            Input::RecordObserved(record) => {
                self.record_read = true;
                self.observe_record(record, &mut out);
                self.enter_waiting();
                self.dial_queued(&mut out);
            }
            Input::SignalingFailed(reason) => {
                warn!(role = %self.role, %reason, "Signaling failed");
                self.signaling_failed = true;
            }
            Input::CallPlaced(call) => match self.phase {
                CallPhase::Dialing { call: None } => {
                    self.phase = CallPhase::Dialing { call: Some(call) };
                }
                _ => {
                    debug!(call = %call, "Placed call is no longer wanted");
                    out.push(Action::CloseCall(call));
                }
            },
            Input::IncomingCall { call, from } => match self.phase {
                CallPhase::Idle | CallPhase::WaitingForPeer => {
                    info!(role = %self.role, call = %call, from = %from, "Incoming call");
                    self.queued_target = None;
                    self.phase = CallPhase::Ringing { call };
                    self.answer_ringing(&mut out);
                }
                _ => {
                    warn!(call = %call, phase = ?self.phase, "Rejecting extra incoming call");
                    out.push(Action::Reject(call));
                }
            },
            Input::RemoteStream { call, stream } => match self.phase {
                CallPhase::Dialing { call: Some(c) } if c == call => {
                    info!(role = %self.role, call = %call, "Remote stream received, connected");
                    self.phase = CallPhase::Connected { call };
                    out.push(Action::BindRemote(stream));
                    if self.role == Role::Caller && self.has_session {
                        out.push(Action::WriteRecordStatus(RecordStatus::Confirmed));
                    }
                }
                CallPhase::Connected { call: c } if c == call => {
                    out.push(Action::BindRemote(stream));
                }
                _ => debug!(call = %call, "Ignoring stream for inactive call"),
            },
            Input::CallFailed { call, reason } => {
                let current = self.phase.active_call();
                let matches = match (&self.phase, call) {
                    (CallPhase::Dialing { call: None }, _) => true,
                    (_, Some(c)) => current == Some(c),
                    (_, None) => false,
                };
                if matches {
                    self.end(EndReason::Failed(reason), &mut out);
                } else if let Some(c) = call {
                    debug!(call = %c, %reason, "Failure for inactive call");
                }
            }
            Input::CallClosed(call) => {
                if self.phase.active_call() == Some(call) {
                    info!(call = %call, "Remote side closed the call");
                    self.end(EndReason::RemoteHangUp, &mut out);
                }
            }
            Input::HangUp => {
                if !self.phase.is_ended() {
                    self.end(EndReason::HangUp, &mut out);
                }
            }
            Input::Exit => {
                if !self.phase.is_ended() {
                    self.end(EndReason::Exit, &mut out);
                }
            }
        }

        self.refresh_status(&mut out);
        out
    }

    fn observe_record(&mut self, record: SharedCallRecord, out: &mut Vec<Action>) {
        let previous = self.last_record_status.replace(record.status);
        let became_ended = record.status == RecordStatus::Ended
            && previous.is_some_and(|p| p != RecordStatus::Ended);
        if became_ended && self.phase.in_call() {
            info!(session = %record.session_id, "Record marked ended by the other side");
            self.end(EndReason::RemoteHangUp, out);
            return;
        }

        let other = record.identity(self.role.other()).cloned();
        match (self.role, other) {
            (Role::Caller, Some(peer)) => {
                if matches!(self.phase, CallPhase::Idle | CallPhase::WaitingForPeer) {
                    if self.queued_target.as_ref() != Some(&peer) {
                        debug!(peer = %peer, "Peer identity queued");
                    }
                    self.queued_target = Some(peer);
                }
            }
            (Role::Callee, Some(peer)) => {
                debug!(peer = %peer, "Caller identity known, waiting for its call");
            }
            (Role::Caller, None) => {
                // собеседник ушёл до звонка
                if let Some(peer) = self.queued_target.take() {
                    debug!(peer = %peer, "Queued peer withdrew");
                }
            }
            (Role::Callee, None) => {}
        }
    }

    /// Идентификатор получен и запись прочитана (если есть сессия)
    fn enter_waiting(&mut self) {
        if self.phase == CallPhase::Idle
            && self.local.right().is_some()
            && (self.record_read || !self.has_session)
        {
            self.phase = CallPhase::WaitingForPeer;
        }
    }

    /// Срабатывает ровно один раз, когда готовы и медиа, и идентификатор
    fn on_local_ready(&mut self, out: &mut Vec<Action>) {
        debug!(role = %self.role, "Local media and identity both ready");
        self.dial_queued(out);
    }

    /// Звонок по запомненной цели, если локальная сторона готова
    fn dial_queued(&mut self, out: &mut Vec<Action>) {
        if self.role != Role::Caller
            || self.phase != CallPhase::WaitingForPeer
            || !self.local.is_complete()
        {
            return;
        }
        let Some(stream) = self.local.left().cloned() else {
            return;
        };
        if let Some(target) = self.queued_target.take() {
            info!(peer = %target, "Placing call");
            self.phase = CallPhase::Dialing { call: None };
            out.push(Action::PlaceCall { target, stream });
        }
    }

    /// Автоответ на входящий звонок, как только есть локальное медиа
    fn answer_ringing(&mut self, out: &mut Vec<Action>) {
        let CallPhase::Ringing { call } = self.phase else {
            return;
        };
        if let Some(stream) = self.local.left() {
            info!(call = %call, "Auto-answering incoming call");
            out.push(Action::Answer {
                call,
                stream: stream.clone(),
            });
            self.phase = CallPhase::Connected { call };
        }
    }

    fn end(&mut self, reason: EndReason, out: &mut Vec<Action>) {
        let was_in_call = self.phase.in_call();
        if let Some(call) = self.phase.active_call() {
            out.push(Action::CloseCall(call));
        }
        out.push(Action::ClearRemote);
        if reason.releases_media() {
            out.push(Action::StopLocalMedia);
        }
        if was_in_call
            && self.has_session
            && matches!(reason, EndReason::HangUp | EndReason::Exit)
        {
            out.push(Action::WriteRecordStatus(RecordStatus::Ended));
        }
        info!(role = %self.role, ?reason, "Call ended");
        self.queued_target = None;
        self.phase = CallPhase::Ended(reason);
    }

    fn derive_status(&self) -> CallStatus {
        match &self.phase {
            CallPhase::Ended(EndReason::Failed(_)) => CallStatus::CallFailed,
            CallPhase::Ended(_) => CallStatus::CallEnded,
            CallPhase::Connected { .. } => CallStatus::Connected,
            _ if self.media_failed => CallStatus::MediaError,
            CallPhase::Dialing { .. } => CallStatus::Calling,
            CallPhase::Ringing { .. } => CallStatus::Incoming,
            _ if self.signaling_failed => CallStatus::SignalingError,
            CallPhase::Idle => CallStatus::Initializing,
            CallPhase::WaitingForPeer => CallStatus::WaitingForPeer,
        }
    }

    fn refresh_status(&mut self, out: &mut Vec<Action>) {
        let status = self.derive_status();
        if status != self.status {
            self.status = status;
            out.push(Action::Status(status));
        }
    }
}
