//! Сценарии врач/пациент поверх MemoryBackend и LoopbackTransport.

use clinic_call_lib::backend::{DataBackend, MemoryBackend, Row};
use clinic_call_lib::config::CallConfig;
use clinic_call_lib::media::{MediaConstraints, MediaStream, TrackKind, VirtualDevices};
use clinic_call_lib::peer::{CallEvent, LoopbackTransport, PeerId, PeerTransport};
use clinic_call_lib::{
    CallDeps, CallPhase, CallSession, CallStatus, CallView, EndReason, Role, SessionHandle,
    SessionParams,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const SESSION: &str = "apt-123";
const TABLE: &str = "appointments";
const WAIT: Duration = Duration::from_secs(5);

struct Clinic {
    backend: Arc<MemoryBackend>,
    transport: Arc<LoopbackTransport>,
}

impl Clinic {
    fn new() -> Self {
        let backend = MemoryBackend::new();
        backend.insert_row(TABLE, SESSION, row(json!({"call_status": "requested"})));
        Self {
            backend,
            transport: LoopbackTransport::new(),
        }
    }

    fn deps(&self, devices: VirtualDevices) -> CallDeps {
        CallDeps {
            backend: self.backend.clone(),
            transport: self.transport.clone(),
            devices: Arc::new(devices),
            layout: (&CallConfig::default()).into(),
        }
    }

    fn join(&self, role: Role) -> SessionHandle {
        self.join_with(role, VirtualDevices::new())
    }

    fn join_with(&self, role: Role, devices: VirtualDevices) -> SessionHandle {
        CallSession::new(
            SessionParams {
                role,
                session_id: Some(SESSION.to_string()),
                constraints: MediaConstraints::default(),
            },
            self.deps(devices),
        )
        .spawn()
    }

    fn record_field(&self, field: &str) -> Option<Value> {
        self.backend
            .row(TABLE, SESSION)
            .and_then(|row| row.get(field).cloned())
    }
}

/// Ждёт, пока поле записи не станет удовлетворять условию
async fn field_settles(clinic: &Clinic, field: &str, f: impl Fn(Option<&Value>) -> bool) {
    let settled = tokio::time::timeout(WAIT, async {
        while !f(clinic.record_field(field).as_ref()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        settled.is_ok(),
        "field {field} stuck at {:?}",
        clinic.record_field(field)
    );
}

fn published(value: Option<&Value>) -> bool {
    value.is_some_and(|v| v.is_string())
}

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

async fn reach(session: &mut SessionHandle, status: CallStatus) -> CallView {
    let reached = tokio::time::timeout(WAIT, session.wait_for_status(status)).await;
    match reached {
        Ok(Some(view)) => view,
        Ok(None) => panic!("session finished before {status}"),
        Err(_) => panic!(
            "timed out waiting for {status}, still at {}",
            session.current().status
        ),
    }
}

/// Connected и удалённый поток уже привязан
async fn media_flowing(session: &mut SessionHandle) -> CallView {
    let reached = tokio::time::timeout(
        WAIT,
        session.wait_for(|v| v.status == CallStatus::Connected && v.remote.is_some()),
    )
    .await;
    match reached {
        Ok(Some(view)) => view,
        _ => panic!("no remote media, at {}", session.current().status),
    }
}

async fn leave(session: SessionHandle) -> EndReason {
    session.control.exit();
    tokio::time::timeout(WAIT, session.join())
        .await
        .expect("session did not finish")
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn patient_first_then_doctor_connects_once() {
    let clinic = Clinic::new();

    let mut patient = clinic.join(Role::Callee);
    reach(&mut patient, CallStatus::WaitingForPeer).await;

    let mut doctor = clinic.join(Role::Caller);
    let doctor_view = media_flowing(&mut doctor).await;
    let patient_view = media_flowing(&mut patient).await;

    assert_eq!(clinic.transport.calls_placed(), 1);
    assert_eq!(
        clinic.record_field("patient_peer_id"),
        patient_view.identity.as_ref().map(|id| json!(id.as_str()))
    );
    assert_eq!(
        clinic.record_field("doctor_peer_id"),
        doctor_view.identity.as_ref().map(|id| json!(id.as_str()))
    );
    assert_eq!(clinic.record_field("call_status"), Some(json!("confirmed")));
    assert!(doctor_view.connected_at.is_some());

    let doctor_local = doctor_view.local_preview.clone().unwrap();
    let patient_local = patient_view.local_preview.clone().unwrap();
    assert!(doctor_view.remote.unwrap().same_stream(&patient_local));
    assert!(patient_view.remote.unwrap().same_stream(&doctor_local));

    doctor.control.hang_up();
    let doctor_view = reach(&mut doctor, CallStatus::CallEnded).await;
    let patient_view = reach(&mut patient, CallStatus::CallEnded).await;
    assert!(doctor_view.remote.is_none());
    assert!(patient_view.remote.is_none());
    assert_eq!(clinic.record_field("call_status"), Some(json!("ended")));
    assert_eq!(doctor_local.live_track_count(), 0);
    assert_eq!(patient_local.live_track_count(), 0);

    assert_eq!(leave(doctor).await, EndReason::HangUp);
    assert_eq!(leave(patient).await, EndReason::RemoteHangUp);
    assert_eq!(clinic.backend.subscriber_count(TABLE, SESSION), 0);
    assert_eq!(clinic.transport.registered_peers(), 0);
    assert_eq!(clinic.transport.calls_placed(), 1);
}

#[tokio::test]
async fn doctor_first_then_patient_connects_once() {
    let clinic = Clinic::new();

    let mut doctor = clinic.join(Role::Caller);
    reach(&mut doctor, CallStatus::WaitingForPeer).await;
    assert_eq!(clinic.transport.calls_placed(), 0);

    let mut patient = clinic.join(Role::Callee);
    reach(&mut doctor, CallStatus::Connected).await;
    reach(&mut patient, CallStatus::Connected).await;
    assert_eq!(clinic.transport.calls_placed(), 1);

    leave(patient).await;
    leave(doctor).await;
    assert_eq!(clinic.transport.registered_peers(), 0);
}

#[tokio::test]
async fn doctor_dials_when_media_arrives_late() {
    let clinic = Clinic::new();

    let mut patient = clinic.join(Role::Callee);
    reach(&mut patient, CallStatus::WaitingForPeer).await;

    let (devices, gate) = VirtualDevices::new().gated();
    let mut doctor = clinic.join_with(Role::Caller, devices);
    let view = reach(&mut doctor, CallStatus::WaitingForPeer).await;
    assert!(view.local_preview.is_none());
    assert_eq!(clinic.transport.calls_placed(), 0);

    gate.notify_one();
    reach(&mut doctor, CallStatus::Connected).await;
    reach(&mut patient, CallStatus::Connected).await;
    assert_eq!(clinic.transport.calls_placed(), 1);

    leave(doctor).await;
    leave(patient).await;
}

#[tokio::test]
async fn patient_answers_with_media_captured_after_the_offer() {
    let clinic = Clinic::new();

    let (devices, gate) = VirtualDevices::new().gated();
    let mut patient = clinic.join_with(Role::Callee, devices);
    reach(&mut patient, CallStatus::WaitingForPeer).await;

    let mut doctor = clinic.join(Role::Caller);
    let view = reach(&mut patient, CallStatus::Incoming).await;
    assert!(matches!(view.phase, CallPhase::Ringing { .. }));
    assert_eq!(doctor.current().status, CallStatus::Calling);

    gate.notify_one();
    let patient_view = reach(&mut patient, CallStatus::Connected).await;
    let doctor_view = media_flowing(&mut doctor).await;
    let remote = doctor_view.remote.unwrap();
    assert!(remote.same_stream(&patient_view.local_preview.unwrap()));
    assert_eq!(clinic.transport.calls_placed(), 1);

    leave(doctor).await;
    leave(patient).await;
}

// ============================================================================
// Roles and extra offers
// ============================================================================

#[tokio::test]
async fn patient_never_dials_a_known_doctor() {
    let clinic = Clinic::new();
    let doctor = clinic.transport.open().await.unwrap();
    let mut doctor_incoming = doctor.incoming;
    clinic
        .backend
        .update_row(
            TABLE,
            SESSION,
            row(json!({"doctor_peer_id": doctor.endpoint.identity().as_str()})),
        )
        .await
        .unwrap();

    let mut patient = clinic.join(Role::Callee);
    reach(&mut patient, CallStatus::WaitingForPeer).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(clinic.transport.calls_placed(), 0);
    assert!(doctor_incoming.try_recv().is_err());
    assert_eq!(patient.current().status, CallStatus::WaitingForPeer);

    leave(patient).await;
    doctor.endpoint.destroy().await;
}

#[tokio::test]
async fn extra_offer_is_rejected_without_touching_the_call() {
    let clinic = Clinic::new();
    let mut patient = clinic.join(Role::Callee);
    let mut doctor = clinic.join(Role::Caller);
    let patient_view = reach(&mut patient, CallStatus::Connected).await;
    reach(&mut doctor, CallStatus::Connected).await;

    let intruder = clinic.transport.open().await.unwrap();
    let target: PeerId = patient_view.identity.unwrap();
    let mut offer = intruder
        .endpoint
        .place_call(&target, &MediaStream::new(&[TrackKind::Audio]))
        .await
        .unwrap();
    let mut events = offer.take_events().unwrap();
    let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
    assert!(matches!(event, Some(CallEvent::Closed)));

    assert_eq!(patient.current().status, CallStatus::Connected);
    assert_eq!(doctor.current().status, CallStatus::Connected);

    intruder.endpoint.destroy().await;
    leave(doctor).await;
    leave(patient).await;
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn establishment_error_shows_call_failed_without_retry() {
    let clinic = Clinic::new();
    clinic.transport.set_fail_calls(true);

    let mut patient = clinic.join(Role::Callee);
    reach(&mut patient, CallStatus::WaitingForPeer).await;
    let mut doctor = clinic.join(Role::Caller);
    let view = reach(&mut doctor, CallStatus::CallFailed).await;
    assert!(matches!(view.phase, CallPhase::Ended(EndReason::Failed(_))));

    // ещё одно обновление записи не запускает повторный звонок
    clinic
        .backend
        .update_row(TABLE, SESSION, row(json!({"call_status": "requested"})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(clinic.transport.calls_placed(), 1);
    assert_eq!(patient.current().status, CallStatus::WaitingForPeer);

    let local = view.local_preview.unwrap();
    assert!(matches!(leave(doctor).await, EndReason::Failed(_)));
    assert_eq!(local.live_track_count(), 0);
    leave(patient).await;
}

#[tokio::test]
async fn denied_camera_shows_media_error() {
    let clinic = Clinic::new();
    let mut doctor = clinic.join_with(Role::Caller, VirtualDevices::new().denied());
    let view = reach(&mut doctor, CallStatus::MediaError).await;
    assert_eq!(view.status.to_string(), "Error accessing camera");
    assert!(view.local_preview.is_none());
    leave(doctor).await;
    assert_eq!(clinic.transport.registered_peers(), 0);
}

#[tokio::test]
async fn unreadable_record_shows_signaling_error() {
    let clinic = Clinic::new();
    clinic.backend.set_fail_reads(true);
    let mut doctor = clinic.join(Role::Caller);
    reach(&mut doctor, CallStatus::SignalingError).await;
    assert_eq!(clinic.transport.calls_placed(), 0);
    leave(doctor).await;
    assert_eq!(clinic.backend.subscriber_count(TABLE, SESSION), 0);
}

#[tokio::test]
async fn unknown_session_shows_signaling_error() {
    let clinic = Clinic::new();
    let mut patient = CallSession::new(
        SessionParams {
            role: Role::Callee,
            session_id: Some("apt-missing".into()),
            constraints: MediaConstraints::default(),
        },
        clinic.deps(VirtualDevices::new()),
    )
    .spawn();
    reach(&mut patient, CallStatus::SignalingError).await;
    leave(patient).await;
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn record_marked_ended_hangs_up_both_sides() {
    let clinic = Clinic::new();
    let mut patient = clinic.join(Role::Callee);
    let mut doctor = clinic.join(Role::Caller);
    reach(&mut doctor, CallStatus::Connected).await;
    reach(&mut patient, CallStatus::Connected).await;

    clinic
        .backend
        .update_row(TABLE, SESSION, row(json!({"call_status": "ended"})))
        .await
        .unwrap();

    let doctor_view = reach(&mut doctor, CallStatus::CallEnded).await;
    reach(&mut patient, CallStatus::CallEnded).await;
    assert_eq!(doctor_view.phase, CallPhase::Ended(EndReason::RemoteHangUp));

    leave(doctor).await;
    leave(patient).await;
    assert_eq!(clinic.transport.registered_peers(), 0);
}

#[tokio::test]
async fn mute_and_camera_toggles_leave_the_call_alone() {
    let clinic = Clinic::new();
    let mut patient = clinic.join(Role::Callee);
    let mut doctor = clinic.join(Role::Caller);
    let view = reach(&mut doctor, CallStatus::Connected).await;
    reach(&mut patient, CallStatus::Connected).await;
    let before = clinic.backend.row(TABLE, SESSION);

    doctor.control.toggle_audio();
    doctor.control.toggle_video();
    let muted = tokio::time::timeout(
        WAIT,
        doctor.wait_for(|v| !v.audio_enabled && !v.video_enabled),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(muted.status, CallStatus::Connected);
    let local = view.local_preview.unwrap();
    assert!(!local.is_enabled(TrackKind::Audio));
    assert_eq!(local.live_track_count(), 2);
    assert_eq!(clinic.backend.row(TABLE, SESSION), before);
    assert_eq!(clinic.transport.calls_placed(), 1);

    leave(doctor).await;
    leave(patient).await;
}

#[tokio::test]
async fn exit_while_waiting_releases_everything() {
    let clinic = Clinic::new();
    let mut doctor = clinic.join(Role::Caller);
    let view = reach(&mut doctor, CallStatus::WaitingForPeer).await;
    let _ = tokio::time::timeout(WAIT, doctor.wait_for(|v| v.local_preview.is_some())).await;
    let local = doctor.current().local_preview.unwrap();
    assert!(view.identity.is_some());

    assert_eq!(leave(doctor).await, EndReason::Exit);
    assert_eq!(local.live_track_count(), 0);
    assert_eq!(clinic.backend.subscriber_count(TABLE, SESSION), 0);
    assert_eq!(clinic.transport.registered_peers(), 0);
    // без звонка запись не трогается
    assert_eq!(clinic.record_field("call_status"), Some(json!("requested")));
}

// ============================================================================
// Re-entry
// ============================================================================

#[tokio::test]
async fn patient_returning_after_exit_is_called_once() {
    let clinic = Clinic::new();

    let mut patient = clinic.join(Role::Callee);
    reach(&mut patient, CallStatus::WaitingForPeer).await;
    field_settles(&clinic, "patient_peer_id", published).await;
    assert_eq!(leave(patient).await, EndReason::Exit);
    assert_eq!(clinic.record_field("patient_peer_id"), Some(Value::Null));

    // врач не видит ушедшего пациента и не звонит в пустоту
    let mut doctor = clinic.join(Role::Caller);
    reach(&mut doctor, CallStatus::WaitingForPeer).await;
    let _ = tokio::time::timeout(WAIT, doctor.wait_for(|v| v.local_preview.is_some())).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(clinic.transport.calls_placed(), 0);
    assert_eq!(doctor.current().status, CallStatus::WaitingForPeer);

    let mut patient = clinic.join(Role::Callee);
    let patient_view = media_flowing(&mut patient).await;
    media_flowing(&mut doctor).await;
    assert_eq!(clinic.transport.calls_placed(), 1);
    assert_eq!(
        clinic.record_field("patient_peer_id"),
        patient_view.identity.as_ref().map(|id| json!(id.as_str()))
    );

    leave(doctor).await;
    leave(patient).await;
    assert_eq!(clinic.transport.registered_peers(), 0);
}

#[tokio::test]
async fn both_rejoin_after_an_ended_call() {
    let clinic = Clinic::new();

    let mut patient = clinic.join(Role::Callee);
    let mut doctor = clinic.join(Role::Caller);
    reach(&mut doctor, CallStatus::Connected).await;
    reach(&mut patient, CallStatus::Connected).await;
    doctor.control.hang_up();
    reach(&mut patient, CallStatus::CallEnded).await;
    leave(doctor).await;
    leave(patient).await;
    assert_eq!(clinic.record_field("call_status"), Some(json!("ended")));
    assert_eq!(clinic.record_field("doctor_peer_id"), Some(Value::Null));
    assert_eq!(clinic.record_field("patient_peer_id"), Some(Value::Null));

    // "ended" от прошлого звонка не завершает новый
    let mut doctor = clinic.join(Role::Caller);
    reach(&mut doctor, CallStatus::WaitingForPeer).await;
    let mut patient = clinic.join(Role::Callee);
    media_flowing(&mut doctor).await;
    media_flowing(&mut patient).await;
    assert_eq!(clinic.transport.calls_placed(), 2);
    field_settles(&clinic, "call_status", |v| v == Some(&json!("confirmed"))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(doctor.current().status, CallStatus::Connected);
    assert_eq!(patient.current().status, CallStatus::Connected);

    leave(doctor).await;
    leave(patient).await;
}

#[tokio::test]
async fn stale_record_from_a_crashed_visit_is_overwritten() {
    let clinic = Clinic::new();
    let ghost = clinic.transport.open().await.unwrap();
    clinic
        .backend
        .update_row(
            TABLE,
            SESSION,
            row(json!({
                "patient_peer_id": ghost.endpoint.identity().as_str(),
                "call_status": "ended",
            })),
        )
        .await
        .unwrap();
    ghost.endpoint.destroy().await;

    // первым читается устаревший идентификатор: звонок на него падает
    let mut doctor = clinic.join(Role::Caller);
    reach(&mut doctor, CallStatus::CallFailed).await;
    leave(doctor).await;

    // пациент вернулся и перезаписал своё поле, статус всё ещё "ended"
    let mut patient = clinic.join(Role::Callee);
    let view = reach(&mut patient, CallStatus::WaitingForPeer).await;
    let fresh = view.identity.map(|id| json!(id.as_str()));
    field_settles(&clinic, "patient_peer_id", |v| v == fresh.as_ref()).await;
    assert_eq!(clinic.record_field("call_status"), Some(json!("ended")));

    let mut doctor = clinic.join(Role::Caller);
    media_flowing(&mut doctor).await;
    media_flowing(&mut patient).await;
    assert_eq!(clinic.transport.calls_placed(), 2);
    field_settles(&clinic, "call_status", |v| v == Some(&json!("confirmed"))).await;

    leave(doctor).await;
    leave(patient).await;
}
