pub mod backend;
pub mod config;
pub mod error;
pub mod identity;
pub mod join;
pub mod logger;
pub mod media;
pub mod negotiator;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use error::{Error, Result};
pub use negotiator::{CallPhase, CallStatus, EndReason};
pub use session::{CallControl, CallDeps, CallSession, CallView, SessionHandle, SessionParams};
pub use signaling::Role;

use backend::{MemoryBackend, Row};
use config::{CallConfig, TransportKind};
use media::VirtualDevices;
use peer::{LoopbackTransport, PeerTransport, WebRtcTransport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Сколько демо ждёт соединения; сам автомат таймаутов не имеет
const DEMO_WAIT: Duration = Duration::from_secs(30);

/// Демо: пациент и врач в одном процессе, одна запись приёма
pub async fn run() -> Result<()> {
    let config = CallConfig::load()?;
    config.validate()?;

    let backend = MemoryBackend::new();
    let mut row = Row::new();
    row.insert(config.status_field.clone(), json!("requested"));
    backend.insert_row(&config.table, &config.demo_session, row);

    let transport: Arc<dyn PeerTransport> = match config.transport {
        TransportKind::Loopback => LoopbackTransport::new(),
        TransportKind::Webrtc => WebRtcTransport::new(config.ice_servers.clone()),
    };
    let deps = CallDeps {
        backend: backend.clone(),
        transport,
        devices: Arc::new(VirtualDevices::new()),
        layout: (&config).into(),
    };
    let params = |role| SessionParams {
        role,
        session_id: Some(config.demo_session.clone()),
        constraints: config.constraints(),
    };

    // пациент приходит первым
    let mut patient = CallSession::new(params(Role::Callee), deps.clone()).spawn();
    wait(&mut patient, CallStatus::WaitingForPeer).await?;
    let mut doctor = CallSession::new(params(Role::Caller), deps).spawn();

    let outcome = wait(&mut doctor, CallStatus::Connected).await;
    match &outcome {
        Ok(view) => {
            info!(
                session = %config.demo_session,
                connected_at = ?view.connected_at,
                "Consultation connected"
            );
            wait(&mut patient, CallStatus::Connected).await?;
            doctor.control.hang_up();
            wait(&mut patient, CallStatus::CallEnded).await?;
        }
        Err(e) => error!("Consultation did not connect: {e}"),
    }

    doctor.control.exit();
    patient.control.exit();
    let doctor_end = doctor.join().await;
    let patient_end = patient.join().await;
    info!(?doctor_end, ?patient_end, "Demo finished");

    if let Some(row) = backend.row(&config.table, &config.demo_session) {
        info!(record = %serde_json::Value::Object(row), "Final record");
    }
    outcome.map(|_| ())
}

async fn wait(session: &mut SessionHandle, status: CallStatus) -> Result<CallView> {
    let role = session.current().role;
    let reached = tokio::time::timeout(
        DEMO_WAIT,
        session.wait_for(|v| v.status == status || is_terminal(v.status)),
    )
    .await
    .map_err(|_| Error::CallEstablishment(format!("{role} timed out waiting for {status}")))?;

    match reached {
        Some(view) if view.status == status => Ok(view),
        Some(view) => Err(Error::CallEstablishment(format!(
            "{role} stopped at \"{}\"",
            view.status
        ))),
        None => Err(Error::CallEstablishment(format!("{role} session finished"))),
    }
}

fn is_terminal(status: CallStatus) -> bool {
    matches!(
        status,
        CallStatus::CallFailed
            | CallStatus::CallEnded
            | CallStatus::MediaError
            | CallStatus::SignalingError
    )
}
