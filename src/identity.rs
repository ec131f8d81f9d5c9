use crate::media::{MediaConstraints, MediaDevices};
use crate::peer::transport::PeerTransport;
use crate::session::SessionEvent;
use crate::signaling::{Role, SignalingRelay};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::SendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Захват медиа и регистрация сетевого идентификатора.
/// Обе операции идут параллельно и не ждут друг друга.
pub struct IdentityManager {
    pub devices: Arc<dyn MediaDevices>,
    pub transport: Arc<dyn PeerTransport>,
    pub constraints: MediaConstraints,
    pub role: Role,
    /// Сессия, в запись которой публикуется идентификатор
    pub publish_to: Option<(SignalingRelay, String)>,
}

impl IdentityManager {
    pub fn start(self, events: mpsc::UnboundedSender<SessionEvent>) -> Vec<JoinHandle<()>> {
        let media = {
            let events = events.clone();
            let devices = self.devices.clone();
            let constraints = self.constraints;
            tokio::spawn(async move {
                debug!(?constraints, "Requesting camera and microphone");
                let result = devices.get_user_media(constraints).await;
                if let Err(SendError(SessionEvent::Media(Ok(stream)))) =
                    events.send(SessionEvent::Media(result))
                {
                    // сессия уже закрыта
                    stream.stop();
                }
            })
        };

        let identity = {
            let transport = self.transport.clone();
            let role = self.role;
            let publish_to = self.publish_to;
            tokio::spawn(async move {
                let opened = match transport.open().await {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = events.send(SessionEvent::Identity(Err(e)));
                        return;
                    }
                };
                let endpoint = opened.endpoint.clone();
                let id = endpoint.identity().clone();
                info!(%role, peer = %id, "Network identity registered");

                if events.send(SessionEvent::Identity(Ok(opened))).is_err() {
                    endpoint.destroy().await;
                    return;
                }

                if let Some((relay, session_id)) = publish_to {
                    let result = relay.write_field(&session_id, role, &id).await;
                    if let Err(e) = &result {
                        warn!(session = %session_id, %role, "Failed to publish identity: {e}");
                    }
                    let _ = events.send(SessionEvent::Published(result));
                }
            })
        };

        vec![media, identity]
    }
}
