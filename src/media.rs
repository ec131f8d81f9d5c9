use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::utils::random_id;

/// Тип дорожки
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Запрос на захват: какие устройства нужны
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("permission to use camera/microphone was denied")]
    PermissionDenied,

    #[error("no {0:?} device found")]
    NotFound(TrackKind),

    #[error("nothing requested")]
    EmptyConstraints,
}

#[derive(Debug)]
struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

#[derive(Debug)]
struct StreamInner {
    id: String,
    tracks: Vec<MediaTrack>,
}

/// Хэндл на медиапоток. Клоны указывают на одни и те же дорожки,
/// поэтому `stop()` на любом клоне останавливает захват для всех.
#[derive(Debug, Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new(kinds: &[TrackKind]) -> Self {
        let tracks = kinds
            .iter()
            .map(|kind| MediaTrack {
                id: random_id(),
                kind: *kind,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            })
            .collect();
        Self {
            inner: Arc::new(StreamInner {
                id: random_id(),
                tracks,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kinds(&self) -> Vec<TrackKind> {
        self.inner.tracks.iter().map(|t| t.kind).collect()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.inner.tracks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn live_track_count(&self) -> usize {
        self.inner
            .tracks
            .iter()
            .filter(|t| t.live.load(Ordering::SeqCst))
            .count()
    }

    /// Выключает/включает все дорожки данного типа. Звонок не переустанавливается.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.inner.tracks.iter().filter(|t| t.kind == kind) {
            track.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    /// Переключает дорожки типа и возвращает новое состояние
    pub fn toggle(&self, kind: TrackKind) -> bool {
        let enabled = !self.is_enabled(kind);
        self.set_enabled(kind, enabled);
        enabled
    }

    /// true если есть хотя бы одна включённая дорожка данного типа
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.inner
            .tracks
            .iter()
            .any(|t| t.kind == kind && t.enabled.load(Ordering::SeqCst))
    }

    /// Останавливает все дорожки захвата
    pub fn stop(&self) {
        let mut stopped = 0;
        for track in &self.inner.tracks {
            if track.live.swap(false, Ordering::SeqCst) {
                stopped += 1;
            }
        }
        if stopped > 0 {
            debug!(stream = %self.inner.id, stopped, "Stopped capture tracks");
        }
    }

    pub fn same_stream(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Доступ к камере и микрофону
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAccessError>;
}

/// Программные устройства: для тестов и демо-режима
#[derive(Debug)]
pub struct VirtualDevices {
    has_camera: bool,
    has_microphone: bool,
    permission_granted: bool,
    gate: Option<Arc<Notify>>,
}

impl Default for VirtualDevices {
    fn default() -> Self {
        Self {
            has_camera: true,
            has_microphone: true,
            permission_granted: true,
            gate: None,
        }
    }
}

impl VirtualDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_camera(mut self) -> Self {
        self.has_camera = false;
        self
    }

    pub fn without_microphone(mut self) -> Self {
        self.has_microphone = false;
        self
    }

    pub fn denied(mut self) -> Self {
        self.permission_granted = false;
        self
    }

    /// Захват завершится только после `notify_one()` на возвращённом Notify
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }
}

#[async_trait]
impl MediaDevices for VirtualDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAccessError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        if !constraints.video && !constraints.audio {
            return Err(MediaAccessError::EmptyConstraints);
        }
        if !self.permission_granted {
            warn!("Media permission denied");
            return Err(MediaAccessError::PermissionDenied);
        }

        let mut kinds = Vec::new();
        if constraints.video {
            if !self.has_camera {
                return Err(MediaAccessError::NotFound(TrackKind::Video));
            }
            kinds.push(TrackKind::Video);
        }
        if constraints.audio {
            if !self.has_microphone {
                return Err(MediaAccessError::NotFound(TrackKind::Audio));
            }
            kinds.push(TrackKind::Audio);
        }

        let stream = MediaStream::new(&kinds);
        info!(stream = %stream.id(), ?kinds, "Local media acquired");
        Ok(stream)
    }
}
