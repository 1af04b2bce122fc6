use crate::peer::engine::{AuxChannel, OutboundTrack, PeerTransport};
use crate::peer::types::MediaKind;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::warn;

/// Одна попытка звонка / установленное соединение.
///
/// Все шесть ручек должны быть на месте, чтобы сессия участвовала в
/// ретрансляции; любая пустая означает, что сессия ещё собирается или уже
/// закрыта.
#[derive(Default)]
pub struct Session {
    pub connection_id: String,
    pub(crate) transport: Option<Arc<dyn PeerTransport>>,
    pub(crate) local_audio: Option<Arc<dyn OutboundTrack>>,
    pub(crate) local_video: Option<Arc<dyn OutboundTrack>>,
    pub(crate) aux_channel: Option<Arc<dyn AuxChannel>>,
    pub(crate) remote_audio_sink: Option<Arc<UdpSocket>>,
    pub(crate) remote_video_sink: Option<Arc<UdpSocket>>,
}

impl Session {
    /// Сессия сразу после открытия контекста: sink-и подключаются позже
    pub fn new(
        connection_id: String,
        transport: Arc<dyn PeerTransport>,
        local_audio: Arc<dyn OutboundTrack>,
        local_video: Arc<dyn OutboundTrack>,
        aux_channel: Arc<dyn AuxChannel>,
    ) -> Self {
        Self {
            connection_id,
            transport: Some(transport),
            local_audio: Some(local_audio),
            local_video: Some(local_video),
            aux_channel: Some(aux_channel),
            remote_audio_sink: None,
            remote_video_sink: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.transport.is_some()
            && self.local_audio.is_some()
            && self.local_video.is_some()
            && self.aux_channel.is_some()
            && self.remote_audio_sink.is_some()
            && self.remote_video_sink.is_some()
    }

    pub fn is_live(&self) -> bool {
        self.transport.is_some()
    }

    pub fn outbound_track(&self, kind: MediaKind) -> Option<Arc<dyn OutboundTrack>> {
        match kind {
            MediaKind::Audio => self.local_audio.clone(),
            MediaKind::Video => self.local_video.clone(),
        }
    }

    pub fn remote_sink(&self, kind: MediaKind) -> Option<Arc<UdpSocket>> {
        match kind {
            MediaKind::Audio => self.remote_audio_sink.clone(),
            MediaKind::Video => self.remote_video_sink.clone(),
        }
    }

    pub fn attach_sinks(
        &mut self,
        audio: Option<Arc<UdpSocket>>,
        video: Option<Arc<UdpSocket>>,
    ) {
        self.remote_audio_sink = audio;
        self.remote_video_sink = video;
    }

    /// Обнуляет все поля. Повторный вызов ничего не делает и возвращает `None`.
    pub(crate) fn take_handles(&mut self) -> Option<ReleasedSession> {
        let transport = self.transport.take()?;
        let released = ReleasedSession {
            transport,
            aux_channel: self.aux_channel.take(),
            remote_audio_sink: self.remote_audio_sink.take(),
            remote_video_sink: self.remote_video_sink.take(),
        };
        self.local_audio = None;
        self.local_video = None;
        Some(released)
    }
}

/// Ручки, изъятые из сессии под блокировкой; закрываются уже без неё
pub struct ReleasedSession {
    transport: Arc<dyn PeerTransport>,
    aux_channel: Option<Arc<dyn AuxChannel>>,
    remote_audio_sink: Option<Arc<UdpSocket>>,
    remote_video_sink: Option<Arc<UdpSocket>>,
}

impl ReleasedSession {
    pub async fn release(self, index: usize) {
        if let Some(dc) = self.aux_channel {
            if let Err(e) = dc.close().await {
                warn!(conn = index, "aux channel close: {e}");
            }
        }

        if let Err(e) = self.transport.close().await {
            warn!(conn = index, "transport close: {e}");
        }

        // сокеты закрываются вместе с последней ссылкой
        drop(self.remote_audio_sink);
        drop(self.remote_video_sink);
    }
}
