//! Фасад транспортного движка.
//!
//! Контроллер, реестр и ретранслятор работают только через эти трейты;
//! реализация на webrtc-rs лежит в `peer::connection`, тесты подставляют
//! свою, in-memory.

use crate::error::RelayResult;
use crate::peer::types::{ConnectivityState, MediaKind, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;

/// Срабатывает один раз, когда сбор ICE кандидатов завершён
pub type GatheringComplete = mpsc::Receiver<()>;

/// Создаёт транспортные контексты, по одному на попытку звонка
#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn create_context(&self, tag: &str) -> RelayResult<Arc<dyn PeerTransport>>;
}

/// Один защищённый транспортный контекст (peer connection)
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_outbound_track(&self, kind: MediaKind) -> RelayResult<Arc<dyn OutboundTrack>>;

    async fn create_aux_channel(&self) -> RelayResult<Arc<dyn AuxChannel>>;

    async fn create_offer(&self) -> RelayResult<SessionDescription>;

    async fn create_answer(&self) -> RelayResult<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> RelayResult<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> RelayResult<()>;

    /// Нужно запросить до `set_local_description`, иначе событие можно пропустить
    async fn gathering_complete(&self) -> GatheringComplete;

    async fn local_description(&self) -> Option<SessionDescription>;

    /// События связности приходят в канал в порядке их возникновения
    fn subscribe_connectivity(&self, events: mpsc::UnboundedSender<ConnectivityState>);

    fn subscribe_inbound_tracks(&self, tracks: mpsc::UnboundedSender<Arc<dyn InboundTrack>>);

    /// Диагностика выбранной пары кандидатов
    async fn dump_stats(&self, _moment: &str) {}

    async fn close(&self) -> RelayResult<()>;
}

/// Исходящий трек: принимает уже готовые RTP пакеты
#[async_trait]
pub trait OutboundTrack: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// `RelayError::TrackClosed`, если трек больше не принимает данные
    async fn write_packet(&self, packet: &[u8]) -> RelayResult<usize>;
}

/// Входящий трек удалённой стороны
#[async_trait]
pub trait InboundTrack: Send + Sync {
    fn kind(&self) -> MediaKind;

    async fn read_packet(&self) -> RelayResult<Packet>;
}

/// Вспомогательный упорядоченный канал данных
#[async_trait]
pub trait AuxChannel: Send + Sync {
    fn subscribe_messages(&self, messages: mpsc::UnboundedSender<Bytes>);

    async fn close(&self) -> RelayResult<()>;
}
