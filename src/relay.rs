//! Ретрансляция медиа.
//!
//! Два направления:
//! * захват → все сессии: RTP с локального порта без изменений уходит в
//!   исходящий трек каждой готовой сессии;
//! * сессия → локальный плеер: входящие пакеты удалённой стороны получают
//!   фиксированный payload type и отправляются на sink сессии.

use crate::error::{RelayError, RelayResult};
use crate::peer::engine::InboundTrack;
use crate::peer::types::MediaKind;
use crate::registry::SessionRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use webrtc::rtp::packet::Packet;
use webrtc::util::marshal::{Marshal, Unmarshal};

/// Порт, на который внешний энкодер шлёт RTP.
///
/// Приёмный буфер увеличивается до `recv_buffer` байт, чтобы всплески
/// видео не терялись в ядре; если ОС отказывает, остаётся буфер по умолчанию.
pub async fn bind_capture(addr: SocketAddr, recv_buffer: usize) -> RelayResult<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(recv_buffer) {
        warn!("capture socket {addr}: cannot set receive buffer to {recv_buffer}: {e}");
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let socket = UdpSocket::from_std(socket.into())?;
    info!("listening for local capture on {}", socket.local_addr()?);
    Ok(socket)
}

/// Сокет с эфемерным loopback-портом, подключённый к локальному плееру
pub async fn dial_sink(addr: SocketAddr) -> RelayResult<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

/// Источник пакетов захвата
#[async_trait]
pub trait CaptureSource: Send {
    async fn recv_packet(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

#[async_trait]
impl CaptureSource for UdpSocket {
    async fn recv_packet(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let (n, _) = self.recv_from(buf).await?;
        Ok(n)
    }
}

/// Рассылает каждый пакет захвата во все готовые сессии. Не завершается.
///
/// После ошибки чтения цикл выжидает `error_pause`, чтобы устойчивая
/// ошибка сокета не крутила ядро вхолостую.
pub async fn run_capture_fan_out<S: CaptureSource>(
    registry: Arc<SessionRegistry>,
    kind: MediaKind,
    mut source: S,
    buffer_size: usize,
    error_pause: Duration,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match source.recv_packet(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("{kind} capture read: {e}");
                sleep(error_pause).await;
                continue;
            }
        };

        fan_out_packet(&registry, kind, &buf[..n]).await;
    }
}

/// Один пакет во все цели; ошибка одной сессии не мешает остальным
pub async fn fan_out_packet(registry: &SessionRegistry, kind: MediaKind, packet: &[u8]) {
    for (index, track) in registry.outbound_targets(kind) {
        match track.write_packet(packet).await {
            Ok(_) => {}
            // webrtc-сессии закрываются по событию связности,
            // TrackClosed отдают движки, которые умеют его сообщать
            Err(RelayError::TrackClosed) => {
                warn!(conn = index, "while writing to {kind} track: track closed");
                if let Some(released) = registry.close_at(index) {
                    tokio::spawn(released.release(index));
                }
            }
            Err(e) => warn!(conn = index, "while writing to {kind} track: {e}"),
        }
    }
}

/// Пересобирает пакет с новым payload type; остальные поля не меняются
pub fn retag_packet(mut packet: Packet, payload_type: u8) -> RelayResult<Bytes> {
    packet.header.payload_type = payload_type;
    Ok(packet.marshal()?)
}

/// То же для сырых байтов
pub fn rewrite_payload_type(raw: &[u8], payload_type: u8) -> RelayResult<Bytes> {
    let mut buf = raw;
    let packet = Packet::unmarshal(&mut buf)?;
    retag_packet(packet, payload_type)
}

/// Переносит входящий трек сессии `index` на её локальный sink.
///
/// Завершается, когда сессия перестаёт быть готовой, при ошибке чтения
/// или при ошибке отправки, отличной от "connection refused".
pub async fn forward_remote_track(
    registry: Arc<SessionRegistry>,
    index: usize,
    track: Arc<dyn InboundTrack>,
    payload_type: u8,
) {
    let kind = track.kind();
    let Some(sink) = registry.remote_sink(index, kind) else {
        warn!(conn = index, "no {kind} sink, dropping inbound track");
        return;
    };

    let mut forwarded: u64 = 0;
    loop {
        if !registry.is_ready(index) {
            break;
        }

        let packet = match track.read_packet().await {
            Ok(packet) => packet,
            Err(e) => {
                warn!(conn = index, "{kind} track read: {e}");
                break;
            }
        };

        let bytes = match retag_packet(packet, payload_type) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(conn = index, "{kind} rtp packet marshal: {e}");
                break;
            }
        };

        match sink.send(&bytes).await.map_err(RelayError::from) {
            Ok(_) => forwarded += 1,
            // плеер ещё не слушает
            Err(e) if e.is_connection_refused() => continue,
            Err(e) => {
                warn!(conn = index, "{kind} rtp packet write: {e}");
                break;
            }
        }
    }

    debug!(conn = index, "{kind} forwarding stopped after {forwarded} packets");
}
