//! Жизненный цикл звонка.
//!
//! Одна попытка за раз: открыть контекст, обменяться описаниями через
//! сигнальный сервер и дождаться исхода. Уже установленные сессии
//! продолжают ретранслировать в фоне, пока идут следующие попытки.

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::peer::engine::{AuxChannel, OutboundTrack, PeerTransport, TransportEngine};
use crate::peer::types::{ConnectivityState, MediaKind, Role, SessionDescription};
use crate::registry::SessionRegistry;
use crate::relay;
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::signaling::SignalingClient;
use crate::utils::random_id;
use std::fmt;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Чем закончилась попытка
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Connected,
    Disconnected,
    TimedOut,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptOutcome::Connected => "connected",
            AttemptOutcome::Disconnected => "disconnected",
            AttemptOutcome::TimedOut => "timed out",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptReport {
    /// Индекс сессии в реестре
    pub index: usize,
    pub outcome: AttemptOutcome,
}

pub struct SessionController {
    role: Role,
    engine: Arc<dyn TransportEngine>,
    registry: Arc<SessionRegistry>,
    signaling: SignalingClient,
    config: Arc<RelayConfig>,
    engine_policy: RetryPolicy,
}

impl SessionController {
    pub fn new(
        role: Role,
        engine: Arc<dyn TransportEngine>,
        registry: Arc<SessionRegistry>,
        signaling: SignalingClient,
        config: Arc<RelayConfig>,
    ) -> Self {
        let engine_policy = RetryPolicy::unbounded(config.engine_retry_interval);
        Self {
            role,
            engine,
            registry,
            signaling,
            config,
            engine_policy,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Бесконечный цикл попыток. Возвращается только с фатальной ошибкой.
    pub async fn run(&self) -> RelayResult<()> {
        loop {
            match self.run_attempt().await {
                Ok(report) => info!(conn = report.index, "attempt finished: {}", report.outcome),
                Err(e) if e.is_fatal() => {
                    error!("giving up: {e}");
                    return Err(e);
                }
                Err(e) => {
                    warn!("attempt failed: {e}");
                    self.engine_policy.pause().await;
                }
            }
        }
    }

    /// Одна попытка от создания контекста до исхода
    pub async fn run_attempt(&self) -> RelayResult<AttemptReport> {
        let tag = random_id();
        let (session, transport, aux) = self.open_session(&tag).await?;
        let index = self.registry.append(session);
        info!(conn = index, "{} session {tag} created", self.role);

        let outcomes = self.spawn_monitor(index, &transport);
        self.wire_session(index, &transport, aux).await;

        // всё, что логирует сигнальный клиент, получает номер сессии
        let negotiation = self
            .negotiate(index, transport.as_ref(), outcomes)
            .instrument(info_span!("attempt", conn = index));
        match negotiation.await {
            Ok(outcome) => Ok(AttemptReport { index, outcome }),
            Err(e) => {
                if let Some(released) = self.registry.close_at(index) {
                    released.release(index).await;
                }
                Err(e)
            }
        }
    }

    /// Контекст, два исходящих трека и служебный канал. Повторяется целиком.
    async fn open_session(&self, tag: &str) -> RelayResult<OpenedSession> {
        let engine = self.engine.as_ref();
        self.engine_policy
            .retry("creating session", move || async move {
                let transport = engine.create_context(tag).await?;
                match register_media(transport.as_ref()).await {
                    Ok((audio, video, aux)) => {
                        let session = Session::new(
                            tag.to_string(),
                            transport.clone(),
                            audio,
                            video,
                            aux.clone(),
                        );
                        Ok((session, transport, aux))
                    }
                    Err(e) => {
                        if let Err(close_err) = transport.close().await {
                            warn!("closing half-built session {tag}: {close_err}");
                        }
                        Err(e)
                    }
                }
            })
            .await
    }

    /// Переводит события связности в сигналы исхода: `true` на каждое
    /// Connected, `false` ровно один раз при первом терминальном событии.
    fn spawn_monitor(
        &self,
        index: usize,
        transport: &Arc<dyn PeerTransport>,
    ) -> mpsc::Receiver<bool> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        transport.subscribe_connectivity(events_tx);

        let (outcome_tx, outcome_rx) = mpsc::channel(8);
        let registry = self.registry.clone();
        let transport = transport.clone();

        tokio::spawn(async move {
            while let Some(state) = events_rx.recv().await {
                info!(conn = index, "ICE connection state changed: {state}");
                if state == ConnectivityState::Connected {
                    transport.dump_stats("connected").await;
                    let _ = outcome_tx.send(true).await;
                } else if state.is_terminal() {
                    // сессию могли уже закрыть ретранслятор или таймаут
                    if let Some(released) = registry.close_at(index) {
                        transport.dump_stats(&state.to_string()).await;
                        let _ = outcome_tx.send(false).await;
                        released.release(index).await;
                    }
                    break;
                }
            }
            debug!(conn = index, "connectivity monitor stopped");
        });

        outcome_rx
    }

    /// Sink-и, входящие треки и сообщения служебного канала
    async fn wire_session(
        &self,
        index: usize,
        transport: &Arc<dyn PeerTransport>,
        aux: Arc<dyn AuxChannel>,
    ) {
        let audio = self.dial_sink(index, MediaKind::Audio).await;
        let video = self.dial_sink(index, MediaKind::Video).await;
        if !self.registry.attach_sinks(index, audio, video) {
            warn!(conn = index, "session closed before sinks were attached");
            return;
        }

        let (tracks_tx, mut tracks_rx) = mpsc::unbounded_channel();
        transport.subscribe_inbound_tracks(tracks_tx);
        let registry = self.registry.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            while let Some(track) = tracks_rx.recv().await {
                let kind = track.kind();
                info!(conn = index, "got remote {kind} track");
                tokio::spawn(relay::forward_remote_track(
                    registry.clone(),
                    index,
                    track,
                    config.payload_type(kind),
                ));
            }
        });

        let (messages_tx, mut messages_rx) = mpsc::unbounded_channel();
        aux.subscribe_messages(messages_tx);
        tokio::spawn(async move {
            while let Some(msg) = messages_rx.recv().await {
                info!(conn = index, "aux message: {}", String::from_utf8_lossy(&msg));
            }
        });
    }

    async fn dial_sink(&self, index: usize, kind: MediaKind) -> Option<Arc<UdpSocket>> {
        let addr = self.config.sink_addr(kind);
        match relay::dial_sink(addr).await {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                warn!(conn = index, "dialing {kind} sink {addr}: {e}");
                None
            }
        }
    }

    /// Обмен описаниями и ожидание исхода
    async fn negotiate(
        &self,
        index: usize,
        pc: &dyn PeerTransport,
        mut outcomes: mpsc::Receiver<bool>,
    ) -> RelayResult<AttemptOutcome> {
        let policy = &self.engine_policy;

        let draft = match self.role {
            Role::Host => policy.retry("creating offer", move || pc.create_offer()).await?,
            Role::Guest => {
                let offer = self.signaling.await_host_offer().await?;
                debug!(conn = index, "got host offer");
                policy
                    .retry("setting remote description", move || {
                        pc.set_remote_description(offer.clone())
                    })
                    .await?;
                policy.retry("creating answer", move || pc.create_answer()).await?
            }
        };

        let mut gathered = pc.gathering_complete().await;
        policy
            .retry("setting local description", move || {
                pc.set_local_description(draft.clone())
            })
            .await?;
        if gathered.recv().await.is_none() {
            debug!(conn = index, "gathering notifier dropped");
        }
        debug!(conn = index, "candidate gathering complete");

        let local = policy
            .retry("reading local description", move || async move {
                pc.local_description()
                    .await
                    .ok_or(RelayError::MissingLocalDescription)
            })
            .await?;

        self.exchange(index, pc, &local).await?;

        Ok(self.await_outcome(index, &mut outcomes).await)
    }

    async fn exchange(
        &self,
        index: usize,
        pc: &dyn PeerTransport,
        local: &SessionDescription,
    ) -> RelayResult<()> {
        match self.role {
            Role::Host => {
                self.signaling.publish_host_offer(local).await?;
                info!(conn = index, "offer published, waiting for guest");
                let answer = self.signaling.await_guest_answer(local).await?;
                if let Err(e) = pc.set_remote_description(answer).await {
                    warn!(conn = index, "while applying guest answer: {e}");
                }
            }
            Role::Guest => {
                self.signaling.publish_guest_answer(local).await?;
                info!(conn = index, "answer published");
            }
        }
        Ok(())
    }

    async fn await_outcome(
        &self,
        index: usize,
        outcomes: &mut mpsc::Receiver<bool>,
    ) -> AttemptOutcome {
        let first = match timeout(self.config.connect_timeout, outcomes.recv()).await {
            Ok(signal) => signal,
            Err(_) => {
                warn!(
                    conn = index,
                    "no connectivity signal within {:?}, abandoning attempt",
                    self.config.connect_timeout
                );
                self.close(index).await;
                return AttemptOutcome::TimedOut;
            }
        };

        match first {
            Some(true) => {}
            Some(false) => return AttemptOutcome::Disconnected,
            None => {
                self.close(index).await;
                return AttemptOutcome::Disconnected;
            }
        }

        if self.role == Role::Host {
            return AttemptOutcome::Connected;
        }

        // гость ждёт второго сигнала, пока звонок не устоится
        match outcomes.recv().await {
            Some(true) => AttemptOutcome::Connected,
            Some(false) => AttemptOutcome::Disconnected,
            None => {
                self.close(index).await;
                AttemptOutcome::Disconnected
            }
        }
    }

    async fn close(&self, index: usize) {
        if let Some(released) = self.registry.close_at(index) {
            released.release(index).await;
        }
    }
}

type OpenedSession = (Session, Arc<dyn PeerTransport>, Arc<dyn AuxChannel>);

type MediaHandles = (
    Arc<dyn OutboundTrack>,
    Arc<dyn OutboundTrack>,
    Arc<dyn AuxChannel>,
);

async fn register_media(transport: &dyn PeerTransport) -> RelayResult<MediaHandles> {
    let audio = transport.add_outbound_track(MediaKind::Audio).await?;
    let video = transport.add_outbound_track(MediaKind::Video).await?;
    let aux = transport.create_aux_channel().await?;
    Ok((audio, video, aux))
}
