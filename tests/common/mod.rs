//! Общие заготовки для интеграционных тестов: движок в памяти и
//! мок сигнального сервера на axum.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use bytes::Bytes;
use meetup_relay_lib::error::{RelayError, RelayResult};
use meetup_relay_lib::peer::{
    AuxChannel, ConnectivityState, GatheringComplete, InboundTrack, MediaKind, OutboundTrack,
    PeerTransport, SessionDescription, TransportEngine,
};
use meetup_relay_lib::session::Session;
use meetup_relay_lib::RelayConfig;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;

pub const FAST: Duration = Duration::from_millis(10);

/// Конфиг с короткими паузами
pub fn fast_config(connect_timeout: Duration) -> RelayConfig {
    RelayConfig {
        connect_timeout,
        poll_interval: FAST,
        engine_retry_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

/// Ждёт выполнения условия, не дольше секунды
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(FAST).await;
    }
    cond()
}

// ── движок ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeEngine {
    /// Транспорты, которые будут выданы по порядку; дальше создаются пустые
    pub queue: Mutex<VecDeque<Arc<FakeTransport>>>,
    pub created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeEngine {
    pub fn with(transports: Vec<Arc<FakeTransport>>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(transports.into()),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> Vec<Arc<FakeTransport>> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportEngine for FakeEngine {
    async fn create_context(&self, tag: &str) -> RelayResult<Arc<dyn PeerTransport>> {
        let transport = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| FakeTransport::scripted(vec![]));
        *transport.tag.lock().unwrap() = tag.to_string();
        self.created.lock().unwrap().push(transport.clone());
        let transport: Arc<dyn PeerTransport> = transport;
        Ok(transport)
    }
}

/// Транспорт, который после установки обоих описаний выдаёт заранее
/// заданную последовательность событий связности
#[derive(Default)]
pub struct FakeTransport {
    pub tag: Mutex<String>,
    pub script: Vec<ConnectivityState>,
    pub offer_failures: AtomicU32,
    pub offers_created: AtomicU32,
    pub closes: AtomicU32,
    pub local: Mutex<Option<SessionDescription>>,
    pub remote: Mutex<Option<SessionDescription>>,
    pub audio: Arc<FakeTrack>,
    pub video: Arc<FakeTrack>,
    pub aux: Arc<FakeAux>,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectivityState>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Arc<dyn InboundTrack>>>>,
    emitted: AtomicBool,
}

impl FakeTransport {
    pub fn scripted(script: Vec<ConnectivityState>) -> Arc<Self> {
        Arc::new(Self {
            script,
            audio: Arc::new(FakeTrack::new(MediaKind::Audio)),
            video: Arc::new(FakeTrack::new(MediaKind::Video)),
            ..Default::default()
        })
    }

    pub fn failing_offers(script: Vec<ConnectivityState>, failures: u32) -> Arc<Self> {
        let transport = Self::scripted(script);
        transport.offer_failures.store(failures, Ordering::SeqCst);
        transport
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub fn local(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    /// Отдаёт событие так, как это сделал бы движок
    pub fn emit(&self, state: ConnectivityState) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(state);
        }
    }

    /// Имитирует появление входящего трека удалённой стороны
    pub fn push_inbound(&self, track: Arc<dyn InboundTrack>) {
        if let Some(tracks) = self.inbound.lock().unwrap().as_ref() {
            let _ = tracks.send(track);
        }
    }

    fn maybe_run_script(&self) {
        let both = self.local.lock().unwrap().is_some() && self.remote.lock().unwrap().is_some();
        if both && !self.emitted.swap(true, Ordering::SeqCst) {
            for state in &self.script {
                self.emit(*state);
            }
        }
    }

    fn tag(&self) -> String {
        self.tag.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_outbound_track(&self, kind: MediaKind) -> RelayResult<Arc<dyn OutboundTrack>> {
        let track: Arc<dyn OutboundTrack> = match kind {
            MediaKind::Audio => self.audio.clone(),
            MediaKind::Video => self.video.clone(),
        };
        Ok(track)
    }

    async fn create_aux_channel(&self) -> RelayResult<Arc<dyn AuxChannel>> {
        let aux: Arc<dyn AuxChannel> = self.aux.clone();
        Ok(aux)
    }

    async fn create_offer(&self) -> RelayResult<SessionDescription> {
        let left = self.offer_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.offer_failures.store(left - 1, Ordering::SeqCst);
            return Err(RelayError::Transport("offer not ready".into()));
        }
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("offer-{}", self.tag())))
    }

    async fn create_answer(&self) -> RelayResult<SessionDescription> {
        if self.remote.lock().unwrap().is_none() {
            return Err(RelayError::Transport("no remote description".into()));
        }
        Ok(SessionDescription::answer(format!("answer-{}", self.tag())))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> RelayResult<()> {
        *self.local.lock().unwrap() = Some(desc);
        self.maybe_run_script();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> RelayResult<()> {
        *self.remote.lock().unwrap() = Some(desc);
        self.maybe_run_script();
        Ok(())
    }

    async fn gathering_complete(&self) -> GatheringComplete {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(());
        rx
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local()
    }

    fn subscribe_connectivity(&self, events: mpsc::UnboundedSender<ConnectivityState>) {
        *self.events.lock().unwrap() = Some(events);
    }

    fn subscribe_inbound_tracks(&self, tracks: mpsc::UnboundedSender<Arc<dyn InboundTrack>>) {
        *self.inbound.lock().unwrap() = Some(tracks);
    }

    async fn close(&self) -> RelayResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    Closed,
    Broken,
}

/// Исходящий трек, запоминающий всё записанное
pub struct FakeTrack {
    kind: MediaKind,
    pub written: Mutex<Vec<Vec<u8>>>,
    failure: Option<WriteFailure>,
}

impl FakeTrack {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            written: Mutex::new(Vec::new()),
            failure: None,
        }
    }

    /// Трек, каждая запись в который завершается ошибкой
    pub fn failing(kind: MediaKind, failure: WriteFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(kind)
        }
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

impl Default for FakeTrack {
    fn default() -> Self {
        Self::new(MediaKind::Audio)
    }
}

#[async_trait]
impl OutboundTrack for FakeTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn write_packet(&self, packet: &[u8]) -> RelayResult<usize> {
        match self.failure {
            Some(WriteFailure::Closed) => return Err(RelayError::TrackClosed),
            Some(WriteFailure::Broken) => return Err(RelayError::Transport("congested".into())),
            None => {}
        }
        self.written.lock().unwrap().push(packet.to_vec());
        Ok(packet.len())
    }
}

#[derive(Default)]
pub struct FakeAux {
    pub closes: AtomicU32,
    messages: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl FakeAux {
    pub fn deliver(&self, msg: &'static str) {
        if let Some(messages) = self.messages.lock().unwrap().as_ref() {
            let _ = messages.send(Bytes::from_static(msg.as_bytes()));
        }
    }
}

#[async_trait]
impl AuxChannel for FakeAux {
    fn subscribe_messages(&self, messages: mpsc::UnboundedSender<Bytes>) {
        *self.messages.lock().unwrap() = Some(messages);
    }

    async fn close(&self) -> RelayResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Входящий трек, которому пакеты подаёт тест
pub struct FakeInboundTrack {
    kind: MediaKind,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

impl FakeInboundTrack {
    pub fn new(kind: MediaKind) -> (Arc<Self>, mpsc::UnboundedSender<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let track = Arc::new(Self {
            kind,
            packets: tokio::sync::Mutex::new(rx),
        });
        (track, tx)
    }
}

#[async_trait]
impl InboundTrack for FakeInboundTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn read_packet(&self) -> RelayResult<Packet> {
        self.packets
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| RelayError::Transport("track ended".into()))
    }
}

// ── реестр ───────────────────────────────────────────────────────────

/// Сессия со всеми шестью ручками; sink-и смотрят на `sink_addr`
pub async fn ready_session(
    transport: Arc<FakeTransport>,
    sink_addr: SocketAddr,
) -> (Session, Arc<UdpSocket>, Arc<UdpSocket>) {
    let audio_sink = Arc::new(dial(sink_addr).await);
    let video_sink = Arc::new(dial(sink_addr).await);
    let mut session = Session::new(
        transport.tag(),
        transport.clone(),
        transport.audio.clone(),
        transport.video.clone(),
        transport.aux.clone(),
    );
    session.attach_sinks(Some(audio_sink.clone()), Some(video_sink.clone()));
    (session, audio_sink, video_sink)
}

async fn dial(addr: SocketAddr) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(addr).await.unwrap();
    socket
}

// ── сигнальный сервер ────────────────────────────────────────────────

#[derive(Default)]
pub struct MockRelay {
    /// hostId → (description, guestDescription)
    pub entries: Mutex<HashMap<String, (String, String)>>,
    pub host_posts: AtomicU32,
    pub guest_posts: AtomicU32,
    pub guest_polls: AtomicU32,
}

impl MockRelay {
    pub fn host_posts(&self) -> u32 {
        self.host_posts.load(Ordering::SeqCst)
    }

    pub fn entry(&self, host_id: &str) -> Option<(String, String)> {
        self.entries.lock().unwrap().get(host_id).cloned()
    }

    pub fn set_guest_description(&self, host_id: &str, value: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(host_id) {
            entry.1 = value.to_string();
        }
    }
}

#[derive(Deserialize)]
struct HostPost {
    id: String,
    description: String,
}

#[derive(Deserialize)]
struct HostQuery {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuestPost {
    host_id: String,
    guest_description: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuestQuery {
    host_id: String,
}

async fn post_host(State(relay): State<Arc<MockRelay>>, Json(body): Json<HostPost>) -> StatusCode {
    relay.host_posts.fetch_add(1, Ordering::SeqCst);
    relay
        .entries
        .lock()
        .unwrap()
        .insert(body.id, (body.description, String::new()));
    StatusCode::OK
}

async fn get_host(
    State(relay): State<Arc<MockRelay>>,
    Query(query): Query<HostQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match relay.entry(&query.id) {
        Some((description, _)) => Ok(Json(serde_json::json!({ "description": description }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn post_guest(
    State(relay): State<Arc<MockRelay>>,
    Json(body): Json<GuestPost>,
) -> StatusCode {
    relay.guest_posts.fetch_add(1, Ordering::SeqCst);
    match relay.entries.lock().unwrap().get_mut(&body.host_id) {
        Some(entry) => {
            entry.1 = body.guest_description;
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn get_guest(
    State(relay): State<Arc<MockRelay>>,
    Query(query): Query<GuestQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    relay.guest_polls.fetch_add(1, Ordering::SeqCst);
    match relay.entry(&query.host_id) {
        Some((_, guest)) => Ok(Json(serde_json::json!({ "guestDescription": guest }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// Поднимает мок на эфемерном порту и возвращает его базовый URL
pub async fn start_mock_relay() -> (String, Arc<MockRelay>) {
    let relay = Arc::new(MockRelay::default());
    let app = axum::Router::new()
        .route("/api/host", axum::routing::get(get_host).post(post_host))
        .route("/api/guest", axum::routing::get(get_guest).post(post_guest))
        .with_state(relay.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/"), relay)
}
