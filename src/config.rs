// Конфигурация узла ретрансляции
// Уровень логирования по умолчанию зависит от режима сборки

use crate::error::{RelayError, RelayResult};
use crate::peer::types::{MediaKind, ServerConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "meetup_relay_lib=debug,meetup_relay=debug"; // В режиме отладки подробные логи

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "info"; // В продакшене только info и выше

/// Порты захвата (сюда внешний энкодер шлёт RTP)
pub const AUDIO_CAPTURE_PORT: u16 = 4000;
pub const VIDEO_CAPTURE_PORT: u16 = 4002;

/// Порты локального плеера (сюда уходит медиа удалённой стороны)
pub const AUDIO_SINK_PORT: u16 = 4004;
pub const VIDEO_SINK_PORT: u16 = 4006;

/// Payload type, который ожидает локальный плеер
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
pub const AUDIO_PAYLOAD_TYPE: u8 = 111;

/// UDP MTU для входящих пакетов захвата
pub const CAPTURE_BUFFER_SIZE: usize = 1600;

/// Приёмный буфер сокета захвата (SO_RCVBUF)
pub const CAPTURE_RECV_BUFFER: usize = 300_000;

pub const AUX_CHANNEL_LABEL: &str = "meetupstation";

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub capture_host: IpAddr,
    pub audio_capture_port: u16,
    pub video_capture_port: u16,
    pub sink_host: IpAddr,
    pub audio_sink_port: u16,
    pub video_sink_port: u16,
    pub capture_buffer_size: usize,
    pub capture_recv_buffer: usize,
    /// Пауза после ошибки чтения сокета захвата
    pub capture_error_pause: Duration,
    pub video_payload_type: u8,
    pub audio_payload_type: u8,
    pub aux_channel_label: String,
    /// Сколько ждать первого события ICE после обмена описаниями
    pub connect_timeout: Duration,
    /// Интервал опроса и повторов сигнального сервера
    pub poll_interval: Duration,
    /// Пауза между повторами операций движка
    pub engine_retry_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![ServerConfig {
                id: "default-stun".into(),
                r#type: "stun".into(),
                url: DEFAULT_STUN_URL.into(),
                username: None,
                credential: None,
            }],
            capture_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            audio_capture_port: AUDIO_CAPTURE_PORT,
            video_capture_port: VIDEO_CAPTURE_PORT,
            sink_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            audio_sink_port: AUDIO_SINK_PORT,
            video_sink_port: VIDEO_SINK_PORT,
            capture_buffer_size: CAPTURE_BUFFER_SIZE,
            capture_recv_buffer: CAPTURE_RECV_BUFFER,
            capture_error_pause: Duration::from_millis(100),
            video_payload_type: VIDEO_PAYLOAD_TYPE,
            audio_payload_type: AUDIO_PAYLOAD_TYPE,
            aux_channel_label: AUX_CHANNEL_LABEL.into(),
            connect_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            engine_retry_interval: Duration::from_millis(100),
        }
    }
}

impl RelayConfig {
    /// Значения по умолчанию с переопределениями из окружения
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("MEETUP_ICE_SERVERS") {
            let servers: Vec<ServerConfig> = serde_json::from_str(&raw)
                .map_err(|e| RelayError::Config(format!("MEETUP_ICE_SERVERS: {e}")))?;
            validate_servers(&servers)?;
            config.ice_servers = servers;
        }

        if let Some(port) = parse_var(&lookup, "MEETUP_AUDIO_IN_PORT")? {
            config.audio_capture_port = port;
        }
        if let Some(port) = parse_var(&lookup, "MEETUP_VIDEO_IN_PORT")? {
            config.video_capture_port = port;
        }
        if let Some(port) = parse_var(&lookup, "MEETUP_AUDIO_OUT_PORT")? {
            config.audio_sink_port = port;
        }
        if let Some(port) = parse_var(&lookup, "MEETUP_VIDEO_OUT_PORT")? {
            config.video_sink_port = port;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "MEETUP_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn capture_addr(&self, kind: MediaKind) -> SocketAddr {
        let port = match kind {
            MediaKind::Audio => self.audio_capture_port,
            MediaKind::Video => self.video_capture_port,
        };
        SocketAddr::new(self.capture_host, port)
    }

    pub fn sink_addr(&self, kind: MediaKind) -> SocketAddr {
        let port = match kind {
            MediaKind::Audio => self.audio_sink_port,
            MediaKind::Video => self.video_sink_port,
        };
        SocketAddr::new(self.sink_host, port)
    }

    pub fn payload_type(&self, kind: MediaKind) -> u8 {
        match kind {
            MediaKind::Audio => self.audio_payload_type,
            MediaKind::Video => self.video_payload_type,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> RelayResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RelayError::Config(format!("{key}={raw}: {e}"))),
        None => Ok(None),
    }
}

// Валидация серверов
fn validate_servers(servers: &[ServerConfig]) -> RelayResult<()> {
    for server in servers {
        if server.url.is_empty() {
            return Err(RelayError::Config("ICE server URL cannot be empty".into()));
        }

        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(RelayError::Config(
                "TURN servers require username and credential".into(),
            ));
        }
    }
    Ok(())
}
