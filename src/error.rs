use thiserror::Error;

/// Ошибки узла ретрансляции
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("transport engine: {0}")]
    Engine(#[from] webrtc::Error),

    #[error("transport: {0}")]
    Transport(String),

    #[error("track closed")]
    TrackClosed,

    #[error("media packet: {0}")]
    Packet(#[from] webrtc::util::Error),

    #[error("signaling request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("signaling relay answered {0}")]
    UnexpectedStatus(reqwest::StatusCode),

    #[error("session description not available yet")]
    NotReady,

    #[error("no local session description")]
    MissingLocalDescription,

    #[error("malformed session description: {0}")]
    MalformedDescription(String),

    #[error("{what}: gave up after {attempts} attempts")]
    RetriesExhausted { what: String, attempts: u32 },

    #[error("configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Ошибки, после которых процесс не может продолжать работу
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::MalformedDescription(_) | RelayError::RetriesExhausted { .. }
        )
    }

    /// Sink ещё не слушает: такая отправка не считается ошибкой
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, RelayError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused)
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
