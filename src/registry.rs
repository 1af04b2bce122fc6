use crate::peer::engine::OutboundTrack;
use crate::peer::types::MediaKind;
use crate::session::{ReleasedSession, Session};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::UdpSocket;

/// Упорядоченное хранилище сессий под одной блокировкой.
///
/// Индекс сессии стабилен на всё время жизни процесса: закрытые сессии
/// остаются в своих слотах, хранилище не уплотняется.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<Vec<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Session>> {
        // poison игнорируем: слоты меняются только целиком
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, session: Session) -> usize {
        let mut sessions = self.lock();
        sessions.push(session);
        sessions.len() - 1
    }

    /// Количество слотов, включая закрытые
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Выполняет `f` над сессией под блокировкой
    pub fn with_session<R>(&self, index: usize, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.lock().get(index).map(f)
    }

    pub fn for_each(&self, mut f: impl FnMut(usize, &Session)) {
        for (index, session) in self.lock().iter().enumerate() {
            f(index, session);
        }
    }

    pub fn is_ready(&self, index: usize) -> bool {
        self.with_session(index, Session::is_ready).unwrap_or(false)
    }

    pub fn is_live(&self, index: usize) -> bool {
        self.with_session(index, Session::is_live).unwrap_or(false)
    }

    pub fn remote_sink(&self, index: usize, kind: MediaKind) -> Option<Arc<UdpSocket>> {
        self.with_session(index, |s| s.remote_sink(kind)).flatten()
    }

    /// Снимок целей для рассылки: только полностью собранные сессии
    pub fn outbound_targets(&self, kind: MediaKind) -> Vec<(usize, Arc<dyn OutboundTrack>)> {
        self.lock()
            .iter()
            .enumerate()
            .filter(|(_, session)| session.is_ready())
            .filter_map(|(index, session)| session.outbound_track(kind).map(|t| (index, t)))
            .collect()
    }

    /// Подключает sink-и, если сессия ещё жива. Возвращает `false`, если она уже закрыта.
    pub fn attach_sinks(
        &self,
        index: usize,
        audio: Option<Arc<UdpSocket>>,
        video: Option<Arc<UdpSocket>>,
    ) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(index) {
            Some(session) if session.is_live() => {
                session.attach_sinks(audio, video);
                true
            }
            _ => false,
        }
    }

    /// Закрывает сессию на месте. `Some` возвращается только первому вызвавшему.
    pub fn close_at(&self, index: usize) -> Option<ReleasedSession> {
        self.lock().get_mut(index).and_then(Session::take_handles)
    }
}
