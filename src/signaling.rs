//! Обмен описаниями сессий через внешний сигнальный сервер.
//!
//! Сервер хранит не больше одного offer хоста и одного answer гостя на
//! `hostId`; клиент опрашивает его по HTTP с фиксированной паузой.

use crate::error::{RelayError, RelayResult};
use crate::peer::types::SessionDescription;
use crate::retry::RetryPolicy;
use base64::{engine::general_purpose, Engine as _};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct HostEntry<'a> {
    id: &'a str,
    description: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GuestEntry<'a> {
    host_id: &'a str,
    guest_description: String,
}

#[derive(Deserialize, Default)]
struct HostLookup {
    #[serde(default)]
    description: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GuestLookup {
    #[serde(default)]
    guest_description: String,
}

/// Результат одного опроса `/api/guest`
enum GuestPoll {
    Answer(SessionDescription),
    Pending,
    NoHostEntry,
}

pub struct SignalingClient {
    http: reqwest::Client,
    host_url: String,
    guest_url: String,
    host_id: String,
    policy: RetryPolicy,
}

impl SignalingClient {
    pub fn new(server: &str, host_id: impl Into<String>, policy: RetryPolicy) -> Self {
        let base = server.trim_end_matches('/');
        Self {
            http: reqwest::Client::new(),
            host_url: format!("{base}/api/host"),
            guest_url: format!("{base}/api/guest"),
            host_id: host_id.into(),
            policy,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// POST /api/host, пока сервер не ответит 200
    pub async fn publish_host_offer(&self, offer: &SessionDescription) -> RelayResult<()> {
        let body = HostEntry {
            id: &self.host_id,
            description: encode(offer)?,
        };
        let body = &body;
        self.policy
            .retry("setting up hostId with signalling server", move || {
                self.post(&self.host_url, body)
            })
            .await?;
        debug!("host offer published");
        Ok(())
    }

    /// GET /api/host?id=…, пока не появится непустое описание
    pub async fn await_host_offer(&self) -> RelayResult<SessionDescription> {
        self.policy
            .retry("getting host information from signalling server", move || {
                self.fetch_host_offer()
            })
            .await
    }

    /// POST /api/guest, пока сервер не ответит 200
    pub async fn publish_guest_answer(&self, answer: &SessionDescription) -> RelayResult<()> {
        let body = GuestEntry {
            host_id: &self.host_id,
            guest_description: encode(answer)?,
        };
        let body = &body;
        self.policy
            .retry("setting up guestDescription with signalling server", move || {
                self.post(&self.guest_url, body)
            })
            .await?;
        debug!("guest answer published");
        Ok(())
    }

    /// GET /api/guest?hostId=…, пока гость не ответит.
    ///
    /// Не-200 означает, что записи хоста на сервере нет: `offer` публикуется
    /// заново и опрос продолжается сразу, без паузы.
    pub async fn await_guest_answer(
        &self,
        offer: &SessionDescription,
    ) -> RelayResult<SessionDescription> {
        let mut attempt = 1;
        loop {
            let mut pause = true;
            match self.poll_guest_answer().await {
                Ok(GuestPoll::Answer(answer)) => return Ok(answer),
                Ok(GuestPoll::Pending) => debug!("the guest has not signalled yet"),
                Ok(GuestPoll::NoHostEntry) => {
                    info!("no host entry on the signalling server, publishing offer");
                    self.publish_host_offer(offer).await?;
                    pause = false;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("while getting guest information from signalling server: {e}"),
            }

            if !self.policy.allows(attempt + 1) {
                return Err(self.policy.exhausted("waiting for guest answer", attempt));
            }
            attempt += 1;
            if pause {
                self.policy.pause().await;
            }
        }
    }

    async fn post<T: Serialize>(&self, url: &str, body: &T) -> RelayResult<()> {
        let resp = self.http.post(url).json(body).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            status => Err(RelayError::UnexpectedStatus(status)),
        }
    }

    async fn fetch_host_offer(&self) -> RelayResult<SessionDescription> {
        let resp = self
            .http
            .get(&self.host_url)
            .query(&[("id", self.host_id.as_str())])
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(RelayError::UnexpectedStatus(resp.status()));
        }

        let lookup = resp.json::<HostLookup>().await.unwrap_or_else(|e| {
            debug!("unreadable host lookup body: {e}");
            HostLookup::default()
        });
        if lookup.description.is_empty() {
            return Err(RelayError::NotReady);
        }
        decode(&lookup.description)
    }

    async fn poll_guest_answer(&self) -> RelayResult<GuestPoll> {
        let resp = self
            .http
            .get(&self.guest_url)
            .query(&[("hostId", self.host_id.as_str())])
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Ok(GuestPoll::NoHostEntry);
        }

        let lookup = resp.json::<GuestLookup>().await.unwrap_or_else(|e| {
            debug!("unreadable guest lookup body: {e}");
            GuestLookup::default()
        });
        if lookup.guest_description.is_empty() {
            return Ok(GuestPoll::Pending);
        }
        decode(&lookup.guest_description).map(GuestPoll::Answer)
    }
}

/// JSON, затем base64
pub fn encode(desc: &SessionDescription) -> RelayResult<String> {
    let json =
        serde_json::to_vec(desc).map_err(|e| RelayError::MalformedDescription(e.to_string()))?;
    Ok(general_purpose::STANDARD.encode(json))
}

/// Обратное к `encode`; любой мусор на входе фатален
pub fn decode(s: &str) -> RelayResult<SessionDescription> {
    let json = general_purpose::STANDARD
        .decode(s)
        .map_err(|e| RelayError::MalformedDescription(format!("base64: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| RelayError::MalformedDescription(format!("json: {e}")))
}
