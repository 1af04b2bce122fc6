use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::engine::{
    AuxChannel, GatheringComplete, InboundTrack, OutboundTrack, PeerTransport, TransportEngine,
};
use crate::peer::types::{ConnectivityState, MediaKind, SdpKind, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

/// Движок на webrtc-rs: один API, из которого создаются peer connection
pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<ServerConfig>,
    aux_label: String,
}

impl WebRtcEngine {
    pub fn new(config: &RelayConfig) -> RelayResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
            aux_label: config.aux_channel_label.clone(),
        })
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn create_context(&self, tag: &str) -> RelayResult<Arc<dyn PeerTransport>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config(&self.ice_servers))
                .await?,
        );

        let label = tag.to_string();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => dump_candidate(&label, &c),
                // cand == None означает конец сбора
                None => debug!("{label}: ICE candidate gathering completed"),
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcTransport {
            pc,
            tag: tag.to_string(),
            aux_label: self.aux_label.clone(),
        }))
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
    }
}

fn to_rtc(desc: SessionDescription) -> RelayResult<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> RelayResult<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        other => {
            return Err(RelayError::Transport(format!(
                "unexpected description type {other}"
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn connectivity_from(state: RTCIceConnectionState) -> ConnectivityState {
    match state {
        RTCIceConnectionState::New => ConnectivityState::New,
        RTCIceConnectionState::Checking => ConnectivityState::Checking,
        RTCIceConnectionState::Connected => ConnectivityState::Connected,
        RTCIceConnectionState::Completed => ConnectivityState::Completed,
        RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCIceConnectionState::Failed => ConnectivityState::Failed,
        RTCIceConnectionState::Closed => ConnectivityState::Closed,
        _ => ConnectivityState::Unspecified,
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    tag: String,
    aux_label: String,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_outbound_track(&self, kind: MediaKind) -> RelayResult<Arc<dyn OutboundTrack>> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            codec_for(kind),
            kind.to_string(),
            self.tag.clone(),
        ));

        let rtp_sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP нужно вычитывать, иначе не работают интерсепторы (NACK и т.п.)
        let tag = self.tag.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
            debug!("{tag}: {kind} RTCP reader stopped");
        });

        Ok(Arc::new(WebRtcOutboundTrack { kind, track }))
    }

    async fn create_aux_channel(&self) -> RelayResult<Arc<dyn AuxChannel>> {
        // Канал согласован заранее (id 0) на обеих сторонах
        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(0),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&self.aux_label, Some(init))
            .await?;
        Ok(Arc::new(WebRtcAuxChannel { dc }))
    }

    async fn create_offer(&self) -> RelayResult<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> RelayResult<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> RelayResult<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> RelayResult<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn gathering_complete(&self) -> GatheringComplete {
        self.pc.gathering_complete_promise().await
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc(desc).ok()
    }

    fn subscribe_connectivity(&self, events: mpsc::UnboundedSender<ConnectivityState>) {
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let _ = events.send(connectivity_from(state));
                Box::pin(async {})
            }));
    }

    fn subscribe_inbound_tracks(&self, tracks: mpsc::UnboundedSender<Arc<dyn InboundTrack>>) {
        let tag = self.tag.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                info!(
                    "{tag}: inbound track kind={} ssrc={}",
                    track.kind(),
                    track.ssrc()
                );
                let _ = tracks.send(Arc::new(WebRtcInboundTrack { track }));
                Box::pin(async {})
            },
        ));
    }

    async fn dump_stats(&self, moment: &str) {
        dump_selected_pair(&self.pc, &self.tag, moment).await;
    }

    async fn close(&self) -> RelayResult<()> {
        self.pc.close().await?;
        Ok(())
    }
}

pub struct WebRtcOutboundTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl OutboundTrack for WebRtcOutboundTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Трек без привязок (до согласования или после close) молча
    /// отбрасывает пакет и возвращает Ok(0)
    async fn write_packet(&self, packet: &[u8]) -> RelayResult<usize> {
        Ok(self.track.write(packet).await?)
    }
}

pub struct WebRtcInboundTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl InboundTrack for WebRtcInboundTrack {
    fn kind(&self) -> MediaKind {
        // всё, что не видео, отдаём как аудио
        match self.track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        }
    }

    async fn read_packet(&self) -> RelayResult<Packet> {
        let (packet, _) = self.track.read_rtp().await?;
        Ok(packet)
    }
}

pub struct WebRtcAuxChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl AuxChannel for WebRtcAuxChannel {
    fn subscribe_messages(&self, messages: mpsc::UnboundedSender<Bytes>) {
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = messages.send(msg.data);
            Box::pin(async {})
        }));
    }

    async fn close(&self) -> RelayResult<()> {
        self.dc.close().await?;
        Ok(())
    }
}
