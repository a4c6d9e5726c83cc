use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::peer::ice::dump_candidate;
use crate::peer::media::{LocalTrack, RemoteTrack};
use crate::peer::transport::{
    LinkState, PeerTransport, TransportEvent, TransportEvents, TransportFactory,
};
use crate::peer::types::{IceCandidate, SdpType, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds webrtc-rs peer connections from the call configuration.
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    ice_servers: Vec<ServerConfig>,
    ice_candidate_pool_size: u8,
}

impl RtcTransportFactory {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let transport = new_peer(
            rtc_config(&self.ice_servers, self.ice_candidate_pool_size),
            events,
        )
        .await?;
        Ok(Arc::new(transport))
    }
}

/// Peer connection configuration
fn rtc_config(servers: &[ServerConfig], pool_size: u8) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: pool_size,
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

/// Candidates received before the remote description is set
#[derive(Default)]
struct PendingCandidates {
    remote_set: bool,
    queue: Vec<RTCIceCandidateInit>,
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    pending: Mutex<PendingCandidates>,
}

/// Creates a peer and forwards its events into `events`
pub async fn new_peer(config: RTCConfiguration, events: TransportEvents) -> Result<RtcTransport> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(config).await?);

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate::from(init);
                        dump_candidate("LOCAL", &candidate);
                        let _ = tx.send(TransportEvent::LocalCandidate(candidate));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                },
                None => {
                    // None marks the end of gathering
                    debug!("ICE candidate gathering completed (null candidate received)");
                    let _ = tx.send(TransportEvent::GatheringComplete);
                }
            }
        })
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("Peer connection state changed to: {:?}", st);
        let _ = tx.send(TransportEvent::LinkState(LinkState::from(st)));
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let remote = RemoteTrack {
            id: track.id(),
            stream_id: track.stream_id(),
            kind: track.kind().into(),
            source: Some(track),
        };
        info!("Remote track arrived: {:?}", remote);
        let _ = tx.send(TransportEvent::RemoteTrack(remote));
        Box::pin(async {})
    }));

    Ok(RtcTransport {
        pc,
        pending: Mutex::new(PendingCandidates::default()),
    })
}

impl RtcTransport {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(CallError::negotiation(format!(
            "unsupported description type {other}"
        ))),
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self
            .pc
            .add_track(Arc::clone(track.sample_track()) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP must be drained or the interceptors stall
        let track_id = track.id().to_string();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
            debug!("RTCP reader for {} stopped", track_id);
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut pending = self.pending.lock().await;
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        pending.remote_set = true;

        // flush queued candidates
        let queued = std::mem::take(&mut pending.queue);
        if !queued.is_empty() {
            info!("Applying {} queued remote candidates", queued.len());
        }
        for candidate in queued {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!("Failed to apply pending candidate: {}", e);
            }
        }
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if !pending.remote_set {
            debug!("Remote description not set yet, queuing candidate");
            pending.queue.push(candidate.into());
            return Ok(());
        }
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pending.lock().await.queue.clear();
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers_get_scheme_and_credentials() {
        let servers = vec![
            ServerConfig::stun("s", "stun.example.org:3478"),
            ServerConfig {
                id: "t".into(),
                r#type: "turn".into(),
                url: "relay.example.org:3478".into(),
                username: Some("u".into()),
                credential: Some("p".into()),
            },
        ];
        let rtc = ice_servers(&servers);
        assert_eq!(rtc[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert_eq!(rtc[1].urls, vec!["turn:relay.example.org:3478".to_string()]);
        assert_eq!(rtc[1].username, "u");
        assert_eq!(rtc[1].credential, "p");
    }

    #[test]
    fn test_rtc_config_uses_pool_size() {
        let config = rtc_config(&crate::config::default_ice_servers(), 10);
        assert_eq!(config.ice_candidate_pool_size, 10);
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_queued() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = new_peer(rtc_config(&[], 0), tx).await.unwrap();
        transport
            .add_ice_candidate(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            })
            .await
            .unwrap();
        assert_eq!(transport.pending.lock().await.queue.len(), 1);
        assert!(!transport.has_remote_description().await);
        transport.close().await.unwrap();
    }
}
