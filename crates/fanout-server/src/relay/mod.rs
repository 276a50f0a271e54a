//! Many-to-many media relay core.
//!
//! Every inbound stream is republished on a local fan-out track and offered
//! to every other session. The session list and the fan-out track map live
//! behind a single lock so renegotiation always sees a consistent joint
//! snapshot of who exists and what there is to forward.

mod forwarder;
mod negotiator;
pub(crate) mod session;
mod signal;

pub use session::SessionEvent;
pub use signal::SignalChannel;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry as InterceptorRegistry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::error::Result;
use crate::state::Config;
use fanout_protocol::SignalMessage;

/// One connected participant: its transport handle plus the signaling
/// channel back to it. Both are owned exclusively by this session.
pub struct Session {
    pub id: Uuid,
    pub pc: Arc<RTCPeerConnection>,
    pub channel: SignalChannel,
}

/// Joint registry of sessions and fan-out tracks. Always read and mutated
/// under the one relay lock.
#[derive(Default)]
struct Registry {
    sessions: Vec<Session>,
    tracks: HashMap<String, Arc<TrackLocalStaticRTP>>,
}

pub struct Relay {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    registry: Mutex<Registry>,
    resync_tx: mpsc::Sender<()>,
}

impl Relay {
    /// Build the relay and start its background tasks (delayed resync and
    /// the standing keyframe refresh). Must be called inside a Tokio
    /// runtime.
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = InterceptorRegistry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if config.udp_port_min > 0 && config.udp_port_max > 0 {
            let ephemeral = EphemeralUDP::new(config.udp_port_min, config.udp_port_max)
                .map_err(|e| webrtc::Error::new(format!("invalid UDP port range: {e}")))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
            tracing::info!(
                "WebRTC UDP port range: {}-{}",
                config.udp_port_min,
                config.udp_port_max
            );
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let mut ice_servers = vec![];
        for stun_url in &config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        let (resync_tx, resync_rx) = mpsc::channel(1);

        let relay = Arc::new(Self {
            api,
            ice_servers,
            registry: Mutex::new(Registry::default()),
            resync_tx,
        });

        tokio::spawn(negotiator::resync_loop(Arc::clone(&relay), resync_rx));
        tokio::spawn(negotiator::keyframe_loop(Arc::clone(&relay)));

        Ok(relay)
    }

    /// Create a peer connection for a new participant, register the session
    /// and renegotiate everyone. Returns the inbox on which the transport
    /// adapter's callbacks deliver their events.
    pub async fn join(
        &self,
        channel: SignalChannel,
    ) -> Result<(Uuid, Arc<RTCPeerConnection>, mpsc::UnboundedReceiver<SessionEvent>)> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: self.ice_servers.clone(),
                    ..Default::default()
                })
                .await?,
        );

        // Accept one video and one audio stream from the participant.
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        session::wire_events(&pc, events_tx);

        let id = Uuid::new_v4();
        {
            let mut registry = self.registry.lock().await;
            registry.sessions.push(Session {
                id,
                pc: Arc::clone(&pc),
                channel,
            });
        }
        tracing::info!("session {} joined", id);

        self.sync_sessions().await;

        Ok((id, pc, events_rx))
    }

    /// Register a fan-out track, then renegotiate every session so it gets
    /// picked up.
    pub async fn add_track(
        &self,
        capability: RTCRtpCodecCapability,
        id: String,
        stream_id: String,
    ) -> Arc<TrackLocalStaticRTP> {
        let local = Arc::new(TrackLocalStaticRTP::new(capability, id, stream_id));
        {
            let mut registry = self.registry.lock().await;
            registry
                .tracks
                .insert(local.id().to_string(), Arc::clone(&local));
        }
        tracing::info!("fan-out track {} registered", local.id());

        self.sync_sessions().await;
        local
    }

    /// Deregister a fan-out track (no-op if already gone), then renegotiate
    /// every session so stale senders get removed.
    pub async fn remove_track(&self, id: &str) {
        let removed = self.registry.lock().await.tracks.remove(id).is_some();
        if removed {
            tracing::info!("fan-out track {} removed", id);
        }

        self.sync_sessions().await;
    }

    /// Relay a chat line to every session except the sender.
    pub async fn broadcast_chat(&self, from: Uuid, text: &str) {
        let channels: Vec<SignalChannel> = {
            let registry = self.registry.lock().await;
            registry
                .sessions
                .iter()
                .filter(|s| s.id != from)
                .map(|s| s.channel.clone())
                .collect()
        };

        for channel in channels {
            if channel
                .send(SignalMessage::Chat(text.to_string()))
                .await
                .is_err()
            {
                tracing::debug!("chat dropped, session channel already closed");
            }
        }
    }

    /// Number of sessions currently registered.
    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.sessions.len()
    }

    /// Ids of the fan-out tracks currently registered.
    pub async fn track_ids(&self) -> Vec<String> {
        self.registry.lock().await.tracks.keys().cloned().collect()
    }
}
