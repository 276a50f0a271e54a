//! Per-session signaling loop.
//!
//! The transport adapter's callbacks do no work of their own: they forward
//! their payloads onto the session's inbox, and the session's owning task is
//! the only place that acts on them.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use tokio::sync::mpsc;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_remote::TrackRemote;

use super::{Relay, SignalChannel, forwarder};
use crate::error::Result;
use fanout_protocol::SignalMessage;

/// Event delivered onto a session's inbox by the transport adapter.
pub enum SessionEvent {
    Candidate(RTCIceCandidate),
    StateChanged(RTCPeerConnectionState),
    InboundTrack(Arc<TrackRemote>),
}

/// Route the peer connection's callbacks onto the session inbox.
pub(super) fn wire_events(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<SessionEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                let _ = tx.send(SessionEvent::Candidate(candidate));
            }
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(SessionEvent::StateChanged(state));
        })
    }));

    let tx = events;
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(SessionEvent::InboundTrack(track));
        })
    }));

    pc.on_ice_connection_state_change(Box::new(|state| {
        Box::pin(async move {
            tracing::debug!("ICE connection state changed: {state}");
        })
    }));
}

/// Drive one session until its socket or transport gives out, then clean up.
pub async fn run(
    relay: Arc<Relay>,
    id: Uuid,
    pc: Arc<RTCPeerConnection>,
    channel: SignalChannel,
    mut socket: SplitStream<WebSocket>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    loop {
        tokio::select! {
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = handle_signal(&relay, id, &pc, text.as_str()).await {
                        tracing::warn!("session {}: terminating: {e}", id);
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("session {}: socket error: {e}", id);
                    break;
                }
            },
            event = events.recv() => match event {
                Some(SessionEvent::Candidate(candidate)) => {
                    deliver_candidate(id, &channel, candidate).await;
                }
                Some(SessionEvent::StateChanged(state)) => {
                    tracing::info!("session {}: connection state {state}", id);
                    match state {
                        RTCPeerConnectionState::Failed => {
                            if let Err(e) = pc.close().await {
                                tracing::warn!("session {}: close failed: {e}", id);
                            }
                        }
                        RTCPeerConnectionState::Closed => relay.sync_sessions().await,
                        _ => {}
                    }
                }
                Some(SessionEvent::InboundTrack(track)) => {
                    tracing::info!(
                        "session {}: inbound track kind={} id={}",
                        id,
                        track.kind(),
                        track.id()
                    );
                    tokio::spawn(forwarder::run(Arc::clone(&relay), track));
                }
                None => break,
            },
        }
    }

    // Cleanup is unconditional: close the transport, then let the next pass
    // prune the registry entry.
    if let Err(e) = pc.close().await {
        tracing::warn!("session {}: close failed: {e}", id);
    }
    relay.sync_sessions().await;
    tracing::info!("session {} left", id);
}

/// Handle one inbound signaling message. An error terminates the session.
async fn handle_signal(
    relay: &Arc<Relay>,
    id: Uuid,
    pc: &Arc<RTCPeerConnection>,
    raw: &str,
) -> Result<()> {
    let Some(message) = SignalMessage::parse(raw)? else {
        tracing::warn!("session {}: unknown signaling event, ignoring", id);
        return Ok(());
    };

    match message {
        SignalMessage::Answer(data) => {
            let answer: RTCSessionDescription = serde_json::from_str(&data)?;
            pc.set_remote_description(answer).await?;
        }
        SignalMessage::Candidate(data) => {
            let candidate: RTCIceCandidateInit = serde_json::from_str(&data)?;
            pc.add_ice_candidate(candidate).await?;
        }
        SignalMessage::Chat(text) => {
            relay.broadcast_chat(id, &text).await;
        }
        SignalMessage::Offer(_) => {
            tracing::warn!("session {}: unexpected offer from client, ignoring", id);
        }
    }

    Ok(())
}

async fn deliver_candidate(id: Uuid, channel: &SignalChannel, candidate: RTCIceCandidate) {
    let init = match candidate.to_json() {
        Ok(init) => init,
        Err(e) => {
            tracing::error!("session {}: failed to serialize candidate: {e}", id);
            return;
        }
    };
    let data = match serde_json::to_string(&init) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!("session {}: failed to serialize candidate: {e}", id);
            return;
        }
    };

    if channel.send(SignalMessage::Candidate(data)).await.is_err() {
        tracing::debug!("session {}: candidate dropped, channel closed", id);
    }
}
