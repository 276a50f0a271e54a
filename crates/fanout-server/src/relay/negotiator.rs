//! Renegotiation scheduler.
//!
//! A reconcile pass makes every session's outbound sender set match the
//! track registry, then sends each session a fresh offer. Passes run under
//! the relay lock and re-derive desired state from scratch every time, so a
//! pass that raced with a concurrent track or session mutation can simply
//! be retried.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use super::{Registry, Relay, Session};
use crate::error::Result;
use fanout_protocol::SignalMessage;

/// In-pass attempts before the lock is released and a delayed resync is
/// scheduled instead. A pass that keeps failing is most likely blocking a
/// track or session mutation that would let it succeed.
const MAX_SYNC_ATTEMPTS: usize = 25;

/// Delay before a rescheduled reconciliation runs.
const RESYNC_DELAY: Duration = Duration::from_secs(3);

/// Period of the standing keyframe refresh.
const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

enum Pass {
    Converged,
    Retry,
}

impl Relay {
    /// Reconcile every session against the track registry and renegotiate.
    /// Finishes with an unconditional keyframe dispatch: senders added by
    /// this pass need a fresh keyframe to start rendering.
    pub async fn sync_sessions(&self) {
        {
            let mut registry = self.registry.lock().await;

            let mut converged = false;
            for attempt in 0..MAX_SYNC_ATTEMPTS {
                match attempt_sync(&mut registry).await {
                    Pass::Converged => {
                        converged = true;
                        break;
                    }
                    Pass::Retry => {
                        tracing::debug!("reconcile attempt {attempt} did not settle, retrying");
                    }
                }
            }

            if !converged {
                tracing::warn!(
                    "reconciliation did not settle after {MAX_SYNC_ATTEMPTS} attempts, \
                     rescheduling in {RESYNC_DELAY:?}"
                );
                // Capacity-1 queue: a burst of failed passes collapses into
                // one pending resync.
                let _ = self.resync_tx.try_send(());
            }
        }

        self.dispatch_keyframes().await;
    }

    /// Ask every session's inbound streams for a fresh keyframe.
    pub async fn dispatch_keyframes(&self) {
        let registry = self.registry.lock().await;

        for session in &registry.sessions {
            for receiver in session.pc.get_receivers().await {
                for track in receiver.tracks().await {
                    let pli = PictureLossIndication {
                        sender_ssrc: 0,
                        media_ssrc: track.ssrc(),
                    };
                    if let Err(e) = session.pc.write_rtcp(&[Box::new(pli)]).await {
                        tracing::debug!("session {}: keyframe request failed: {e}", session.id);
                    }
                }
            }
        }
    }
}

/// One reconcile attempt over the whole session list. Any failure aborts
/// the attempt; the caller restarts it from scratch.
async fn attempt_sync(registry: &mut Registry) -> Pass {
    // Prune sessions whose transport reached its terminal state. Indices
    // are collected first and applied after the scan; removing mid-walk
    // would invalidate the iteration.
    let mut closed = Vec::new();
    for (index, session) in registry.sessions.iter().enumerate() {
        if session.pc.connection_state() == RTCPeerConnectionState::Closed {
            closed.push(index);
        }
    }
    if !closed.is_empty() {
        for index in closed.into_iter().rev() {
            let session = registry.sessions.remove(index);
            tracing::info!("session {} pruned", session.id);
        }
        return Pass::Retry;
    }

    for session in &registry.sessions {
        if let Err(e) = renegotiate(session, &registry.tracks).await {
            tracing::debug!("session {}: renegotiation failed: {e}", session.id);
            return Pass::Retry;
        }
    }

    Pass::Converged
}

/// Bring one session's sender set in line with the registry and deliver the
/// resulting offer.
async fn renegotiate(
    session: &Session,
    tracks: &HashMap<String, Arc<TrackLocalStaticRTP>>,
) -> Result<()> {
    // Track ids already covered for this session: everything it sends, plus
    // everything it feeds into the relay itself. Offering the latter back
    // would loop its own media.
    let mut covered = HashSet::new();

    for sender in session.pc.get_senders().await {
        let Some(track) = sender.track().await else {
            continue;
        };
        let id = track.id().to_string();
        let stale = !tracks.contains_key(&id);
        covered.insert(id);

        if stale {
            session.pc.remove_track(&sender).await?;
        }
    }

    for receiver in session.pc.get_receivers().await {
        for track in receiver.tracks().await {
            covered.insert(track.id().to_string());
        }
    }

    for (id, track) in tracks {
        if !covered.contains(id) {
            session
                .pc
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }
    }

    let offer = session.pc.create_offer(None).await?;
    session.pc.set_local_description(offer.clone()).await?;

    let data = serde_json::to_string(&offer)?;
    session.channel.send(SignalMessage::Offer(data)).await?;

    Ok(())
}

/// Drains the rescheduling queue: each token is one delayed reconciliation.
pub(super) async fn resync_loop(relay: Arc<Relay>, mut pending: mpsc::Receiver<()>) {
    while pending.recv().await.is_some() {
        tokio::time::sleep(RESYNC_DELAY).await;
        relay.sync_sessions().await;
    }
}

/// Standing keyframe refresh for the lifetime of the relay. Covers streams
/// whose initial keyframe was dropped on the wire.
pub(super) async fn keyframe_loop(relay: Arc<Relay>) {
    let mut interval = tokio::time::interval(KEYFRAME_INTERVAL);
    loop {
        interval.tick().await;
        relay.dispatch_keyframes().await;
    }
}
