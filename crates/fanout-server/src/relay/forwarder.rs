//! Inbound stream forwarding.

use std::sync::Arc;

use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use super::Relay;

/// Republish one inbound stream on a fan-out track until the read side
/// gives out. This loop is the only writer of the fan-out track.
pub(super) async fn run(relay: Arc<Relay>, remote: Arc<TrackRemote>) {
    let local = relay
        .add_track(
            remote.codec().capability,
            remote.id().to_string(),
            remote.stream_id().to_string(),
        )
        .await;

    loop {
        let (mut packet, _) = match remote.read_rtp().await {
            Ok(read) => read,
            Err(e) => {
                tracing::debug!("track {}: read loop ended: {e}", remote.id());
                break;
            }
        };

        // Header extensions are endpoint-specific and never forwarded
        // between peers.
        packet.header.extension = false;
        packet.header.extension_profile = 0;
        packet.header.extensions.clear();

        if let Err(e) = local.write_rtp(&packet).await {
            tracing::warn!("track {}: forward failed: {e}", remote.id());
        }
    }

    relay.remove_track(&remote.id()).await;
}
