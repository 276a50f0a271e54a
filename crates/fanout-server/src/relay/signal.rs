use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;

use crate::error::{RelayError, Result};
use fanout_protocol::SignalMessage;

/// Messages buffered per session before senders start blocking.
const OUTBOUND_BUFFER: usize = 64;

/// Outbound half of a session's signaling connection.
///
/// The session's own task, the renegotiation pass and chat broadcasts all
/// write concurrently; everything goes through one bounded queue drained by
/// a single writer task, so frames are never interleaved on the wire. A
/// closed queue means the socket is gone and surfaces as a send error.
#[derive(Clone)]
pub struct SignalChannel {
    tx: mpsc::Sender<SignalMessage>,
}

impl SignalChannel {
    pub fn new<S>(mut sink: S) -> Self
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: std::fmt::Display,
    {
        let (tx, mut rx) = mpsc::channel::<SignalMessage>(OUTBOUND_BUFFER);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("failed to serialize signaling message: {e}");
                        continue;
                    }
                };

                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::debug!("signaling write failed, stopping writer: {e}");
                    break;
                }
            }
        });

        Self { tx }
    }

    pub async fn send(&self, message: SignalMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    type SinkResult = std::result::Result<(), std::convert::Infallible>;

    struct VecSink(mpsc::UnboundedSender<Message>);

    impl Sink<Message> for VecSink {
        type Error = std::convert::Infallible;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<SinkResult> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> SinkResult {
            let _ = self.0.send(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<SinkResult> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<SinkResult> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn concurrent_writes_come_out_as_whole_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = SignalChannel::new(VecSink(tx));

        let mut writers = Vec::new();
        for writer in 0..4 {
            let channel = channel.clone();
            writers.push(tokio::spawn(async move {
                for n in 0..25 {
                    channel
                        .send(SignalMessage::Chat(format!("writer {writer} line {n}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }
        drop(channel);

        let mut frames = 0;
        while let Some(message) = rx.recv().await {
            let Message::Text(text) = message else {
                panic!("unexpected frame type");
            };
            let parsed: SignalMessage = serde_json::from_str(text.as_str()).unwrap();
            assert!(matches!(parsed, SignalMessage::Chat(_)));
            frames += 1;
        }
        assert_eq!(frames, 100);
    }
}
