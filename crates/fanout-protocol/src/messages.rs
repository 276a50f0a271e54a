use serde::{Deserialize, Serialize};

/// Wire envelope for the per-session signaling channel.
///
/// Serializes as `{"event": "...", "data": "..."}`. The `data` field carries
/// an event-specific encoding: a JSON session description for `offer` and
/// `answer`, a JSON ICE candidate for `candidate`, and literal text for
/// `chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum SignalMessage {
    /// Session description sent by the relay whenever a session's stream set
    /// changes.
    Offer(String),

    /// Session description answering a relay offer.
    Answer(String),

    /// Trickled ICE candidate, in either direction.
    Candidate(String),

    /// Chat text, relayed verbatim to every other session.
    Chat(String),
}

impl SignalMessage {
    /// Parse an inbound envelope.
    ///
    /// A well-formed envelope whose event name this build does not know
    /// yields `Ok(None)`; callers log it and move on. Anything else that
    /// fails to parse is an error, including a known event with a missing
    /// or mistyped payload.
    pub fn parse(raw: &str) -> Result<Option<Self>, serde_json::Error> {
        match serde_json::from_str::<Self>(raw) {
            Ok(message) => Ok(Some(message)),
            Err(err) => {
                #[derive(Deserialize)]
                struct Envelope {
                    event: String,
                }

                match serde_json::from_str::<Envelope>(raw) {
                    Ok(envelope) if !Self::knows_event(&envelope.event) => Ok(None),
                    _ => Err(err),
                }
            }
        }
    }

    fn knows_event(event: &str) -> bool {
        matches!(event, "offer" | "answer" | "candidate" | "chat")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_event_and_data_fields() {
        let json = serde_json::to_string(&SignalMessage::Chat("hello".to_string())).unwrap();
        assert_eq!(json, r#"{"event":"chat","data":"hello"}"#);

        let json = serde_json::to_string(&SignalMessage::Offer("{\"type\":\"offer\"}".to_string()))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "offer");
        assert_eq!(value["data"], "{\"type\":\"offer\"}");
    }

    #[test]
    fn candidate_round_trips() {
        let message = SignalMessage::Candidate(r#"{"candidate":"candidate:1"}"#.to_string());
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(SignalMessage::parse(&json).unwrap(), Some(message));
    }

    #[test]
    fn unknown_events_are_tolerated() {
        let parsed = SignalMessage::parse(r#"{"event":"wiggle","data":"whatever"}"#).unwrap();
        assert_eq!(parsed, None);

        // Even with no payload at all.
        let parsed = SignalMessage::parse(r#"{"event":"wiggle"}"#).unwrap();
        assert_eq!(parsed, None);
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        assert!(SignalMessage::parse(r#"{"data":"no event"}"#).is_err());
        assert!(SignalMessage::parse("not json at all").is_err());

        // Known events with a broken payload are malformed, not unknown.
        assert!(SignalMessage::parse(r#"{"event":"chat"}"#).is_err());
        assert!(SignalMessage::parse(r#"{"event":"chat","data":42}"#).is_err());
    }
}
