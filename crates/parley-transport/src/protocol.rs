//! Text envelopes exchanged with the media bridge.

use serde::{Deserialize, Serialize};

use parley_core::types::{MembershipEvent, Participant};

/// A JSON text message on the bridge socket, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Client -> bridge: start taking part in the meeting.
    Join {
        meeting_id: String,
        account_id: String,
    },

    /// Client -> bridge: stop taking part.
    Leave,

    /// Either direction: a text frame.
    Text { text: String },

    /// Bridge -> client roster updates.
    ParticipantJoined { participant: Participant },
    ParticipantLeft { participant: Participant },
}

impl BridgeMessage {
    /// The membership event carried by this message, if any.
    pub fn membership(self) -> Option<MembershipEvent> {
        match self {
            BridgeMessage::ParticipantJoined { participant } => {
                Some(MembershipEvent::Joined(participant))
            }
            BridgeMessage::ParticipantLeft { participant } => Some(MembershipEvent::Left(participant)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let join = BridgeMessage::Join {
            meeting_id: "m1".into(),
            account_id: "acct".into(),
        };
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            serde_json::json!({"type": "join", "meeting_id": "m1", "account_id": "acct"})
        );
        assert_eq!(
            serde_json::to_string(&BridgeMessage::Leave).unwrap(),
            r#"{"type":"leave"}"#
        );
    }

    #[test]
    fn test_participant_messages_become_membership_events() {
        let msg: BridgeMessage = serde_json::from_str(
            r#"{"type":"participant_left","participant":{"id":"p-2","name":"Grace"}}"#,
        )
        .unwrap();
        let event = msg.membership().unwrap();
        assert_eq!(event.announcement(), "Participant Left Grace");

        let text: BridgeMessage = serde_json::from_str(r#"{"type":"text","text":"hi"}"#).unwrap();
        assert_eq!(text.membership(), None);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<BridgeMessage>(r#"{"type":"reaction"}"#).is_err());
    }
}
