use serde::{Deserialize, Serialize};

/// A participant in the live external session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
}

/// Membership kinds a subscriber can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipEventKind {
    Joined,
    Left,
}

/// Roster change in the live session.
///
/// These never travel through a pipeline; the transport delivers them straight
/// to whoever subscribed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "participant", rename_all = "snake_case")]
pub enum MembershipEvent {
    Joined(Participant),
    Left(Participant),
}

impl MembershipEvent {
    pub fn kind(&self) -> MembershipEventKind {
        match self {
            MembershipEvent::Joined(_) => MembershipEventKind::Joined,
            MembershipEvent::Left(_) => MembershipEventKind::Left,
        }
    }

    pub fn participant(&self) -> &Participant {
        match self {
            MembershipEvent::Joined(p) | MembershipEvent::Left(p) => p,
        }
    }

    /// Spoken announcement for this event, e.g. `"Participant Joined Ada"`.
    pub fn announcement(&self) -> String {
        match self {
            MembershipEvent::Joined(p) => format!("Participant Joined {}", p.name),
            MembershipEvent::Left(p) => format!("Participant Left {}", p.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ada() -> Participant {
        Participant {
            id: "p-1".into(),
            name: "Ada".into(),
        }
    }

    #[test]
    fn test_announcement_text() {
        assert_eq!(
            MembershipEvent::Joined(ada()).announcement(),
            "Participant Joined Ada"
        );
        assert_eq!(
            MembershipEvent::Left(ada()).announcement(),
            "Participant Left Ada"
        );
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(MembershipEvent::Joined(ada()).kind(), MembershipEventKind::Joined);
        assert_eq!(MembershipEvent::Left(ada()).kind(), MembershipEventKind::Left);
    }

    #[test]
    fn test_event_serde_shape() {
        let json = serde_json::to_value(MembershipEvent::Joined(ada())).unwrap();
        assert_eq!(json["type"], "joined");
        assert_eq!(json["participant"]["name"], "Ada");
    }
}
