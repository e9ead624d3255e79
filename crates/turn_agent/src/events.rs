use dialog_core::Usage;
use serde::Serialize;

/// Progress of one turn, sent on the agent's optional event channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    AttemptStarted {
        attempt: u32,
        total: u32,
    },

    /// Incremental output of the current attempt.
    Delta {
        attempt: u32,
        content: String,
    },

    /// An attempt failed, timed out, was interrupted or came back empty.
    AttemptWarning {
        attempt: u32,
        total: u32,
        reason: String,
    },

    Succeeded {
        attempts: u32,
        usage: Usage,
        latency_ms: u64,
    },

    Exhausted {
        attempts: u32,
        last_error: Option<String>,
        usage: Usage,
    },

    Cancelled {
        attempt: u32,
        usage: Usage,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = TurnEvent::AttemptWarning {
            attempt: 2,
            total: 3,
            reason: "response was empty".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "attempt_warning");
        assert_eq!(json["attempt"], 2);
    }
}
