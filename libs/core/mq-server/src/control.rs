//! Payloads carried on the control topic.
//!
//! A payload is either the administrative sentinel `CTRL` (optionally
//! `CTRL:<subtype>`) or the name of a queue that just received a message.
//! The operation a command triggers lives in the server's pending slot, not
//! on the wire.

/// Administrative command sentinel
pub const CONTROL_COMMAND: &str = "CTRL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Administrative command with an optional subtype
    Command(Option<String>),
    /// A message was published to this queue
    Queue(String),
    /// Blank payload, ignored
    Empty,
}

impl ControlMessage {
    pub fn parse(payload: &str) -> Self {
        let payload = payload.trim();
        if payload.is_empty() {
            return ControlMessage::Empty;
        }

        let (head, subtype) = match payload.split_once(':') {
            Some((head, rest)) => (head, Some(rest)),
            None => (payload, None),
        };

        if head == CONTROL_COMMAND {
            ControlMessage::Command(subtype.filter(|s| !s.is_empty()).map(str::to_string))
        } else {
            ControlMessage::Queue(payload.to_string())
        }
    }

    pub fn encode_command(subtype: Option<&str>) -> String {
        match subtype {
            Some(subtype) => format!("{}:{}", CONTROL_COMMAND, subtype),
            None => CONTROL_COMMAND.to_string(),
        }
    }
}
