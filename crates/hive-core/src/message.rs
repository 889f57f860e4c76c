//! Bus message schema and the broker framing around it.
//!
//! A `Message` is immutable once sent. Its `body` is a tagged union over the
//! seven message patterns, so receivers match exhaustively instead of
//! switching on a type string.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HiveError, Result};

/// Node identifier. Supplied by configuration, unique within a hive.
pub type NodeId = String;

/// Message pattern discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessagePattern {
    Request,
    Response,
    Broadcast,
    Direct,
    Publish,
    ConsensusProposal,
    ConsensusVote,
}

/// A consensus ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Yes,
    No,
}

impl From<bool> for Vote {
    fn from(yes: bool) -> Self {
        if yes {
            Vote::Yes
        } else {
            Vote::No
        }
    }
}

/// Pattern-specific content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "kebab-case")]
pub enum MessageBody {
    /// Correlation-tagged request. The message id is the correlation id.
    Request { payload: serde_json::Value },

    /// Reply to a request; `response_id` is the originating request's id.
    Response {
        #[serde(rename = "responseId")]
        response_id: Uuid,
        payload: serde_json::Value,
    },

    /// Delivered to every other connected node.
    Broadcast { payload: serde_json::Value },

    /// Point-to-point, no reply expected.
    Direct { payload: serde_json::Value },

    /// Delivered to current subscribers of `topic`.
    Publish {
        topic: String,
        payload: serde_json::Value,
    },

    /// Ballot request. The message id is the proposal id.
    ConsensusProposal { payload: serde_json::Value },

    ConsensusVote {
        #[serde(rename = "proposalId")]
        proposal_id: Uuid,
        vote: Vote,
    },
}

/// A bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<NodeId>,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    pub fn new(from: impl Into<NodeId>, to: Option<NodeId>, body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to,
            timestamp: now_ms(),
            body,
        }
    }

    pub fn pattern(&self) -> MessagePattern {
        match &self.body {
            MessageBody::Request { .. } => MessagePattern::Request,
            MessageBody::Response { .. } => MessagePattern::Response,
            MessageBody::Broadcast { .. } => MessagePattern::Broadcast,
            MessageBody::Direct { .. } => MessagePattern::Direct,
            MessageBody::Publish { .. } => MessagePattern::Publish,
            MessageBody::ConsensusProposal { .. } => MessagePattern::ConsensusProposal,
            MessageBody::ConsensusVote { .. } => MessagePattern::ConsensusVote,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Publish { topic, .. } => Some(topic),
            _ => None,
        }
    }

    /// Point-to-point patterns must name a recipient.
    pub fn validate(&self) -> Result<()> {
        let needs_target = matches!(
            self.pattern(),
            MessagePattern::Request
                | MessagePattern::Response
                | MessagePattern::Direct
                | MessagePattern::ConsensusVote
        );
        if needs_target && self.to.is_none() {
            return Err(HiveError::Validation(format!(
                "{:?} message {} has no recipient",
                self.pattern(),
                self.id
            )));
        }
        if let MessageBody::Publish { topic, .. } = &self.body {
            if topic.is_empty() {
                return Err(HiveError::Validation("publish with empty topic".into()));
            }
        }
        Ok(())
    }
}

// ── Broker framing ────────────────────────────────────────────────────────────

/// One line on a broker connection. Newline-delimited JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// First frame on every connection. Binds the connection to a node id.
    Hello { node_id: NodeId },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Message { message: Message },
}

impl Frame {
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pattern_follows_body() {
        let msg = Message::new(
            "a",
            None,
            MessageBody::Publish {
                topic: "t".into(),
                payload: json!(1),
            },
        );
        assert_eq!(msg.pattern(), MessagePattern::Publish);
        assert_eq!(msg.topic(), Some("t"));
    }

    #[test]
    fn request_without_target_is_invalid() {
        let msg = Message::new("a", None, MessageBody::Request { payload: json!({}) });
        assert!(matches!(msg.validate(), Err(HiveError::Validation(_))));
    }

    #[test]
    fn response_serializes_with_response_id() {
        let request_id = Uuid::new_v4();
        let msg = Message::new(
            "b",
            Some("a".into()),
            MessageBody::Response {
                response_id: request_id,
                payload: json!({ "ok": true }),
            },
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["pattern"], "response");
        assert_eq!(value["responseId"], request_id.to_string());
        assert_eq!(value["to"], "a");
    }

    #[test]
    fn frame_line_has_no_newline_and_parses_back() {
        let frame = Frame::Message {
            message: Message::new(
                "a",
                Some("b".into()),
                MessageBody::ConsensusVote {
                    proposal_id: Uuid::new_v4(),
                    vote: Vote::No,
                },
            ),
        };
        let line = frame.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(Frame::from_line(&line).unwrap(), frame);
    }

    #[test]
    fn garbage_frame_is_a_validation_error() {
        assert!(matches!(
            Frame::from_line("{\"frame\":\"bogus\"}"),
            Err(HiveError::Validation(_))
        ));
    }
}
