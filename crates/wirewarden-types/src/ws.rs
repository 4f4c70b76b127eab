//! WebSocket message envelopes and channel names (spec §4.7, §4.8, §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of channel names a client may subscribe to (spec §6 "Valid channels").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelName {
    /// Coarse node identity/summary info.
    GeneralInfo,
    /// Fires when the total node count changes, distinct from online/offline flaps.
    NodesUpdated,
    /// Container list snapshot.
    Docker,
    /// On-demand log stream for a single container.
    DockerLogs,
    /// Overview composite statistics.
    Stats,
    /// Traffic reconciler rate updates.
    Traffic,
}

impl ChannelName {
    /// Parse a channel name from the wire string, rejecting anything outside the closed set.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "general_info" => Some(Self::GeneralInfo),
            "nodes_updated" => Some(Self::NodesUpdated),
            "docker" => Some(Self::Docker),
            "docker_logs" => Some(Self::DockerLogs),
            "stats" => Some(Self::Stats),
            "traffic" => Some(Self::Traffic),
            _ => None,
        }
    }

    /// The wire representation of this channel name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GeneralInfo => "general_info",
            Self::NodesUpdated => "nodes_updated",
            Self::Docker => "docker",
            Self::DockerLogs => "docker_logs",
            Self::Stats => "stats",
            Self::Traffic => "traffic",
        }
    }
}

/// A message sent from client to server over the WebSocket (spec §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First-message handshake when no URL token was supplied.
    Auth {
        /// Session token to validate.
        token: String,
    },
    /// Subscribe to one or more channels.
    Subscribe {
        /// Channel names, validated against the closed set on receipt.
        #[serde(default)]
        channels: Vec<String>,
        /// Required when `docker_logs` is among `channels`.
        #[serde(default)]
        container: Option<String>,
    },
    /// Unsubscribe from one or more channels.
    Unsubscribe {
        /// Channel names.
        #[serde(default)]
        channels: Vec<String>,
        /// Container name, to cancel a specific `docker_logs` stream.
        #[serde(default)]
        container: Option<String>,
    },
    /// Anything else — spec S5 sends `{"action":"ping"}` to exercise rejection pre-auth.
    #[serde(other)]
    Other,
}

/// A message sent from server to client over the WebSocket (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    /// The channel (or `init`) this payload belongs to.
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary JSON payload.
    pub payload: Value,
}

impl ServerMessage {
    /// Build a message addressed to a named channel.
    pub fn for_channel(channel: ChannelName, payload: Value) -> Self {
        Self {
            kind: channel.as_str().to_string(),
            payload,
        }
    }

    /// Build the synthetic post-auth `init` message (spec §4.8, S5).
    pub fn init(payload: Value) -> Self {
        Self {
            kind: "init".to_string(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_channel_name_rejected() {
        assert_eq!(ChannelName::parse("general_info"), Some(ChannelName::GeneralInfo));
        assert_eq!(ChannelName::parse("hacker_channel"), None);
    }

    #[test]
    fn client_message_other_on_unknown_action() {
        let msg: ClientMessage = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Other));
    }
}
