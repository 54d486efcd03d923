//! Newline-delimited JSON frames exchanged on the registration stream.
//!
//! Each frame carries at most one of `register`, `echo`,
//! `attributes_announcement` (and, in JWT mode, `auth` as the first frame
//! of the stream). Echo frames flow both ways: the agent pings, the hub
//! updates the heartbeat and answers pong with its own timestamp, and the
//! agent derives RTT plus the two one-way legs from the three timestamps.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Attribute map announced by agents.
pub type ConnectionAttributes = HashMap<String, String>;

/// One registration-stream frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register: Option<RegisterPayload>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo: Option<EchoPayload>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes_announcement: Option<AttributesAnnouncementPayload>,

    /// Bearer credential, required as the first frame when the hub
    /// listener validates JWTs instead of client certificates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthPayload>,
}

impl MessagePayload {
    pub fn register(node_name: impl Into<String>) -> Self {
        Self {
            register: Some(RegisterPayload {
                node_name: node_name.into(),
            }),
            ..Default::default()
        }
    }

    pub fn echo(echo: EchoPayload) -> Self {
        Self {
            echo: Some(echo),
            ..Default::default()
        }
    }

    pub fn attributes(attributes: ConnectionAttributes, withdrawals: Vec<String>) -> Self {
        Self {
            attributes_announcement: Some(AttributesAnnouncementPayload {
                attributes,
                withdrawals,
            }),
            ..Default::default()
        }
    }

    pub fn auth(bearer: impl Into<String>) -> Self {
        Self {
            auth: Some(AuthPayload {
                bearer: bearer.into(),
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub node_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub bearer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EchoDirection {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

/// Heartbeat echo. All timestamps are unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoPayload {
    pub direction: EchoDirection,
    pub correlation_id: String,
    /// Stamped by the hub on the pong.
    pub server_timestamp: u64,
    /// Stamped by the agent on the ping, preserved on the pong.
    pub timestamp: u64,
    pub seq_id: u64,
}

impl EchoPayload {
    /// Delays derived on pong receipt: round trip, agent→hub leg,
    /// hub→agent leg. Negative legs happen with skewed clocks.
    pub fn delays(&self, now_ms: u64) -> (i64, i64, i64) {
        let rtt = now_ms as i64 - self.timestamp as i64;
        let one_trip = self.server_timestamp as i64 - self.timestamp as i64;
        let back_trip = now_ms as i64 - self.server_timestamp as i64;
        (rtt, one_trip, back_trip)
    }

    /// The hub's reply: direction flipped, server timestamp stamped,
    /// everything else preserved.
    pub fn pong(&self, server_now_ms: u64) -> Self {
        Self {
            direction: EchoDirection::Pong,
            correlation_id: self.correlation_id.clone(),
            server_timestamp: server_now_ms,
            timestamp: self.timestamp,
            seq_id: self.seq_id,
        }
    }
}

/// Merge-and-withdraw attribute update: withdrawn keys are removed first,
/// then the announced attributes overlay the remainder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributesAnnouncementPayload {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: ConnectionAttributes,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub withdrawals: Vec<String>,
}

impl AttributesAnnouncementPayload {
    /// Apply this announcement to an existing attribute map.
    pub fn apply(&self, current: &mut ConnectionAttributes) {
        for key in &self.withdrawals {
            current.remove(key);
        }
        for (key, value) in &self.attributes {
            current.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_carries_at_most_one_payload() {
        let frame = MessagePayload::register("node-a");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["register"]["node_name"], "node-a");
        assert!(json.get("echo").is_none());
        assert!(json.get("attributes_announcement").is_none());
    }

    #[test]
    fn test_echo_round_trip_math() {
        let ping_at = 1_000_000;
        let hub_at = 1_000_040;
        let pong_back_at = 1_000_100;

        let ping = EchoPayload {
            direction: EchoDirection::Ping,
            correlation_id: "c".into(),
            server_timestamp: 0,
            timestamp: ping_at,
            seq_id: 7,
        };
        let pong = ping.pong(hub_at);
        assert_eq!(pong.direction, EchoDirection::Pong);
        assert_eq!(pong.seq_id, 7);
        assert_eq!(pong.timestamp, ping_at);

        let (rtt, one_trip, back_trip) = pong.delays(pong_back_at);
        assert_eq!(rtt, 100);
        assert_eq!(one_trip, 40);
        assert_eq!(back_trip, 60);
    }

    #[test]
    fn test_echo_direction_wire_names() {
        assert_eq!(
            serde_json::to_string(&EchoDirection::Ping).unwrap(),
            "\"ping\""
        );
        assert_eq!(
            serde_json::to_string(&EchoDirection::Pong).unwrap(),
            "\"pong\""
        );
    }

    #[test]
    fn test_attributes_withdraw_before_merge() {
        let mut current = HashMap::from([
            ("asn".to_string(), "AS65001".to_string()),
            ("city".to_string(), "Berlin".to_string()),
        ]);

        // A key both withdrawn and announced ends up with the new value.
        let update = AttributesAnnouncementPayload {
            attributes: HashMap::from([("asn".to_string(), "AS65002".to_string())]),
            withdrawals: vec!["asn".to_string(), "city".to_string()],
        };
        update.apply(&mut current);

        assert_eq!(current.get("asn").map(String::as_str), Some("AS65002"));
        assert!(!current.contains_key("city"));
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let parsed: MessagePayload =
            serde_json::from_str(r#"{"echo":{"direction":"ping","correlation_id":"x",
                "server_timestamp":0,"timestamp":1,"seq_id":2},"future_field":true}"#)
            .unwrap();
        assert!(parsed.echo.is_some());
    }
}
