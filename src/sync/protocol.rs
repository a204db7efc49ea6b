// sync/protocol.rs - Wire frames for the duplex sync channel
//
// Framed JSON text messages. Outbound: init (once, first), then transact
// per pending transaction. Inbound: ack, tx, error. The init handshake is
// acknowledged with an ack carrying the reserved txId "init".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::tx::Operation;
use crate::{Error, Result};

/// Reserved txId acknowledging the init frame
pub const INIT_ACK_ID: &str = "init";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Frame {
    #[serde(rename_all = "camelCase")]
    Init {
        app_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Transact {
        tx_id: String,
        operations: Vec<Operation>,
    },
    #[serde(rename_all = "camelCase")]
    Ack { tx_id: String },
    #[serde(rename_all = "camelCase")]
    Tx {
        tx_id: String,
        operations: Vec<Operation>,
        timestamp: DateTime<Utc>,
    },
    Error { code: String, message: String },
}

impl Frame {
    pub fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }

    /// A malformed inbound frame is a protocol error and resets the
    /// connection
    pub fn parse(text: &str) -> Result<Frame> {
        serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("Malformed frame: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::TxChunk;
    use serde_json::json;

    #[test]
    fn test_init_frame_shape() {
        let frame = Frame::Init {
            app_id: "app-1".to_string(),
            token: Some("tok".to_string()),
        };
        let wire: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(wire, json!({"op": "init", "appId": "app-1", "token": "tok"}));

        let anonymous = Frame::Init {
            app_id: "app-1".to_string(),
            token: None,
        };
        let wire: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&anonymous).unwrap()).unwrap();
        assert_eq!(wire, json!({"op": "init", "appId": "app-1"}));
    }

    #[test]
    fn test_transact_round_trip() {
        let op = TxChunk::new("todos")
            .id("t1")
            .update(json!({"done": true}))
            .unwrap();
        let frame = Frame::Transact {
            tx_id: "tx-9".to_string(),
            operations: vec![op],
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains("\"op\":\"transact\""));
        assert!(encoded.contains("\"txId\":\"tx-9\""));
        assert_eq!(Frame::parse(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_inbound_frames_parse() {
        let ack = Frame::parse(r#"{"op":"ack","txId":"tx-1"}"#).unwrap();
        assert_eq!(
            ack,
            Frame::Ack {
                tx_id: "tx-1".to_string()
            }
        );

        let error = Frame::parse(r#"{"op":"error","code":"auth","message":"bad token"}"#).unwrap();
        assert!(matches!(error, Frame::Error { .. }));

        assert!(matches!(
            Frame::parse("not json"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Frame::parse(r#"{"op":"mystery"}"#),
            Err(Error::Protocol(_))
        ));
    }
}
