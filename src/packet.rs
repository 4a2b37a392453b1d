//! Wire-level envelope shapes.
//!
//! An [`Envelope`] is the outermost JSON object on the wire. The Router only
//! ever looks at `packet_id` and `r#type`; everything route-related lives
//! one level down inside `data` and is interpreted by [`crate::client`] and
//! [`crate::server`], not by the Router itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The two envelope kinds the Router understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Request,
    Response,
}

/// The outermost frame carried over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub packet_id: String,
    pub r#type: EnvelopeType,
    pub data: Value,
}

impl Envelope {
    pub fn request(packet_id: impl Into<String>, data: Value) -> Self {
        Self {
            packet_id: packet_id.into(),
            r#type: EnvelopeType::Request,
            data,
        }
    }

    pub fn response(packet_id: impl Into<String>, data: Value) -> Self {
        Self {
            packet_id: packet_id.into(),
            r#type: EnvelopeType::Response,
            data,
        }
    }
}

/// `{route, arguments}` — the payload of a route invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPacket {
    pub route: String,
    pub arguments: serde_json::Map<String, Value>,
}

/// `{secret_key, override_key}` — the payload of an IDENTIFY request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyData {
    pub secret_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_key: Option<String>,
}

/// The application-level packet that sits inside `Envelope::data` for route
/// traffic: `{identifier, type, data}`, where the inner `data` shape depends
/// on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePacket {
    pub identifier: String,
    #[serde(flatten)]
    pub body: RouteBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RouteBody {
    #[serde(rename = "REQUEST")]
    Request { data: RequestPacket },
    #[serde(rename = "CLIENT_REQUEST")]
    ClientRequest { data: RequestPacket },
    #[serde(rename = "IDENTIFY")]
    Identify { data: IdentifyData },
    #[serde(rename = "SUCCESS_RESPONSE")]
    Success { data: Value },
    #[serde(rename = "FAILURE_RESPONSE")]
    Failure { data: String },
}
