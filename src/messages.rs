//! # Wire Protocol Messages
//!
//! Every RPC travels as a JSON [`Message`] envelope whose `Payload` is itself
//! a JSON document, hex-encoded inside the envelope:
//!
//! ```json
//! {"ID":"<uuid>","From":"10.0.0.1:4000","To":"10.0.0.2:4000","Type":2,"Payload":"7b22..."}
//! ```
//!
//! | Type | Request | Response |
//! |------|---------|----------|
//! | Ping | [`PingReq`] (0) | [`PingResp`] (1) |
//! | Find contacts | [`FindContactsReq`] (2) | [`FindContactsResp`] (3) |
//! | Put | [`PutReq`] (4) | [`PutResp`] (5) |
//! | Get | [`GetReq`] (6) | [`GetResp`] (7) |
//!
//! Requests and responses carry an [`RpcHeader`] naming the sender, so every
//! exchange teaches both sides about each other. Responses also carry a
//! [`Status`] and an error string: a peer that received a request but could
//! not serve it answers with `Status::Failure` rather than staying silent.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{DhtError, Result};
use crate::identity::{Contact, KademliaID};
use crate::kvstore::KV;

/// Largest payload accepted by [`decode_payload`].
pub const MAX_PAYLOAD_SIZE: usize = 512 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    PingReq,
    PingResp,
    FindContactsReq,
    FindContactsResp,
    PutReq,
    PutResp,
    GetReq,
    GetResp,
}

impl MessageType {
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::PingResp
                | MessageType::FindContactsResp
                | MessageType::PutResp
                | MessageType::GetResp
        )
    }

    pub fn is_request(self) -> bool {
        !self.is_response()
    }

    /// The response type that answers this request type.
    pub fn response_type(self) -> Option<MessageType> {
        match self {
            MessageType::PingReq => Some(MessageType::PingResp),
            MessageType::FindContactsReq => Some(MessageType::FindContactsResp),
            MessageType::PutReq => Some(MessageType::PutResp),
            MessageType::GetReq => Some(MessageType::GetResp),
            _ => None,
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        match t {
            MessageType::PingReq => 0,
            MessageType::PingResp => 1,
            MessageType::FindContactsReq => 2,
            MessageType::FindContactsResp => 3,
            MessageType::PutReq => 4,
            MessageType::PutResp => 5,
            MessageType::GetReq => 6,
            MessageType::GetResp => 7,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = DhtError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => MessageType::PingReq,
            1 => MessageType::PingResp,
            2 => MessageType::FindContactsReq,
            3 => MessageType::FindContactsResp,
            4 => MessageType::PutReq,
            5 => MessageType::PutResp,
            6 => MessageType::GetReq,
            7 => MessageType::GetResp,
            other => return Err(DhtError::Protocol(format!("unknown message type {}", other))),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation ID shared by a request and its response.
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Type")]
    pub msg_type: MessageType,
    #[serde(rename = "Payload", with = "hex::serde")]
    pub payload: Vec<u8>,
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| DhtError::Protocol(format!("malformed envelope: {}", e)))
    }

    /// Build the envelope answering `self`, addressed back to its sender.
    pub fn reply(&self, msg_type: MessageType, payload: Vec<u8>) -> Message {
        Message {
            id: self.id.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            msg_type,
            payload,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    #[default]
    Success,
    Failure,
}

impl From<Status> for u8 {
    fn from(s: Status) -> u8 {
        match s {
            Status::Success => 0,
            Status::Failure => 1,
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = DhtError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Status::Success),
            1 => Ok(Status::Failure),
            other => Err(DhtError::Protocol(format!("unknown status {}", other))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RpcHeader {
    pub sender: Contact,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PingReq {
    pub header: RpcHeader,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PingResp {
    pub header: RpcHeader,
    pub status: Status,
    pub error: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FindContactsReq {
    pub header: RpcHeader,
    #[serde(rename = "KademliaID")]
    pub target: KademliaID,
    pub count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FindContactsResp {
    pub header: RpcHeader,
    pub status: Status,
    pub error: String,
    pub contacts: Vec<Contact>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutReq {
    pub header: RpcHeader,
    pub key: String,
    pub value: String,
    pub sig: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutResp {
    pub header: RpcHeader,
    pub status: Status,
    pub error: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetReq {
    pub header: RpcHeader,
    pub key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetResp {
    pub header: RpcHeader,
    pub status: Status,
    pub error: String,
    #[serde(rename = "KVS")]
    pub kvs: Vec<KV>,
}

/// A typed request payload and the type tag it travels under.
pub trait Request: Serialize + DeserializeOwned + Send + 'static {
    const TYPE: MessageType;
    type Response: Response;

    fn header(&self) -> &RpcHeader;
}

/// A typed response payload.
pub trait Response: Serialize + DeserializeOwned + Send + 'static {
    const TYPE: MessageType;

    fn header(&self) -> &RpcHeader;
    fn status(&self) -> Status;
    fn error(&self) -> &str;

    /// `Err(Rejected)` when the peer answered with a failure status.
    fn into_result(self) -> Result<Self>
    where
        Self: Sized,
    {
        match self.status() {
            Status::Success => Ok(self),
            Status::Failure => Err(DhtError::Rejected(self.error().to_string())),
        }
    }
}

macro_rules! impl_request {
    ($req:ty, $tag:expr, $resp:ty) => {
        impl Request for $req {
            const TYPE: MessageType = $tag;
            type Response = $resp;

            fn header(&self) -> &RpcHeader {
                &self.header
            }
        }
    };
}

macro_rules! impl_response {
    ($resp:ty, $tag:expr) => {
        impl Response for $resp {
            const TYPE: MessageType = $tag;

            fn header(&self) -> &RpcHeader {
                &self.header
            }

            fn status(&self) -> Status {
                self.status
            }

            fn error(&self) -> &str {
                &self.error
            }
        }
    };
}

impl_request!(PingReq, MessageType::PingReq, PingResp);
impl_request!(FindContactsReq, MessageType::FindContactsReq, FindContactsResp);
impl_request!(PutReq, MessageType::PutReq, PutResp);
impl_request!(GetReq, MessageType::GetReq, GetResp);

impl_response!(PingResp, MessageType::PingResp);
impl_response!(FindContactsResp, MessageType::FindContactsResp);
impl_response!(PutResp, MessageType::PutResp);
impl_response!(GetResp, MessageType::GetResp);

pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Decode a payload, rejecting oversized input before parsing.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(DhtError::Protocol(format!(
            "payload too large: {} bytes (max {})",
            bytes.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    serde_json::from_slice(bytes).map_err(|e| DhtError::Protocol(format!("malformed payload: {}", e)))
}
