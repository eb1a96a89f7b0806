//! Wire codec for router messages.
//!
//! Two JSON shapes travel on a channel:
//!
//! ```text
//! Request   { "method": string, "id": number, "params": any }
//! Response  { "id": number, "result": any }
//!           { "id": number, "error": { "code": string, "message": string } }
//! ```
//!
//! A frame with a `method` field is a request; anything else must be a
//! response. Extra fields (e.g. `"jsonrpc": "2.0"` from other
//! implementations) are ignored.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value};

use super::error::{ErrorObject, RpcError};

/// Correlation id of a request within one router's lifetime.
pub type RequestId = u64;

/// An incoming or outgoing call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Method parameters (`null` when absent).
    pub params: Value,
}

/// The answer to exactly one [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request this answers.
    pub id: RequestId,
    /// Success value or error.
    pub outcome: Result<Value, RpcError>,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Call from the peer.
    Request(Request),
    /// Answer from the peer.
    Response(Response),
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl Message {
    /// Encode this message as frame text.
    pub fn encode(&self) -> String {
        let mut map = Map::new();
        match self {
            Message::Request(request) => {
                map.insert("method".into(), Value::String(request.method.clone()));
                map.insert("id".into(), Value::from(request.id));
                map.insert("params".into(), request.params.clone());
            }
            Message::Response(response) => {
                map.insert("id".into(), Value::from(response.id));
                match &response.outcome {
                    Ok(result) => {
                        map.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        let ErrorObject { code, message } = error.to_object();
                        let mut object = Map::new();
                        object.insert("code".into(), Value::String(code));
                        object.insert("message".into(), Value::String(message));
                        map.insert("error".into(), Value::Object(object));
                    }
                }
            }
        }
        Value::Object(map).to_string()
    }

    /// Decode frame text into a message.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| anyhow!("Invalid JSON frame: {e}"))?;
        let Value::Object(mut map) = value else {
            bail!("Frame is not a JSON object");
        };

        let id = map
            .get("id")
            .and_then(Value::as_u64)
            .context("Frame has no numeric id")?;

        if let Some(method) = map.remove("method") {
            let Value::String(method) = method else {
                bail!("Request {id} has a non-string method");
            };
            let params = map.remove("params").unwrap_or(Value::Null);
            return Ok(Message::Request(Request { id, method, params }));
        }

        if let Some(error) = map.remove("error") {
            let object: ErrorObject = serde_json::from_value(error)
                .with_context(|| format!("Response {id} has a malformed error"))?;
            return Ok(Message::Response(Response {
                id,
                outcome: Err(RpcError::from_object(object)),
            }));
        }

        match map.remove("result") {
            Some(result) => Ok(Message::Response(Response {
                id,
                outcome: Ok(result),
            })),
            None => bail!("Frame {id} is neither a request nor a response"),
        }
    }
}
