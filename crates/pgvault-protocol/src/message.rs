//! Wire frame types.

use pgvault_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command that exercises the connection without doing work. Sent as a
/// keep-alive on idle connections.
pub const CMD_NOOP: &str = "noop";
/// Command asking the remote end to exit its serve loop.
pub const CMD_EXIT: &str = "exit";

/// One request frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub param: Vec<Value>,
}

impl Request {
    pub fn new(cmd: impl Into<String>, param: Vec<Value>) -> Self {
        Request { cmd: cmd.into(), param }
    }
}

/// One response frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Response {
    Out { out: Vec<Value> },
    Err { err: u32, message: String },
}

impl Response {
    pub fn ok(out: Vec<Value>) -> Self {
        Response::Out { out }
    }

    pub fn error(err: &Error) -> Self {
        Response::Err { err: err.code(), message: err.to_string() }
    }

    /// Unwrap into the success payload or the reconstructed error.
    pub fn into_result(self) -> Result<Vec<Value>> {
        match self {
            Response::Out { out } => Ok(out),
            Response::Err { err, message } => Err(Error::from_code(err, message)),
        }
    }
}
