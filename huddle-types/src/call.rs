//! The call frame — decrypted content of requests, notifications and
//! broadcasts.
//!
//! Layout: `u16 BE method-length ‖ method UTF-8 ‖ params`, where
//! `params` is a MessagePack value. Response content is the bare
//! MessagePack result; error content is a UTF-8 message.

use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A method invocation: name plus MessagePack-encoded parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Method name, e.g. `"peer.init"`.
    pub method: String,
    /// MessagePack-encoded parameter value.
    pub params: Vec<u8>,
}

impl Call {
    /// Build a call with typed parameters.
    pub fn new<P: Serialize>(method: &str, params: &P) -> Result<Self, CodecError> {
        Ok(Self {
            method: method.to_string(),
            params: encode_value(params)?,
        })
    }

    /// Decode the parameters into a typed value.
    pub fn params<P: DeserializeOwned>(&self) -> Result<P, CodecError> {
        decode_value(&self.params)
    }

    /// Serialize into content bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let name = self.method.as_bytes();
        if name.len() > u16::MAX as usize {
            return Err(CodecError::Params("method name too long".to_string()));
        }
        let mut out = Vec::with_capacity(2 + name.len() + self.params.len());
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&self.params);
        Ok(out)
    }

    /// Parse content bytes back into a call.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < 2 {
            return Err(CodecError::MalformedFrame("call frame too short"));
        }
        let name_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + name_len {
            return Err(CodecError::MalformedFrame("truncated method name"));
        }
        let method = std::str::from_utf8(&bytes[2..2 + name_len])
            .map_err(|_| CodecError::MalformedFrame("method name not utf-8"))?
            .to_string();
        Ok(Self {
            method,
            params: bytes[2 + name_len..].to_vec(),
        })
    }
}

/// Serialize a value to MessagePack (named fields, self-describing).
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(value).map_err(|e| CodecError::Params(e.to_string()))
}

/// Deserialize a MessagePack value.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| CodecError::Params(e.to_string()))
}
