use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Error types for payload encoding and decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary serialization error: {0}")]
    Binary(#[from] bincode::Error),
}

/// Trait for objects that can be turned into payload bytes
pub trait SerializeObject {
    fn to_json(&self) -> Result<Vec<u8>, CodecError>;
    fn to_binary(&self) -> Result<Vec<u8>, CodecError>;
}

// Implement SerializeObject for any type that implements Serialize
impl<T: Serialize + ?Sized> SerializeObject for T {
    fn to_json(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Json)
    }

    fn to_binary(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::Binary)
    }
}

/// Wire format of collective payloads.
///
/// Every node of a group must use the same codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadCodec {
    /// Human readable; non-finite floats do not survive it.
    Json,
    #[default]
    Binary,
}

impl PayloadCodec {
    pub fn encode(&self, data: &dyn SerializeObject) -> Result<Vec<u8>, CodecError> {
        match self {
            PayloadCodec::Json => data.to_json(),
            PayloadCodec::Binary => data.to_binary(),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            PayloadCodec::Json => Ok(serde_json::from_slice(bytes)?),
            PayloadCodec::Binary => Ok(bincode::deserialize(bytes)?),
        }
    }
}
