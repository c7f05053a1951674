//! Serializer port - body / headers と型付き値の相互変換
//!
//! エンジン自体はバイト列しか扱わない。型付き Producer / Handler がこの port を使う。

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{QueueError, Result};

pub trait Serializer: Send + Sync + 'static {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Stored in the message headers so consumers can tell formats apart.
    fn content_type(&self) -> &'static str;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| QueueError::Serialization(format!("json encode: {e}")))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| QueueError::Serialization(format!("json decode: {e}")))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
