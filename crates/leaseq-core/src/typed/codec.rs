//! PayloadCodec - Payload と body / headers の相互変換
//!
//! # デシリアライズフロー
//! 1. headers を `MessageHeaders` に戻す
//! 2. payload_type が期待する型と一致するか確認
//! 3. body を T に戻す
//!
//! どの段階の失敗も、その message は二度と処理できない（poison）。

use super::payload::{MessageHeaders, Payload};
use crate::error::{QueueError, Result};
use crate::ports::Serializer;

#[derive(Debug, Default, Clone)]
pub struct PayloadCodec<S> {
    serializer: S,
}

impl<S: Serializer> PayloadCodec<S> {
    pub fn new(serializer: S) -> Self {
        Self { serializer }
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Returns `(body, headers)`.
    pub fn encode<T: Payload>(
        &self,
        payload: &T,
        headers: &MessageHeaders,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let body = self.serializer.serialize(payload)?;
        let headers = self.serializer.serialize(headers)?;
        Ok((body, headers))
    }

    pub fn decode_headers(&self, headers: &[u8]) -> Result<MessageHeaders> {
        self.serializer.deserialize(headers)
    }

    pub fn decode_body<T: Payload>(&self, headers: &MessageHeaders, body: &[u8]) -> Result<T> {
        if headers.payload_type != T::TYPE {
            return Err(QueueError::Serialization(format!(
                "payload type `{}` does not match `{}`",
                headers.payload_type,
                T::TYPE
            )));
        }
        self.serializer.deserialize(body)
    }
}
