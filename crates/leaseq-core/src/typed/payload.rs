//! Payload trait - 型付きメッセージ本体の定義
//!
//! # Trait Bounds
//! - `Serialize` / `DeserializeOwned`: body との相互変換のため
//! - `Send + Sync + 'static`: ワーカー間で共有される handler から使うため

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Payload は payload_type と型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ChargeCard {
///     order_id: u64,
/// }
///
/// impl Payload for ChargeCard {
///     const TYPE: &'static str = "billing.charge_card.v1";
/// }
/// ```
///
/// # 命名規約
/// - `{domain}.{action}.v{major}`
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}

/// What a typed producer writes into the opaque headers column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub payload_type: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl MessageHeaders {
    pub fn for_payload<T: Payload>(content_type: &str) -> Self {
        Self {
            payload_type: T::TYPE.to_string(),
            content_type: content_type.to_string(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ResizeImage {
        pub image_id: u64,
        pub width: u32,
    }

    impl Payload for ResizeImage {
        const TYPE: &'static str = "images.resize.v1";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SendEmail {
        pub to: String,
        pub template: String,
    }

    impl Payload for SendEmail {
        const TYPE: &'static str = "mail.send.v1";
    }
}
