//! Typed - 型付きメッセージ API
//!
//! エンジンは body / headers をバイト列としてしか扱わない。
//! このモジュールは `Serializer` port を使って型付きの値と相互変換する。
//!
//! # 二層構造
//! - **表層（Typed）**: `Payload` trait, `Handler<T>` trait, `Producer<T>` - 型安全
//! - **内部（Bytes）**: `MessageHandler` trait - object-safe, ワーカーが呼ぶ

pub mod codec;
pub mod handler;
pub mod payload;
pub mod producer;
pub mod registry;

// 主要な trait/型 を再エクスポート
pub use self::codec::PayloadCodec;
pub use self::handler::{Handler, MessageContext, TypedHandler};
pub use self::payload::{MessageHeaders, Payload};
pub use self::producer::{Producer, SentMessage};
pub use self::registry::{RegistryError, TypedRegistry};
