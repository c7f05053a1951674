//! Handler trait - Payload を処理する Handler の定義
//!
//! # 二層構造
//! - `Handler<T>`: 型付き。`T` しか受け取れない
//! - `TypedHandler<T, H, S>`: body / headers をデコードして `MessageHandler` として動く
//!
//! デコードの失敗は `HandlerError::Poison` になり、リトライされない。

use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec::PayloadCodec;
use super::payload::{MessageHeaders, Payload};
use crate::domain::{CorrelationId, MessageRecord, QueueId};
use crate::ports::{JsonSerializer, Serializer};
use crate::worker::{HandlerError, MessageHandler};

/// Lease details handed to a typed handler next to its payload.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub queue_id: QueueId,
    pub correlation_id: CorrelationId,
    pub delivery_count: u32,
    pub job_name: Option<String>,
    pub route: Option<String>,
    pub headers: MessageHeaders,
}

impl MessageContext {
    fn new(record: &MessageRecord, headers: MessageHeaders) -> Self {
        Self {
            queue_id: record.queue_id,
            correlation_id: record.correlation_id,
            delivery_count: record.delivery_count,
            job_name: record.job_name.clone(),
            route: record.route.clone(),
            headers,
        }
    }
}

/// Handler は Payload を処理する
///
/// # 使用例
/// ```ignore
/// struct Resize;
///
/// #[async_trait]
/// impl Handler<ResizeImage> for Resize {
///     async fn handle(&self, job: ResizeImage, ctx: &MessageContext) -> Result<(), HandlerError> {
///         resize(job.image_id, job.width).map_err(HandlerError::from_error)
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Payload>: Send + Sync + 'static {
    async fn handle(&self, payload: T, context: &MessageContext) -> Result<(), HandlerError>;
}

pub struct TypedHandler<T, H, S = JsonSerializer> {
    handler: H,
    codec: PayloadCodec<S>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Payload, H: Handler<T>> TypedHandler<T, H, JsonSerializer> {
    pub fn new(handler: H) -> Self {
        Self::with_serializer(handler, JsonSerializer)
    }
}

impl<T: Payload, H: Handler<T>, S: Serializer> TypedHandler<T, H, S> {
    pub fn with_serializer(handler: H, serializer: S) -> Self {
        Self {
            handler,
            codec: PayloadCodec::new(serializer),
            _marker: PhantomData,
        }
    }

    /// Decode and run with headers that were already parsed.
    pub(crate) async fn handle_decoded(
        &self,
        record: &MessageRecord,
        headers: MessageHeaders,
    ) -> Result<(), HandlerError> {
        let payload: T = self
            .codec
            .decode_body(&headers, &record.body)
            .map_err(|e| HandlerError::poison(e.to_string()))?;
        let context = MessageContext::new(record, headers);
        self.handler.handle(payload, &context).await
    }
}

#[async_trait]
impl<T: Payload, H: Handler<T>, S: Serializer> MessageHandler for TypedHandler<T, H, S> {
    async fn handle(&self, message: &MessageRecord) -> Result<(), HandlerError> {
        let headers = self
            .codec
            .decode_headers(&message.headers)
            .map_err(|e| HandlerError::poison(e.to_string()))?;
        self.handle_decoded(message, headers).await
    }
}
