//! Producer - 型付きの enqueue
//!
//! correlation id は producer 側で決めてから enqueue する。
//! 呼び出し側は返り値の `SentMessage` で status を追跡できる。

use std::marker::PhantomData;

use super::codec::PayloadCodec;
use super::payload::{MessageHeaders, Payload};
use crate::domain::{CorrelationId, EnqueueOptions, QueueId};
use crate::engine::LifecycleEngine;
use crate::error::Result;
use crate::ports::{JsonSerializer, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub queue_id: QueueId,
    pub correlation_id: CorrelationId,
}

pub struct Producer<T, S = JsonSerializer> {
    engine: LifecycleEngine,
    codec: PayloadCodec<S>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Payload> Producer<T, JsonSerializer> {
    pub fn new(engine: LifecycleEngine) -> Self {
        Self::with_serializer(engine, JsonSerializer)
    }
}

impl<T: Payload, S: Serializer> Producer<T, S> {
    pub fn with_serializer(engine: LifecycleEngine, serializer: S) -> Self {
        Self {
            engine,
            codec: PayloadCodec::new(serializer),
            _marker: PhantomData,
        }
    }

    pub async fn send(&self, payload: &T) -> Result<SentMessage> {
        self.send_with(payload, EnqueueOptions::new()).await
    }

    pub async fn send_with(&self, payload: &T, options: EnqueueOptions) -> Result<SentMessage> {
        let headers = MessageHeaders::for_payload::<T>(self.codec.serializer().content_type());
        self.send_with_headers(payload, headers, options).await
    }

    /// Send with caller-supplied headers; `payload_type` is always overwritten.
    pub async fn send_with_headers(
        &self,
        payload: &T,
        mut headers: MessageHeaders,
        mut options: EnqueueOptions,
    ) -> Result<SentMessage> {
        headers.payload_type = T::TYPE.to_string();
        let correlation_id = *options
            .correlation_id
            .get_or_insert_with(CorrelationId::new);
        let (body, headers) = self.codec.encode(payload, &headers)?;
        let queue_id = self.engine.enqueue(body, headers, options).await?;
        Ok(SentMessage {
            queue_id,
            correlation_id,
        })
    }

    /// Enqueue each payload in order; stops at the first failure.
    pub async fn send_batch<'a, I>(&self, payloads: I) -> Result<Vec<SentMessage>>
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        let mut sent = Vec::new();
        for payload in payloads {
            sent.push(self.send(payload).await?);
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::QueueOptions;
    use crate::impls::InMemoryStore;
    use crate::typed::payload::fixtures::ResizeImage;

    fn engine(options: QueueOptions) -> LifecycleEngine {
        let store = Arc::new(InMemoryStore::new(&options));
        LifecycleEngine::new(store, options).unwrap()
    }

    #[tokio::test]
    async fn sends_typed_payload_with_headers() {
        let engine = engine(QueueOptions::new("images"));
        let producer = Producer::<ResizeImage>::new(engine.clone());
        let sent = producer
            .send(&ResizeImage {
                image_id: 9,
                width: 320,
            })
            .await
            .unwrap();

        let leased = engine.dequeue(None).await.unwrap().unwrap();
        assert_eq!(leased.queue_id, sent.queue_id);
        assert_eq!(leased.correlation_id, sent.correlation_id);

        let codec = PayloadCodec::new(JsonSerializer);
        let headers = codec.decode_headers(&leased.headers).unwrap();
        assert_eq!(headers.payload_type, ResizeImage::TYPE);
        assert_eq!(headers.content_type, "application/json");
        let body: ResizeImage = codec.decode_body(&headers, &leased.body).unwrap();
        assert_eq!(body.image_id, 9);
    }

    #[tokio::test]
    async fn keeps_caller_correlation_id_and_options() {
        let engine = engine(QueueOptions::new("images"));
        let producer = Producer::<ResizeImage>::new(engine.clone());
        let correlation_id = CorrelationId::new();
        let sent = producer
            .send_with(
                &ResizeImage {
                    image_id: 1,
                    width: 1,
                },
                EnqueueOptions::new()
                    .with_correlation_id(correlation_id)
                    .with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        assert_eq!(sent.correlation_id, correlation_id);
        assert!(engine.dequeue(None).await.unwrap().is_none());
        assert_eq!(engine.counts().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let engine = engine(QueueOptions::new("images"));
        let producer = Producer::<ResizeImage>::new(engine);
        let jobs: Vec<ResizeImage> = (0..3)
            .map(|i| ResizeImage {
                image_id: i,
                width: 10,
            })
            .collect();
        let sent = producer.send_batch(&jobs).await.unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent.windows(2).all(|w| w[0].queue_id < w[1].queue_id));
    }
}
