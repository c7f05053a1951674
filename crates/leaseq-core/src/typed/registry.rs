//! TypedRegistry - 1 つのキューに複数の Payload 型を流すための振り分け
//!
//! headers の payload_type を見て、登録済みの `TypedHandler` に渡す。
//! 未登録の payload_type は poison として扱う。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::codec::PayloadCodec;
use super::handler::{Handler, TypedHandler};
use super::payload::{MessageHeaders, Payload};
use crate::domain::MessageRecord;
use crate::ports::{JsonSerializer, Serializer};
use crate::worker::{HandlerError, MessageHandler};

#[async_trait]
trait DecodedHandler: Send + Sync {
    async fn handle_decoded(
        &self,
        record: &MessageRecord,
        headers: MessageHeaders,
    ) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T: Payload, H: Handler<T>, S: Serializer> DecodedHandler for TypedHandler<T, H, S> {
    async fn handle_decoded(
        &self,
        record: &MessageRecord,
        headers: MessageHeaders,
    ) -> Result<(), HandlerError> {
        TypedHandler::handle_decoded(self, record, headers).await
    }
}

pub struct TypedRegistry<S = JsonSerializer> {
    handlers: HashMap<String, Arc<dyn DecodedHandler>>,
    codec: PayloadCodec<S>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for payload type '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl TypedRegistry<JsonSerializer> {
    pub fn new() -> Self {
        Self::with_serializer(JsonSerializer)
    }
}

impl Default for TypedRegistry<JsonSerializer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Serializer + Clone> TypedRegistry<S> {
    pub fn with_serializer(serializer: S) -> Self {
        Self {
            handlers: HashMap::new(),
            codec: PayloadCodec::new(serializer),
        }
    }

    pub fn register<T: Payload, H: Handler<T>>(&mut self, handler: H) -> Result<(), RegistryError> {
        let payload_type = T::TYPE.to_string();
        if self.handlers.contains_key(&payload_type) {
            return Err(RegistryError::AlreadyRegistered(payload_type));
        }
        let typed = TypedHandler::<T, H, S>::with_serializer(handler, self.codec.serializer().clone());
        self.handlers.insert(payload_type, Arc::new(typed));
        Ok(())
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[async_trait]
impl<S: Serializer> MessageHandler for TypedRegistry<S> {
    async fn handle(&self, message: &MessageRecord) -> Result<(), HandlerError> {
        let headers = self
            .codec
            .decode_headers(&message.headers)
            .map_err(|e| HandlerError::poison(e.to_string()))?;
        let Some(handler) = self.handlers.get(&headers.payload_type) else {
            return Err(HandlerError::poison(format!(
                "no handler for payload type `{}`",
                headers.payload_type
            )));
        };
        handler.handle_decoded(message, headers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;

    use crate::domain::{AdditionalColumns, CorrelationId, NewMessage, QueueId};
    use crate::typed::handler::MessageContext;
    use crate::typed::payload::fixtures::{ResizeImage, SendEmail};

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    struct Resize(Arc<Log>);

    #[async_trait]
    impl Handler<ResizeImage> for Resize {
        async fn handle(&self, job: ResizeImage, _: &MessageContext) -> Result<(), HandlerError> {
            self.0.0.lock().unwrap().push(format!("resize {}", job.image_id));
            Ok(())
        }
    }

    struct Mail(Arc<Log>);

    #[async_trait]
    impl Handler<SendEmail> for Mail {
        async fn handle(&self, job: SendEmail, _: &MessageContext) -> Result<(), HandlerError> {
            self.0.0.lock().unwrap().push(format!("mail {}", job.to));
            Ok(())
        }
    }

    fn record<T: Payload>(payload: &T) -> MessageRecord {
        let codec = PayloadCodec::new(JsonSerializer);
        let headers = MessageHeaders::for_payload::<T>("application/json");
        let (body, headers) = codec.encode(payload, &headers).unwrap();
        let now = Utc::now();
        NewMessage {
            correlation_id: CorrelationId::new(),
            body,
            headers,
            queued_at: now,
            process_at: now,
            expires_at: None,
            route: None,
            priority: None,
            job_name: None,
            columns: AdditionalColumns::new(),
        }
        .into_record(QueueId::new(1))
    }

    #[test]
    fn double_registration_is_rejected() {
        let log = Arc::new(Log::default());
        let mut registry = TypedRegistry::new();
        registry.register::<ResizeImage, _>(Resize(log.clone())).unwrap();
        let result = registry.register::<ResizeImage, _>(Resize(log));
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn dispatches_by_payload_type() {
        let log = Arc::new(Log::default());
        let mut registry = TypedRegistry::new();
        registry.register::<ResizeImage, _>(Resize(log.clone())).unwrap();
        registry.register::<SendEmail, _>(Mail(log.clone())).unwrap();
        assert_eq!(
            registry.registered_types(),
            vec![ResizeImage::TYPE.to_string(), SendEmail::TYPE.to_string()]
        );

        registry
            .handle(&record(&ResizeImage {
                image_id: 3,
                width: 10,
            }))
            .await
            .unwrap();
        registry
            .handle(&record(&SendEmail {
                to: "a@example.com".into(),
                template: "welcome".into(),
            }))
            .await
            .unwrap();
        assert_eq!(
            *log.0.lock().unwrap(),
            vec!["resize 3".to_string(), "mail a@example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn unknown_payload_type_is_poison() {
        let registry = TypedRegistry::new();
        let err = registry
            .handle(&record(&SendEmail {
                to: "a@example.com".into(),
                template: "welcome".into(),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Poison(_)));
    }
}
