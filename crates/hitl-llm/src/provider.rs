use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use hitl_types::HitlError;

use crate::{Request, Response, StreamEvent};

/// Incremental events for one generation call.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'a>>;

/// A text generation backend.
///
/// Stream failures are reported in-band as [`StreamEvent::Error`]; the
/// client turns them into a [`HitlError`] for the caller.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Registry key, also used in error messages.
    fn name(&self) -> &str;

    /// Model used when neither the request nor the client names one.
    fn default_model(&self) -> &str;

    async fn complete(&self, request: &Request) -> Result<Response, HitlError>;

    fn stream(&self, request: &Request) -> EventStream<'_>;

    /// Providers that return `false` are completed and replayed as a single
    /// delta by the client.
    fn supports_streaming(&self) -> bool {
        true
    }
}

/// Type-erased provider handle held by the client registry.
#[derive(Clone)]
pub struct DynProvider(Arc<dyn ProviderAdapter>);

impl DynProvider {
    pub fn new(provider: impl ProviderAdapter + 'static) -> Self {
        Self(Arc::new(provider))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn default_model(&self) -> &str {
        self.0.default_model()
    }

    pub fn supports_streaming(&self) -> bool {
        self.0.supports_streaming()
    }

    pub async fn complete(&self, request: &Request) -> Result<Response, HitlError> {
        self.0.complete(request).await
    }

    pub fn stream(&self, request: &Request) -> EventStream<'_> {
        self.0.stream(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FinishReason, Usage};

    /// Echoes the last message back; no streaming support.
    struct EchoProvider;

    #[async_trait]
    impl ProviderAdapter for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        fn default_model(&self) -> &str {
            "echo-1"
        }

        async fn complete(&self, request: &Request) -> Result<Response, HitlError> {
            let text = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(Response {
                id: "echo-0".into(),
                text,
                usage: Usage::default(),
                model: request.model.clone(),
                finish_reason: FinishReason::EndTurn,
            })
        }

        fn stream(&self, _request: &Request) -> EventStream<'_> {
            Box::pin(tokio_stream::empty::<StreamEvent>())
        }

        fn supports_streaming(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn dyn_provider_forwards_to_adapter() {
        let provider = DynProvider::new(EchoProvider);
        let resp = provider
            .complete(&Request::prompt("Be brief.", "Rain falls."))
            .await
            .unwrap();
        assert_eq!(resp.text, "Rain falls.");
        assert_eq!(provider.name(), "echo");
        assert_eq!(provider.default_model(), "echo-1");
        assert!(!provider.supports_streaming());
    }

    #[test]
    fn clones_share_the_adapter() {
        let provider = DynProvider::new(EchoProvider);
        let copy = provider.clone();
        assert!(Arc::ptr_eq(&provider.0, &copy.0));
    }
}
