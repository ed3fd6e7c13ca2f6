//! The composed pipeline shared by every connection

use std::fmt;
use std::sync::Arc;
use tracing::debug;

use vmhub_core::{CallKind, FilterSet, HubError, PendingCall, Result, ViewModelFilter};

use crate::chain::{Chain, Interceptor, Terminal};
use crate::translate::ExceptionTranslator;

/// One chain per call kind plus translators and view-model filters.
///
/// Composed once at startup and read-only afterwards; cloning is cheap.
#[derive(Clone, Default)]
pub struct Pipeline {
    request: Chain,
    update: Chain,
    dispose: Chain,
    response: Chain,
    disconnect: Chain,
    translators: Arc<Vec<Arc<dyn ExceptionTranslator>>>,
    filters: FilterSet,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let translators: Vec<&str> = self.translators.iter().map(|t| t.name()).collect();
        f.debug_struct("Pipeline")
            .field("request", &self.request)
            .field("update", &self.update)
            .field("dispose", &self.dispose)
            .field("response", &self.response)
            .field("disconnect", &self.disconnect)
            .field("translators", &translators)
            .field("filters", &self.filters)
            .finish()
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn chain(&self, kind: CallKind) -> &Chain {
        match kind {
            CallKind::Request => &self.request,
            CallKind::Update => &self.update,
            CallKind::Dispose => &self.dispose,
            CallKind::Response => &self.response,
            CallKind::Disconnect => &self.disconnect,
        }
    }

    /// Run the chain matching `call.kind` around `terminal`
    pub async fn run(&self, call: &mut PendingCall, terminal: &dyn Terminal) -> Result<()> {
        self.chain(call.kind).run(call, terminal).await
    }

    /// Pass `error` through every translator in order
    pub fn translate(&self, call: &PendingCall, error: HubError) -> HubError {
        self.translators.iter().fold(error, |error, translator| {
            let translated = translator.translate(call, error);
            debug!(
                translator = translator.name(),
                kind = translated.kind(),
                "Translated error"
            );
            translated
        })
    }

    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    pub fn translator_count(&self) -> usize {
        self.translators.len()
    }
}

/// Collects interceptors, translators and filters in registration order
#[derive(Default)]
pub struct PipelineBuilder {
    request: Vec<Arc<dyn Interceptor>>,
    update: Vec<Arc<dyn Interceptor>>,
    dispose: Vec<Arc<dyn Interceptor>>,
    response: Vec<Arc<dyn Interceptor>>,
    disconnect: Vec<Arc<dyn Interceptor>>,
    translators: Vec<Arc<dyn ExceptionTranslator>>,
    filters: Vec<Arc<dyn ViewModelFilter>>,
}

impl PipelineBuilder {
    /// Append an interceptor to the chain for `kind`
    pub fn intercept(mut self, kind: CallKind, interceptor: Arc<dyn Interceptor>) -> Self {
        let chain = match kind {
            CallKind::Request => &mut self.request,
            CallKind::Update => &mut self.update,
            CallKind::Dispose => &mut self.dispose,
            CallKind::Response => &mut self.response,
            CallKind::Disconnect => &mut self.disconnect,
        };
        chain.push(interceptor);
        self
    }

    pub fn on_request(self, interceptor: impl Interceptor + 'static) -> Self {
        self.intercept(CallKind::Request, Arc::new(interceptor))
    }

    pub fn on_update(self, interceptor: impl Interceptor + 'static) -> Self {
        self.intercept(CallKind::Update, Arc::new(interceptor))
    }

    pub fn on_dispose(self, interceptor: impl Interceptor + 'static) -> Self {
        self.intercept(CallKind::Dispose, Arc::new(interceptor))
    }

    pub fn on_response(self, interceptor: impl Interceptor + 'static) -> Self {
        self.intercept(CallKind::Response, Arc::new(interceptor))
    }

    pub fn on_disconnect(self, interceptor: impl Interceptor + 'static) -> Self {
        self.intercept(CallKind::Disconnect, Arc::new(interceptor))
    }

    /// Append one shared interceptor to every chain
    pub fn around_all(self, interceptor: Arc<dyn Interceptor>) -> Self {
        [
            CallKind::Request,
            CallKind::Update,
            CallKind::Dispose,
            CallKind::Response,
            CallKind::Disconnect,
        ]
        .into_iter()
        .fold(self, |builder, kind| {
            builder.intercept(kind, Arc::clone(&interceptor))
        })
    }

    pub fn translate_with(mut self, translator: impl ExceptionTranslator + 'static) -> Self {
        self.translators.push(Arc::new(translator));
        self
    }

    pub fn filter(mut self, filter: impl ViewModelFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            request: Chain::new(self.request),
            update: Chain::new(self.update),
            dispose: Chain::new(self.dispose),
            response: Chain::new(self.response),
            disconnect: Chain::new(self.disconnect),
            translators: Arc::new(self.translators),
            filters: FilterSet::new(self.filters),
        }
    }
}
