//! Session gateway
//!
//! Entry point for every inbound protocol message and disconnect event.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use vmhub_core::{
    CallKind, ChangeSet, HubError, Identity, PendingCall, Response, Result, ViewModelTypes,
};
use vmhub_pipeline::{Pipeline, Terminal};
use vmhub_session::{
    FactoryConfig, PushCallback, RegistryBuilder, RegistryFactory, SweepHandle, ViewModelRegistry,
};

use crate::transport::{Transport, TransportError};

/// Gateway behaviour switches
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub factory: FactoryConfig,
    /// Run update failures through the exception translators, like
    /// request failures. When false they are reported untranslated.
    pub translate_update_errors: bool,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            factory: FactoryConfig::default(),
            translate_update_errors: true,
        }
    }
}

impl GatewayOptions {
    pub fn with_factory(mut self, factory: FactoryConfig) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_translate_update_errors(mut self, enabled: bool) -> Self {
        self.translate_update_errors = enabled;
        self
    }
}

/// Per-message facts supplied by the transport
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub connection_id: String,
    /// Identity resolved for this message only
    pub identity: Identity,
    pub headers: Option<Value>,
}

impl InboundContext {
    pub fn new(connection_id: impl Into<String>, identity: Identity) -> Self {
        Self {
            connection_id: connection_id.into(),
            identity,
            headers: None,
        }
    }

    pub fn with_headers(mut self, headers: Option<Value>) -> Self {
        self.headers = headers;
        self
    }
}

struct GatewayInner {
    factory: Arc<RegistryFactory>,
    pipeline: Pipeline,
    transport: Arc<dyn Transport>,
    options: GatewayOptions,
}

/// Facade the transport invokes; cheap to clone
#[derive(Clone)]
pub struct SessionGateway {
    inner: Arc<GatewayInner>,
}

impl std::fmt::Debug for SessionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGateway")
            .field("factory", &self.inner.factory)
            .field("pipeline", &self.inner.pipeline)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl SessionGateway {
    /// Must be called inside a tokio runtime
    pub fn new(
        types: ViewModelTypes,
        pipeline: Pipeline,
        transport: Arc<dyn Transport>,
        options: GatewayOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<GatewayInner>| {
            let weak = weak.clone();
            let filters = pipeline.filters().clone();

            // each registry gets its own push queue, drained in order
            let builder: RegistryBuilder = Arc::new(move |connection_id: &str| {
                let (tx, rx) = mpsc::unbounded_channel::<Response>();
                let push: PushCallback = Arc::new(move |response| {
                    let _ = tx.send(response);
                });
                let registry =
                    ViewModelRegistry::new(connection_id, types.clone(), filters.clone(), push);
                tokio::spawn(dispatch_pushes(weak.clone(), Arc::downgrade(&registry), rx));
                registry
            });

            GatewayInner {
                factory: Arc::new(RegistryFactory::new(options.factory.clone(), builder)),
                pipeline,
                transport,
                options,
            }
        });
        Self { inner }
    }

    pub fn factory(&self) -> &Arc<RegistryFactory> {
        &self.inner.factory
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.inner.options
    }

    /// Start the idle sweep; it stops when the handle is dropped
    pub fn spawn_sweeper(&self) -> SweepHandle {
        self.inner.factory.spawn_sweeper()
    }

    /// Handle `RequestVM`.
    ///
    /// An error is returned after it has been reported to the connection.
    pub async fn request_vm(
        &self,
        ctx: InboundContext,
        vm_id: impl Into<String>,
        arg: Option<Value>,
    ) -> Result<()> {
        let call = PendingCall::request(ctx.connection_id, vm_id, arg, ctx.identity)
            .with_headers(ctx.headers);
        self.inner.handle(call).await
    }

    /// Handle `UpdateVM`.
    ///
    /// An error is returned after it has been reported to the connection.
    pub async fn update_vm(
        &self,
        ctx: InboundContext,
        vm_id: impl Into<String>,
        changes: ChangeSet,
    ) -> Result<()> {
        let call = PendingCall::update(ctx.connection_id, vm_id, changes, ctx.identity)
            .with_headers(ctx.headers);
        self.inner.handle(call).await
    }

    /// Handle `DisposeVM`; failures are logged only
    pub async fn dispose_vm(&self, ctx: InboundContext, vm_id: impl Into<String>) {
        let call = PendingCall::dispose(ctx.connection_id, vm_id, ctx.identity)
            .with_headers(ctx.headers);
        let _ = self.inner.handle(call).await;
    }

    /// Run the disconnect chain, then drop the connection's registry
    /// whatever the chain did
    pub async fn disconnect(&self, ctx: InboundContext) {
        let connection_id = ctx.connection_id.clone();
        let mut call =
            PendingCall::disconnect(ctx.connection_id, ctx.identity).with_headers(ctx.headers);

        if let Err(e) = self.inner.pipeline.run(&mut call, &NoopTerminal).await {
            warn!(connection_id = %connection_id, kind = e.kind(), error = %e, "Disconnect chain failed");
        }
        let removed = self.inner.factory.remove(&connection_id).await;
        debug!(connection_id = %connection_id, removed, "Connection disconnected");
    }
}

impl GatewayInner {
    async fn handle(&self, mut call: PendingCall) -> Result<()> {
        // errors are answered under the id the client used
        let connection_id = call.connection_id.clone();
        let vm_id = call.vm_id.clone();

        let terminal = RegistryTerminal {
            factory: &self.factory,
        };
        let error = match self.pipeline.run(&mut call, &terminal).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        let error = match call.kind {
            CallKind::Dispose => {
                warn!(connection_id = %connection_id, vm_id = %vm_id, error = %error, "Dispose failed");
                return Err(error);
            }
            CallKind::Update if !self.options.translate_update_errors => error,
            _ => self.pipeline.translate(&call, error),
        };

        warn!(
            kind = %call.kind,
            connection_id = %connection_id,
            vm_id = %vm_id,
            error_kind = error.kind(),
            error = %error,
            "Call failed"
        );
        let response = Response::error(&connection_id, &vm_id, &error);
        if let Err(e) = self
            .transport
            .send(&response.connection_id, &response.vm_id, response.data)
            .await
        {
            warn!(connection_id = %connection_id, error = %e, "Failed to send error response");
        }
        Err(error)
    }

    /// Send one push from `origin` through the response chain
    async fn dispatch(&self, origin: &Weak<ViewModelRegistry>, response: Response) {
        let connection_id = response.connection_id.clone();
        let vm_id = response.vm_id.clone();
        let mut call = PendingCall::response(response, Identity::anonymous());
        let terminal = SendTerminal {
            inner: self,
            origin,
        };

        if let Err(e) = self.pipeline.run(&mut call, &terminal).await {
            warn!(connection_id = %connection_id, vm_id = %vm_id, error = %e, "Push failed");
        }
    }
}

async fn dispatch_pushes(
    inner: Weak<GatewayInner>,
    origin: Weak<ViewModelRegistry>,
    mut rx: mpsc::UnboundedReceiver<Response>,
) {
    while let Some(response) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(&origin, response).await;
    }
}

/// Invokes the registry for inbound calls
struct RegistryTerminal<'a> {
    factory: &'a RegistryFactory,
}

#[async_trait]
impl Terminal for RegistryTerminal<'_> {
    async fn invoke(&self, call: &mut PendingCall) -> Result<()> {
        match call.kind {
            CallKind::Request => {
                let registry = self.factory.get_or_create(&call.connection_id);
                let arg = call.payload.take();
                registry.request_vm(&call.identity, &call.vm_id, arg).await
            }
            CallKind::Update => {
                let registry = self.factory.get_or_create(&call.connection_id);
                let changes = call.take_changes()?;
                registry.update_vm(&call.identity, &call.vm_id, changes).await
            }
            CallKind::Dispose => {
                let registry = self.factory.get_or_create(&call.connection_id);
                registry.dispose_vm(&call.vm_id).await;
                Ok(())
            }
            CallKind::Response | CallKind::Disconnect => Err(HubError::internal(format!(
                "{} is not an inbound call",
                call.kind
            ))),
        }
    }
}

/// Sends a push if the registry that produced it is still the live one
/// for its connection
struct SendTerminal<'a> {
    inner: &'a GatewayInner,
    origin: &'a Weak<ViewModelRegistry>,
}

#[async_trait]
impl Terminal for SendTerminal<'_> {
    async fn invoke(&self, call: &mut PendingCall) -> Result<()> {
        let Some(data) = call.take_response_data() else {
            return Ok(());
        };
        let live = self.inner.factory.get(&call.connection_id);
        if !live.is_some_and(|live| Weak::ptr_eq(self.origin, &Arc::downgrade(&live))) {
            debug!(connection_id = %call.connection_id, vm_id = %call.vm_id, "Registry no longer live, push dropped");
            return Ok(());
        }

        match self.inner.transport.send(&call.connection_id, &call.vm_id, data).await {
            Ok(()) => Ok(()),
            Err(TransportError::NotFound(_)) => {
                debug!(connection_id = %call.connection_id, "Transport has no such connection, push dropped");
                Ok(())
            }
            Err(e) => Err(HubError::internal(e.to_string())),
        }
    }
}

struct NoopTerminal;

#[async_trait]
impl Terminal for NoopTerminal {
    async fn invoke(&self, _call: &mut PendingCall) -> Result<()> {
        Ok(())
    }
}
