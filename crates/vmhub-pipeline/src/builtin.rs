//! Built-in interceptors and filters

use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, warn, Instrument};
use vmhub_observability::create_call_span;

use vmhub_core::{
    ChangeSet, FilterContext, FilterOutcome, HubError, Identity, PendingCall, Result, ViewModel,
    ViewModelFilter,
};

use crate::chain::{Interceptor, Next};

/// Logs every call with its outcome and elapsed time
#[derive(Debug, Default, Clone)]
pub struct TracingInterceptor;

impl TracingInterceptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Interceptor for TracingInterceptor {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn intercept(&self, call: &mut PendingCall, next: Next<'_>) -> Result<()> {
        let span = create_call_span(
            call.kind,
            &call.connection_id,
            &call.vm_id,
            call.identity.display_name(),
        );
        let started = Instant::now();

        let result = next.run(call).instrument(span.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        span.in_scope(|| match &result {
            Ok(()) => debug!(elapsed_ms, "Call completed"),
            Err(e) => warn!(elapsed_ms, kind = e.kind(), error = %e, "Call failed"),
        });
        result
    }
}

/// Turns a header value into an identity.
///
/// Returning `Ok(None)` leaves the call identity untouched; an error fails
/// the call.
pub trait IdentityExtractor: Send + Sync {
    fn extract(&self, header: &Value) -> Result<Option<Identity>>;
}

/// Accepts an identity spelled out in the header: either a subject string
/// or an object `{"subject", "roles", "claims"}`.
///
/// Performs no verification; only use it behind a trusted front end.
#[derive(Debug, Default, Clone)]
pub struct PlainIdentityExtractor;

impl IdentityExtractor for PlainIdentityExtractor {
    fn extract(&self, header: &Value) -> Result<Option<Identity>> {
        match header {
            Value::Null => Ok(None),
            Value::String(subject) if subject.is_empty() => Ok(None),
            Value::String(subject) => Ok(Some(Identity::user(subject.clone()))),
            Value::Object(_) => {
                let identity: Identity = serde_json::from_value(header.clone())
                    .map_err(|e| HubError::unauthorized(format!("malformed identity header: {}", e)))?;
                Ok(Some(identity))
            }
            _ => Err(HubError::unauthorized("malformed identity header")),
        }
    }
}

/// Replaces the call identity with one extracted from a header
pub struct HeaderIdentityInterceptor<E> {
    header: String,
    extractor: E,
}

impl<E: IdentityExtractor> HeaderIdentityInterceptor<E> {
    pub fn new(header: impl Into<String>, extractor: E) -> Self {
        Self {
            header: header.into(),
            extractor,
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }
}

#[async_trait]
impl<E: IdentityExtractor> Interceptor for HeaderIdentityInterceptor<E> {
    fn name(&self) -> &str {
        "header-identity"
    }

    async fn intercept(&self, call: &mut PendingCall, next: Next<'_>) -> Result<()> {
        let extracted = match call.header(&self.header) {
            Some(value) => self.extractor.extract(value)?,
            None => None,
        };
        if let Some(identity) = extracted {
            debug!(
                connection_id = %call.connection_id,
                caller = identity.display_name(),
                "Identity taken from header"
            );
            call.identity = identity;
        }
        next.run(call).await
    }
}

/// Enforces [`ViewModelMetadata`](vmhub_core::ViewModelMetadata) on every
/// request and update
#[derive(Debug, Default, Clone)]
pub struct RoleAuthorizationFilter;

impl RoleAuthorizationFilter {
    pub fn new() -> Self {
        Self
    }

    fn authorize(&self, ctx: &FilterContext<'_>, vm: &dyn ViewModel) -> Result<FilterOutcome> {
        let metadata = vm.metadata();
        if ctx.identity.is_anonymous() && !metadata.allow_anonymous {
            return Err(HubError::unauthorized(format!(
                "'{}' requires an authenticated caller",
                ctx.vm_id
            )));
        }
        if let Some(role) = metadata
            .required_roles
            .iter()
            .find(|role| !ctx.identity.has_role(role))
        {
            return Err(HubError::unauthorized(format!(
                "'{}' requires role '{}'",
                ctx.vm_id, role
            )));
        }
        Ok(FilterOutcome::Continue)
    }
}

#[async_trait]
impl ViewModelFilter for RoleAuthorizationFilter {
    fn name(&self) -> &str {
        "role-authorization"
    }

    async fn before_request(
        &self,
        ctx: &FilterContext<'_>,
        vm: &dyn ViewModel,
        _arg: &mut Option<Value>,
    ) -> Result<FilterOutcome> {
        self.authorize(ctx, vm)
    }

    async fn before_update(
        &self,
        ctx: &FilterContext<'_>,
        vm: &dyn ViewModel,
        _changes: &mut ChangeSet,
    ) -> Result<FilterOutcome> {
        self.authorize(ctx, vm)
    }
}
