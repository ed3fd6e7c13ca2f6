//! vmhub pipeline - cross-cutting logic around every protocol operation.
//!
//! Interceptors are composed into one [`Chain`] per [`CallKind`]; each one
//! receives the mutable [`PendingCall`] and a [`Next`] continuation it may
//! run, wrap, or skip. Exception translators rewrite failures before they
//! are reported, and view-model filters travel with the pipeline into every
//! registry.
//!
//! [`CallKind`]: vmhub_core::CallKind
//! [`PendingCall`]: vmhub_core::PendingCall

pub mod builtin;
pub mod chain;
pub mod pipeline;
pub mod translate;

pub use builtin::{
    HeaderIdentityInterceptor, IdentityExtractor, PlainIdentityExtractor,
    RoleAuthorizationFilter, TracingInterceptor,
};
pub use chain::{Chain, Interceptor, Next, Terminal};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use translate::{ExceptionTranslator, FnTranslator, MaskInternalErrors};
