//! Exception translation

use tracing::warn;

use vmhub_core::{HubError, PendingCall};

/// Rewrites an error before it is reported to the client.
///
/// Translators run in registration order, each seeing the previous one's
/// output.
pub trait ExceptionTranslator: Send + Sync {
    fn name(&self) -> &str;

    fn translate(&self, call: &PendingCall, error: HubError) -> HubError;
}

/// Translator backed by a closure
pub struct FnTranslator<F> {
    name: String,
    f: F,
}

impl<F> FnTranslator<F>
where
    F: Fn(&PendingCall, HubError) -> HubError + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> ExceptionTranslator for FnTranslator<F>
where
    F: Fn(&PendingCall, HubError) -> HubError + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn translate(&self, call: &PendingCall, error: HubError) -> HubError {
        (self.f)(call, error)
    }
}

/// Hides errors outside the client-facing taxonomy behind a generic
/// `TranslatedError`; the original is logged.
#[derive(Debug, Clone)]
pub struct MaskInternalErrors {
    message: String,
}

impl Default for MaskInternalErrors {
    fn default() -> Self {
        Self {
            message: "An internal error occurred".to_string(),
        }
    }
}

impl MaskInternalErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl ExceptionTranslator for MaskInternalErrors {
    fn name(&self) -> &str {
        "mask-internal-errors"
    }

    fn translate(&self, call: &PendingCall, error: HubError) -> HubError {
        if error.is_public() {
            return error;
        }
        warn!(
            kind = %call.kind,
            connection_id = %call.connection_id,
            vm_id = %call.vm_id,
            error = %error,
            "Masking internal error"
        );
        HubError::translated(self.message.clone())
    }
}
