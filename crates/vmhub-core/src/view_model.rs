//! View model abstraction
//!
//! A view model is server-side state exposed to one connection under a
//! string id. The registry owns instances; builders create them by type tag.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::identity::Identity;
use crate::protocol::{ChangeSet, VmId};

/// Boxed error returned by view-model code
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Static facts about a view model consulted by filters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewModelMetadata {
    /// Every listed role is required
    #[serde(default)]
    pub required_roles: Vec<String>,
    /// Whether anonymous callers may use the view model
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ViewModelMetadata {
    fn default() -> Self {
        Self {
            required_roles: Vec::new(),
            allow_anonymous: true,
        }
    }
}

impl ViewModelMetadata {
    /// Metadata requiring an authenticated caller holding `roles`
    pub fn require_roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_roles: roles.into_iter().map(Into::into).collect(),
            allow_anonymous: false,
        }
    }
}

/// Server-side state object
#[async_trait]
pub trait ViewModel: Send + Sync {
    /// Full current state
    fn state(&self) -> Value;

    /// Apply one property-path update
    async fn apply(&mut self, path: &str, value: Value) -> Result<(), BoxError>;

    /// Drain changes recorded since the last call.
    ///
    /// `None` or an empty set means nothing observable changed.
    fn take_changes(&mut self) -> Option<ChangeSet>;

    fn metadata(&self) -> ViewModelMetadata {
        ViewModelMetadata::default()
    }

    /// Called once when the instance is released
    fn on_dispose(&mut self) {}
}

/// Lets a view model announce changes made outside request/update handling.
///
/// `notify` only queues the view-model id; the registry drains the
/// instance's changes and pushes them on its own task.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    vm_id: String,
    tx: mpsc::UnboundedSender<String>,
}

impl ChangeNotifier {
    pub fn new(vm_id: impl Into<String>, tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            tx,
        }
    }

    /// A notifier with no registry behind it
    pub fn detached(vm_id: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new(vm_id, tx)
    }

    /// Queue a push; returns false once the owning registry is gone
    pub fn notify(&self) -> bool {
        self.tx.send(self.vm_id.clone()).is_ok()
    }

    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything a builder may consult when constructing an instance
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub connection_id: String,
    /// Full id, including any instance suffix
    pub vm_id: String,
    pub arg: Option<Value>,
    pub identity: Identity,
    pub notifier: ChangeNotifier,
}

impl BuildContext {
    pub fn type_name(&self) -> &str {
        VmId::parse(&self.vm_id).type_name()
    }

    pub fn instance(&self) -> Option<&str> {
        VmId::parse(&self.vm_id).instance()
    }
}

/// Constructs view models of one type
#[async_trait]
pub trait ViewModelBuilder: Send + Sync {
    async fn build(&self, ctx: BuildContext) -> Result<Box<dyn ViewModel>, BoxError>;
}

/// Builder backed by a synchronous closure
pub struct FnBuilder<F>(pub F);

#[async_trait]
impl<F> ViewModelBuilder for FnBuilder<F>
where
    F: Fn(BuildContext) -> Result<Box<dyn ViewModel>, BoxError> + Send + Sync,
{
    async fn build(&self, ctx: BuildContext) -> Result<Box<dyn ViewModel>, BoxError> {
        (self.0)(ctx)
    }
}
