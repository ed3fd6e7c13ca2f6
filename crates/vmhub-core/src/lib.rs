//! vmhub core - protocol building blocks shared by every vmhub crate.
//!
//! This crate defines what travels through a session: the caller
//! [`Identity`], the [`PendingCall`] record threaded through interceptors,
//! outbound [`Response`]s, the [`HubError`] taxonomy, and the
//! [`ViewModel`] abstraction together with the by-name type registry.

pub mod error;
pub mod filter;
pub mod identity;
pub mod path;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod view_model;

pub use error::{HubError, Result};
pub use filter::{FilterContext, FilterOutcome, FilterSet, ViewModelFilter};
pub use identity::Identity;
pub use path::{get_path, set_path, PathError};
pub use protocol::{CallKind, ChangeSet, PendingCall, Response, VmId, VM_ARG_KEY};
pub use registry::ViewModelTypes;
pub use state::{ObservableState, StateViewModel};
pub use view_model::{
    BoxError, BuildContext, ChangeNotifier, FnBuilder, ViewModel, ViewModelBuilder,
    ViewModelMetadata,
};
