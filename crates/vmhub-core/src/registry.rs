//! View-model type registry: type tag -> builder

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{HubError, Result};
use crate::view_model::{BoxError, BuildContext, FnBuilder, ViewModel, ViewModelBuilder};

/// Builders registered by type tag, populated at startup.
///
/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct ViewModelTypes {
    builders: Arc<DashMap<String, Arc<dyn ViewModelBuilder>>>,
}

impl fmt::Debug for ViewModelTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewModelTypes")
            .field("types", &self.type_names())
            .finish()
    }
}

impl ViewModelTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builder, replacing any previous one for the tag
    pub fn register<B>(&self, type_name: impl Into<String>, builder: B)
    where
        B: ViewModelBuilder + 'static,
    {
        let type_name = type_name.into();
        debug!(type_name = %type_name, "Registering view model type");
        self.builders.insert(type_name, Arc::new(builder));
    }

    /// Register a synchronous constructor
    pub fn register_fn<F>(&self, type_name: impl Into<String>, f: F)
    where
        F: Fn(BuildContext) -> std::result::Result<Box<dyn ViewModel>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.register(type_name, FnBuilder(f));
    }

    pub fn unregister(&self, type_name: &str) -> bool {
        self.builders.remove(type_name).is_some()
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn ViewModelBuilder>> {
        self.builders
            .get(type_name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.builders.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .builders
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// Construct the instance `ctx.vm_id` names.
    ///
    /// Fails with `NotFound` for an unknown type tag and `Instantiation`
    /// when the builder fails.
    pub async fn build(&self, ctx: BuildContext) -> Result<Box<dyn ViewModel>> {
        let vm_id = ctx.vm_id.clone();
        let builder = self
            .get(ctx.type_name())
            .ok_or_else(|| HubError::not_found(vm_id.clone()))?;

        builder
            .build(ctx)
            .await
            .map_err(|e| HubError::instantiation(vm_id, e.to_string()))
    }
}
