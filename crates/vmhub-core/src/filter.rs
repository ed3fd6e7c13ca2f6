//! View-model level filter hooks.
//!
//! Unlike interceptors, filters run after the instance is resolved, so
//! decisions can depend on [`ViewModel::metadata`].

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::identity::Identity;
use crate::protocol::ChangeSet;
use crate::view_model::ViewModel;

/// What a filter decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Continue,
    /// Stop silently; the call is treated as handled
    Veto,
}

/// Call details visible to a filter
#[derive(Debug, Clone, Copy)]
pub struct FilterContext<'a> {
    pub connection_id: &'a str,
    pub vm_id: &'a str,
    pub identity: &'a Identity,
}

/// Pre-request / pre-update hook.
///
/// Returning an error aborts the call and reports the error to the caller.
#[async_trait]
pub trait ViewModelFilter: Send + Sync {
    fn name(&self) -> &str;

    async fn before_request(
        &self,
        _ctx: &FilterContext<'_>,
        _vm: &dyn ViewModel,
        _arg: &mut Option<Value>,
    ) -> Result<FilterOutcome> {
        Ok(FilterOutcome::Continue)
    }

    async fn before_update(
        &self,
        _ctx: &FilterContext<'_>,
        _vm: &dyn ViewModel,
        _changes: &mut ChangeSet,
    ) -> Result<FilterOutcome> {
        Ok(FilterOutcome::Continue)
    }
}

/// Ordered filters shared by every registry
#[derive(Clone, Default)]
pub struct FilterSet {
    filters: Arc<Vec<Arc<dyn ViewModelFilter>>>,
}

impl fmt::Debug for FilterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.filters.iter().map(|filter| filter.name()).collect();
        f.debug_struct("FilterSet").field("filters", &names).finish()
    }
}

impl FilterSet {
    pub fn new(filters: Vec<Arc<dyn ViewModelFilter>>) -> Self {
        Self {
            filters: Arc::new(filters),
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run pre-request filters in order; the first veto wins
    pub async fn before_request(
        &self,
        ctx: &FilterContext<'_>,
        vm: &dyn ViewModel,
        arg: &mut Option<Value>,
    ) -> Result<FilterOutcome> {
        for filter in self.filters.iter() {
            if filter.before_request(ctx, vm, arg).await? == FilterOutcome::Veto {
                debug!(filter = filter.name(), vm_id = ctx.vm_id, "Request vetoed");
                return Ok(FilterOutcome::Veto);
            }
        }
        Ok(FilterOutcome::Continue)
    }

    /// Run pre-update filters in order; the first veto wins
    pub async fn before_update(
        &self,
        ctx: &FilterContext<'_>,
        vm: &dyn ViewModel,
        changes: &mut ChangeSet,
    ) -> Result<FilterOutcome> {
        for filter in self.filters.iter() {
            if filter.before_update(ctx, vm, changes).await? == FilterOutcome::Veto {
                debug!(filter = filter.name(), vm_id = ctx.vm_id, "Update vetoed");
                return Ok(FilterOutcome::Veto);
            }
        }
        Ok(FilterOutcome::Continue)
    }
}
