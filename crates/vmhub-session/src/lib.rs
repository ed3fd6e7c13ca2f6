//! vmhub session - connection-scoped view-model registries
//!
//! A [`ViewModelRegistry`] owns the live view models of one connection; the
//! [`RegistryFactory`] owns every registry, touching them on access and
//! evicting the ones left idle too long.

mod factory;
mod registry;

pub use factory::{FactoryConfig, RegistryBuilder, RegistryFactory, SweepHandle};
pub use registry::{PushCallback, ViewModelRegistry};
