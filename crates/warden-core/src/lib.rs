//! Core types for warden, a lifecycle and resource governor for pluggable
//! security-analysis components.
//!
//! This crate holds what every other warden crate agrees on:
//!
//! - [`ComponentDescriptor`] and [`Criticality`]: who a component is and what it costs.
//! - [`LifecycleState`]: the single authoritative state of a component.
//! - [`ComponentPlugin`]: the fixed interface a component implements.
//! - [`RegistryStore`]: CAS-only durable store of component records, with
//!   [`InMemoryRegistry`] and [`FileRegistry`] backends.
//! - [`WardenConfig`] and [`WardenError`].

pub mod component;
pub mod config;
pub mod error;
pub mod file_registry;
pub mod plugin;
pub mod registry;
pub mod state;

pub use component::{ComponentDescriptor, Criticality};
pub use config::WardenConfig;
pub use error::WardenError;
pub use file_registry::FileRegistry;
pub use plugin::{ComponentPlugin, PluginError, PluginFuture};
pub use registry::{
    ComponentFilter, ComponentRecord, InMemoryRegistry, Listing, RegistryStore, StateUpdate,
};
pub use state::{LifecycleState, RestState, StateKind};
