//! Engine services shipped with the runtime.

pub mod client;
pub mod property;

pub use client::PropertyClientService;
pub use property::{register_property_schemas, PropertyManagerService};
