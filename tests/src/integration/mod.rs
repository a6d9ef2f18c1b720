//! Integration flows across the engine crates.

pub mod broker_properties;
pub mod lifecycle_flows;
pub mod request_reply;
