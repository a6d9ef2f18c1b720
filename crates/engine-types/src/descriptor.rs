//! # Service Descriptor
//!
//! Static metadata an engine service submits to the lifecycle manager:
//! its globally unique name, its version and the services it depends on.
//!
//! ## Example
//!
//! ```rust
//! use engine_types::ServiceDescriptor;
//!
//! let descriptor = ServiceDescriptor::new("aasb.customDomain", "1.0")
//!     .depends_on(["aace.messageBroker"]);
//!
//! assert!(descriptor.validate().is_ok());
//! assert!(descriptor.depends_on_service("aace.messageBroker"));
//! ```

use crate::errors::DescriptorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

/// Identity and dependency metadata of an engine service.
///
/// Equality and hashing are by `name` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    name: String,
    version: String,
    #[serde(default)]
    dependencies: BTreeSet<String>,
}

impl ServiceDescriptor {
    /// Create a descriptor with no dependencies.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dependencies: BTreeSet::new(),
        }
    }

    /// Add dependencies. Every dependency must reach `PostRegistered` before
    /// this service's post-register hook runs.
    #[must_use]
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    #[must_use]
    pub fn depends_on_service(&self, name: &str) -> bool {
        self.dependencies.contains(name)
    }

    /// Check the descriptor is well formed.
    ///
    /// # Errors
    ///
    /// - `DescriptorError::EmptyName` - the name is blank
    /// - `DescriptorError::SelfDependency` - the service lists itself
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.name.trim().is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        if self.dependencies.contains(&self.name) {
            return Err(DescriptorError::SelfDependency {
                service: self.name.clone(),
            });
        }
        Ok(())
    }
}

impl PartialEq for ServiceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ServiceDescriptor {}

impl Hash for ServiceDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}
