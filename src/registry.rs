//! Channel registry
//!
//! Descriptors are collected in a [`RegistryBuilder`] and frozen into a
//! [`Registry`] before any dispatcher or proxy is built. A frozen registry has
//! no mutation path.

use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::{Channel, ChannelDescriptor, Contract};
use crate::error::{SetupError, SetupResult};

/// Longest channel name the wire format can carry
pub const MAX_CHANNEL_NAME_LEN: usize = 255;

/// Immutable set of channel descriptors
#[derive(Debug, Clone, Default)]
pub struct Registry {
    // Registration order, for `list()`
    descriptors: Vec<ChannelDescriptor>,
    index: HashMap<&'static str, usize>,
}

impl Registry {
    /// Start an empty registry builder
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Build the registry for every channel of contract `K`
    pub fn of<K: Contract>() -> SetupResult<Arc<Self>> {
        let mut builder = Self::builder();
        for descriptor in K::descriptors() {
            builder.register(descriptor)?;
        }
        Ok(builder.build())
    }

    /// Look up a channel by wire name
    pub fn get(&self, name: &str) -> Option<&ChannelDescriptor> {
        self.index.get(name).map(|&i| &self.descriptors[i])
    }

    /// Whether a channel with this name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All descriptors, in registration order
    pub fn list(&self) -> &[ChannelDescriptor] {
        &self.descriptors
    }

    /// Number of registered channels
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether no channel is registered
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Check that this (host) registry can serve every channel of `guest`
    ///
    /// Extra host channels are fine; a missing or differently shaped channel
    /// is a setup error.
    pub fn check_serves(&self, guest: &Registry) -> SetupResult<()> {
        for wanted in guest.list() {
            let Some(ours) = self.get(wanted.name()) else {
                return Err(SetupError::MissingChannel(wanted.name().to_string()));
            };
            if !ours.is_compatible(wanted) {
                return Err(SetupError::IncompatibleBinding {
                    name: wanted.name().to_string(),
                    expected: ours.signature(),
                    actual: wanted.signature(),
                });
            }
        }
        Ok(())
    }
}

/// Accumulates descriptors until [`build`](Self::build) freezes them
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    inner: Registry,
}

impl RegistryBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor
    ///
    /// Fails if the name is taken; the registry keeps the first descriptor.
    pub fn register(&mut self, descriptor: ChannelDescriptor) -> SetupResult<&mut Self> {
        let name = descriptor.name();
        validate_name(name)?;
        if self.inner.index.contains_key(name) {
            return Err(SetupError::DuplicateChannel(name.to_string()));
        }

        tracing::debug!(channel = %name, signature = %descriptor, "registered channel");
        self.inner.index.insert(name, self.inner.descriptors.len());
        self.inner.descriptors.push(descriptor);
        Ok(self)
    }

    /// Add the descriptor of channel `C`
    pub fn channel<C: Channel>(&mut self) -> SetupResult<&mut Self> {
        self.register(C::descriptor())
    }

    /// Add every channel of contract `K`
    pub fn contract<K: Contract>(&mut self) -> SetupResult<&mut Self> {
        for descriptor in K::descriptors() {
            self.register(descriptor)?;
        }
        Ok(self)
    }

    /// Freeze the registered channels into an immutable registry
    pub fn build(self) -> Arc<Registry> {
        Arc::new(self.inner)
    }
}

fn validate_name(name: &str) -> SetupResult<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.len() > MAX_CHANNEL_NAME_LEN {
        "name is longer than 255 bytes"
    } else if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
        "name contains whitespace or control characters"
    } else {
        return Ok(());
    };
    Err(SetupError::InvalidChannelName {
        name: name.to_string(),
        reason,
    })
}
