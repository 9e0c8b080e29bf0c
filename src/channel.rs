//! Channel contracts and their two projections
//!
//! A [`Channel`] is declared once. The host side sees it through
//! [`ChannelDescriptor::handler_params`] (context handle first, then the user
//! parameters) and the [`Handler`](crate::Handler) trait; the guest side sees it
//! through [`ChannelDescriptor::caller_params`] and
//! [`GuestProxy::call`](crate::GuestProxy::call), which never mention the
//! context handle.

use std::fmt;
use std::time::Instant;

use crate::marshal::{ArgList, Marshal};

/// Primitive value kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Unit,
    Bool,
    Int,
    Float,
    Str,
}

/// Semantic type tag of a parameter or result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeSpec {
    Primitive(Primitive),
    /// A serde-serializable struct, copied by value
    Record,
    /// A raw byte buffer
    Bytes,
    /// The host-side invocation context; never crosses the boundary
    Context,
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Primitive(Primitive::Unit) => "unit",
            Self::Primitive(Primitive::Bool) => "bool",
            Self::Primitive(Primitive::Int) => "int",
            Self::Primitive(Primitive::Float) => "float",
            Self::Primitive(Primitive::Str) => "string",
            Self::Record => "record",
            Self::Bytes => "bytes",
            Self::Context => "context",
        };
        f.write_str(name)
    }
}

/// A named parameter slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: TypeSpec,
}

impl ParamSpec {
    pub const fn new(name: &'static str, ty: TypeSpec) -> Self {
        Self { name, ty }
    }

    const fn context() -> Self {
        Self::new("ctx", TypeSpec::Context)
    }
}

/// Schema of one operation: its name, user parameters and result type
///
/// The context handle is not stored in `params`; it is added by
/// [`handler_params`](Self::handler_params) only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelDescriptor {
    name: &'static str,
    params: Vec<ParamSpec>,
    result: TypeSpec,
}

impl ChannelDescriptor {
    /// Describe a channel from its user parameters and result
    pub fn new(name: &'static str, params: Vec<ParamSpec>, result: TypeSpec) -> Self {
        Self {
            name,
            params,
            result,
        }
    }

    /// Wire name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Result type
    pub fn result(&self) -> TypeSpec {
        self.result
    }

    /// Parameters of the handler shape: context handle, then user parameters
    pub fn handler_params(&self) -> Vec<ParamSpec> {
        let mut params = Vec::with_capacity(self.params.len() + 1);
        params.push(ParamSpec::context());
        params.extend(self.params.iter().cloned());
        params
    }

    /// Parameters of the caller shape: user parameters only
    pub fn caller_params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Whether two descriptors have the same call shape
    ///
    /// Parameter names are documentation only; arity, types and result decide.
    pub fn is_compatible(&self, other: &ChannelDescriptor) -> bool {
        self.name == other.name
            && self.result == other.result
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.ty == b.ty)
    }

    /// Compact signature, e.g. `double(int) -> int`
    pub fn signature(&self) -> String {
        let params: Vec<String> = self.params.iter().map(|p| p.ty.to_string()).collect();
        format!("{}({}) -> {}", self.name, params.join(", "), self.result)
    }
}

impl fmt::Display for ChannelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

/// A typed operation that can cross the boundary
///
/// Usually generated by [`contract!`](crate::contract).
pub trait Channel: Send + Sync + 'static {
    /// Wire name; unique within a registry
    const NAME: &'static str;

    /// User arguments as a tuple, in declaration order
    type Args: ArgList;

    type Output: Marshal;

    /// Parameter names, used for documentation and diagnostics
    fn param_names() -> &'static [&'static str] {
        &[]
    }

    fn descriptor() -> ChannelDescriptor {
        ChannelDescriptor::new(
            Self::NAME,
            Self::Args::specs(Self::param_names()),
            Self::Output::SPEC,
        )
    }
}

/// A closed set of channels that one guest may call
pub trait Contract: Send + Sync + 'static {
    fn descriptors() -> Vec<ChannelDescriptor>;
}

/// Marks `Self` as one of the channels of contract `K`
///
/// [`GuestProxy<K>`](crate::GuestProxy) only accepts channels implementing
/// `Member<K>`, so calling a channel outside the contract does not compile.
pub trait Member<K: Contract>: Channel {}

/// Opaque per-call context handed to host handlers
///
/// Only the dispatcher can create one; guests never see it.
#[derive(Debug, Clone)]
pub struct CallContext {
    call_id: u64,
    channel: &'static str,
    peer: Option<String>,
    received_at: Instant,
}

impl CallContext {
    pub(crate) fn new(call_id: u64, channel: &'static str, peer: Option<String>) -> Self {
        Self {
            call_id,
            channel,
            peer,
            received_at: Instant::now(),
        }
    }

    /// Id the guest assigned to this call; also used as the error reference
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Name of the channel being handled
    pub fn channel(&self) -> &'static str {
        self.channel
    }

    /// Label of the connection the call arrived on, if the transport has one
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// When the dispatcher received the call
    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}
