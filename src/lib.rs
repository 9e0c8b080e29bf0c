//! tether - typed call bridge between a host and a sandboxed guest
//!
//! One declared contract yields both sides of the bridge:
//! - the host binds one handler per channel on a [`Dispatcher`], each handler
//!   receiving a host-only [`CallContext`] followed by the user arguments
//! - the guest gets a client with one async method per channel, backed by a
//!   [`GuestProxy`] that can only call channels of its contract
//!
//! Values crossing the boundary are copied: primitives, [`Record`]s of any
//! serde type, and byte buffers. Anything else does not implement [`Marshal`]
//! and cannot be used in a contract.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::convert::Infallible;
//! use tether::{BridgeConfig, CallContext, Dispatcher, GuestProxy, Link, Registry};
//!
//! tether::contract! {
//!     pub contract Sandbox => SandboxClient {
//!         Double = fn double(n: i64) -> i64;
//!     }
//! }
//!
//! async fn run<E: executor_core::Executor + Clone + 'static>(executor: E) -> anyhow::Result<()> {
//!     let (host, guest) = Link::pair();
//!
//!     let mut dispatcher = Dispatcher::new(Registry::of::<Sandbox>()?);
//!     dispatcher.register::<Double, _>(|_ctx: CallContext, n: i64| async move {
//!         Ok::<_, Infallible>(n * 2)
//!     })?;
//!     let _server = dispatcher.start(host, executor.clone())?;
//!
//!     let client = SandboxClient::from(GuestProxy::connect(guest, &BridgeConfig::default(), executor));
//!     assert_eq!(client.double(21).await?, 42);
//!     Ok(())
//! }
//! ```
//!
//! # Sandboxed guests
//!
//! A host usually serves a Unix socket with [`Dispatcher::serve`] and passes
//! its path to the child in the `TETHER_SOCKET` environment variable; the
//! guest connects with [`transport::unix::connect_from_env`].

mod channel;
mod config;
mod contract;
mod dispatch;
mod error;
mod marshal;
pub mod protocol;
mod proxy;
mod registry;
pub mod transport;

pub use channel::{
    CallContext, Channel, ChannelDescriptor, Contract, Member, ParamSpec, Primitive, TypeSpec,
};
pub use config::{BridgeConfig, BridgeConfigBuilder, DEFAULT_MAX_FRAME_LEN, DEFAULT_SOCKET_ENV};
#[cfg(unix)]
pub use dispatch::ServerHandle;
pub use dispatch::{BoxError, Dispatcher, DispatcherHandle, Handler};
pub use error::{
    CallError, ErrorKind, MarshalingError, Position, SetupError, SetupResult, ShapeError,
};
pub use marshal::{ArgList, Marshal, Record, Value};
pub use proxy::GuestProxy;
pub use registry::{MAX_CHANNEL_NAME_LEN, Registry, RegistryBuilder};
pub use transport::Link;

/// Re-export of `bytes::Bytes`, the binary buffer type of channel arguments
pub use bytes::Bytes;
