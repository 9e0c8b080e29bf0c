//! Host dispatcher
//!
//! A [`Dispatcher`] binds one handler per registry channel. Once set up it is
//! frozen and started on a [`Link`] (or a Unix socket, see [`Dispatcher::serve`]).
//! Every inbound call is answered with exactly one reply; failures are local
//! to the call that caused them.

mod handler;
#[cfg(unix)]
mod server;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use executor_core::{Executor, Task};
use futures_lite::FutureExt;
use futures_lite::future;
use smol::channel::{self, Receiver, Sender};

use crate::channel::{CallContext, Channel, ChannelDescriptor};
use crate::config::BridgeConfig;
use crate::error::{MarshalingError, Position, SetupError, SetupResult};
use crate::marshal::{ArgList, Marshal, Value};
use crate::protocol::{CallHeader, Failure, Frame, Invocation, Reply};
use crate::registry::Registry;
use crate::transport::{Link, LinkReceiver, LinkSender, TransportError};

pub use handler::{BoxError, Handler};
use handler::BoxFuture;
#[cfg(unix)]
pub use server::ServerHandle;

/// Ways a bound handler can fail after its arguments were accepted
enum Fault {
    Failed(BoxError),
    Panicked(String),
    Result(MarshalingError),
}

type PreparedCall = BoxFuture<Result<Value, Fault>>;

/// Type-erased handler: unmarshals the arguments, then yields the call future
type ErasedHandler =
    Box<dyn Fn(CallContext, Vec<Value>) -> Result<PreparedCall, MarshalingError> + Send + Sync>;

struct Binding {
    name: &'static str,
    invoke: ErasedHandler,
}

/// Frozen handler table shared by every running loop
struct HandlerTable {
    bindings: HashMap<String, Binding>,
}

impl HandlerTable {
    async fn dispatch(&self, invocation: Invocation, peer: Option<String>) -> Reply {
        let Invocation {
            id,
            channel,
            arguments,
        } = invocation;

        let Some(binding) = self.bindings.get(&channel) else {
            tracing::debug!(channel = %channel, id, "call to unbound channel");
            return Reply::failure(id, Failure::UnknownChannel { channel });
        };

        let ctx = CallContext::new(id, binding.name, peer);
        let prepared = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            (binding.invoke)(ctx, arguments)
        })) {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) => {
                tracing::debug!(channel = %channel, id, error = %e, "rejected call arguments");
                return Reply::failure(id, Failure::Marshaling(e));
            }
            Err(panic) => return fault_reply(id, channel, Fault::Panicked(panic_message(&*panic))),
        };

        let outcome = match AssertUnwindSafe(prepared).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(Fault::Panicked(panic_message(&*panic))),
        };

        match outcome {
            Ok(value) => Reply::success(id, value),
            Err(fault) => fault_reply(id, channel, fault),
        }
    }
}

/// Build the reply for a failed handler
///
/// The handler's own error goes to the host log only. The guest gets the
/// channel name and the call id as a reference into that log.
fn fault_reply(id: u64, channel: String, fault: Fault) -> Reply {
    match fault {
        Fault::Failed(e) => {
            tracing::error!(channel = %channel, reference = id, error = %e, "handler failed");
        }
        Fault::Panicked(message) => {
            tracing::error!(channel = %channel, reference = id, panic = %message, "handler panicked");
        }
        Fault::Result(e) => {
            tracing::error!(channel = %channel, reference = id, error = %e, "handler returned an unmarshalable result");
            return Reply::failure(id, Failure::Marshaling(e));
        }
    }
    Reply::failure(
        id,
        Failure::Handler {
            channel,
            reference: id,
        },
    )
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Host-side binding table for one registry
///
/// # Example
///
/// ```rust,ignore
/// let registry = Registry::of::<Sandbox>()?;
/// let mut dispatcher = Dispatcher::new(registry);
/// dispatcher.register::<Double, _>(|_ctx: CallContext, n: i64| async move {
///     Ok::<_, Infallible>(n * 2)
/// })?;
/// let handle = dispatcher.start(link, executor)?;
/// ```
pub struct Dispatcher {
    registry: Arc<Registry>,
    config: BridgeConfig,
    table: HandlerTable,
}

impl Dispatcher {
    /// Create a dispatcher for `registry` with the default config
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_config(registry, BridgeConfig::default())
    }

    /// Create a dispatcher with an explicit config
    pub fn with_config(registry: Arc<Registry>, config: BridgeConfig) -> Self {
        Self {
            registry,
            config,
            table: HandlerTable {
                bindings: HashMap::new(),
            },
        }
    }

    /// The registry this dispatcher serves
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bind the implementation of channel `C`
    ///
    /// Fails if `C` is not in the registry, if its shape differs from the
    /// registered descriptor, or if it is already bound.
    pub fn register<C, H>(&mut self, handler: H) -> SetupResult<&mut Self>
    where
        C: Channel,
        H: Handler<C::Args, C::Output>,
    {
        let descriptor = C::descriptor();
        self.check_bindable(&descriptor)?;

        let invoke: ErasedHandler = Box::new(move |ctx: CallContext, arguments: Vec<Value>| {
            let args = <C::Args as ArgList>::unmarshal(C::NAME, arguments)?;
            let call = handler.call(ctx, args);
            let prepared: PreparedCall = Box::pin(async move {
                let output = call.await.map_err(Fault::Failed)?;
                Marshal::marshal(&output).map_err(|e| Fault::Result(e.at(C::NAME, Position::Result)))
            });
            Ok(prepared)
        });

        tracing::debug!(channel = %C::NAME, "bound handler");
        self.table.bindings.insert(
            C::NAME.to_string(),
            Binding {
                name: C::NAME,
                invoke,
            },
        );
        Ok(self)
    }

    fn check_bindable(&self, descriptor: &ChannelDescriptor) -> SetupResult<()> {
        let name = descriptor.name();
        let registered = self
            .registry
            .get(name)
            .ok_or_else(|| SetupError::UnknownChannel(name.to_string()))?;
        if !registered.is_compatible(descriptor) {
            return Err(SetupError::IncompatibleBinding {
                name: name.to_string(),
                expected: registered.signature(),
                actual: descriptor.signature(),
            });
        }
        if self.table.bindings.contains_key(name) {
            return Err(SetupError::DuplicateBinding(name.to_string()));
        }
        Ok(())
    }

    /// Whether channel `name` has a handler
    pub fn is_bound(&self, name: &str) -> bool {
        self.table.bindings.contains_key(name)
    }

    /// Registry channels that have no handler yet, in registration order
    pub fn unbound(&self) -> Vec<&'static str> {
        self.registry
            .list()
            .iter()
            .map(|d| d.name())
            .filter(|name| !self.is_bound(name))
            .collect()
    }

    fn ensure_ready(&self) -> SetupResult<()> {
        let unbound = self.unbound();
        if unbound.is_empty() {
            return Ok(());
        }
        if self.config.require_complete_bindings() {
            return Err(SetupError::UnboundChannels(
                unbound.into_iter().map(str::to_string).collect(),
            ));
        }
        tracing::warn!(channels = ?unbound, "starting with unbound channels");
        Ok(())
    }

    /// Answer a single call
    pub async fn dispatch(&self, invocation: Invocation) -> Reply {
        self.table.dispatch(invocation, None).await
    }

    /// Freeze the bindings and start answering calls arriving on `link`
    pub fn start<E: Executor + Clone + 'static>(
        self,
        link: Link,
        executor: E,
    ) -> SetupResult<DispatcherHandle> {
        self.ensure_ready()?;
        let table = Arc::new(self.table);
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);
        let link = link.with_max_frame_len(self.config.max_frame_len());
        let finished = spawn_link(table, link, shutdown_rx, executor);
        Ok(DispatcherHandle {
            shutdown: shutdown_tx,
            finished,
        })
    }
}

/// Handle to a running dispatch loop
///
/// Dropping the handle stops the loop; calls already being handled still
/// send their replies.
pub struct DispatcherHandle {
    shutdown: Sender<()>,
    finished: Receiver<()>,
}

impl DispatcherHandle {
    /// Stop accepting new calls
    pub fn stop(&self) {
        self.shutdown.close();
    }

    /// Wait until the loop has exited, either after `stop` or because the link closed
    pub async fn finished(&self) {
        let _ = self.finished.recv().await;
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.finished.is_closed()
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_link<E: Executor + Clone + 'static>(
    table: Arc<HandlerTable>,
    link: Link,
    shutdown: Receiver<()>,
    executor: E,
) -> Receiver<()> {
    let (finished_tx, finished_rx) = channel::bounded::<()>(1);
    let (sender, receiver) = link.split();

    executor
        .clone()
        .spawn(async move {
            run_link(table, sender, receiver, shutdown, executor).await;
            drop(finished_tx);
        })
        .detach();

    finished_rx
}

/// Receive loop for one link
///
/// Decoding happens inline; each call is then handled on its own task so a
/// slow handler never holds up the next frame.
async fn run_link<E: Executor + Clone + 'static>(
    table: Arc<HandlerTable>,
    sender: LinkSender,
    receiver: LinkReceiver,
    shutdown: Receiver<()>,
    executor: E,
) {
    let peer = receiver.peer().map(str::to_string);
    tracing::debug!(peer = ?peer, "dispatcher started");

    loop {
        let next = future::or(async { receiver.recv().await }, async {
            let _ = shutdown.recv().await;
            None
        })
        .await;
        let Some(body) = next else {
            break;
        };

        let invocation = match Frame::decode(&body) {
            Ok(Frame::Call(invocation)) => invocation,
            Ok(Frame::Reply(reply)) => {
                tracing::warn!(id = reply.id, "ignoring reply frame sent to host");
                continue;
            }
            Err(e) => {
                // A call whose header survived still gets an answer.
                match CallHeader::parse(&body) {
                    Some(header) => {
                        tracing::warn!(channel = %header.channel, id = header.id, error = %e, "malformed call");
                        let failure = Failure::Protocol {
                            channel: header.channel,
                            message: e.to_string(),
                        };
                        send_reply(&sender, Reply::failure(header.id, failure));
                    }
                    None => tracing::warn!(error = %e, "failed to decode frame"),
                }
                continue;
            }
        };

        tracing::debug!(channel = %invocation.channel, id = invocation.id, "handling call");
        let table = Arc::clone(&table);
        let sender = sender.clone();
        let peer = peer.clone();
        executor
            .spawn(async move {
                let id = invocation.id;
                let channel = invocation.channel.clone();
                let reply = table.dispatch(invocation, peer).await;
                match sender.send(&Frame::Reply(reply)) {
                    Err(TransportError::Protocol(e)) => {
                        tracing::error!(channel = %channel, id, error = %e, "reply could not be sent");
                        let failure = Failure::Protocol {
                            channel,
                            message: e.to_string(),
                        };
                        send_reply(&sender, Reply::failure(id, failure));
                    }
                    Err(e) => tracing::debug!(error = %e, "failed to send reply"),
                    Ok(()) => {}
                }
            })
            .detach();
    }

    tracing::debug!(peer = ?peer, "dispatcher stopped");
}

fn send_reply(sender: &LinkSender, reply: Reply) {
    if let Err(e) = sender.send(&Frame::Reply(reply)) {
        tracing::debug!(error = %e, "failed to send reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::marshal::Record;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Stat {
        path: String,
        size: u64,
    }

    struct Double;
    impl Channel for Double {
        const NAME: &'static str = "double";
        type Args = (i64,);
        type Output = i64;
    }

    struct Fail;
    impl Channel for Fail {
        const NAME: &'static str = "fail";
        type Args = ();
        type Output = ();
    }

    struct StatFile;
    impl Channel for StatFile {
        const NAME: &'static str = "stat";
        type Args = (String,);
        type Output = Record<Stat>;
    }

    struct Outside;
    impl Channel for Outside {
        const NAME: &'static str = "outside";
        type Args = ();
        type Output = ();
    }

    struct DoubleFloat;
    impl Channel for DoubleFloat {
        const NAME: &'static str = "double";
        type Args = (f64,);
        type Output = f64;
    }

    fn registry() -> Arc<Registry> {
        let mut builder = Registry::builder();
        builder
            .channel::<Double>()
            .unwrap()
            .channel::<Fail>()
            .unwrap()
            .channel::<StatFile>()
            .unwrap();
        builder.build()
    }

    fn dispatcher() -> Dispatcher {
        let mut dispatcher = Dispatcher::new(registry());
        dispatcher
            .register::<Double, _>(|_ctx: CallContext, n: i64| async move {
                Ok::<_, Infallible>(n * 2)
            })
            .unwrap()
            .register::<Fail, _>(|_ctx: CallContext| async move {
                Err::<(), _>(std::io::Error::other("secret path /root/.ssh unreadable"))
            })
            .unwrap();
        dispatcher
    }

    fn call(id: u64, channel: &str, arguments: Vec<Value>) -> Invocation {
        Invocation {
            id,
            channel: channel.to_string(),
            arguments,
        }
    }

    #[tokio::test]
    async fn dispatches_to_bound_handler() {
        let reply = dispatcher().dispatch(call(1, "double", vec![Value::Int(21)])).await;
        assert_eq!(reply, Reply::success(1, Value::Int(42)));
    }

    #[tokio::test]
    async fn unbound_channel_is_unknown() {
        let reply = dispatcher().dispatch(call(2, "stat", vec![Value::Str("/".into())])).await;
        assert_eq!(
            reply,
            Reply::failure(2, Failure::UnknownChannel { channel: "stat".into() })
        );

        let reply = dispatcher().dispatch(call(3, "nonexistent", vec![])).await;
        assert_eq!(
            reply,
            Reply::failure(3, Failure::UnknownChannel { channel: "nonexistent".into() })
        );
    }

    #[tokio::test]
    async fn bad_arguments_never_reach_handler() {
        let ran = Arc::new(AtomicBool::new(false));
        let mut dispatcher = Dispatcher::new(registry());
        let flag = Arc::clone(&ran);
        dispatcher
            .register::<Double, _>(move |_ctx: CallContext, n: i64| {
                let flag = Arc::clone(&flag);
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok::<_, Infallible>(n)
                }
            })
            .unwrap();

        let reply = dispatcher.dispatch(call(4, "double", vec![Value::Str("21".into())])).await;
        let crate::protocol::Outcome::Failure(Failure::Marshaling(e)) = reply.outcome else {
            panic!("expected marshaling failure, got {:?}", reply.outcome);
        };
        assert_eq!(e.position, Position::Argument(0));
        assert_eq!(e.expected, "int");
        assert_eq!(e.actual, "string");
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn handler_error_is_sanitized() {
        let reply = dispatcher().dispatch(call(5, "fail", vec![])).await;
        assert_eq!(
            reply,
            Reply::failure(
                5,
                Failure::Handler {
                    channel: "fail".into(),
                    reference: 5
                }
            )
        );
        let encoded = Frame::Reply(reply).encode().unwrap();
        let needle = b".ssh";
        assert!(!encoded.windows(needle.len()).any(|w| w == needle));
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let mut dispatcher = Dispatcher::new(registry());
        dispatcher
            .register::<Fail, _>(|_ctx: CallContext| async move {
                if true {
                    panic!("boom");
                }
                Ok::<_, Infallible>(())
            })
            .unwrap();

        let reply = dispatcher.dispatch(call(6, "fail", vec![])).await;
        assert!(matches!(
            reply.outcome,
            crate::protocol::Outcome::Failure(Failure::Handler { reference: 6, .. })
        ));
    }

    #[tokio::test]
    async fn context_carries_call_identity() {
        let mut dispatcher = Dispatcher::new(registry());
        dispatcher
            .register::<StatFile, _>(|ctx: CallContext, path: String| async move {
                assert_eq!(ctx.channel(), "stat");
                assert_eq!(ctx.call_id(), 9);
                Ok::<_, Infallible>(Record(Stat { path, size: 3 }))
            })
            .unwrap();

        let reply = dispatcher.dispatch(call(9, "stat", vec![Value::Str("/a".into())])).await;
        let crate::protocol::Outcome::Success(value) = reply.outcome else {
            panic!("expected success");
        };
        let stat = Record::<Stat>::unmarshal(value).unwrap();
        assert_eq!(stat.path, "/a");
        assert_eq!(stat.size, 3);
    }

    #[test]
    fn registration_errors() {
        let mut dispatcher = dispatcher();

        let err = dispatcher
            .register::<Outside, _>(|_ctx: CallContext| async move { Ok::<_, Infallible>(()) })
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::UnknownChannel(ref n) if n == "outside"));

        let err = dispatcher
            .register::<Double, _>(|_ctx: CallContext, n: i64| async move {
                Ok::<_, Infallible>(n)
            })
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::DuplicateBinding(ref n) if n == "double"));
    }

    #[test]
    fn shape_drift_is_rejected_at_registration() {
        let mut dispatcher = Dispatcher::new(registry());
        let err = dispatcher
            .register::<DoubleFloat, _>(|_ctx: CallContext, n: f64| async move {
                Ok::<_, Infallible>(n * 2.0)
            })
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::IncompatibleBinding { .. }));
    }

    #[test]
    fn strict_mode_requires_every_binding() {
        let config = BridgeConfig::builder().require_complete_bindings(true).build();
        let mut dispatcher = Dispatcher::with_config(registry(), config);
        dispatcher
            .register::<Double, _>(|_ctx: CallContext, n: i64| async move {
                Ok::<_, Infallible>(n * 2)
            })
            .unwrap();

        assert_eq!(dispatcher.unbound(), ["fail", "stat"]);
        let (host, _guest) = Link::pair();
        let err = dispatcher
            .start(host, executor_core::tokio::TokioGlobal)
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::UnboundChannels(ref names) if names.len() == 2));
    }

    #[tokio::test]
    async fn loop_survives_garbage_and_exits_on_close() {
        let (to_host, host_rx) = channel::unbounded();
        let (host_tx, from_host) = channel::unbounded();
        let handle = dispatcher()
            .start(Link::from_channels(host_tx, host_rx), executor_core::tokio::TokioGlobal)
            .unwrap();

        to_host.send(vec![0xff, 0x00]).await.unwrap();
        let frame = Frame::Call(call(10, "double", vec![Value::Int(4)]));
        to_host.send(frame.encode().unwrap()).await.unwrap();

        let reply = Frame::decode(&from_host.recv().await.unwrap()).unwrap();
        assert_eq!(reply, Frame::Reply(Reply::success(10, Value::Int(8))));

        to_host.close();
        handle.finished().await;
        assert!(handle.is_finished());
        assert!(from_host.recv().await.is_err());
    }

    #[tokio::test]
    async fn corrupt_arguments_still_get_a_reply() {
        let (to_host, host_rx) = channel::unbounded();
        let (host_tx, from_host) = channel::unbounded();
        let _handle = dispatcher()
            .start(Link::from_channels(host_tx, host_rx), executor_core::tokio::TokioGlobal)
            .unwrap();

        let mut body = Frame::Call(call(77, "double", vec![Value::Str("twenty-one".into())]))
            .encode()
            .unwrap();
        body.truncate(body.len() - 3);
        to_host.send(body).await.unwrap();

        let reply = Frame::decode(&from_host.recv().await.unwrap()).unwrap();
        let Frame::Reply(Reply {
            id: 77,
            outcome: crate::protocol::Outcome::Failure(Failure::Protocol { channel, .. }),
        }) = &reply
        else {
            panic!("expected protocol failure for call 77, got {reply:?}");
        };
        assert_eq!(channel, "double");

        let frame = Frame::Call(call(78, "double", vec![Value::Int(2)]));
        to_host.send(frame.encode().unwrap()).await.unwrap();
        let reply = Frame::decode(&from_host.recv().await.unwrap()).unwrap();
        assert_eq!(reply, Frame::Reply(Reply::success(78, Value::Int(4))));
    }

    #[tokio::test]
    async fn oversized_result_fails_only_its_call() {
        let config = BridgeConfig::builder().max_frame_len(256).build();
        let mut dispatcher = Dispatcher::with_config(registry(), config);
        dispatcher
            .register::<StatFile, _>(|_ctx: CallContext, path: String| async move {
                Ok::<_, Infallible>(Record(Stat {
                    path: path.repeat(100),
                    size: 1,
                }))
            })
            .unwrap()
            .register::<Double, _>(|_ctx: CallContext, n: i64| async move {
                Ok::<_, Infallible>(n * 2)
            })
            .unwrap();

        let (to_host, host_rx) = channel::unbounded();
        let (host_tx, from_host) = channel::unbounded();
        let _handle = dispatcher
            .start(Link::from_channels(host_tx, host_rx), executor_core::tokio::TokioGlobal)
            .unwrap();

        let frame = Frame::Call(call(1, "stat", vec![Value::Str("/long/path".into())]));
        to_host.send(frame.encode().unwrap()).await.unwrap();
        let reply = Frame::decode(&from_host.recv().await.unwrap()).unwrap();
        assert!(matches!(
            reply,
            Frame::Reply(Reply {
                id: 1,
                outcome: crate::protocol::Outcome::Failure(Failure::Protocol { .. }),
            })
        ));

        let frame = Frame::Call(call(2, "double", vec![Value::Int(8)]));
        to_host.send(frame.encode().unwrap()).await.unwrap();
        let reply = Frame::decode(&from_host.recv().await.unwrap()).unwrap();
        assert_eq!(reply, Frame::Reply(Reply::success(2, Value::Int(16))));
    }
}
