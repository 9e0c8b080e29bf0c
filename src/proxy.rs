//! Guest-side call proxy
//!
//! A [`GuestProxy<K>`] is the only way a guest reaches the host. It can call
//! exactly the channels of contract `K`; anything else fails to compile. Each
//! call gets its own id, so replies are paired with their calls no matter in
//! which order the host finishes them.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_io::Timer;
use executor_core::{Executor, Task};
use futures_lite::future;
use smol::channel::{self, Sender};

use crate::channel::{Contract, Member};
use crate::config::BridgeConfig;
use crate::error::CallError;
use crate::marshal::{ArgList, unmarshal_result};
use crate::protocol::{Failure, Frame, Invocation, Outcome};
use crate::transport::{Link, LinkReceiver, LinkSender, TransportError};

/// Calls waiting for their reply, keyed by call id
///
/// `None` once the link has closed; no call may be added after that.
type PendingCalls = Mutex<Option<HashMap<u64, Sender<Outcome>>>>;

struct Shared {
    sender: LinkSender,
    pending: PendingCalls,
    next_id: AtomicU64,
    call_timeout: Option<Duration>,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, Option<HashMap<u64, Sender<Outcome>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a pending entry when its call finishes or is abandoned
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.shared.pending().as_mut() {
            pending.remove(&self.id);
        }
    }
}

enum Waited {
    Reply(Outcome),
    Closed,
    TimedOut,
}

/// Typed caller for the channels of contract `K`
///
/// Usually wrapped by the client type generated with [`contract!`](crate::contract).
pub struct GuestProxy<K: Contract> {
    shared: Arc<Shared>,
    _contract: PhantomData<fn() -> K>,
}

impl<K: Contract> Clone for GuestProxy<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _contract: PhantomData,
        }
    }
}

impl<K: Contract> GuestProxy<K> {
    /// Attach to a link and start routing replies
    pub fn connect<E: Executor + Clone + 'static>(
        link: Link,
        config: &BridgeConfig,
        executor: E,
    ) -> Self {
        let (sender, receiver) = link.with_max_frame_len(config.max_frame_len()).split();
        let shared = Arc::new(Shared {
            sender,
            pending: Mutex::new(Some(HashMap::new())),
            next_id: AtomicU64::new(1),
            call_timeout: config.call_timeout(),
        });

        executor
            .spawn(route_replies(receiver, Arc::downgrade(&shared)))
            .detach();

        Self {
            shared,
            _contract: PhantomData,
        }
    }

    /// Call channel `C` with its user arguments
    ///
    /// Resolves with the host's result, or rejects with the failure for this
    /// call only.
    pub async fn call<C: Member<K>>(&self, args: C::Args) -> Result<C::Output, CallError> {
        let arguments = ArgList::marshal(&args, C::NAME)?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = channel::bounded(1);
        match self.shared.pending().as_mut() {
            Some(pending) => {
                pending.insert(id, tx);
            }
            None => return Err(CallError::Disconnected(C::NAME.to_string())),
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let frame = Frame::Call(Invocation {
            id,
            channel: C::NAME.to_string(),
            arguments,
        });
        match self.shared.sender.send(&frame) {
            Ok(()) => {}
            Err(TransportError::Closed) => return Err(CallError::Disconnected(C::NAME.to_string())),
            Err(TransportError::Protocol(e)) => {
                return Err(CallError::Protocol {
                    channel: C::NAME.to_string(),
                    message: e.to_string(),
                });
            }
        }
        tracing::trace!(channel = %C::NAME, id, "call sent");

        let reply = async {
            match rx.recv().await {
                Ok(outcome) => Waited::Reply(outcome),
                Err(_) => Waited::Closed,
            }
        };
        let waited = match self.shared.call_timeout {
            Some(timeout) => {
                future::or(reply, async {
                    Timer::after(timeout).await;
                    Waited::TimedOut
                })
                .await
            }
            None => reply.await,
        };

        match waited {
            Waited::Reply(Outcome::Success(value)) => {
                unmarshal_result::<C::Output>(C::NAME, value).map_err(CallError::from)
            }
            Waited::Reply(Outcome::Failure(failure)) => Err(expect_channel(failure, C::NAME)),
            Waited::Closed => Err(CallError::Disconnected(C::NAME.to_string())),
            Waited::TimedOut => {
                tracing::debug!(channel = %C::NAME, id, "call timed out");
                Err(CallError::TimedOut(C::NAME.to_string()))
            }
        }
    }

    /// Whether the link to the host is gone
    pub fn is_disconnected(&self) -> bool {
        self.shared.pending().is_none()
    }
}

/// Convert a failure, checking it names the channel that was called
fn expect_channel(failure: Failure, channel: &str) -> CallError {
    let err = CallError::from(failure);
    if err.channel() != channel {
        return CallError::Protocol {
            channel: channel.to_string(),
            message: format!("reply names channel `{}`", err.channel()),
        };
    }
    err
}

/// Deliver each reply to the call waiting for it
///
/// Holds the shared state weakly so dropping the last proxy closes the link.
async fn route_replies(receiver: LinkReceiver, shared: Weak<Shared>) {
    while let Some(body) = receiver.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let reply = match Frame::decode(&body) {
            Ok(Frame::Reply(reply)) => reply,
            Ok(Frame::Call(call)) => {
                tracing::warn!(channel = %call.channel, "ignoring call frame sent to guest");
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode reply");
                continue;
            }
        };

        let waiter = shared
            .pending()
            .as_mut()
            .and_then(|pending| pending.remove(&reply.id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.try_send(reply.outcome);
            }
            None => tracing::debug!(id = reply.id, "discarding reply for abandoned call"),
        }
    }

    let Some(shared) = shared.upgrade() else {
        return;
    };
    // Dropping every waiter rejects the calls still in flight.
    let abandoned = shared.pending().take();
    if let Some(abandoned) = abandoned {
        if !abandoned.is_empty() {
            tracing::debug!(count = abandoned.len(), "link closed with calls in flight");
        }
    }
    shared.sender.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use crate::channel::{CallContext, Channel, ChannelDescriptor};
    use crate::dispatch::Dispatcher;
    use crate::error::{ErrorKind, Position};
    use crate::marshal::Value;
    use crate::protocol::Reply;
    use crate::registry::Registry;
    use executor_core::tokio::TokioGlobal;

    struct Api;
    impl Contract for Api {
        fn descriptors() -> Vec<ChannelDescriptor> {
            vec![Echo::descriptor(), Count::descriptor()]
        }
    }

    struct Echo;
    impl Channel for Echo {
        const NAME: &'static str = "echo";
        type Args = (String,);
        type Output = String;
    }
    impl Member<Api> for Echo {}

    struct Count;
    impl Channel for Count {
        const NAME: &'static str = "count";
        type Args = (Vec<u8>,);
        type Output = u32;
    }
    impl Member<Api> for Count {}

    fn proxy_with_raw_host(config: &BridgeConfig) -> (GuestProxy<Api>, Link) {
        let (guest, host) = Link::pair();
        (GuestProxy::connect(guest, config, TokioGlobal), host)
    }

    #[tokio::test]
    async fn replies_are_paired_by_id() {
        let (proxy, host) = proxy_with_raw_host(&BridgeConfig::default());
        let (host_tx, host_rx) = host.split();

        let first = proxy.call::<Echo>(("first".to_string(),));
        let second = proxy.call::<Echo>(("second".to_string(),));
        let host = async {
            let mut calls = Vec::new();
            for _ in 0..2 {
                let Frame::Call(call) = Frame::decode(&host_rx.recv().await.unwrap()).unwrap() else {
                    panic!("expected call");
                };
                calls.push(call);
            }
            // Answer in reverse order
            for call in calls.into_iter().rev() {
                let value = call.arguments[0].clone();
                host_tx.send(&Frame::Reply(Reply::success(call.id, value))).unwrap();
            }
        };

        let ((first, second), ()) = future::zip(future::zip(first, second), host).await;
        assert_eq!(first.unwrap(), "first");
        assert_eq!(second.unwrap(), "second");
    }

    #[tokio::test]
    async fn closed_link_rejects_pending_and_later_calls() {
        let (proxy, host) = proxy_with_raw_host(&BridgeConfig::default());
        let (host_tx, host_rx) = host.split();

        let pending = proxy.call::<Echo>(("lost".to_string(),));
        let closer = async {
            host_rx.recv().await.unwrap();
            drop(host_tx);
        };
        let (result, ()) = future::zip(pending, closer).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Disconnected);

        // The router notices the close asynchronously; wait for it.
        while !proxy.is_disconnected() {
            Timer::after(Duration::from_millis(5)).await;
        }
        let err = proxy.call::<Echo>(("again".to_string(),)).await.unwrap_err();
        assert_eq!(err, CallError::Disconnected("echo".to_string()));
    }

    #[tokio::test]
    async fn timeout_rejects_locally() {
        let config = BridgeConfig::builder()
            .call_timeout(Duration::from_millis(20))
            .build();
        let (proxy, _host) = proxy_with_raw_host(&config);

        let err = proxy.call::<Count>((vec![1, 2, 3],)).await.unwrap_err();
        assert_eq!(err, CallError::TimedOut("count".to_string()));
        assert!(proxy.shared.pending().as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mismatched_result_is_a_marshaling_error() {
        let (proxy, host) = proxy_with_raw_host(&BridgeConfig::default());
        let (host_tx, host_rx) = host.split();

        let call = proxy.call::<Count>((vec![0; 4],));
        let host = async {
            let Frame::Call(call) = Frame::decode(&host_rx.recv().await.unwrap()).unwrap() else {
                panic!("expected call");
            };
            host_tx
                .send(&Frame::Reply(Reply::success(call.id, Value::Str("four".into()))))
                .unwrap();
        };
        let (result, ()) = future::zip(call, host).await;
        let CallError::Marshaling(e) = result.unwrap_err() else {
            panic!("expected marshaling error");
        };
        assert_eq!(e.position, Position::Result);
        assert_eq!(e.channel, "count");
    }

    #[tokio::test]
    async fn talks_to_a_dispatcher() {
        let (guest, host) = Link::pair();
        let mut dispatcher = Dispatcher::new(Registry::of::<Api>().unwrap());
        dispatcher
            .register::<Echo, _>(|_ctx: CallContext, s: String| async move {
                Ok::<_, Infallible>(s)
            })
            .unwrap()
            .register::<Count, _>(|_ctx: CallContext, bytes: Vec<u8>| async move {
                u32::try_from(bytes.len())
            })
            .unwrap();
        let _handle = dispatcher.start(host, TokioGlobal).unwrap();

        let proxy = GuestProxy::<Api>::connect(guest, &BridgeConfig::default(), TokioGlobal);
        assert_eq!(proxy.call::<Echo>(("hi".to_string(),)).await.unwrap(), "hi");
        assert_eq!(proxy.call::<Count>((vec![7; 5],)).await.unwrap(), 5);
    }
}
