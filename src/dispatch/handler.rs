//! Host-side handler shape

use std::future::Future;
use std::pin::Pin;

use crate::channel::CallContext;

/// Error type handlers may fail with
///
/// Whatever a handler returns is logged on the host and replaced by a
/// sanitized failure before it reaches the guest.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// An implementation of one channel
///
/// Implemented for async functions and closures taking the [`CallContext`]
/// followed by the channel's user arguments:
///
/// ```rust,ignore
/// dispatcher.register::<Double, _>(|_ctx: CallContext, n: i64| async move {
///     Ok::<_, Infallible>(n * 2)
/// })?;
/// ```
pub trait Handler<Args, Output>: Send + Sync + 'static {
    fn call(&self, ctx: CallContext, args: Args) -> BoxFuture<Result<Output, BoxError>>;
}

macro_rules! impl_handler {
    ($($ty:ident => $idx:tt),*) => {
        impl<F, Fut, R, E, $($ty,)*> Handler<($($ty,)*), R> for F
        where
            F: Fn(CallContext, $($ty),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<R, E>> + Send + 'static,
            E: Into<BoxError>,
        {
            #[allow(unused_variables)]
            fn call(&self, ctx: CallContext, args: ($($ty,)*)) -> BoxFuture<Result<R, BoxError>> {
                let fut = (self)(ctx, $(args.$idx),*);
                Box::pin(async move { fut.await.map_err(Into::into) })
            }
        }
    };
}

impl_handler!();
impl_handler!(A => 0);
impl_handler!(A => 0, B => 1);
impl_handler!(A => 0, B => 1, C => 2);
impl_handler!(A => 0, B => 1, C => 2, D => 3);
impl_handler!(A => 0, B => 1, C => 2, D => 3, E1 => 4);
impl_handler!(A => 0, B => 1, C => 2, D => 3, E1 => 4, F1 => 5);
