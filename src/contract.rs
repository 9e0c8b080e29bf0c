//! Declarative contracts
//!
//! [`contract!`](crate::contract) turns one list of operations into everything
//! both sides need: a marker type and [`Channel`](crate::Channel) impl per
//! operation, the [`Contract`](crate::Contract) listing them, and a guest
//! client with one async method per operation.

/// Declare a contract between host and guest
///
/// ```rust,ignore
/// use tether::{Record, contract};
///
/// contract! {
///     /// Calls the sandbox may make into the host.
///     pub contract Sandbox => SandboxClient {
///         /// Liveness probe.
///         Ping = fn ping() -> String;
///         Double = fn double(n: i64) -> i64;
///         ReadFile = fn read_file(path: String) -> Vec<u8>;
///     }
/// }
///
/// // Host
/// let mut dispatcher = Dispatcher::new(Registry::of::<Sandbox>()?);
/// dispatcher.register::<Double, _>(|_ctx: CallContext, n: i64| async move {
///     Ok::<_, Infallible>(n * 2)
/// })?;
///
/// // Guest
/// let client = SandboxClient::from(GuestProxy::connect(link, &config, executor));
/// assert_eq!(client.double(21).await?, 42);
/// ```
///
/// The wire name of each channel is its method name.
#[macro_export]
macro_rules! contract {
    (
        $(#[$meta:meta])*
        $vis:vis contract $contract:ident => $client:ident {
            $(
                $(#[$channel_meta:meta])*
                $marker:ident = fn $method:ident ( $($arg:ident : $ty:ty),* $(,)? ) -> $output:ty;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        $vis struct $contract;

        impl $crate::Contract for $contract {
            fn descriptors() -> ::std::vec::Vec<$crate::ChannelDescriptor> {
                ::std::vec![$(<$marker as $crate::Channel>::descriptor()),*]
            }
        }

        $(
            $(#[$channel_meta])*
            #[derive(Debug, Clone, Copy)]
            $vis struct $marker;

            impl $crate::Channel for $marker {
                const NAME: &'static str = ::std::stringify!($method);
                type Args = ($($ty,)*);
                type Output = $output;

                fn param_names() -> &'static [&'static str] {
                    &[$(::std::stringify!($arg)),*]
                }
            }

            impl $crate::Member<$contract> for $marker {}
        )*

        $(#[$meta])*
        #[derive(Clone)]
        $vis struct $client {
            proxy: $crate::GuestProxy<$contract>,
        }

        impl ::std::convert::From<$crate::GuestProxy<$contract>> for $client {
            fn from(proxy: $crate::GuestProxy<$contract>) -> Self {
                Self { proxy }
            }
        }

        impl ::std::convert::AsRef<$crate::GuestProxy<$contract>> for $client {
            fn as_ref(&self) -> &$crate::GuestProxy<$contract> {
                &self.proxy
            }
        }

        impl $client {
            $(
                $(#[$channel_meta])*
                pub async fn $method(
                    &self,
                    $($arg: $ty),*
                ) -> ::std::result::Result<$output, $crate::CallError> {
                    self.proxy.call::<$marker>(($($arg,)*)).await
                }
            )*
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::{Channel, Contract, Primitive, Registry, TypeSpec};

    crate::contract! {
        /// Test contract
        pub contract Files => FilesClient {
            /// Read a file
            ReadFile = fn read_file(path: String) -> Vec<u8>;
            WriteFile = fn write_file(path: String, data: Vec<u8>, append: bool) -> u64;
            Flush = fn flush() -> ();
        }
    }

    #[test]
    fn one_declaration_yields_every_descriptor() {
        let names: Vec<_> = Files::descriptors().iter().map(|d| d.name()).collect();
        assert_eq!(names, ["read_file", "write_file", "flush"]);
    }

    #[test]
    fn generated_descriptor_matches_declaration() {
        let d = WriteFile::descriptor();
        assert_eq!(d.signature(), "write_file(string, bytes, bool) -> int");
        let names: Vec<_> = d.caller_params().iter().map(|p| p.name).collect();
        assert_eq!(names, ["path", "data", "append"]);
        assert_eq!(d.handler_params().len(), 4);
        assert_eq!(
            Flush::descriptor().result(),
            TypeSpec::Primitive(Primitive::Unit)
        );
    }

    #[test]
    fn contract_builds_a_registry() {
        let registry = Registry::of::<Files>().unwrap();
        assert_eq!(registry.len(), 3);
        assert!(registry.contains(ReadFile::NAME));
    }
}
