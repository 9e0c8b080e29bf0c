use std::time::Duration;

/// Default upper bound on a single frame body (16 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Environment variable a sandboxed guest reads to find the host socket
pub const DEFAULT_SOCKET_ENV: &str = "TETHER_SOCKET";

/// Settings shared by the host dispatcher and the guest proxy
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    max_frame_len: usize,
    call_timeout: Option<Duration>,
    require_complete_bindings: bool,
    socket_env: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            call_timeout: None,
            require_complete_bindings: false,
            socket_env: DEFAULT_SOCKET_ENV.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Create a new builder for BridgeConfig
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Largest frame body accepted or sent, in bytes
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// How long a guest waits for a reply before rejecting the call locally
    ///
    /// `None` waits until the reply arrives or the link closes.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    /// Whether the host refuses to start while a registry channel is unbound
    pub fn require_complete_bindings(&self) -> bool {
        self.require_complete_bindings
    }

    /// Environment variable that carries the socket path to the guest
    pub fn socket_env(&self) -> &str {
        &self.socket_env
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    inner: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Set the largest frame body, in bytes
    pub fn max_frame_len(mut self, bytes: usize) -> Self {
        self.inner.max_frame_len = bytes;
        self
    }

    /// Reject calls that get no reply within `timeout`
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.inner.call_timeout = Some(timeout);
        self
    }

    /// Refuse to start while any registry channel is unbound
    pub fn require_complete_bindings(mut self, required: bool) -> Self {
        self.inner.require_complete_bindings = required;
        self
    }

    /// Set the environment variable carrying the socket path
    pub fn socket_env(mut self, name: impl Into<String>) -> Self {
        self.inner.socket_env = name.into();
        self
    }

    /// Build the config
    pub fn build(self) -> BridgeConfig {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.max_frame_len(), DEFAULT_MAX_FRAME_LEN);
        assert_eq!(config.call_timeout(), None);
        assert!(!config.require_complete_bindings());
        assert_eq!(config.socket_env(), "TETHER_SOCKET");
    }

    #[test]
    fn builder_overrides() {
        let config = BridgeConfig::builder()
            .max_frame_len(1024)
            .call_timeout(Duration::from_secs(5))
            .require_complete_bindings(true)
            .socket_env("APP_BRIDGE")
            .build();
        assert_eq!(config.max_frame_len(), 1024);
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(5)));
        assert!(config.require_complete_bindings());
        assert_eq!(config.socket_env(), "APP_BRIDGE");
    }
}
