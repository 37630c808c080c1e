// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::time::Duration;

use tracing::Dispatch;

/// Port the echo servers listen on and the probes dial by default.
pub const DEFAULT_PORT: u16 = 8080;

/// Socket deadline applied by probes and echo servers by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Options shared by every component of a managed namespace.
///
/// ```
/// use netns_probe::Config;
/// use std::time::Duration;
///
/// let cfg = Config::default()
///     .with_port(9000)
///     .with_timeout(Duration::from_secs(2));
/// assert_eq!(cfg.port(), 9000);
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    port: u16,
    timeout: Duration,
    sink: Option<Dispatch>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            sink: None,
        }
    }
}

impl Config {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Routes this crate's log events to `sink` instead of the global
    /// subscriber.
    pub fn with_log_sink<D: Into<Dispatch>>(mut self, sink: D) -> Self {
        self.sink = Some(sink.into());
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn log<F: FnOnce()>(&self, f: F) {
        match &self.sink {
            Some(sink) => tracing::dispatcher::with_default(sink, f),
            None => f(),
        }
    }
}
