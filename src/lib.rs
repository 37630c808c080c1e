// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! This crate provisions isolated Linux network namespaces wired to the host
//! through a veth pair, and uses them to probe reachability with TCP/UDP
//! echoes. Changing namespaces requires elevated privileges, so in most cases
//! this code needs to be run as root.
//!
//! A [`ManagedNetworkNamespace`] is built from a name and a CIDR. The first
//! usable address of the CIDR is assigned inside the namespace and the last
//! one on the host side of the veth pair, which also becomes the namespace
//! default gateway.
//!
//! # Examples
//!
//!```no_run
//!use netns_probe::{Config, NamespacePinger};
//!use std::sync::mpsc;
//!
//!let pinger = NamespacePinger::new("probe", "10.0.0.0/30", Config::default()).unwrap();
//!
//!// serve an echo from inside the namespace and reach it from the host.
//!let (tx, rx) = mpsc::channel();
//!pinger.start_tcp_echo_server(tx);
//!// ... dial pinger.internal_ip() on port 8080 from the host ...
//!rx.recv().unwrap().unwrap();
//!
//!// probe the host side from inside the namespace.
//!pinger.ping_udp(pinger.external_ip()).unwrap_err();
//!
//!pinger.close().unwrap();
//!```
//!
//! Namespace membership is a per-thread attribute. Every switch happens on
//! the calling OS thread: [`NetworkNamespace::run`] switches back before it
//! returns, while [`NetworkNamespace::join`] leaves the thread inside the
//! namespace until the same thread calls [`NetworkNamespace::leave`]. Async
//! callers must drive these from a dedicated blocking thread.
//!
//! On targets other than Linux every constructor and method returns
//! [`Error::Unsupported`].

use std::io;

/// Logs through the sink configured in a [`Config`], falling back to the
/// global subscriber.
macro_rules! logf {
    ($cfg:expr, $lvl:ident, $($arg:tt)+) => {
        $cfg.log(|| ::tracing::$lvl!($($arg)+))
    };
}

mod cidr;
mod config;

pub use self::cidr::AddressRange;
pub use self::config::{Config, DEFAULT_PORT, DEFAULT_TIMEOUT};

#[cfg(target_os = "linux")]
mod link;
#[cfg(target_os = "linux")]
mod managed;
#[cfg(target_os = "linux")]
mod namespace;
#[cfg(target_os = "linux")]
mod netns;
#[cfg(target_os = "linux")]
mod pair;
#[cfg(target_os = "linux")]
mod pinger;
#[cfg(all(test, target_os = "linux"))]
mod testing;

#[cfg(target_os = "linux")]
pub use self::{
    link::{Link, LinkOps, Netlink},
    managed::ManagedNetworkNamespace,
    namespace::NetworkNamespace,
    netns::*,
    pair::InterfacePair,
    pinger::NamespacePinger,
};

#[cfg(not(target_os = "linux"))]
mod unsupported;
#[cfg(not(target_os = "linux"))]
pub use self::unsupported::*;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("create netns dir failed. {0}")]
    CreateNsDirError(io::Error),

    #[error("create netns failed. {0}")]
    CreateNsError(io::Error),

    #[error("open netns {0} failed. {1}")]
    OpenNsError(std::path::PathBuf, io::Error),

    #[cfg(target_os = "linux")]
    #[error("close netns failed. {0}")]
    CloseNsError(nix::Error),

    #[error("remove netns {0} failed. {1}")]
    RemoveNsError(std::path::PathBuf, io::Error),

    #[cfg(target_os = "linux")]
    #[error("mount {0} failed. {1}")]
    MountError(String, nix::Error),

    #[cfg(target_os = "linux")]
    #[error("unmount {0} failed. {1}")]
    UnmountError(std::path::PathBuf, nix::Error),

    #[cfg(target_os = "linux")]
    #[error("unshare failed. {0}")]
    UnshareError(nix::Error),

    #[cfg(target_os = "linux")]
    #[error("setns failed. {0}")]
    SetnsError(nix::Error),

    #[cfg(target_os = "linux")]
    #[error("netlink {0} failed. {1}")]
    NetlinkError(&'static str, rtnetlink::Error),

    #[error("netlink runtime failed. {0}")]
    RuntimeError(io::Error),

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("invalid interface prefix {0:?}, expected 1 to {1} bytes")]
    InvalidPrefix(String, usize),

    #[error("invalid cidr {0:?}. {1}")]
    InvalidCidr(String, ipnetwork::IpNetworkError),

    #[error("cidr {0:?} has no two distinct usable addresses")]
    CidrTooSmall(String),

    #[error("invalid address {0:?}")]
    InvalidAddr(String),

    #[error("invalid gateway {0:?}")]
    InvalidGateway(String),

    #[error("namespace {0} already joined")]
    AlreadyJoined(String),

    #[error("namespace {0} not joined")]
    NotJoined(String),

    #[error("{0} is not set up")]
    NotSetup(String),

    #[error("namespace {0} is closed")]
    Closed(String),

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        source: io::Error,
    },

    #[error("spawn thread failed. {0}")]
    Thread(io::Error),

    #[error("{context}: {source}")]
    Context {
        context: &'static str,
        source: Box<Error>,
    },

    /// A cleanup step failed after (or while) the primary operation failed.
    /// Both errors are kept; `source()` yields the primary one.
    #[error("{context}: {cleanup}: {primary}")]
    Cleanup {
        context: &'static str,
        cleanup: Box<Error>,
        #[source]
        primary: Box<Error>,
    },

    #[error("namespaces not supported on this platform")]
    Unsupported,
}

impl Error {
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Error::Io { context, source }
    }

    /// Returns the kind of the underlying socket error, looking through
    /// context wrappers and the primary side of aggregates.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::Io { source, .. } => Some(source.kind()),
            Error::Context { source, .. } => source.io_kind(),
            Error::Cleanup { primary, .. } => primary.io_kind(),
            _ => None,
        }
    }

    /// Returns `true` if the error is a socket deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.io_kind(),
            Some(io::ErrorKind::WouldBlock) | Some(io::ErrorKind::TimedOut)
        )
    }
}

pub(crate) trait ResultExt<T> {
    fn context(self, context: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|e| Error::Context {
            context,
            source: Box::new(e),
        })
    }
}

/// Runs `cleanup` unconditionally and folds its outcome into `result`.
///
/// A cleanup failure never replaces the primary error: both end up in an
/// [`Error::Cleanup`]. If the primary operation succeeded, the cleanup error
/// is returned on its own, wrapped with `context`.
pub(crate) fn wrap_if_fail<T, F>(context: &'static str, result: Result<T>, cleanup: F) -> Result<T>
where
    F: FnOnce() -> Result<()>,
{
    match (result, cleanup()) {
        (result, Ok(())) => result,
        (Ok(_), Err(e)) => Err(Error::Context {
            context,
            source: Box::new(e),
        }),
        (Err(primary), Err(cleanup)) => Err(Error::Cleanup {
            context,
            cleanup: Box::new(cleanup),
            primary: Box::new(primary),
        }),
    }
}
