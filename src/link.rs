// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::RawFd;

use futures_util::stream::TryStreamExt;
use ipnetwork::Ipv4Network;
use nix::errno::Errno;
use rtnetlink::{Handle, LinkUnspec, LinkVeth, RouteMessageBuilder};

use crate::{Error, Result};

/// A network interface resolved in the namespace of the calling thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
}

/// The link capability consumed by [`NetworkNamespace`] and
/// [`InterfacePair`]. Every operation acts on the network namespace of the
/// calling thread.
///
/// [`NetworkNamespace`]: crate::NetworkNamespace
/// [`InterfacePair`]: crate::InterfacePair
pub trait LinkOps: Send + Sync {
    fn link_by_name(&self, name: &str) -> Result<Link>;

    /// Creates a veth pair with ends `name` and `peer`.
    fn add_veth(&self, name: &str, peer: &str) -> Result<()>;

    fn link_del(&self, link: &Link) -> Result<()>;

    /// Moves `link` into the namespace referred to by `fd`.
    fn link_set_ns_fd(&self, link: &Link, fd: RawFd) -> Result<()>;

    fn addr_add(&self, link: &Link, addr: &Ipv4Network) -> Result<()>;

    fn link_set_up(&self, link: &Link) -> Result<()>;

    /// Adds a default route through `gw`.
    fn route_add_default(&self, gw: Ipv4Addr) -> Result<()>;

    /// Parses an `a.b.c.d/len` interface address. The host bits are kept.
    fn parse_addr(&self, addr: &str) -> Result<Ipv4Network> {
        addr.parse()
            .map_err(|_| Error::InvalidAddr(addr.to_string()))
    }
}

/// The kernel implementation of [`LinkOps`], speaking rtnetlink.
///
/// Each request opens its own netlink socket on a current-thread runtime
/// driven by the caller, so the socket lives in whatever namespace the
/// calling thread is in at that moment.
#[derive(Copy, Clone, Default, Debug)]
pub struct Netlink;

impl Netlink {
    fn execute<F, Fut, T>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future<Output = std::result::Result<T, rtnetlink::Error>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .map_err(Error::RuntimeError)?;

        runtime.block_on(async {
            let (connection, handle, _) = rtnetlink::new_connection().map_err(Error::RuntimeError)?;
            tokio::spawn(connection);
            f(handle).await.map_err(|e| Error::NetlinkError(op, e))
        })
    }
}

impl LinkOps for Netlink {
    fn link_by_name(&self, name: &str) -> Result<Link> {
        let message = self.execute("link get", |handle| {
            let name = name.to_string();
            async move {
                let mut links = handle.link().get().match_name(name).execute();
                links.try_next().await
            }
        });

        match message {
            Ok(Some(message)) => Ok(Link {
                index: message.header.index,
                name: name.to_string(),
            }),
            Ok(None) => Err(Error::LinkNotFound(name.to_string())),
            Err(Error::NetlinkError(_, e)) if is_no_device(&e) => {
                Err(Error::LinkNotFound(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn add_veth(&self, name: &str, peer: &str) -> Result<()> {
        self.execute("veth add", |handle| async move {
            handle
                .link()
                .add(LinkVeth::new(name, peer).build())
                .execute()
                .await
        })
    }

    fn link_del(&self, link: &Link) -> Result<()> {
        let index = link.index;
        self.execute("link del", |handle| async move {
            handle.link().del(index).execute().await
        })
    }

    fn link_set_ns_fd(&self, link: &Link, fd: RawFd) -> Result<()> {
        let index = link.index;
        self.execute("link set netns", |handle| async move {
            handle
                .link()
                .set(LinkUnspec::new_with_index(index).setns_by_fd(fd).build())
                .execute()
                .await
        })
    }

    fn addr_add(&self, link: &Link, addr: &Ipv4Network) -> Result<()> {
        let (index, ip, prefix) = (link.index, addr.ip(), addr.prefix());
        self.execute("addr add", |handle| async move {
            handle
                .address()
                .add(index, IpAddr::V4(ip), prefix)
                .execute()
                .await
        })
    }

    fn link_set_up(&self, link: &Link) -> Result<()> {
        let index = link.index;
        self.execute("link set up", |handle| async move {
            handle
                .link()
                .set(LinkUnspec::new_with_index(index).up().build())
                .execute()
                .await
        })
    }

    fn route_add_default(&self, gw: Ipv4Addr) -> Result<()> {
        self.execute("route add", |handle| async move {
            let route = RouteMessageBuilder::<Ipv4Addr>::new().gateway(gw).build();
            handle.route().add(route).execute().await
        })
    }
}

// The kernel answers a lookup of an unknown name with ENODEV.
fn is_no_device(err: &rtnetlink::Error) -> bool {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.raw_code() == -(Errno::ENODEV as i32),
        _ => false,
    }
}
