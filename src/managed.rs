// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::net::Ipv4Addr;

use crate::{
    wrap_if_fail, AddressRange, Config, InterfacePair, LinkOps, NamespaceOps, Netlink, Netns,
    NetworkNamespace, Result, ResultExt,
};

/// A network namespace reachable from the host through a veth pair.
///
/// For a CIDR such as `10.0.0.0/30` the namespace gets `10.0.0.1/30` on its
/// end of the pair, the host keeps `10.0.0.2/30` on the other end, and the
/// namespace routes everything through `10.0.0.2`. Construction is all or
/// nothing: whatever was created before a failing step is removed again.
pub struct ManagedNetworkNamespace<N: NamespaceOps = Netns, L: LinkOps = Netlink> {
    namespace: NetworkNamespace<N, L>,
    pair: InterfacePair<L>,
    range: AddressRange,
}

impl ManagedNetworkNamespace {
    pub fn new<S: AsRef<str>>(name: S, cidr: &str, cfg: Config) -> Result<Self> {
        Self::with_ops(name, cidr, Netns::default(), Netlink, cfg)
    }
}

impl<N: NamespaceOps, L: LinkOps + Clone> ManagedNetworkNamespace<N, L> {
    pub fn with_ops<S: AsRef<str>>(
        name: S,
        cidr: &str,
        nsops: N,
        linkops: L,
        cfg: Config,
    ) -> Result<Self> {
        let name = name.as_ref();
        logf!(cfg, info, namespace = name, cidr, "creating network namespace");

        let range = AddressRange::parse(cidr)?;
        logf!(cfg, info, namespace = name, %range, "network namespace address range");

        let mut pair = InterfacePair::with_ops(name, linkops.clone(), cfg.clone());
        pair.setup().context("error creating interface pair")?;

        if let Err(e) = pair.set_external_ip(&range.external_cidr()) {
            let e = Err(e).context("error setting external interface");
            return wrap_if_fail("error closing interface pair", e, || pair.close());
        }

        let namespace = NetworkNamespace::with_ops(name, nsops, linkops, cfg);
        if let Err(e) = namespace.setup() {
            let e = Err(e).context("error creating namespace");
            return wrap_if_fail("error closing interface pair", e, || pair.close());
        }

        match Self::wire(&namespace, &pair, &range) {
            Ok(()) => Ok(Self {
                namespace,
                pair,
                range,
            }),
            Err(e) => {
                let e = wrap_if_fail("error closing namespace", Err(e), || namespace.close());
                wrap_if_fail("error closing interface pair", e, || pair.close())
            }
        }
    }

    fn wire(namespace: &NetworkNamespace<N, L>, pair: &InterfacePair<L>, range: &AddressRange) -> Result<()> {
        let inner = pair.in_name();
        namespace
            .attach_interface(&inner)
            .context("error attaching interface pair")?;
        namespace
            .set_interface_ip(&inner, &range.internal_cidr())
            .context("error setting interface ip")?;
        for ifname in ["lo", inner.as_str()] {
            namespace
                .bring_interface_up(ifname)
                .context("error bringing interface up")?;
        }
        namespace
            .set_default_gateway(&range.external.to_string())
            .context("error setting default gateway")
    }
}

impl<N: NamespaceOps, L: LinkOps> ManagedNetworkNamespace<N, L> {
    pub fn name(&self) -> &str {
        self.namespace.name()
    }

    /// The address of the namespace end of the pair.
    pub fn internal_ip(&self) -> Ipv4Addr {
        self.range.internal
    }

    /// The address of the host end of the pair, and the namespace gateway.
    pub fn external_ip(&self) -> Ipv4Addr {
        self.range.external
    }

    pub fn prefix_len(&self) -> u8 {
        self.range.prefix_len
    }

    pub fn namespace(&self) -> &NetworkNamespace<N, L> {
        &self.namespace
    }

    pub fn pair(&self) -> &InterfacePair<L> {
        &self.pair
    }

    /// See [`NetworkNamespace::run`].
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.namespace.run(f)
    }

    /// See [`NetworkNamespace::join`].
    pub fn join(&self) -> Result<()> {
        self.namespace.join()
    }

    /// See [`NetworkNamespace::leave`].
    pub fn leave(&self) -> Result<()> {
        self.namespace.leave()
    }

    /// Deletes the interface pair and then the namespace. The namespace is
    /// deleted even if removing the pair failed.
    pub fn close(&self) -> Result<()> {
        let closed = self.pair.close().context("error closing interface pair");
        wrap_if_fail("error closing namespace", closed, || self.namespace.close())
    }
}

impl<N: NamespaceOps, L: LinkOps> std::fmt::Debug for ManagedNetworkNamespace<N, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ManagedNetworkNamespace")
            .field("name", &self.name())
            .field("internal_ip", &self.range.internal)
            .field("external_ip", &self.range.external)
            .field("prefix_len", &self.range.prefix_len)
            .finish()
    }
}
