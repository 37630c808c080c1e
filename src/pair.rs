// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use crate::{wrap_if_fail, Config, Error, Link, LinkOps, Netlink, Result, ResultExt};

// IFNAMSIZ minus the trailing NUL and the "-out" suffix.
const MAX_PREFIX_LEN: usize = 15 - 4;

/// A veth pair named `<prefix>-in` / `<prefix>-out`. The `in` end is meant
/// to be moved into a namespace while `out` stays on the host.
pub struct InterfacePair<L: LinkOps = Netlink> {
    prefix: String,
    linkops: L,
    ends: Option<(Link, Link)>,
    cfg: Config,
}

impl InterfacePair {
    pub fn new<S: AsRef<str>>(prefix: S, cfg: Config) -> Self {
        Self::with_ops(prefix, Netlink, cfg)
    }
}

impl<L: LinkOps> InterfacePair<L> {
    pub fn with_ops<S: AsRef<str>>(prefix: S, linkops: L, cfg: Config) -> Self {
        Self {
            prefix: prefix.as_ref().to_string(),
            linkops,
            ends: None,
            cfg,
        }
    }

    pub fn in_name(&self) -> String {
        format!("{}-in", self.prefix)
    }

    pub fn out_name(&self) -> String {
        format!("{}-out", self.prefix)
    }

    fn ends(&self) -> Result<&(Link, Link)> {
        self.ends
            .as_ref()
            .ok_or_else(|| Error::NotSetup(format!("interface pair {}", self.prefix)))
    }

    /// Creates the veth pair and resolves both of its ends.
    pub fn setup(&mut self) -> Result<()> {
        if self.prefix.is_empty() || self.prefix.len() > MAX_PREFIX_LEN {
            return Err(Error::InvalidPrefix(self.prefix.clone(), MAX_PREFIX_LEN));
        }
        let (in_name, out_name) = (self.in_name(), self.out_name());
        logf!(self.cfg, info, %in_name, %out_name, "creating veth pair");

        self.linkops
            .add_veth(&in_name, &out_name)
            .context("error creating veth pair")?;

        let out = match self.linkops.link_by_name(&out_name) {
            Ok(out) => out,
            Err(e) => {
                let e = Err(e).context("error finding out interface");
                return wrap_if_fail("error deleting veth pair", e, || {
                    let inner = self.linkops.link_by_name(&in_name)?;
                    self.linkops.link_del(&inner)
                });
            }
        };
        let inner = match self.linkops.link_by_name(&in_name) {
            Ok(inner) => inner,
            Err(e) => {
                let e = Err(e).context("error finding in interface");
                return wrap_if_fail("error deleting veth pair", e, || {
                    self.linkops.link_del(&out)
                });
            }
        };

        self.ends = Some((inner, out));
        Ok(())
    }

    /// Assigns `addr` (`a.b.c.d/len`) to the host end and brings it up.
    pub fn set_external_ip(&self, addr: &str) -> Result<()> {
        let (_, out) = self.ends()?;
        let addr = self.linkops.parse_addr(addr).context("error parsing ip")?;

        self.linkops
            .addr_add(out, &addr)
            .context("error setting external ip")?;
        self.linkops
            .link_set_up(out)
            .context("error bringing external interface up")
    }

    /// Deletes the host end; the kernel removes the `in` end with it.
    pub fn close(&self) -> Result<()> {
        let (_, out) = self.ends()?;
        logf!(self.cfg, info, out = %out.name, "deleting veth pair");
        self.linkops
            .link_del(out)
            .context("error deleting veth pair")
    }
}
