// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::{Error, Result};

/// The two ends of the point-to-point link derived from a CIDR.
///
/// The network and broadcast addresses are not usable, so `internal` is the
/// network address plus one and `external` the broadcast address minus one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AddressRange {
    pub internal: Ipv4Addr,
    pub external: Ipv4Addr,
    pub prefix_len: u8,
}

impl AddressRange {
    /// Parses `cidr` and computes its first and last usable addresses.
    ///
    /// Fails for prefixes longer than 30 bits, which leave no room for two
    /// distinct host addresses.
    pub fn parse(cidr: &str) -> Result<Self> {
        let net: Ipv4Network = cidr
            .parse()
            .map_err(|e| Error::InvalidCidr(cidr.to_string(), e))?;

        let first = u32::from(net.network());
        let last = u32::from(net.broadcast());
        if last.saturating_sub(first) < 3 {
            return Err(Error::CidrTooSmall(cidr.to_string()));
        }

        Ok(Self {
            internal: Ipv4Addr::from(first + 1),
            external: Ipv4Addr::from(last - 1),
            prefix_len: net.prefix(),
        })
    }

    /// `internal/prefix_len`, as assigned inside the namespace.
    pub fn internal_cidr(&self) -> String {
        format!("{}/{}", self.internal, self.prefix_len)
    }

    /// `external/prefix_len`, as assigned to the host end of the pair.
    pub fn external_cidr(&self) -> String {
        format!("{}/{}", self.external, self.prefix_len)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}", self.internal, self.external)
    }
}
