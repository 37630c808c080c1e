// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Network namespaces only exist on Linux. Elsewhere the same names are
//! exported, and every operation fails with [`Error::Unsupported`].

use std::net::Ipv4Addr;
use std::sync::mpsc::Sender;

use crate::{Config, Error, Result};

pub struct NetworkNamespace {
    name: String,
}

impl NetworkNamespace {
    pub fn new<S: AsRef<str>>(name: S, _cfg: Config) -> Self {
        Self {
            name: name.as_ref().to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn setup(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn join(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn leave(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn run<F, T>(&self, _f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        Err(Error::Unsupported)
    }

    pub fn attach_interface(&self, _ifname: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn set_interface_ip(&self, _ifname: &str, _ipaddr: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn bring_interface_up(&self, _ifname: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn set_default_gateway(&self, _addr: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn close(&self) -> Result<()> {
        Err(Error::Unsupported)
    }
}

pub struct InterfacePair {
    prefix: String,
}

impl InterfacePair {
    pub fn new<S: AsRef<str>>(prefix: S, _cfg: Config) -> Self {
        Self {
            prefix: prefix.as_ref().to_string(),
        }
    }

    pub fn in_name(&self) -> String {
        format!("{}-in", self.prefix)
    }

    pub fn out_name(&self) -> String {
        format!("{}-out", self.prefix)
    }

    pub fn setup(&mut self) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn set_external_ip(&self, _addr: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn close(&self) -> Result<()> {
        Err(Error::Unsupported)
    }
}

/// Never constructed on this platform.
pub struct ManagedNetworkNamespace {
    _unconstructible: (),
}

impl ManagedNetworkNamespace {
    pub fn new<S: AsRef<str>>(_name: S, _cidr: &str, _cfg: Config) -> Result<Self> {
        Err(Error::Unsupported)
    }

    pub fn internal_ip(&self) -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }

    pub fn external_ip(&self) -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }

    pub fn run<F, T>(&self, _f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        Err(Error::Unsupported)
    }

    pub fn join(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn leave(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn close(&self) -> Result<()> {
        Err(Error::Unsupported)
    }
}

/// Never constructed on this platform.
pub struct NamespacePinger {
    _unconstructible: (),
}

impl NamespacePinger {
    pub fn new<S: AsRef<str>>(_name: S, _cidr: &str, _cfg: Config) -> Result<Self> {
        Err(Error::Unsupported)
    }

    pub fn internal_ip(&self) -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }

    pub fn external_ip(&self) -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }

    pub fn ping_udp(&self, _dst: Ipv4Addr) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn ping_tcp(&self, _dst: Ipv4Addr) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn start_tcp_echo_server(&self, errors: Sender<Result<()>>) {
        let _ = errors.send(Err(Error::Unsupported));
    }

    pub fn start_udp_echo_server(&self, errors: Sender<Result<()>>) {
        let _ = errors.send(Err(Error::Unsupported));
    }

    pub fn close(&self) -> Result<()> {
        Err(Error::Unsupported)
    }
}
