// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! In-memory stand-ins for the kernel capabilities. They keep just enough
//! state to tell which resources are still alive and record every call.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};

use ipnetwork::Ipv4Network;
use nix::unistd::{gettid, Pid};

use crate::{Error, Link, LinkOps, NamespaceOps, Result};

/// The namespace every thread starts in.
pub const HOST_NS: u32 = 0;

fn injected(op: &str) -> Error {
    Error::Io {
        context: "injected failure",
        source: std::io::Error::new(std::io::ErrorKind::Other, op.to_string()),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct FakeHandle {
    pub fd: RawFd,
    pub ns: u32,
}

impl AsRawFd for FakeHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

#[derive(Default)]
struct NsState {
    current: HashMap<Pid, u32>,
    named: HashMap<String, u32>,
    open: HashSet<RawFd>,
    next_fd: RawFd,
    next_ns: u32,
    calls: Vec<String>,
    failing: HashSet<String>,
}

/// A fake [`NamespaceOps`] tracking which namespace each thread is in.
#[derive(Clone, Default)]
pub struct FakeNamespace {
    state: Arc<Mutex<NsState>>,
}

impl FakeNamespace {
    fn lock(&self) -> MutexGuard<'_, NsState> {
        self.state.lock().unwrap()
    }

    /// Makes `op` fail from now on. `set` can also be failed only when
    /// switching into a given namespace with `"set:<ns>"`.
    pub fn fail(&self, op: &str) {
        self.lock().failing.insert(op.to_string());
    }

    pub fn heal(&self, op: &str) {
        self.lock().failing.remove(op);
    }

    /// The namespace the calling thread is in.
    pub fn current(&self) -> u32 {
        let state = self.lock();
        state.current.get(&gettid()).copied().unwrap_or(HOST_NS)
    }

    pub fn named(&self) -> Vec<String> {
        self.lock().named.keys().cloned().collect()
    }

    pub fn open_handles(&self) -> usize {
        self.lock().open.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.as_str() == op).count()
    }

    fn open(state: &mut NsState, ns: u32) -> FakeHandle {
        state.next_fd += 1;
        let fd = 1000 + state.next_fd;
        state.open.insert(fd);
        FakeHandle { fd, ns }
    }
}

impl NamespaceOps for FakeNamespace {
    type Handle = FakeHandle;

    fn get(&self) -> Result<FakeHandle> {
        let mut state = self.lock();
        state.calls.push("get".into());
        if state.failing.contains("get") {
            return Err(injected("get"));
        }
        let ns = state.current.get(&gettid()).copied().unwrap_or(HOST_NS);
        Ok(Self::open(&mut state, ns))
    }

    fn set(&self, handle: &FakeHandle) -> Result<()> {
        let mut state = self.lock();
        state.calls.push("set".into());
        if state.failing.contains("set") || state.failing.contains(&format!("set:{}", handle.ns)) {
            return Err(injected("set"));
        }
        if !state.open.contains(&handle.fd) {
            return Err(injected("set on closed handle"));
        }
        state.current.insert(gettid(), handle.ns);
        Ok(())
    }

    fn new_named(&self, name: &str) -> Result<FakeHandle> {
        let mut state = self.lock();
        state.calls.push("new_named".into());
        if state.failing.contains("new_named") {
            return Err(injected("new_named"));
        }
        state.next_ns += 1;
        let ns = state.next_ns;
        state.named.insert(name.to_string(), ns);
        state.current.insert(gettid(), ns);
        Ok(Self::open(&mut state, ns))
    }

    fn delete_named(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push("delete_named".into());
        if state.failing.contains("delete_named") {
            return Err(injected("delete_named"));
        }
        match state.named.remove(name) {
            Some(_) => Ok(()),
            None => Err(injected("delete_named on unknown namespace")),
        }
    }

    fn close(&self, handle: FakeHandle) -> Result<()> {
        let mut state = self.lock();
        state.calls.push("close".into());
        // the descriptor is gone even when close reports an error
        let known = state.open.remove(&handle.fd);
        if state.failing.contains("close") || !known {
            return Err(injected("close"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FakeLinkEntry {
    pub index: u32,
    pub peer: Option<String>,
    pub ns_fd: Option<RawFd>,
    pub up: bool,
    pub addrs: Vec<Ipv4Network>,
}

#[derive(Default)]
struct LinkState {
    links: HashMap<String, FakeLinkEntry>,
    routes: Vec<Ipv4Addr>,
    next_index: u32,
    calls: Vec<String>,
    failing: HashSet<String>,
}

/// A fake [`LinkOps`]. Deleting one end of a veth pair removes its peer,
/// like the kernel does. Namespaces are not modelled: every link is visible
/// from everywhere.
#[derive(Clone)]
pub struct FakeLink {
    state: Arc<Mutex<LinkState>>,
}

impl Default for FakeLink {
    fn default() -> Self {
        let fake = Self {
            state: Arc::new(Mutex::new(LinkState::default())),
        };
        fake.insert("lo", None);
        fake
    }
}

impl FakeLink {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap()
    }

    fn insert(&self, name: &str, peer: Option<&str>) {
        let mut state = self.lock();
        state.next_index += 1;
        let entry = FakeLinkEntry {
            index: state.next_index,
            peer: peer.map(str::to_string),
            ns_fd: None,
            up: false,
            addrs: vec![],
        };
        state.links.insert(name.to_string(), entry);
    }

    /// Makes `op` fail from now on, either for every link or, with
    /// `"<op>:<link name>"`, for one link only.
    pub fn fail(&self, op: &str) {
        self.lock().failing.insert(op.to_string());
    }

    pub fn link(&self, name: &str) -> Option<FakeLinkEntry> {
        self.lock().links.get(name).cloned()
    }

    /// Names of the links still alive, `lo` excluded.
    pub fn links(&self) -> Vec<String> {
        let state = self.lock();
        state.links.keys().filter(|l| *l != "lo").cloned().collect()
    }

    pub fn routes(&self) -> Vec<Ipv4Addr> {
        self.lock().routes.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn record(&self, op: &str, target: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("{}:{}", op, target));
        if state.failing.contains(op) || state.failing.contains(&format!("{}:{}", op, target)) {
            return Err(injected(op));
        }
        Ok(())
    }

    fn with_link<F: FnOnce(&mut FakeLinkEntry)>(&self, link: &Link, f: F) -> Result<()> {
        let mut state = self.lock();
        match state.links.get_mut(&link.name) {
            Some(entry) if entry.index == link.index => {
                f(entry);
                Ok(())
            }
            _ => Err(Error::LinkNotFound(link.name.clone())),
        }
    }
}

impl LinkOps for FakeLink {
    fn link_by_name(&self, name: &str) -> Result<Link> {
        self.record("link_by_name", name)?;
        let state = self.lock();
        match state.links.get(name) {
            Some(entry) => Ok(Link {
                index: entry.index,
                name: name.to_string(),
            }),
            None => Err(Error::LinkNotFound(name.to_string())),
        }
    }

    fn add_veth(&self, name: &str, peer: &str) -> Result<()> {
        self.record("add_veth", name)?;
        self.insert(name, Some(peer));
        self.insert(peer, Some(name));
        Ok(())
    }

    fn link_del(&self, link: &Link) -> Result<()> {
        self.record("link_del", &link.name)?;
        let mut state = self.lock();
        let entry = match state.links.remove(&link.name) {
            Some(entry) => entry,
            None => return Err(Error::LinkNotFound(link.name.clone())),
        };
        if let Some(peer) = entry.peer {
            state.links.remove(&peer);
        }
        Ok(())
    }

    fn link_set_ns_fd(&self, link: &Link, fd: RawFd) -> Result<()> {
        self.record("link_set_ns_fd", &link.name)?;
        self.with_link(link, |entry| entry.ns_fd = Some(fd))
    }

    fn addr_add(&self, link: &Link, addr: &Ipv4Network) -> Result<()> {
        self.record("addr_add", &link.name)?;
        let addr = *addr;
        self.with_link(link, |entry| entry.addrs.push(addr))
    }

    fn link_set_up(&self, link: &Link) -> Result<()> {
        self.record("link_set_up", &link.name)?;
        self.with_link(link, |entry| entry.up = true)
    }

    fn route_add_default(&self, gw: Ipv4Addr) -> Result<()> {
        self.record("route_add_default", &gw.to_string())?;
        self.lock().routes.push(gw);
        Ok(())
    }
}
