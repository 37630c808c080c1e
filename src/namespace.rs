// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::unistd::{gettid, Pid};

use crate::{wrap_if_fail, Config, Error, LinkOps, NamespaceOps, Netlink, Netns, Result, ResultExt};

struct State<H> {
    handle: Option<H>,
    closed: bool,
    // namespace each thread was in before joining, keyed by kernel tid
    origins: HashMap<Pid, H>,
}

/// A named network namespace.
///
/// The namespace is created by [`setup`] and destroyed by [`close`]. In
/// between, threads enter it either for the span of a closure with [`run`],
/// or until they explicitly [`leave`] after a [`join`]. At most one join per
/// thread can be outstanding.
///
/// [`setup`]: NetworkNamespace::setup
/// [`close`]: NetworkNamespace::close
/// [`run`]: NetworkNamespace::run
/// [`join`]: NetworkNamespace::join
/// [`leave`]: NetworkNamespace::leave
pub struct NetworkNamespace<N: NamespaceOps = Netns, L: LinkOps = Netlink> {
    name: String,
    nsops: N,
    linkops: L,
    state: Mutex<State<N::Handle>>,
    cfg: Config,
}

impl NetworkNamespace {
    /// Creates a namespace object backed by the kernel. Nothing exists on
    /// the system until [`setup`](Self::setup) is called.
    pub fn new<S: AsRef<str>>(name: S, cfg: Config) -> Self {
        Self::with_ops(name, Netns::default(), Netlink, cfg)
    }
}

impl<N: NamespaceOps, L: LinkOps> NetworkNamespace<N, L> {
    pub fn with_ops<S: AsRef<str>>(name: S, nsops: N, linkops: L, cfg: Config) -> Self {
        Self {
            name: name.as_ref().to_string(),
            nsops,
            linkops,
            state: Mutex::new(State {
                handle: None,
                closed: false,
                origins: HashMap::new(),
            }),
            cfg,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, State<N::Handle>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle<'a>(&self, state: &'a State<N::Handle>) -> Result<&'a N::Handle> {
        match &state.handle {
            Some(handle) => Ok(handle),
            None if state.closed => Err(Error::Closed(self.name.clone())),
            None => Err(Error::NotSetup(self.name.clone())),
        }
    }

    /// Creates the named namespace. The calling thread ends up back in the
    /// namespace it was in before the call.
    pub fn setup(&self) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Closed(self.name.clone()));
        }

        let origin = self
            .nsops
            .get()
            .context("error getting current namespace")?;

        let created = self
            .nsops
            .new_named(&self.name)
            .context("error creating network namespace");

        // Restoring is attempted even if creation failed half way.
        let restored = self.nsops.set(&origin);
        let result = match (created, restored) {
            (Ok(handle), Ok(())) => Ok(handle),
            (Ok(handle), Err(e)) => {
                // the thread is stuck in the new namespace; do not leak it
                let e = Err(e).context("error exiting namespace");
                let e = wrap_if_fail("error closing new namespace", e, || {
                    self.nsops.close(handle)
                });
                wrap_if_fail("error deleting new namespace", e, || {
                    self.nsops.delete_named(&self.name)
                })
            }
            (Err(e), restored) => wrap_if_fail("error exiting namespace", Err(e), || restored),
        };
        let handle = wrap_if_fail("error closing original namespace", result, || {
            self.nsops.close(origin)
        })?;

        logf!(self.cfg, info, namespace = %self.name, "network namespace created");
        if let Some(old) = state.handle.replace(handle) {
            self.nsops.close(old).context("error closing previous handle")?;
        }
        Ok(())
    }

    /// Moves the calling thread into the namespace and keeps it there until
    /// [`leave`](Self::leave) is called from the same thread.
    pub fn join(&self) -> Result<()> {
        let mut state = self.lock();
        let tid = gettid();
        if state.origins.contains_key(&tid) {
            return Err(Error::AlreadyJoined(self.name.clone()));
        }
        let handle = self.handle(&state)?;

        let origin = self
            .nsops
            .get()
            .context("error getting current namespace")?;
        if let Err(e) = self.nsops.set(handle) {
            let e = Err(e).context("error switching to the namespace");
            return wrap_if_fail("error closing original namespace", e, || {
                self.nsops.close(origin)
            });
        }

        logf!(self.cfg, debug, namespace = %self.name, %tid, "joined namespace");
        state.origins.insert(tid, origin);
        Ok(())
    }

    /// Returns the calling thread to the namespace it was in before
    /// [`join`](Self::join).
    pub fn leave(&self) -> Result<()> {
        let mut state = self.lock();
        let tid = gettid();
        let origin = match state.origins.get(&tid) {
            Some(origin) => origin,
            None => return Err(Error::NotJoined(self.name.clone())),
        };

        self.nsops
            .set(origin)
            .context("error switching to original namespace")?;

        logf!(self.cfg, debug, namespace = %self.name, %tid, "left namespace");
        match state.origins.remove(&tid) {
            Some(origin) => self
                .nsops
                .close(origin)
                .context("error closing original namespace"),
            None => Ok(()),
        }
    }

    /// Runs `f` inside the namespace and switches back afterwards, whatever
    /// `f` returned. A failed switch back never hides the error from `f`.
    ///
    /// Only the switch into the namespace is serialized with
    /// [`join`](Self::join) and [`leave`](Self::leave); `f` runs unlocked.
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let origin = self
            .nsops
            .get()
            .context("error getting current namespace")?;

        let entered = {
            let state = self.lock();
            self.handle(&state)
                .and_then(|handle| self.nsops.set(handle))
                .context("error switching to namespace")
        };

        let result = match entered {
            Ok(()) => {
                let result = f();
                wrap_if_fail("error exiting namespace", result, || {
                    self.nsops.set(&origin)
                })
            }
            Err(e) => Err(e),
        };

        wrap_if_fail("error closing namespace", result, || self.nsops.close(origin))
    }

    /// Moves the host interface `ifname` into the namespace. The interface is
    /// left down.
    pub fn attach_interface(&self, ifname: &str) -> Result<()> {
        logf!(self.cfg, info, namespace = %self.name, ifname, "attaching interface");
        let link = self
            .linkops
            .link_by_name(ifname)
            .context("error finding interface")?;

        let state = self.lock();
        let fd = self.handle(&state)?.as_raw_fd();
        self.linkops
            .link_set_ns_fd(&link, fd)
            .context("error moving peer into namespace")
    }

    /// Assigns `ipaddr` (`a.b.c.d/len`) to `ifname` inside the namespace.
    pub fn set_interface_ip(&self, ifname: &str, ipaddr: &str) -> Result<()> {
        let addr = self
            .linkops
            .parse_addr(ipaddr)
            .context("error parsing ip")?;

        self.run(|| {
            let link = self.linkops.link_by_name(ifname)?;
            self.linkops.addr_add(&link, &addr)
        })
        .context("error setting interface ip")
    }

    pub fn bring_interface_up(&self, ifname: &str) -> Result<()> {
        self.run(|| {
            let link = self.linkops.link_by_name(ifname)?;
            self.linkops.link_set_up(&link)
        })
        .context("error bringing interface up")
    }

    /// Routes all traffic leaving the namespace through `addr`.
    pub fn set_default_gateway(&self, addr: &str) -> Result<()> {
        logf!(self.cfg, info, namespace = %self.name, gateway = addr, "setting default gateway");
        let gw: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidGateway(addr.to_string()))?;

        self.run(|| self.linkops.route_add_default(gw))
            .context("error setting default gateway")
    }

    /// Closes the namespace handle and deletes the named namespace. Both
    /// steps are attempted; the namespace cannot be used afterwards.
    pub fn close(&self) -> Result<()> {
        let handle = {
            let mut state = self.lock();
            let handle = state.handle.take();
            state.closed = true;
            handle
        };
        let handle = match handle {
            Some(handle) => handle,
            None => return Err(Error::Closed(self.name.clone())),
        };

        logf!(self.cfg, info, namespace = %self.name, "deleting network namespace");
        let closed = self
            .nsops
            .close(handle)
            .context("error closing namespace");
        wrap_if_fail("error deleting namespace", closed, || {
            self.nsops.delete_named(&self.name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLink, FakeNamespace, HOST_NS};

    fn fake(name: &str) -> (NetworkNamespace<FakeNamespace, FakeLink>, FakeNamespace, FakeLink) {
        let nsops = FakeNamespace::default();
        let linkops = FakeLink::default();
        let ns = NetworkNamespace::with_ops(name, nsops.clone(), linkops.clone(), Config::default());
        (ns, nsops, linkops)
    }

    fn fake_setup(name: &str) -> (NetworkNamespace<FakeNamespace, FakeLink>, FakeNamespace, FakeLink) {
        let (ns, nsops, linkops) = fake(name);
        ns.setup().unwrap();
        (ns, nsops, linkops)
    }

    #[test]
    fn test_setup_restores_thread() {
        let (ns, nsops, _) = fake("test");
        ns.setup().unwrap();

        assert_eq!(nsops.current(), HOST_NS);
        assert_eq!(nsops.named(), vec!["test".to_string()]);
        // only the namespace handle stays open
        assert_eq!(nsops.open_handles(), 1);
        assert_eq!(nsops.calls(), vec!["get", "new_named", "set", "close"]);
    }

    #[test]
    fn test_setup_create_failure() {
        let (ns, nsops, _) = fake("test");
        nsops.fail("new_named");

        let err = ns.setup().unwrap_err();
        assert!(err.to_string().contains("error creating network namespace"));
        assert_eq!(nsops.count("set"), 1);
        assert_eq!(nsops.open_handles(), 0);
        assert!(nsops.named().is_empty());

        // both the creation and the restore failure are reported
        nsops.fail("set");
        let err = ns.setup().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("error exiting namespace"));
        assert!(text.contains("error creating network namespace"));
    }

    #[test]
    fn test_setup_get_failure() {
        let (ns, nsops, _) = fake("test");
        nsops.fail("get");

        assert!(ns.setup().is_err());
        assert_eq!(nsops.calls(), vec!["get"]);
    }

    #[test]
    fn test_setup_restore_failure_deletes_namespace() {
        let (ns, nsops, _) = fake("test");
        nsops.fail(&format!("set:{}", HOST_NS));

        let err = ns.setup().unwrap_err();
        assert!(err.to_string().contains("error exiting namespace"));
        assert!(nsops.named().is_empty());
        assert_eq!(nsops.open_handles(), 0);
        assert!(matches!(ns.join(), Err(Error::NotSetup(_))));
    }

    #[test]
    fn test_join_leave_restores_namespace() {
        let (ns, nsops, _) = fake_setup("test");
        let before = nsops.current();

        ns.join().unwrap();
        assert_ne!(nsops.current(), before);
        assert_eq!(ns.lock().origins.len(), 1);

        ns.leave().unwrap();
        assert_eq!(nsops.current(), before);
        assert!(ns.lock().origins.is_empty());
        assert_eq!(nsops.open_handles(), 1);
    }

    #[test]
    fn test_leave_without_join() {
        let (ns, nsops, _) = fake_setup("test");
        let sets = nsops.count("set");

        assert!(matches!(ns.leave(), Err(Error::NotJoined(_))));
        assert_eq!(nsops.count("set"), sets);
        assert_eq!(nsops.current(), HOST_NS);
    }

    #[test]
    fn test_join_twice() {
        let (ns, nsops, _) = fake_setup("test");
        ns.join().unwrap();
        let joined = nsops.current();
        let calls = nsops.calls().len();

        assert!(matches!(ns.join(), Err(Error::AlreadyJoined(_))));
        assert_eq!(nsops.calls().len(), calls);
        assert_eq!(nsops.current(), joined);
        assert_eq!(ns.lock().origins.len(), 1);

        ns.leave().unwrap();
        assert_eq!(nsops.current(), HOST_NS);
    }

    #[test]
    fn test_join_per_thread() {
        let (ns, nsops, _) = fake_setup("test");
        ns.join().unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(nsops.current(), HOST_NS);
                assert!(matches!(ns.leave(), Err(Error::NotJoined(_))));
                ns.join().unwrap();
                assert_ne!(nsops.current(), HOST_NS);
                ns.leave().unwrap();
            });
        });

        assert_ne!(nsops.current(), HOST_NS);
        ns.leave().unwrap();
        assert_eq!(nsops.current(), HOST_NS);
    }

    #[test]
    fn test_join_switch_failure() {
        let (ns, nsops, _) = fake_setup("test");
        nsops.fail("set");

        assert!(ns.join().is_err());
        assert!(ns.lock().origins.is_empty());
        assert_eq!(nsops.open_handles(), 1);

        nsops.heal("set");
        ns.join().unwrap();
        ns.leave().unwrap();
    }

    #[test]
    fn test_join_before_setup() {
        let (ns, _, _) = fake("test");
        assert!(matches!(ns.join(), Err(Error::NotSetup(_))));
        assert!(matches!(ns.run(|| Ok(())), Err(Error::Context { .. })));
    }

    #[test]
    fn test_run() {
        let (ns, nsops, _) = fake_setup("test");

        let inside = ns.run(|| Ok(nsops.current())).unwrap();
        assert_ne!(inside, HOST_NS);
        assert_eq!(nsops.current(), HOST_NS);
        assert_eq!(nsops.open_handles(), 1);

        let err = ns
            .run(|| -> Result<()> { Err(Error::InvalidAddr("test error".into())) })
            .unwrap_err();
        assert!(err.to_string().contains("test error"));
        assert_eq!(nsops.current(), HOST_NS);
        assert_eq!(nsops.open_handles(), 1);
    }

    #[test]
    fn test_run_restore_failure_keeps_error() {
        let (ns, nsops, _) = fake_setup("test");
        nsops.fail(&format!("set:{}", HOST_NS));

        let err = ns
            .run(|| -> Result<()> { Err(Error::InvalidAddr("test error".into())) })
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("error exiting namespace"));
        assert!(text.contains("test error"));
        assert!(matches!(err, Error::Cleanup { .. }));
        // the origin handle was closed regardless
        assert_eq!(nsops.open_handles(), 1);
    }

    #[test]
    fn test_run_restore_failure_after_success() {
        let (ns, nsops, _) = fake_setup("test");
        nsops.fail(&format!("set:{}", HOST_NS));

        let err = ns.run(|| Ok(())).unwrap_err();
        assert!(err.to_string().contains("error exiting namespace"));
        assert!(matches!(err, Error::Context { .. }));
    }

    #[test]
    fn test_run_while_joined() {
        let (ns, nsops, _) = fake_setup("test");
        ns.join().unwrap();
        let joined = nsops.current();

        ns.run(|| Ok(())).unwrap();
        assert_eq!(nsops.current(), joined);

        ns.leave().unwrap();
        assert_eq!(nsops.current(), HOST_NS);
    }

    #[test]
    fn test_attach_interface() {
        let (ns, _, linkops) = fake_setup("test");
        linkops.add_veth("test-in", "test-out").unwrap();

        ns.attach_interface("test-in").unwrap();
        assert!(linkops.link("test-in").unwrap().ns_fd.is_some());
        assert!(!linkops.link("test-in").unwrap().up);

        assert!(ns.attach_interface("missing").is_err());
    }

    #[test]
    fn test_set_interface_ip() {
        let (ns, nsops, linkops) = fake_setup("test");
        linkops.add_veth("test-in", "test-out").unwrap();

        ns.set_interface_ip("test-in", "10.0.0.1/30").unwrap();
        let addrs = linkops.link("test-in").unwrap().addrs;
        assert_eq!(addrs, vec!["10.0.0.1/30".parse().unwrap()]);
        assert_eq!(nsops.current(), HOST_NS);

        assert!(ns.set_interface_ip("test-in", "10.0.0.1/99").is_err());
        assert!(ns.set_interface_ip("missing", "10.0.0.1/30").is_err());
        assert_eq!(nsops.current(), HOST_NS);
    }

    #[test]
    fn test_bring_interface_up() {
        let (ns, nsops, linkops) = fake_setup("test");

        ns.bring_interface_up("lo").unwrap();
        assert!(linkops.link("lo").unwrap().up);
        assert_eq!(nsops.current(), HOST_NS);
    }

    #[test]
    fn test_set_default_gateway() {
        let (ns, nsops, linkops) = fake_setup("test");

        ns.set_default_gateway("10.0.0.2").unwrap();
        assert_eq!(linkops.routes(), vec![Ipv4Addr::new(10, 0, 0, 2)]);
        assert_eq!(nsops.current(), HOST_NS);

        assert!(matches!(
            ns.set_default_gateway("10.0.0"),
            Err(Error::InvalidGateway(_))
        ));
    }

    #[test]
    fn test_close() {
        let (ns, nsops, _) = fake_setup("test");

        ns.close().unwrap();
        assert!(nsops.named().is_empty());
        assert_eq!(nsops.open_handles(), 0);

        assert!(matches!(ns.close(), Err(Error::Closed(_))));
        assert!(matches!(ns.join(), Err(Error::Closed(_))));
        assert!(matches!(ns.setup(), Err(Error::Closed(_))));
    }

    #[test]
    fn test_close_attempts_both_steps() {
        let (ns, nsops, _) = fake_setup("test");
        nsops.fail("close");

        let err = ns.close().unwrap_err();
        assert!(err.to_string().contains("error closing namespace"));
        assert_eq!(nsops.count("delete_named"), 1);
        assert!(nsops.named().is_empty());
    }

    #[test]
    fn test_real_join_leave() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        std::thread::spawn(|| {
            let ns = NetworkNamespace::new("test_real_join_leave", Config::default());
            ns.setup().unwrap();

            let before = crate::get_from_current_thread().unwrap();
            ns.join().unwrap();
            assert_ne!(crate::get_from_current_thread().unwrap(), before);
            ns.leave().unwrap();
            assert_eq!(crate::get_from_current_thread().unwrap(), before);

            ns.run(|| {
                assert_ne!(crate::get_from_current_thread().unwrap(), before);
                Ok(())
            })
            .unwrap();
            ns.bring_interface_up("lo").unwrap();
            ns.close().unwrap();
        })
        .join()
        .unwrap();
    }
}
