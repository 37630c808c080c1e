// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::{
    wrap_if_fail, Config, Error, LinkOps, ManagedNetworkNamespace, NamespaceOps, Netlink, Netns,
    Result, ResultExt,
};

const PROBE: &[u8] = b"echo";
const TCP_REPLY: &[u8] = b"echo\n";
const UDP_REPLY: &[u8] = b"echo";
const REPLY_BUFFER: usize = 6;
const SERVER_BUFFER: usize = 1024;

// There is no hook telling when accept/recv is actually waiting, so servers
// report ready this long after binding.
const READY_DELAY: Duration = Duration::from_millis(100);

/// Runs echo probes and echo servers from inside a managed namespace.
///
/// Probes dial from the namespace with [`ping_tcp`](Self::ping_tcp) and
/// [`ping_udp`](Self::ping_udp). The echo servers listen on the namespace
/// internal address, answer the first connection or datagram and stop.
pub struct NamespacePinger<N: NamespaceOps = Netns, L: LinkOps = Netlink> {
    namespace: Arc<ManagedNetworkNamespace<N, L>>,
    cfg: Config,
}

impl NamespacePinger {
    pub fn new<S: AsRef<str>>(name: S, cidr: &str, cfg: Config) -> Result<Self> {
        Self::with_ops(name, cidr, Netns::default(), Netlink, cfg)
    }
}

impl<N: NamespaceOps, L: LinkOps + Clone> NamespacePinger<N, L> {
    pub fn with_ops<S: AsRef<str>>(
        name: S,
        cidr: &str,
        nsops: N,
        linkops: L,
        cfg: Config,
    ) -> Result<Self> {
        let namespace = ManagedNetworkNamespace::with_ops(name, cidr, nsops, linkops, cfg.clone())
            .context("error creating network namespace")?;
        Ok(Self {
            namespace: Arc::new(namespace),
            cfg,
        })
    }
}

impl<N: NamespaceOps, L: LinkOps> NamespacePinger<N, L> {
    pub fn namespace(&self) -> &ManagedNetworkNamespace<N, L> {
        &self.namespace
    }

    pub fn internal_ip(&self) -> Ipv4Addr {
        self.namespace.internal_ip()
    }

    pub fn external_ip(&self) -> Ipv4Addr {
        self.namespace.external_ip()
    }

    /// Sends a UDP probe to `dst` from inside the namespace and waits for a
    /// reply from that same address until the configured timeout. Datagrams
    /// from other peers are dropped.
    pub fn ping_udp(&self, dst: Ipv4Addr) -> Result<()> {
        logf!(self.cfg, info, %dst, from = %self.internal_ip(), "reaching out with udp");
        let addr = SocketAddr::from((dst, self.cfg.port()));
        let timeout = self.cfg.timeout();

        self.namespace.run(|| {
            // unconnected, so an ICMP unreachable does not cut the wait short
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
                .map_err(Error::io("error dialing udp"))?;
            socket
                .send_to(PROBE, addr)
                .map_err(Error::io("error writing to udp socket"))?;

            let deadline = Instant::now() + timeout;
            let mut buffer = [0u8; REPLY_BUFFER];
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Io {
                        context: "error reading from udp socket",
                        source: io::ErrorKind::TimedOut.into(),
                    });
                }
                socket
                    .set_read_timeout(Some(remaining))
                    .map_err(Error::io("error setting udp read deadline"))?;

                let (len, source) = socket
                    .recv_from(&mut buffer)
                    .map_err(Error::io("error reading from udp socket"))?;
                if source == addr {
                    logf!(self.cfg, debug, %source, len, "udp reply received");
                    return Ok(());
                }
                logf!(self.cfg, debug, %source, %addr, "ignoring udp datagram from unexpected peer");
            }
        })
    }

    /// Connects to `dst` over TCP from inside the namespace, sends a probe
    /// and waits for a reply until the configured timeout.
    pub fn ping_tcp(&self, dst: Ipv4Addr) -> Result<()> {
        logf!(self.cfg, info, %dst, from = %self.internal_ip(), "reaching out with tcp");
        let addr = SocketAddr::from((dst, self.cfg.port()));
        let timeout = self.cfg.timeout();

        self.namespace.run(|| {
            let mut conn = TcpStream::connect_timeout(&addr, timeout)
                .map_err(Error::io("error dialing tcp"))?;
            conn.write_all(PROBE)
                .map_err(Error::io("error writing to tcp socket"))?;
            conn.set_read_timeout(Some(timeout))
                .map_err(Error::io("error setting tcp read deadline"))?;

            let mut buffer = [0u8; REPLY_BUFFER];
            let len = conn
                .read(&mut buffer)
                .map_err(Error::io("error reading from tcp socket"))?;
            if len == 0 {
                return Err(Error::Io {
                    context: "error reading from tcp socket",
                    source: io::ErrorKind::UnexpectedEof.into(),
                });
            }
            logf!(self.cfg, debug, %addr, len, "tcp reply received");
            Ok(())
        })
    }

    /// Closes the underlying managed namespace.
    pub fn close(&self) -> Result<()> {
        self.namespace.close()
    }
}

impl<N, L> NamespacePinger<N, L>
where
    N: NamespaceOps + 'static,
    L: LinkOps + 'static,
{
    /// Starts a TCP echo server inside the namespace on a dedicated thread,
    /// returning once it is ready to accept or has failed. The outcome of
    /// the server is sent to `errors`.
    pub fn start_tcp_echo_server(&self, errors: Sender<Result<()>>) {
        self.start_server("tcp-echo", errors, serve_tcp::<N, L>)
    }

    /// Starts a UDP echo server inside the namespace on a dedicated thread,
    /// returning once it is ready to receive or has failed. The outcome of
    /// the server is sent to `errors`.
    pub fn start_udp_echo_server(&self, errors: Sender<Result<()>>) {
        self.start_server("udp-echo", errors, serve_udp::<N, L>)
    }

    fn start_server<F>(&self, kind: &str, errors: Sender<Result<()>>, serve: F)
    where
        F: FnOnce(&ManagedNetworkNamespace<N, L>, &Config, Sender<()>) -> Result<()>
            + Send
            + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel();
        let namespace = Arc::clone(&self.namespace);
        let cfg = self.cfg.clone();
        let failed = errors.clone();

        let spawned = thread::Builder::new()
            .name(format!("{}-{}", kind, namespace.name()))
            .spawn(move || {
                let _ = errors.send(serve(&namespace, &cfg, ready_tx));
            });
        if let Err(e) = spawned {
            let _ = failed.send(Err(Error::Thread(e)));
        }

        // released by the ready signal, or by the sender being dropped when
        // the server gives up early
        let _ = ready_rx.recv();
    }
}

fn serve_tcp<N: NamespaceOps, L: LinkOps>(
    namespace: &ManagedNetworkNamespace<N, L>,
    cfg: &Config,
    ready: Sender<()>,
) -> Result<()> {
    let addr = SocketAddr::from((namespace.internal_ip(), cfg.port()));
    logf!(cfg, info, namespace = namespace.name(), %addr, "starting tcp echo server");

    namespace.join().context("error joining namespace")?;
    let served = tcp_echo_once(addr, cfg, ready);
    wrap_if_fail("error leaving namespace", served, || namespace.leave())
}

fn tcp_echo_once(addr: SocketAddr, cfg: &Config, ready: Sender<()>) -> Result<()> {
    let listener = TcpListener::bind(addr).map_err(Error::io("error starting tcp server"))?;
    let deadline = Instant::now() + cfg.timeout();

    thread::sleep(READY_DELAY);
    let _ = ready.send(());

    wait_readable(&listener, deadline).map_err(Error::io("error accepting connection"))?;
    let (mut conn, peer) = listener
        .accept()
        .map_err(Error::io("error accepting connection"))?;
    logf!(cfg, info, %addr, %peer, "received tcp connection");

    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(1));
    conn.set_read_timeout(Some(remaining))
        .map_err(Error::io("error setting tcp read deadline"))?;
    // drain the probe so closing does not reset the connection
    let mut buffer = [0u8; SERVER_BUFFER];
    let len = conn
        .read(&mut buffer)
        .map_err(Error::io("error reading from tcp socket"))?;
    logf!(cfg, debug, %peer, len, "tcp probe received");

    conn.write_all(TCP_REPLY)
        .map_err(Error::io("error writing to tcp socket"))
}

fn serve_udp<N: NamespaceOps, L: LinkOps>(
    namespace: &ManagedNetworkNamespace<N, L>,
    cfg: &Config,
    ready: Sender<()>,
) -> Result<()> {
    let addr = SocketAddr::from((namespace.internal_ip(), cfg.port()));
    logf!(cfg, info, namespace = namespace.name(), %addr, "starting udp echo server");

    namespace.join().context("error joining namespace")?;
    let served = udp_echo_once(addr, cfg, ready);
    wrap_if_fail("error leaving namespace", served, || namespace.leave())
}

fn udp_echo_once(addr: SocketAddr, cfg: &Config, ready: Sender<()>) -> Result<()> {
    let socket = UdpSocket::bind(addr).map_err(Error::io("error starting udp server"))?;
    socket
        .set_read_timeout(Some(cfg.timeout()))
        .map_err(Error::io("error setting udp listener deadline"))?;

    thread::sleep(READY_DELAY);
    let _ = ready.send(());

    let mut buffer = [0u8; SERVER_BUFFER];
    let (_, source) = socket
        .recv_from(&mut buffer)
        .map_err(Error::io("error reading from udp socket"))?;
    logf!(cfg, info, %addr, %source, "received udp packet");

    socket
        .send_to(UDP_REPLY, source)
        .map(|_| ())
        .map_err(Error::io("error writing to udp socket"))
}

/// Blocks until `listener` has a pending connection or `deadline` passes.
fn wait_readable(listener: &TcpListener, deadline: Instant) -> io::Result<()> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let millis = remaining.as_millis().clamp(1, i32::MAX as u128) as i32;

        let mut fds = [PollFd::new(listener.as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, millis) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}
