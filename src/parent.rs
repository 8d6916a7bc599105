use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::socket::{bind, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType,
    SockaddrStorage};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::channel::{Channel, FlushState, Message, WireError};
use crate::config::{self, Config};
use crate::message::{
    check_len, BindReq, CfgSummary, HostMsg, MsgType, ProtoMsg, RdrMsg, RelayMsg, RouterMsg,
    RuleMsg, ScriptReq, TableMsg, Transport, RESET_ALL,
};
use crate::privsep::{Peer, Role};
use crate::registry::HandleMap;
use crate::secret::SecretBuf;

const TOKEN_SIGNAL: u64 = 1 << 24;
const TOKEN_CTL_LISTEN: u64 = TOKEN_SIGNAL + 1;
const TOKEN_CTL_BASE: u64 = 1 << 25;

/// Block the signals the parent consumes through its signalfd. Must run
/// before forking so no window exists where a default disposition fires;
/// children inherit the mask and rely on channel teardown instead.
pub fn block_signals() -> Result<SigSet> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGHUP);
    mask.add(Signal::SIGPIPE);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
    Ok(mask)
}

/// The supervisor. Owns the configuration, the channel to every child and
/// the reload state machine gating "configuring" -> "running".
pub struct Parent {
    pub(crate) cfg: Config,
    pub(crate) conffile: PathBuf,
    pub(crate) macros: Vec<(String, String)>,
    pub(crate) peers: Vec<Peer>,
    /// Outstanding CFG_DONE acknowledgements; zero means running.
    pub(crate) reload: u32,
    pub(crate) sigfd: Option<SignalFd>,
    pub(crate) ctl: Option<UnixListener>,
    pub(crate) ctl_conns: HandleMap<Channel>,
}

impl Parent {
    pub fn new(
        cfg: Config,
        conffile: PathBuf,
        macros: Vec<(String, String)>,
        peers: Vec<Peer>,
        mask: &SigSet,
    ) -> Result<Parent> {
        let sigfd = SignalFd::with_flags(mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .context("signalfd")?;

        let _ = std::fs::remove_file(&cfg.socket);
        let ctl = UnixListener::bind(&cfg.socket)
            .with_context(|| format!("control socket {}", cfg.socket.display()))?;
        ctl.set_nonblocking(true)?;

        Ok(Parent {
            cfg,
            conffile,
            macros,
            peers,
            reload: 0,
            sigfd: Some(sigfd),
            ctl: Some(ctl),
            ctl_conns: HandleMap::new(),
        })
    }

    pub fn run(mut self) -> Result<()> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        for (i, peer) in self.peers.iter().enumerate() {
            epoll.add(&peer.chan, EpollEvent::new(EpollFlags::EPOLLIN, i as u64))?;
        }
        if let Some(sigfd) = &self.sigfd {
            epoll.add(sigfd, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SIGNAL))?;
        }
        if let Some(ctl) = &self.ctl {
            epoll.add(ctl, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_CTL_LISTEN))?;
        }

        self.configure().context("initial configuration")?;
        self.flush_peers(&epoll)?;

        let mut events = [EpollEvent::empty(); 16];
        loop {
            let n = match epoll.wait(&mut events, EpollTimeout::NONE) {
                Err(Errno::EINTR) => continue,
                other => other?,
            };

            for ev in &events[..n] {
                match ev.data() {
                    TOKEN_SIGNAL => self.handle_signals()?,
                    TOKEN_CTL_LISTEN => self.accept_control(&epoll)?,
                    token if token >= TOKEN_CTL_BASE => {
                        self.handle_control(token, &epoll)?;
                    }
                    token => {
                        let i = token as usize;
                        if ev.events().contains(EpollFlags::EPOLLOUT)
                            && self.peers[i].chan.flush()? == FlushState::Done
                        {
                            crate::privsep::rearm(&epoll, &self.peers[i].chan, token)?;
                        }
                        if ev
                            .events()
                            .intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP)
                        {
                            match self.peers[i].chan.fill() {
                                Ok(_) => {}
                                Err(WireError::Closed) => {
                                    // reaped via SIGCHLD; the closed channel
                                    // alone already means the child is gone
                                    warn!(
                                        "lost child: {} {}",
                                        self.peers[i].role.title(),
                                        self.peers[i].instance
                                    );
                                    self.shutdown();
                                }
                                Err(e) => return Err(e.into()),
                            }
                            loop {
                                let msg = match self.peers[i].chan.get()? {
                                    Some(msg) => msg,
                                    None => break,
                                };
                                self.dispatch(i, msg)?;
                            }
                        }
                    }
                }
            }

            self.flush_peers(&epoll)?;
        }
    }

    /// Push out queued messages; a suspended channel resumes on EPOLLOUT.
    fn flush_peers(&mut self, epoll: &Epoll) -> Result<()> {
        for i in 0..self.peers.len() {
            if self.peers[i].chan.wants_write()
                && self.peers[i].chan.flush()? == FlushState::Suspend
            {
                let mut ev = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT, i as u64);
                epoll.modify(&self.peers[i].chan, &mut ev)?;
            }
        }
        Ok(())
    }

    /// Signals arrive here from the event loop, not in signal context, so
    /// handlers are free to allocate and send messages.
    fn handle_signals(&mut self) -> Result<()> {
        let Some(sigfd) = &mut self.sigfd else {
            return Ok(());
        };
        let mut siginfos = Vec::new();
        while let Some(siginfo) = sigfd.read_signal()? {
            siginfos.push(siginfo);
        }
        for siginfo in siginfos {
            match Signal::try_from(siginfo.ssi_signo as i32) {
                Ok(Signal::SIGTERM) | Ok(Signal::SIGINT) => {
                    info!("terminating on signal");
                    self.shutdown();
                }
                Ok(Signal::SIGCHLD) => self.reap_children(),
                Ok(Signal::SIGHUP) => {
                    info!("reload requested with SIGHUP");
                    self.reload(None)?;
                }
                Ok(Signal::SIGPIPE) => {}
                other => warn!(?other, "unexpected signal"),
            }
        }
        Ok(())
    }

    /// Any child exit, clean or not, tears the whole daemon down; a
    /// missing role cannot be tolerated across the privilege boundary.
    fn reap_children(&mut self) {
        let mut die = false;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, status)) => {
                    die = true;
                    self.log_lost(pid, &format!("exited with status {status}"));
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    die = true;
                    self.log_lost(pid, &format!("terminated; signal {signal}"));
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => {}
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("waitpid: {e}");
                    break;
                }
            }
        }
        if die {
            self.shutdown();
        }
    }

    fn log_lost(&self, pid: Pid, cause: &str) {
        match self.peers.iter().find(|p| p.pid == pid) {
            Some(peer) => warn!(
                "lost child: {} {} {}",
                peer.role.title(),
                peer.instance,
                cause
            ),
            None => warn!("lost unknown child {pid}: {cause}"),
        }
    }

    /// Push one complete configuration snapshot to every child: one
    /// message per entity, then CFG_DONE, then arm the reload counter.
    /// Key blobs are read here and fanned out to the custodians only;
    /// every parent-side copy, the queued channel buffers included, is
    /// scrubbed when released.
    pub(crate) fn configure(&mut self) -> Result<()> {
        self.cfg.load_keys()?;

        // tables and hosts go to the filter, health and relay engines
        for table in &self.cfg.tables {
            let wire = crate::message::to_wire(
                "table config",
                &TableMsg {
                    id: table.id,
                    name: table.name.clone(),
                    check_script: table.check_script.clone(),
                },
            )?;
            for role in [Role::Pfe, Role::Hce, Role::Relay] {
                compose_role(&mut self.peers, role, MsgType::CfgTable, &wire)?;
            }
            for host in &table.hosts {
                let wire = crate::message::to_wire(
                    "host config",
                    &HostMsg {
                        id: host.id,
                        table: table.id,
                        name: host.name.clone(),
                    },
                )?;
                for role in [Role::Pfe, Role::Hce, Role::Relay] {
                    compose_role(&mut self.peers, role, MsgType::CfgHost, &wire)?;
                }
            }
        }

        for rdr in &self.cfg.rdrs {
            let wire = crate::message::to_wire(
                "rdr config",
                &RdrMsg {
                    id: rdr.id,
                    name: rdr.name.clone(),
                    table: rdr.table_id,
                },
            )?;
            compose_role(&mut self.peers, Role::Pfe, MsgType::CfgRdr, &wire)?;
        }

        for router in &self.cfg.routers {
            let wire = crate::message::to_wire(
                "router config",
                &RouterMsg {
                    id: router.id,
                    name: router.name.clone(),
                    gateways: router.gateways.clone(),
                },
            )?;
            compose_role(&mut self.peers, Role::Pfe, MsgType::CfgRouter, &wire)?;
        }

        for proto in &self.cfg.protocols {
            let wire = crate::message::to_wire(
                "protocol config",
                &ProtoMsg {
                    id: proto.id,
                    name: proto.name.clone(),
                },
            )?;
            compose_role(&mut self.peers, Role::Relay, MsgType::CfgProto, &wire)?;
            for rule in &proto.rules {
                let wire = crate::message::to_wire(
                    "rule config",
                    &RuleMsg {
                        id: rule.id,
                        proto: proto.id,
                        dir: rule.dir,
                        action: rule.action,
                        key: rule.key.clone(),
                        value: rule.value.clone(),
                    },
                )?;
                compose_role(&mut self.peers, Role::Relay, MsgType::CfgRule, &wire)?;
            }
        }

        for relay in &mut self.cfg.relays {
            let wire = crate::message::to_wire(
                "relay config",
                &RelayMsg {
                    id: relay.id,
                    name: relay.name.clone(),
                    listen: relay.listen,
                    transport: relay.transport,
                    proto: relay.protocol_id,
                    tls_cert: relay.tls_cert.clone(),
                    tls_keyid: relay.tls_keyid,
                },
            )?;
            compose_role(&mut self.peers, Role::Relay, MsgType::CfgRelay, &wire)?;

            // the key blob goes to the custodians only; every instance
            // holds every key, a relay only ever asks its own instance
            if let (Some(keyid), Some(mut key)) = (relay.tls_keyid, relay.tls_key.take()) {
                for peer in self.peers.iter_mut().filter(|p| p.role == Role::Ca) {
                    let entry = crate::message::CaKeyMsg {
                        relay: relay.id,
                        keyid,
                        pem: SecretBuf::new(key.as_slice().to_vec()),
                    };
                    // the serialized record still holds the PEM bytes, so
                    // it and the queued send buffer get the same scrub
                    // treatment as the blob itself
                    let wire = SecretBuf::new(crate::message::to_wire("ca relay config", &entry)?);
                    peer.chan.compose_secret(
                        MsgType::CfgRelay.into(),
                        peer.instance,
                        wire.as_slice(),
                    )?;
                }
                key.purge();
            }
        }

        let summary = CfgSummary {
            opts: self.cfg.opts,
            flags: self.cfg.flags(),
        };
        compose_all(&mut self.peers, MsgType::CfgDone, &summary.encode())?;

        // one ack per relay, one per custodian instance, plus pfe and hce
        self.reload = self.peers.len() as u32;
        debug!(pending = self.reload, "configuration distributed");

        self.cfg.purge_keys();
        Ok(())
    }

    /// One child acknowledged the configuration round. When the last ack
    /// drains the counter, tell everyone to start.
    pub(crate) fn configure_done(&mut self) -> Result<()> {
        if self.reload == 0 {
            warn!("configuration already finished");
            return Ok(());
        }
        self.reload -= 1;
        if self.reload == 0 {
            compose_all(&mut self.peers, MsgType::CtlStart, &[])?;
            info!("startup complete, all processes running");
        }
        Ok(())
    }

    /// Reload the configuration. A round already in flight makes this a
    /// no-op; the new request is dropped.
    pub(crate) fn reload(&mut self, file: Option<String>) -> Result<()> {
        if self.reload > 0 {
            warn!(pending = self.reload, "reload already in progress");
            return Ok(());
        }
        let path = file
            .filter(|f| !f.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.conffile.clone());
        debug!(config = %path.display(), "reloading");

        match config::load(&path, &self.macros, self.cfg.opts) {
            Err(e) => {
                warn!("failed to load {}, keeping previous config: {e:#}", path.display());
                Ok(())
            }
            Ok(new) => {
                if new.prefork != self.cfg.prefork {
                    warn!(
                        "prefork changed from {} to {}, restart required; keeping previous config",
                        self.cfg.prefork, new.prefork
                    );
                    return Ok(());
                }
                self.cfg = new;
                self.reset_children(RESET_ALL)?;
                self.configure()
            }
        }
    }

    fn reset_children(&mut self, level: u32) -> Result<()> {
        compose_all(&mut self.peers, MsgType::CtlReset, &level.to_ne_bytes())
    }

    /// Orderly teardown: terminate messages, close every channel, reap,
    /// clean the filesystem, exit.
    pub(crate) fn shutdown(&mut self) -> ! {
        for peer in self.peers.iter_mut() {
            let _ = peer
                .chan
                .compose(MsgType::CtlShutdown.into(), peer.instance, None, &[]);
            let _ = peer.chan.flush_blocking();
        }
        self.peers.clear();

        loop {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }

        let _ = std::fs::remove_file(&self.cfg.socket);
        if let Some(pidfile) = &self.cfg.pidfile {
            let _ = std::fs::remove_file(pidfile);
        }
        info!("parent terminating, pid {}", std::process::id());
        std::process::exit(0);
    }

    fn dispatch(&mut self, i: usize, msg: Message) -> Result<()> {
        let role = self.peers[i].role;
        match (role, MsgType::from_raw(msg.hdr.kind)) {
            (_, Some(MsgType::CfgDone)) => {
                check_len("cfg done ack", &msg, 0)?;
                self.configure_done()
            }
            (Role::Hce, Some(MsgType::Script)) => self.handle_script(i, msg),
            (Role::Relay, Some(MsgType::BindAny)) => self.handle_bindany(i, msg),
            _ => bail!(
                "unexpected message type {} from {}",
                msg.hdr.kind,
                role.title()
            ),
        }
    }

    /// Exec a host check on behalf of the health check engine; only paths
    /// named by the loaded configuration are honored.
    fn handle_script(&mut self, i: usize, msg: Message) -> Result<()> {
        let mut req: ScriptReq = crate::message::from_wire("script request", &msg)?;
        let configured = self
            .cfg
            .tables
            .iter()
            .any(|t| t.check_script.as_deref() == Some(req.path.as_path()));
        if !configured {
            bail!("script {} not in configuration", req.path.display());
        }
        let host = self
            .cfg
            .tables
            .iter()
            .flat_map(|t| t.hosts.iter())
            .find(|h| h.id == req.host);
        let Some(host) = host else {
            bail!("script request for unknown host {}", req.host);
        };

        let mut cmd = Command::new(&req.path);
        cmd.arg(&host.name);
        // the parent keeps its signals blocked for the signalfd; the
        // script must not inherit that mask
        unsafe {
            cmd.pre_exec(|| {
                sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }
        req.retval = match cmd.output() {
            Ok(output) => output.status.code().unwrap_or(-1),
            Err(e) => {
                warn!(script = %req.path.display(), "exec failed: {e}");
                -1
            }
        };

        let wire = crate::message::to_wire("script result", &req)?;
        let peer = &mut self.peers[i];
        peer.chan
            .compose(MsgType::Script.into(), peer.instance, None, &wire)?;
        Ok(())
    }

    /// Bind a listening socket with the parent's privilege and hand it to
    /// the requesting relay worker.
    fn handle_bindany(&mut self, i: usize, msg: Message) -> Result<()> {
        let req: BindReq = crate::message::from_wire("bind request", &msg)?;
        let fd = match bindany(&req) {
            Ok(fd) => Some(fd),
            Err(e) => {
                warn!(relay = req.id, addr = %req.addr, "bind failed: {e:#}");
                None
            }
        };
        let peer = &mut self.peers[i];
        peer.chan.compose(
            MsgType::BindAny.into(),
            peer.instance,
            fd,
            &req.id.to_ne_bytes(),
        )?;
        Ok(())
    }

    fn accept_control(&mut self, epoll: &Epoll) -> Result<()> {
        let Some(ctl) = &self.ctl else { return Ok(()) };
        loop {
            match ctl.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true)?;
                    let chan = Channel::new(OwnedFd::from(stream));
                    let id = self.ctl_conns.insert(chan);
                    let token = TOKEN_CTL_BASE + id as u64;
                    epoll.add(
                        self.ctl_conns.get(id).expect("just inserted"),
                        EpollEvent::new(EpollFlags::EPOLLIN, token),
                    )?;
                    debug!(conn = id, "control connection");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Control connections speak the same typed message protocol as the
    /// children, restricted to the CTL_* requests.
    fn handle_control(&mut self, token: u64, epoll: &Epoll) -> Result<()> {
        let id = (token - TOKEN_CTL_BASE) as u32;
        let Some(chan) = self.ctl_conns.get_mut(id) else {
            return Ok(());
        };
        let closed = chan.fill().is_err();

        let mut drop_conn = closed;
        loop {
            let msg = match self.ctl_conns.get_mut(id) {
                None => break,
                Some(chan) => match chan.get() {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("control connection: {e}");
                        drop_conn = true;
                        break;
                    }
                },
            };
            match MsgType::from_raw(msg.hdr.kind) {
                Some(MsgType::CtlReload) => {
                    let file = config::get_string(&msg.data);
                    info!("reload requested over control socket");
                    self.reload(if file.is_empty() { None } else { Some(file) })?;
                }
                Some(MsgType::CtlReset) => {
                    check_len("reset", &msg, 4)?;
                    let level = u32::from_ne_bytes(msg.data[..4].try_into().unwrap());
                    self.reset_children(level)?;
                }
                Some(MsgType::CtlShutdown) => {
                    info!("shutdown requested over control socket");
                    self.shutdown();
                }
                other => {
                    warn!(?other, "unsupported control request");
                    drop_conn = true;
                    break;
                }
            }
        }

        if drop_conn {
            if let Some(chan) = self.ctl_conns.remove(id) {
                let _ = epoll.delete(&chan);
            }
        }
        Ok(())
    }
}

fn compose_role(peers: &mut [Peer], role: Role, kind: MsgType, data: &[u8]) -> Result<()> {
    for peer in peers.iter_mut().filter(|p| p.role == role) {
        peer.chan.compose(kind.into(), peer.instance, None, data)?;
    }
    Ok(())
}

fn compose_all(peers: &mut [Peer], kind: MsgType, data: &[u8]) -> Result<()> {
    for peer in peers.iter_mut() {
        peer.chan.compose(kind.into(), peer.instance, None, data)?;
    }
    Ok(())
}

/// The privileged bind. SO_REUSEADDR plus, where available, the freebind
/// option standing in for SO_BINDANY so relays may listen on addresses
/// not yet configured on an interface.
pub fn bindany(req: &BindReq) -> Result<OwnedFd> {
    let family = match req.addr {
        std::net::SocketAddr::V4(_) => AddressFamily::Inet,
        std::net::SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let ty = match req.transport {
        Transport::Tcp => SockType::Stream,
        Transport::Udp => SockType::Datagram,
    };
    let fd = socket(
        family,
        ty,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    let _ = setsockopt(&fd, sockopt::IpFreebind, &true);
    bind(fd.as_raw_fd(), &SockaddrStorage::from(req.addr))?;
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Header;
    use crate::privsep::Peer;

    fn test_parent(prefork: u32) -> (Parent, Vec<Channel>) {
        let mut peers = Vec::new();
        let mut remotes = Vec::new();
        let mut add = |role: Role, instance: u32| {
            let (local, remote) = Channel::pair().unwrap();
            peers.push(Peer {
                role,
                instance,
                pid: Pid::from_raw(0),
                chan: local,
            });
            remotes.push(remote);
        };
        add(Role::Pfe, 0);
        add(Role::Hce, 0);
        for i in 0..prefork {
            add(Role::Ca, i);
        }
        for i in 0..prefork {
            add(Role::Relay, i);
        }

        let cfg: Config = serde_json::from_str(&format!("{{ \"prefork\": {prefork} }}")).unwrap();
        let parent = Parent {
            cfg,
            conffile: PathBuf::from("/nonexistent/wardend.conf"),
            macros: vec![],
            peers,
            reload: 0,
            sigfd: None,
            ctl: None,
            ctl_conns: HandleMap::new(),
        };
        (parent, remotes)
    }

    fn drain(parent: &mut Parent, remotes: &mut [Channel]) -> Vec<Vec<u32>> {
        for peer in parent.peers.iter_mut() {
            peer.chan.flush_blocking().unwrap();
        }
        let mut kinds = Vec::new();
        for remote in remotes.iter_mut() {
            let mut got = Vec::new();
            while remote.fill().unwrap_or(0) > 0 {}
            while let Some(msg) = remote.get().unwrap() {
                got.push(msg.hdr.kind);
            }
            kinds.push(got);
        }
        kinds
    }

    #[test]
    fn configure_arms_counter_and_start_fires_once() {
        let (mut parent, mut remotes) = test_parent(2);
        parent.configure().unwrap();
        // 2 + 2 * prefork outstanding acknowledgements
        assert_eq!(parent.reload, 6);

        let kinds = drain(&mut parent, &mut remotes);
        for got in &kinds {
            assert_eq!(got.last(), Some(&u32::from(MsgType::CfgDone)));
        }

        // five acks leave the counter armed, nothing started yet
        for _ in 0..5 {
            parent.configure_done().unwrap();
        }
        assert_eq!(parent.reload, 1);
        let kinds = drain(&mut parent, &mut remotes);
        assert!(kinds.iter().all(|g| g.is_empty()));

        // the sixth drains it: exactly one CTL_START per child
        parent.configure_done().unwrap();
        assert_eq!(parent.reload, 0);
        let kinds = drain(&mut parent, &mut remotes);
        assert_eq!(kinds.len(), 6);
        for got in &kinds {
            assert_eq!(got, &vec![u32::from(MsgType::CtlStart)]);
        }

        // a stray ack after completion is logged, never resent
        parent.configure_done().unwrap();
        let kinds = drain(&mut parent, &mut remotes);
        assert!(kinds.iter().all(|g| g.is_empty()));
    }

    #[test]
    fn reload_in_progress_is_dropped() {
        let (mut parent, mut remotes) = test_parent(1);
        parent.configure().unwrap();
        let before = parent.reload;
        assert!(before > 0);

        // second reload while the counter is armed leaves it untouched
        parent.reload(None).unwrap();
        assert_eq!(parent.reload, before);
        drain(&mut parent, &mut remotes);
    }

    #[test]
    fn reload_with_bad_file_keeps_previous_config() {
        let (mut parent, _remotes) = test_parent(1);
        parent.cfg.opts = 42;
        parent.reload(Some("/nonexistent/other.conf".into())).unwrap();
        assert_eq!(parent.cfg.opts, 42);
        assert_eq!(parent.reload, 0);
    }

    #[test]
    fn bind_request_gets_descriptor_back() {
        let (mut parent, mut remotes) = test_parent(1);
        let relay_index = parent
            .peers
            .iter()
            .position(|p| p.role == Role::Relay)
            .unwrap();

        let req = BindReq {
            id: 9,
            addr: "127.0.0.1:0".parse().unwrap(),
            transport: Transport::Tcp,
        };
        let wire = crate::message::to_wire("bind", &req).unwrap();
        let msg = Message {
            hdr: Header {
                kind: MsgType::BindAny.into(),
                len: wire.len() as u32,
                peer: 0,
                pid: 0,
            },
            data: wire,
        };
        parent.handle_bindany(relay_index, msg).unwrap();
        parent.peers[relay_index].chan.flush_blocking().unwrap();

        let remote = &mut remotes[relay_index];
        remote.fill().unwrap();
        let ack = remote.get().unwrap().unwrap();
        assert_eq!(ack.hdr.kind, u32::from(MsgType::BindAny));
        assert_eq!(ack.data, 9u32.to_ne_bytes());
        assert!(remote.take_fd().is_some());
    }

    #[test]
    fn script_outside_config_is_fatal() {
        let (mut parent, _remotes) = test_parent(1);
        let req = ScriptReq {
            host: 1,
            path: "/bin/true".into(),
            retval: -1,
        };
        let wire = crate::message::to_wire("script", &req).unwrap();
        let msg = Message {
            hdr: Header {
                kind: MsgType::Script.into(),
                len: wire.len() as u32,
                peer: 0,
                pid: 0,
            },
            data: wire,
        };
        let hce_index = parent
            .peers
            .iter()
            .position(|p| p.role == Role::Hce)
            .unwrap();
        assert!(parent.handle_script(hce_index, msg).is_err());
    }

    #[test]
    fn unexpected_peer_message_is_fatal() {
        let (mut parent, _remotes) = test_parent(1);
        let msg = Message {
            hdr: Header {
                kind: u32::from(MsgType::CaPrivEnc),
                len: 0,
                peer: 0,
                pid: 0,
            },
            data: vec![],
        };
        assert!(parent.dispatch(0, msg).is_err());
    }
}
