use std::cell::RefCell;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::resource::{getrlimit, Resource};
use nix::sys::socket::{accept4, getpeername, listen, Backlog, SockFlag, SockaddrStorage};
use openssl::x509::X509;
use tracing::{debug, info, warn};

use crate::channel::{Channel, FlushState, Message, WireError};
use crate::fd_count;
use crate::kv::{Kv, KvTree};
use crate::message::{
    check_len, BindReq, CfgSummary, HostMsg, MsgType, ProtoMsg, RelayMsg, RuleAction, RuleMsg,
    TableMsg, Transport, BIND_ACK_LEN,
};
use crate::privsep::{ChildCtx, Flow, TOKEN_EXTRA};
use crate::registry::{Entity, HandleMap, IdMap, ObjectId};
use crate::rsae::{KeyHandle, PrivsepRsa};

const CHAN_PARENT: u64 = 0;
const CHAN_CA: u64 = 1;

/// Keep this many descriptors free for channels and logging; accepts are
/// refused inside the margin.
const FD_RESERVE: usize = 5;

pub struct RelayEntry {
    pub conf: RelayMsg,
    /// Index into the worker's listener table once bound.
    pub listener: Option<usize>,
    /// TLS key handle; private operations go through the custodian.
    pub key: Option<Rc<KeyHandle>>,
}

impl Entity for RelayEntry {
    fn id(&self) -> ObjectId {
        self.conf.id
    }
    fn name(&self) -> &str {
        &self.conf.name
    }
}

pub struct ProtoEntry {
    pub conf: ProtoMsg,
    /// Header rewrite rules, request and response side.
    pub request_rules: KvTree,
    pub response_rules: KvTree,
}

impl Entity for ProtoEntry {
    fn id(&self) -> ObjectId {
        self.conf.id
    }
    fn name(&self) -> &str {
        &self.conf.name
    }
}

pub struct BackendTable {
    pub conf: TableMsg,
    pub hosts: Vec<HostMsg>,
}

impl Entity for BackendTable {
    fn id(&self) -> ObjectId {
        self.conf.id
    }
    fn name(&self) -> &str {
        &self.conf.name
    }
}

#[derive(Debug)]
pub struct Session {
    pub relay: ObjectId,
    pub peer: Option<SockaddrStorage>,
}

struct Listener {
    fd: OwnedFd,
    relay: ObjectId,
    addr: std::net::SocketAddr,
    transport: Transport,
}

/// A pre-forked relay worker. Terminates client connections and owns the
/// per-session state; every private-key operation is delegated to the key
/// custodian of the same instance index over the dedicated channel.
pub struct RelayWorker {
    instance: u32,
    parent: Channel,
    ca: Rc<RefCell<Channel>>,
    rsae: PrivsepRsa,
    relays: IdMap<RelayEntry>,
    protos: IdMap<ProtoEntry>,
    tables: IdMap<BackendTable>,
    sessions: HandleMap<Session>,
    listeners: Vec<Listener>,
}

pub fn run(ctx: ChildCtx) -> Result<()> {
    let ca = Rc::new(RefCell::new(
        ctx.cross.context("relay started without a ca channel")?,
    ));
    let mut worker = RelayWorker {
        instance: ctx.instance,
        parent: ctx.parent,
        rsae: PrivsepRsa::new(ca.clone(), ctx.instance),
        ca,
        relays: IdMap::new(),
        protos: IdMap::new(),
        tables: IdMap::new(),
        sessions: HandleMap::new(),
        listeners: Vec::new(),
    };
    worker.event_loop()
}

impl RelayWorker {
    /// The worker's own loop. The CA channel cannot go through the shared
    /// child loop because the RSA shim shares it for synchronous calls.
    fn event_loop(&mut self) -> Result<()> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(
            &self.parent,
            EpollEvent::new(EpollFlags::EPOLLIN, CHAN_PARENT),
        )?;
        epoll.add(
            &*self.ca.borrow(),
            EpollEvent::new(EpollFlags::EPOLLIN, CHAN_CA),
        )?;

        let mut events = [EpollEvent::empty(); 16];
        loop {
            let n = match epoll.wait(&mut events, nix::sys::epoll::EpollTimeout::NONE) {
                Err(Errno::EINTR) => continue,
                other => other?,
            };

            for ev in &events[..n] {
                match ev.data() {
                    CHAN_PARENT => {
                        if ev.events().contains(EpollFlags::EPOLLOUT) {
                            if self.parent.flush()? == FlushState::Done {
                                crate::privsep::rearm(&epoll, &self.parent, CHAN_PARENT)?;
                            }
                        }
                        if ev
                            .events()
                            .intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP)
                        {
                            match self.parent.fill() {
                                Ok(_) => {}
                                Err(WireError::Closed) => {
                                    debug!("parent channel closed, exiting");
                                    return Ok(());
                                }
                                Err(e) => return Err(e.into()),
                            }
                            loop {
                                let msg = match self.parent.get()? {
                                    Some(msg) => msg,
                                    None => break,
                                };
                                if self.dispatch_parent(msg, &epoll)? == Flow::Quit {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    CHAN_CA => {
                        // the custodian speaks only in reply to the shim's
                        // synchronous requests; data here is a violation
                        let mut ca = self.ca.borrow_mut();
                        match ca.fill() {
                            Ok(0) => {}
                            Ok(_) => bail!("unsolicited message from key custodian"),
                            Err(WireError::Closed) => {
                                bail!("key custodian channel closed")
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    token if token >= TOKEN_EXTRA => {
                        self.accept_session((token - TOKEN_EXTRA) as usize)?;
                    }
                    token => bail!("unexpected epoll token {token}"),
                }
            }

            if self.parent.wants_write() && self.parent.flush()? == FlushState::Suspend {
                let mut ev =
                    EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT, CHAN_PARENT);
                epoll.modify(&self.parent, &mut ev)?;
            }
        }
    }

    fn dispatch_parent(&mut self, msg: Message, epoll: &Epoll) -> Result<Flow> {
        match MsgType::from_raw(msg.hdr.kind) {
            Some(MsgType::CfgTable) => {
                let conf: TableMsg = crate::message::from_wire("table config", &msg)?;
                self.tables.push(BackendTable {
                    conf,
                    hosts: Vec::new(),
                });
            }
            Some(MsgType::CfgHost) => {
                let host: HostMsg = crate::message::from_wire("host config", &msg)?;
                let Some(table) = self.tables.find_mut(host.table) else {
                    bail!("host {} references unknown table {}", host.id, host.table);
                };
                table.hosts.push(host);
            }
            Some(MsgType::CfgProto) => {
                let conf: ProtoMsg = crate::message::from_wire("protocol config", &msg)?;
                self.protos.push(ProtoEntry {
                    conf,
                    request_rules: KvTree::new(),
                    response_rules: KvTree::new(),
                });
            }
            Some(MsgType::CfgRule) => {
                let rule: RuleMsg = crate::message::from_wire("rule config", &msg)?;
                self.add_rule(rule)?;
            }
            Some(MsgType::CfgRelay) => {
                let conf: RelayMsg = crate::message::from_wire("relay config", &msg)?;
                let key = self.build_key_handle(&conf)?;
                self.relays.push(RelayEntry {
                    conf,
                    listener: None,
                    key,
                });
            }
            Some(MsgType::CfgDone) => {
                let _ = CfgSummary::decode(&msg)?;
                self.parent
                    .compose(MsgType::CfgDone.into(), self.instance, None, &[])?;
            }
            Some(MsgType::CtlStart) => {
                check_len("start", &msg, 0)?;
                self.launch()?;
            }
            Some(MsgType::CtlReset) => {
                check_len("reset", &msg, 4)?;
                debug!("resetting relay configuration");
                self.relays.clear();
                self.protos.clear();
                self.tables.clear();
            }
            Some(MsgType::CtlShutdown) => {
                check_len("shutdown", &msg, 0)?;
                return Ok(Flow::Quit);
            }
            Some(MsgType::BindAny) => {
                check_len("bind ack", &msg, BIND_ACK_LEN)?;
                let id = ObjectId::from_ne_bytes(msg.data[..4].try_into().unwrap());
                let fd = self
                    .parent
                    .take_fd()
                    .with_context(|| format!("relay {id}: bind request failed"))?;
                self.install_listener(id, fd, epoll)?;
            }
            _ => bail!("unexpected message type {} from parent", msg.hdr.kind),
        }
        Ok(Flow::Continue)
    }

    fn add_rule(&mut self, rule: RuleMsg) -> Result<()> {
        let Some(proto) = self.protos.find_mut(rule.proto) else {
            bail!("rule {} references unknown protocol {}", rule.id, rule.proto);
        };
        let tree = match rule.dir {
            crate::message::RuleDir::Request => &mut proto.request_rules,
            crate::message::RuleDir::Response => &mut proto.response_rules,
        };
        // Remove/Log rules carry no value by design
        let value = match rule.action {
            RuleAction::Remove | RuleAction::Log => None,
            RuleAction::Set | RuleAction::Append => rule.value,
        };
        tree.add(Kv::new(rule.key, value));
        Ok(())
    }

    fn build_key_handle(&self, conf: &RelayMsg) -> Result<Option<Rc<KeyHandle>>> {
        let (Some(keyid), Some(cert)) = (conf.tls_keyid, conf.tls_cert.as_deref()) else {
            return Ok(None);
        };
        let x509 = X509::from_pem(cert)
            .with_context(|| format!("relay {}: bad certificate", conf.name))?;
        let public = x509
            .public_key()
            .and_then(|k| k.rsa())
            .with_context(|| format!("relay {}: certificate has no RSA key", conf.name))?;
        debug!(relay = %conf.name, key = keyid, "tls key handle references custodian");
        Ok(Some(Rc::new(KeyHandle::remote(keyid, public))))
    }

    /// Request listening sockets from the parent for any relay not yet
    /// bound. Binding needs privilege this process dropped, so the parent
    /// does it and passes the descriptor back. Sockets bound before a
    /// reload are reused, matched by address.
    fn launch(&mut self) -> Result<()> {
        let mut requests = Vec::new();
        let listeners = &mut self.listeners;
        for relay in self.relays.iter_mut() {
            if relay.listener.is_some() {
                continue;
            }
            if let Some(index) = listeners
                .iter()
                .position(|l| l.addr == relay.conf.listen && l.transport == relay.conf.transport)
            {
                listeners[index].relay = relay.conf.id;
                relay.listener = Some(index);
                continue;
            }
            requests.push(BindReq {
                id: relay.conf.id,
                addr: relay.conf.listen,
                transport: relay.conf.transport,
            });
        }
        for req in &requests {
            let wire = crate::message::to_wire("bind request", req)?;
            self.parent
                .compose(MsgType::BindAny.into(), self.instance, None, &wire)?;
        }
        info!(
            instance = self.instance,
            relays = self.relays.len(),
            pending_binds = requests.len(),
            "relay worker running"
        );
        Ok(())
    }

    fn install_listener(&mut self, id: ObjectId, fd: OwnedFd, epoll: &Epoll) -> Result<()> {
        let Some(relay) = self.relays.find_mut(id) else {
            bail!("bind ack for unknown relay {id}");
        };
        let transport = relay.conf.transport;
        let addr = relay.conf.listen;
        if transport == Transport::Tcp {
            listen(&fd, Backlog::new(128)?)?;
        }
        let index = self.listeners.len();
        relay.listener = Some(index);
        if transport == Transport::Tcp {
            epoll.add(
                &fd,
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_EXTRA + index as u64),
            )?;
        }
        debug!(relay = id, listener = index, "listener installed");
        self.listeners.push(Listener {
            fd,
            relay: id,
            addr,
            transport,
        });
        Ok(())
    }

    /// Accept with a reserve: refuse new sessions when the descriptor
    /// budget is nearly exhausted so channels keep working.
    fn accept_reserve(&self, listener: BorrowedFd<'_>) -> Result<Option<OwnedFd>> {
        let (soft, _) = getrlimit(Resource::RLIMIT_NOFILE)?;
        if fd_count()? + FD_RESERVE >= soft as usize {
            warn!("descriptor reserve reached, refusing connection");
            return Ok(None);
        }
        match accept4(
            listener.as_raw_fd(),
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        ) {
            Ok(fd) => Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) })),
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn accept_session(&mut self, index: usize) -> Result<()> {
        let Some(listener) = self.listeners.get(index) else {
            bail!("event on unknown listener {index}");
        };
        let relay_id = listener.relay;
        let Some(stream) = self.accept_reserve(listener.fd.as_fd())? else {
            return Ok(());
        };

        let peer = getpeername::<SockaddrStorage>(stream.as_raw_fd()).ok();
        let id = self.sessions.insert(Session {
            relay: relay_id,
            peer,
        });
        debug!(session = id, relay = relay_id, "session accepted");

        // No stream engine is wired into this tree; account for the
        // session, then drop the connection.
        drop(stream);
        self.sessions.remove(id);
        Ok(())
    }

    /// The worker's RSA method table; TLS stacks sign through this.
    pub fn rsa_backend(&self) -> &PrivsepRsa {
        &self.rsae
    }
}
