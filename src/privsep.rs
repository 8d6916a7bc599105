use std::ffi::CString;
use std::os::fd::OwnedFd;

use anyhow::{Context, Result};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{fork, setgroups, setresgid, setresuid, ForkResult, Pid, Uid, User};
use tracing::{debug, error, info};

use crate::channel::{Channel, FlushState, Message, WireError};
use crate::config::Config;

/// Logical process types. Relay and CA are pre-forked per instance; the
/// others run a single instance each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Parent,
    Pfe,
    Hce,
    Ca,
    Relay,
}

impl Role {
    pub fn title(self) -> &'static str {
        match self {
            Role::Parent => "parent",
            Role::Pfe => "pfe",
            Role::Hce => "hce",
            Role::Ca => "ca",
            Role::Relay => "relay",
        }
    }
}

/// Parent-side descriptor of a running child.
#[derive(Debug)]
pub struct Peer {
    pub role: Role,
    pub instance: u32,
    pub pid: Pid,
    pub chan: Channel,
}

/// Everything a freshly forked child keeps: its channel to the parent and,
/// for relay/CA instances, the dedicated cross channel to its counterpart
/// of the same index.
pub struct ChildCtx {
    pub instance: u32,
    pub prefork: u32,
    pub parent: Channel,
    pub cross: Option<Channel>,
}

/// Fork the full child set. All channel pairs are created up front so that
/// the per-index relay<->CA links can be handed to both sides; each child
/// then keeps only the endpoints meant for it and closes everything else
/// before entering its event loop.
///
/// Never returns in the children.
pub fn spawn_children(cfg: &Config, user: &User) -> Result<Vec<Peer>> {
    let prefork = cfg.prefork;

    let mut plan: Vec<(Role, u32)> = vec![(Role::Pfe, 0), (Role::Hce, 0)];
    for i in 0..prefork {
        plan.push((Role::Ca, i));
    }
    for i in 0..prefork {
        plan.push((Role::Relay, i));
    }

    struct Planned {
        role: Role,
        instance: u32,
        parent_end: Option<OwnedFd>,
        child_end: Option<OwnedFd>,
    }

    let duplex = || -> Result<(OwnedFd, OwnedFd)> {
        Ok(socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )?)
    };

    let mut planned = Vec::with_capacity(plan.len());
    for (role, instance) in plan {
        let (a, b) = duplex()?;
        planned.push(Planned {
            role,
            instance,
            parent_end: Some(a),
            child_end: Some(b),
        });
    }

    // relay i <-> ca i
    let mut cross: Vec<(Option<OwnedFd>, Option<OwnedFd>)> = Vec::with_capacity(prefork as usize);
    for _ in 0..prefork {
        let (relay_end, ca_end) = duplex()?;
        cross.push((Some(relay_end), Some(ca_end)));
    }

    let mut peers: Vec<Peer> = Vec::with_capacity(planned.len());
    for idx in 0..planned.len() {
        let role = planned[idx].role;
        let instance = planned[idx].instance;

        // single-threaded here, fork is safe
        match unsafe { fork() }.context("fork")? {
            ForkResult::Parent { child } => {
                let parent_end = planned[idx].parent_end.take().expect("parent end");
                drop(planned[idx].child_end.take());
                peers.push(Peer {
                    role,
                    instance,
                    pid: child,
                    chan: Channel::new(parent_end),
                });
            }
            ForkResult::Child => {
                let my_end = planned[idx].child_end.take().expect("child end");
                let my_cross = match role {
                    Role::Relay => cross[instance as usize].0.take(),
                    Role::Ca => cross[instance as usize].1.take(),
                    _ => None,
                };
                // need-to-know: close every other endpoint we inherited
                drop(planned);
                drop(cross);
                drop(peers);

                let ctx = ChildCtx {
                    instance,
                    prefork,
                    parent: Channel::new(my_end),
                    cross: my_cross.map(Channel::new),
                };
                run_role(role, ctx, user);
            }
        }
    }

    for peer in &peers {
        debug!(role = peer.role.title(), instance = peer.instance, pid = %peer.pid, "forked child");
    }
    Ok(peers)
}

fn run_role(role: Role, ctx: ChildCtx, user: &User) -> ! {
    set_title(role, ctx.instance);
    if let Err(e) = drop_privileges(user) {
        error!("{}: failed to drop privileges: {e:#}", role.title());
        std::process::exit(1);
    }

    let result = match role {
        Role::Pfe => crate::pfe::run(ctx),
        Role::Hce => crate::hce::run(ctx),
        Role::Ca => crate::ca::run(ctx),
        Role::Relay => crate::relay::run(ctx),
        Role::Parent => unreachable!("parent does not run as a child"),
    };
    match result {
        Ok(()) => {
            info!("{} exiting", role.title());
            std::process::exit(0);
        }
        Err(e) => {
            error!("{} terminating: {e:#}", role.title());
            std::process::exit(1);
        }
    }
}

fn set_title(role: Role, instance: u32) {
    let title = match role {
        Role::Ca | Role::Relay => format!("warden: {} {}", role.title(), instance),
        _ => format!("warden: {}", role.title()),
    };
    if let Ok(name) = CString::new(title) {
        let _ = nix::sys::prctl::set_name(&name);
    }
}

/// Switch to the unprivileged account. A no-op for non-root invocations
/// (config check mode, tests).
pub fn drop_privileges(user: &User) -> Result<()> {
    if !Uid::effective().is_root() {
        debug!("not root, keeping current credentials");
        return Ok(());
    }
    setgroups(&[user.gid]).context("setgroups")?;
    setresgid(user.gid, user.gid, user.gid).context("setresgid")?;
    setresuid(user.uid, user.uid, user.uid).context("setresuid")?;
    Ok(())
}

/// Raise the file descriptor limit to the hard maximum; relays burn two
/// descriptors per proxied session.
pub fn socket_rlimit() -> Result<()> {
    let (_, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    debug!(max_open_files = hard, "raising descriptor limit");
    setrlimit(Resource::RLIMIT_NOFILE, hard, hard)?;
    Ok(())
}

/// Dispatch outcome: keep looping or leave the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// First epoll token available for per-role extras (listening sockets);
/// everything below indexes into [`Dispatcher::chans`].
pub const TOKEN_EXTRA: u64 = 1 << 16;

/// A child process body: a set of channels plus a message handler. The
/// shared loop drives readiness, framing, ordered delivery and write
/// resumption; roles only see complete typed messages.
pub trait Dispatcher {
    fn title(&self) -> &'static str;
    fn chans(&mut self) -> &mut [Channel];
    fn dispatch(&mut self, src: usize, msg: Message, epoll: &Epoll) -> Result<Flow>;
    /// Readiness on a non-channel fd registered with token >= TOKEN_EXTRA.
    fn ready(&mut self, _token: u64, _epoll: &Epoll) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    /// Poll timeout; [`Dispatcher::tick`] runs when it expires.
    fn timeout(&self) -> EpollTimeout {
        EpollTimeout::NONE
    }
    fn tick(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Re-register a channel for reads, plus writes while its queue is
/// non-empty.
pub fn rearm(epoll: &Epoll, chan: &Channel, token: u64) -> Result<(), WireError> {
    let mut flags = EpollFlags::EPOLLIN;
    if chan.wants_write() {
        flags |= EpollFlags::EPOLLOUT;
    }
    epoll
        .modify(chan, &mut EpollEvent::new(flags, token))
        .map_err(WireError::from)?;
    Ok(())
}

/// Run a child's event loop until the dispatcher quits or the channel to
/// the parent closes. Handlers run to completion; all I/O is nonblocking.
pub fn run_child<D: Dispatcher>(d: &mut D) -> Result<()> {
    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
    for (i, chan) in d.chans().iter().enumerate() {
        epoll.add(chan, EpollEvent::new(EpollFlags::EPOLLIN, i as u64))?;
    }

    let mut events = [EpollEvent::empty(); 16];
    loop {
        let n = match epoll.wait(&mut events, d.timeout()) {
            Err(nix::errno::Errno::EINTR) => continue,
            other => other?,
        };
        if n == 0 {
            d.tick()?;
            continue;
        }

        for ev in &events[..n] {
            let token = ev.data();
            if token >= TOKEN_EXTRA {
                if d.ready(token, &epoll)? == Flow::Quit {
                    return Ok(());
                }
                continue;
            }
            let i = token as usize;

            if ev.events().contains(EpollFlags::EPOLLOUT) {
                let state = d.chans()[i].flush()?;
                if state == FlushState::Done {
                    rearm(&epoll, &d.chans()[i], token)?;
                }
            }

            if ev
                .events()
                .intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP)
            {
                match d.chans()[i].fill() {
                    Ok(_) => {}
                    Err(WireError::Closed) => {
                        debug!("{}: channel {} closed, leaving event loop", d.title(), i);
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
                loop {
                    let msg = match d.chans()[i].get()? {
                        Some(msg) => msg,
                        None => break,
                    };
                    if d.dispatch(i, msg, &epoll)? == Flow::Quit {
                        return Ok(());
                    }
                }
            }
        }

        // push out queued replies; suspended writes resume via EPOLLOUT
        for i in 0..d.chans().len() {
            if d.chans()[i].wants_write() {
                let state = d.chans()[i].flush()?;
                if state == FlushState::Suspend {
                    let mut ev =
                        EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT, i as u64);
                    epoll.modify(&d.chans()[i], &mut ev)?;
                }
            }
        }
    }
}
