use anyhow::{bail, Result};
use nix::sys::epoll::{Epoll, EpollTimeout};
use tracing::{debug, info, warn};

use crate::channel::{Channel, Message};
use crate::message::{check_len, CfgSummary, HostMsg, MsgType, ScriptReq, TableMsg};
use crate::privsep::{run_child, ChildCtx, Dispatcher, Flow};
use crate::registry::{Entity, IdMap, ObjectId};

/// Interval between check rounds, milliseconds.
const CHECK_INTERVAL_MS: u16 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Unknown,
    Up,
    Down,
}

pub struct CheckedHost {
    pub conf: HostMsg,
    pub state: HostState,
}

pub struct CheckedTable {
    pub conf: TableMsg,
    pub hosts: Vec<CheckedHost>,
}

impl Entity for CheckedTable {
    fn id(&self) -> ObjectId {
        self.conf.id
    }
    fn name(&self) -> &str {
        &self.conf.name
    }
}

/// The health check engine. Probing of backends is delegated to check
/// scripts; only the parent may exec, so each check is a SCRIPT round trip
/// over the parent channel.
pub struct Hce {
    instance: u32,
    tables: IdMap<CheckedTable>,
    chans: Vec<Channel>,
    started: bool,
}

pub fn run(ctx: ChildCtx) -> Result<()> {
    let mut hce = Hce {
        instance: ctx.instance,
        tables: IdMap::new(),
        chans: vec![ctx.parent],
        started: false,
    };
    run_child(&mut hce)
}

impl Hce {
    fn reset(&mut self) {
        self.tables.clear();
        self.started = false;
    }

    /// Ask the parent to run the check script of every scripted host.
    fn schedule_checks(&mut self) -> Result<()> {
        let mut requests = Vec::new();
        for table in self.tables.iter() {
            let Some(script) = &table.conf.check_script else {
                continue;
            };
            for host in &table.hosts {
                requests.push(ScriptReq {
                    host: host.conf.id,
                    path: script.clone(),
                    retval: -1,
                });
            }
        }
        for req in requests {
            let wire = crate::message::to_wire("script", &req)?;
            self.chans[0].compose(MsgType::Script.into(), self.instance, None, &wire)?;
        }
        Ok(())
    }

    fn record_result(&mut self, reply: ScriptReq) {
        for table in self.tables.iter_mut() {
            for host in &mut table.hosts {
                if host.conf.id != reply.host {
                    continue;
                }
                let state = if reply.retval == 0 {
                    HostState::Up
                } else {
                    HostState::Down
                };
                if state != host.state {
                    info!(
                        host = %host.conf.name,
                        up = state == HostState::Up,
                        "host state changed"
                    );
                }
                host.state = state;
                return;
            }
        }
        warn!(host = reply.host, "check result for unknown host");
    }

    fn dispatch_parent(&mut self, msg: Message) -> Result<Flow> {
        match MsgType::from_raw(msg.hdr.kind) {
            Some(MsgType::CfgTable) => {
                let conf: TableMsg = crate::message::from_wire("table config", &msg)?;
                self.tables.push(CheckedTable {
                    conf,
                    hosts: Vec::new(),
                });
            }
            Some(MsgType::CfgHost) => {
                let conf: HostMsg = crate::message::from_wire("host config", &msg)?;
                let Some(table) = self.tables.find_mut(conf.table) else {
                    bail!("host {} references unknown table {}", conf.id, conf.table);
                };
                table.hosts.push(CheckedHost {
                    conf,
                    state: HostState::Unknown,
                });
            }
            Some(MsgType::CfgDone) => {
                let _ = CfgSummary::decode(&msg)?;
                self.chans[0].compose(MsgType::CfgDone.into(), self.instance, None, &[])?;
            }
            Some(MsgType::CtlStart) => {
                check_len("start", &msg, 0)?;
                self.started = true;
                info!(tables = self.tables.len(), "health check engine running");
                self.schedule_checks()?;
            }
            Some(MsgType::CtlReset) => {
                check_len("reset", &msg, 4)?;
                debug!("resetting health check state");
                self.reset();
            }
            Some(MsgType::CtlShutdown) => {
                check_len("shutdown", &msg, 0)?;
                return Ok(Flow::Quit);
            }
            Some(MsgType::Script) => {
                let reply: ScriptReq = crate::message::from_wire("script result", &msg)?;
                self.record_result(reply);
            }
            _ => bail!("unexpected message type {} from parent", msg.hdr.kind),
        }
        Ok(Flow::Continue)
    }
}

impl Dispatcher for Hce {
    fn title(&self) -> &'static str {
        "hce"
    }

    fn chans(&mut self) -> &mut [Channel] {
        &mut self.chans
    }

    fn dispatch(&mut self, src: usize, msg: Message, _epoll: &Epoll) -> Result<Flow> {
        match src {
            0 => self.dispatch_parent(msg),
            _ => bail!("message from unknown channel {src}"),
        }
    }

    fn timeout(&self) -> EpollTimeout {
        EpollTimeout::from(CHECK_INTERVAL_MS)
    }

    fn tick(&mut self) -> Result<()> {
        if self.started {
            self.schedule_checks()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Header;
    use crate::message::to_wire;

    fn msg<T: serde::Serialize>(kind: MsgType, value: &T) -> Message {
        let data = to_wire("test", value).unwrap();
        Message {
            hdr: Header {
                kind: kind.into(),
                len: data.len() as u32,
                peer: 0,
                pid: 0,
            },
            data,
        }
    }

    fn test_hce() -> (Hce, Channel) {
        let (local, remote) = Channel::pair().unwrap();
        let mut hce = Hce {
            instance: 0,
            tables: IdMap::new(),
            chans: vec![local],
            started: false,
        };
        hce.dispatch_parent(msg(
            MsgType::CfgTable,
            &TableMsg {
                id: 1,
                name: "webhosts".into(),
                check_script: Some("/usr/local/bin/check".into()),
            },
        ))
        .unwrap();
        hce.dispatch_parent(msg(
            MsgType::CfgHost,
            &HostMsg {
                id: 2,
                table: 1,
                name: "web1".into(),
            },
        ))
        .unwrap();
        (hce, remote)
    }

    #[test]
    fn start_schedules_script_checks() {
        let (mut hce, mut parent) = test_hce();
        let start = Message {
            hdr: Header {
                kind: MsgType::CtlStart.into(),
                len: 0,
                peer: 0,
                pid: 0,
            },
            data: vec![],
        };
        hce.dispatch_parent(start).unwrap();
        hce.chans[0].flush().unwrap();

        parent.fill().unwrap();
        let req = parent.get().unwrap().unwrap();
        assert_eq!(req.hdr.kind, u32::from(MsgType::Script));
        let script: ScriptReq = crate::message::from_wire("script", &req).unwrap();
        assert_eq!(script.host, 2);
        assert_eq!(script.path, std::path::PathBuf::from("/usr/local/bin/check"));
    }

    #[test]
    fn script_result_updates_host_state() {
        let (mut hce, _parent) = test_hce();
        assert_eq!(hce.tables.find(1).unwrap().hosts[0].state, HostState::Unknown);

        hce.dispatch_parent(msg(
            MsgType::Script,
            &ScriptReq {
                host: 2,
                path: "/usr/local/bin/check".into(),
                retval: 0,
            },
        ))
        .unwrap();
        assert_eq!(hce.tables.find(1).unwrap().hosts[0].state, HostState::Up);

        hce.dispatch_parent(msg(
            MsgType::Script,
            &ScriptReq {
                host: 2,
                path: "/usr/local/bin/check".into(),
                retval: 1,
            },
        ))
        .unwrap();
        assert_eq!(hce.tables.find(1).unwrap().hosts[0].state, HostState::Down);
    }

    #[test]
    fn tick_is_quiet_before_start() {
        let (mut hce, mut parent) = test_hce();
        hce.tick().unwrap();
        hce.chans[0].flush().unwrap();
        parent.fill().unwrap_or(0);
        assert!(parent.get().unwrap().is_none());
    }
}
