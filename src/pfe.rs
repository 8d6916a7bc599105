use anyhow::{bail, Result};
use nix::sys::epoll::Epoll;
use tracing::{debug, info};

use crate::channel::{Channel, Message};
use crate::message::{check_len, CfgSummary, HostMsg, MsgType, RdrMsg, RouterMsg, TableMsg};
use crate::privsep::{run_child, ChildCtx, Dispatcher, Flow};
use crate::registry::{Entity, IdMap, ObjectId};

pub struct PfTable {
    pub conf: TableMsg,
    pub hosts: Vec<HostMsg>,
}

impl Entity for PfTable {
    fn id(&self) -> ObjectId {
        self.conf.id
    }
    fn name(&self) -> &str {
        &self.conf.name
    }
}

pub struct PfRdr {
    pub conf: RdrMsg,
}

impl Entity for PfRdr {
    fn id(&self) -> ObjectId {
        self.conf.id
    }
    fn name(&self) -> &str {
        &self.conf.name
    }
}

pub struct PfRouter {
    pub conf: RouterMsg,
}

impl Entity for PfRouter {
    fn id(&self) -> ObjectId {
        self.conf.id
    }
    fn name(&self) -> &str {
        &self.conf.name
    }
}

/// The packet filter engine. Owns the redirection state derived from
/// tables and rdrs; the kernel-facing ruleset programming lives behind a
/// platform backend that is not part of this tree.
pub struct Pfe {
    instance: u32,
    tables: IdMap<PfTable>,
    rdrs: IdMap<PfRdr>,
    routers: IdMap<PfRouter>,
    chans: Vec<Channel>,
}

pub fn run(ctx: ChildCtx) -> Result<()> {
    let mut pfe = Pfe {
        instance: ctx.instance,
        tables: IdMap::new(),
        rdrs: IdMap::new(),
        routers: IdMap::new(),
        chans: vec![ctx.parent],
    };
    run_child(&mut pfe)
}

impl Pfe {
    fn reset(&mut self) {
        self.tables.clear();
        self.rdrs.clear();
        self.routers.clear();
    }

    fn dispatch_parent(&mut self, msg: Message) -> Result<Flow> {
        match MsgType::from_raw(msg.hdr.kind) {
            Some(MsgType::CfgTable) => {
                let conf: TableMsg = crate::message::from_wire("table config", &msg)?;
                self.tables.push(PfTable {
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
            Some(MsgType::CfgRdr) => {
                let conf: RdrMsg = crate::message::from_wire("rdr config", &msg)?;
                self.rdrs.push(PfRdr { conf });
            }
            Some(MsgType::CfgRouter) => {
                let conf: RouterMsg = crate::message::from_wire("router config", &msg)?;
                self.routers.push(PfRouter { conf });
            }
            Some(MsgType::CfgDone) => {
                let _ = CfgSummary::decode(&msg)?;
                self.chans[0].compose(MsgType::CfgDone.into(), self.instance, None, &[])?;
            }
            Some(MsgType::CtlStart) => {
                check_len("start", &msg, 0)?;
                info!(
                    tables = self.tables.len(),
                    rdrs = self.rdrs.len(),
                    routers = self.routers.len(),
                    "packet filter engine running"
                );
            }
            Some(MsgType::CtlReset) => {
                check_len("reset", &msg, 4)?;
                debug!("resetting packet filter state");
                self.reset();
            }
            Some(MsgType::CtlShutdown) => {
                check_len("shutdown", &msg, 0)?;
                return Ok(Flow::Quit);
            }
            _ => bail!("unexpected message type {} from parent", msg.hdr.kind),
        }
        Ok(Flow::Continue)
    }
}

impl Dispatcher for Pfe {
    fn title(&self) -> &'static str {
        "pfe"
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

    fn test_pfe() -> (Pfe, Channel) {
        let (local, remote) = Channel::pair().unwrap();
        (
            Pfe {
                instance: 0,
                tables: IdMap::new(),
                rdrs: IdMap::new(),
                routers: IdMap::new(),
                chans: vec![local],
            },
            remote,
        )
    }

    #[test]
    fn config_builds_registries_and_acks() {
        let (mut pfe, mut parent) = test_pfe();

        pfe.dispatch_parent(msg(
            MsgType::CfgTable,
            &TableMsg {
                id: 1,
                name: "webhosts".into(),
                check_script: None,
            },
        ))
        .unwrap();
        pfe.dispatch_parent(msg(
            MsgType::CfgHost,
            &HostMsg {
                id: 2,
                table: 1,
                name: "10.0.0.1".into(),
            },
        ))
        .unwrap();
        pfe.dispatch_parent(msg(
            MsgType::CfgRdr,
            &RdrMsg {
                id: 3,
                name: "web".into(),
                table: 1,
            },
        ))
        .unwrap();

        assert_eq!(pfe.tables.len(), 1);
        assert_eq!(pfe.tables.find(1).unwrap().hosts.len(), 1);
        assert_eq!(pfe.rdrs.by_name("web").unwrap().conf.table, 1);

        let done = Message {
            hdr: Header {
                kind: MsgType::CfgDone.into(),
                len: CfgSummary::WIRE_LEN as u32,
                peer: 0,
                pid: 0,
            },
            data: CfgSummary::default().encode().to_vec(),
        };
        pfe.dispatch_parent(done).unwrap();
        pfe.chans[0].flush().unwrap();

        parent.fill().unwrap();
        let ack = parent.get().unwrap().unwrap();
        assert_eq!(ack.hdr.kind, u32::from(MsgType::CfgDone));
    }

    #[test]
    fn host_for_unknown_table_is_fatal() {
        let (mut pfe, _parent) = test_pfe();
        let err = pfe
            .dispatch_parent(msg(
                MsgType::CfgHost,
                &HostMsg {
                    id: 2,
                    table: 42,
                    name: "10.0.0.1".into(),
                },
            ))
            .unwrap_err();
        assert!(err.to_string().contains("unknown table"));
    }

    #[test]
    fn reset_clears_state() {
        let (mut pfe, _parent) = test_pfe();
        pfe.dispatch_parent(msg(
            MsgType::CfgTable,
            &TableMsg {
                id: 1,
                name: "t".into(),
                check_script: None,
            },
        ))
        .unwrap();
        let reset = Message {
            hdr: Header {
                kind: MsgType::CtlReset.into(),
                len: 4,
                peer: 0,
                pid: 0,
            },
            data: crate::message::RESET_ALL.to_ne_bytes().to_vec(),
        };
        pfe.dispatch_parent(reset).unwrap();
        assert!(pfe.tables.is_empty());
    }
}
