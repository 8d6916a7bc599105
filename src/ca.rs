use anyhow::{bail, Context, Result};
use nix::sys::epoll::Epoll;
use openssl::pkey::Private;
use openssl::rsa::Rsa;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Message, MAX_PAYLOAD};
use crate::message::{check_len, CaKeyMsg, CfgSummary, KeyOp, MsgType};
use crate::privsep::{run_child, ChildCtx, Dispatcher, Flow};
use crate::registry::ObjectId;
use crate::rsae::padding_from_raw;

const CHAN_PARENT: usize = 0;
const CHAN_RELAY: usize = 1;

struct CaKey {
    id: ObjectId,
    rsa: Rsa<Private>,
}

/// The key custodian. Exclusively owns private keys and answers one
/// private-key operation at a time from its relay worker. Single-threaded;
/// the key registry is written once at start and only read afterwards.
pub struct Ca {
    instance: u32,
    prefork: u32,
    chans: Vec<Channel>,
    pending: Vec<CaKeyMsg>,
    keys: Vec<CaKey>,
}

pub fn run(ctx: ChildCtx) -> Result<()> {
    let relay = ctx.cross.context("ca started without a relay channel")?;
    let mut ca = Ca {
        instance: ctx.instance,
        prefork: ctx.prefork,
        chans: vec![ctx.parent, relay],
        pending: Vec::new(),
        keys: Vec::new(),
    };
    run_child(&mut ca)
}

impl Ca {
    /// Parse every PEM blob received during the config round into a key
    /// object, register it under its handle id, and scrub the blob.
    fn launch(&mut self) -> Result<()> {
        for mut entry in self.pending.drain(..) {
            let rsa = Rsa::private_key_from_pem(entry.pem.as_slice())
                .with_context(|| format!("key {}: bad PEM", entry.keyid))?;
            entry.pem.purge();
            debug!(key = entry.keyid, relay = entry.relay, bits = rsa.size() * 8, "registered private key");
            self.keys.push(CaKey {
                id: entry.keyid,
                rsa,
            });
        }
        info!(instance = self.instance, keys = self.keys.len(), "key custodian running");
        Ok(())
    }

    fn find_key(&self, id: ObjectId) -> Option<&Rsa<Private>> {
        self.keys.iter().find(|k| k.id == id).map(|k| &k.rsa)
    }

    fn reset(&mut self) {
        for mut entry in self.pending.drain(..) {
            entry.pem.purge();
        }
        self.keys.clear();
    }

    fn dispatch_parent(&mut self, msg: Message) -> Result<Flow> {
        let kind = MsgType::from_raw(msg.hdr.kind);
        match kind {
            Some(MsgType::CfgRelay) => {
                let entry: CaKeyMsg = crate::message::from_wire("ca relay config", &msg)?;
                self.pending.push(entry);
            }
            Some(MsgType::CfgDone) => {
                let summary = CfgSummary::decode(&msg)?;
                debug!(opts = summary.opts, flags = summary.flags, "config received");
                self.chans[CHAN_PARENT].compose(
                    MsgType::CfgDone.into(),
                    self.instance,
                    None,
                    &[],
                )?;
            }
            Some(MsgType::CtlStart) => {
                check_len("start", &msg, 0)?;
                self.launch()?;
            }
            Some(MsgType::CtlReset) => {
                check_len("reset", &msg, 4)?;
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

    /// Service one private-key operation. The relay worker is less
    /// privileged, so every inconsistency here is treated as an intrusion
    /// attempt and kills the process.
    fn dispatch_relay(&mut self, msg: Message) -> Result<Flow> {
        let kind = match MsgType::from_raw(msg.hdr.kind) {
            Some(k @ (MsgType::CaPrivEnc | MsgType::CaPrivDec)) => k,
            _ => bail!("unexpected message type {} from relay", msg.hdr.kind),
        };

        let op = KeyOp::decode(&msg.data)?;
        if op.requester >= self.prefork {
            bail!("invalid relay instance {} in key operation", op.requester);
        }
        check_len("key op", &msg, KeyOp::WIRE_LEN + op.flen as usize)?;
        let Some(rsa) = self.find_key(op.id) else {
            bail!("invalid key id {} in key operation", op.id);
        };
        // the output buffer must hold a full modulus, and the reply must
        // still fit in one message
        if (op.tlen as usize) < rsa.size() as usize
            || KeyOp::WIRE_LEN + op.tlen as usize > MAX_PAYLOAD
        {
            bail!("invalid output length {} in key operation", op.tlen);
        }

        let from = &msg.data[KeyOp::WIRE_LEN..];
        let mut to = vec![0u8; op.tlen as usize];
        // a failed operation is reported as a zero-length reply and only
        // fails the requesting session
        let tlen = match padding_from_raw(op.padding) {
            None => {
                warn!(padding = op.padding, "unsupported padding mode");
                0
            }
            Some(padding) => {
                let result = match kind {
                    MsgType::CaPrivEnc => rsa.private_encrypt(from, &mut to, padding),
                    MsgType::CaPrivDec => rsa.private_decrypt(from, &mut to, padding),
                    _ => unreachable!(),
                };
                match result {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(key = op.id, "key operation failed: {e}");
                        0
                    }
                }
            }
        };

        let reply = KeyOp {
            tlen: tlen as u32,
            ..op
        };
        self.chans[CHAN_RELAY].composev(
            kind.into(),
            op.requester,
            None,
            &[&reply.encode(), &to[..tlen]],
        )?;
        Ok(Flow::Continue)
    }
}

impl Dispatcher for Ca {
    fn title(&self) -> &'static str {
        "ca"
    }

    fn chans(&mut self) -> &mut [Channel] {
        &mut self.chans
    }

    fn dispatch(&mut self, src: usize, msg: Message, _epoll: &Epoll) -> Result<Flow> {
        match src {
            CHAN_PARENT => self.dispatch_parent(msg),
            CHAN_RELAY => self.dispatch_relay(msg),
            _ => bail!("message from unknown channel {src}"),
        }
    }
}
