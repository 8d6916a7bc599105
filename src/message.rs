use std::net::SocketAddr;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::channel::{Message, WireError};
use crate::registry::ObjectId;
use crate::secret::SecretBuf;

/// Message type codes. The numeric assignment is part of the wire protocol
/// and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    CfgTable = 1,
    CfgHost = 2,
    CfgRelay = 3,
    CfgProto = 4,
    CfgRule = 5,
    CfgRdr = 6,
    CfgDone = 7,
    CtlStart = 8,
    CtlReset = 9,
    CtlReload = 10,
    CtlShutdown = 11,
    BindAny = 12,
    CaPrivEnc = 13,
    CaPrivDec = 14,
    Script = 15,
    CfgRouter = 16,
}

impl MsgType {
    pub fn from_raw(raw: u32) -> Option<MsgType> {
        Some(match raw {
            1 => MsgType::CfgTable,
            2 => MsgType::CfgHost,
            3 => MsgType::CfgRelay,
            4 => MsgType::CfgProto,
            5 => MsgType::CfgRule,
            6 => MsgType::CfgRdr,
            7 => MsgType::CfgDone,
            8 => MsgType::CtlStart,
            9 => MsgType::CtlReset,
            10 => MsgType::CtlReload,
            11 => MsgType::CtlShutdown,
            12 => MsgType::BindAny,
            13 => MsgType::CaPrivEnc,
            14 => MsgType::CaPrivDec,
            15 => MsgType::Script,
            16 => MsgType::CfgRouter,
            _ => return None,
        })
    }
}

impl From<MsgType> for u32 {
    fn from(t: MsgType) -> u32 {
        t as u32
    }
}

/// Enforce an exact payload size. Headers come from a peer across a
/// privilege boundary; a mismatch is a protocol violation and the caller
/// terminates on it.
pub fn check_len(what: &'static str, msg: &Message, want: usize) -> Result<(), WireError> {
    if msg.data.len() != want {
        return Err(WireError::SizeMismatch {
            what,
            want,
            got: msg.data.len(),
        });
    }
    Ok(())
}

/// Private key operation, relay worker <-> key custodian. The fixed part
/// is encoded field by field; `flen` input bytes (request) or `tlen`
/// output bytes (reply) follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyOp {
    pub id: ObjectId,
    /// Relay instance the reply is owed to.
    pub requester: u32,
    pub flen: u32,
    /// Output capacity on request, actual output length on reply.
    pub tlen: u32,
    /// Padding mode, numeric per the crypto library.
    pub padding: i32,
}

impl KeyOp {
    pub const WIRE_LEN: usize = 20;

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.id.to_ne_bytes());
        out[4..8].copy_from_slice(&self.requester.to_ne_bytes());
        out[8..12].copy_from_slice(&self.flen.to_ne_bytes());
        out[12..16].copy_from_slice(&self.tlen.to_ne_bytes());
        out[16..20].copy_from_slice(&self.padding.to_ne_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<KeyOp, WireError> {
        if buf.len() < Self::WIRE_LEN {
            return Err(WireError::SizeMismatch {
                what: "key op",
                want: Self::WIRE_LEN,
                got: buf.len(),
            });
        }
        let u32_at = |o: usize| u32::from_ne_bytes(buf[o..o + 4].try_into().unwrap());
        Ok(KeyOp {
            id: u32_at(0),
            requester: u32_at(4),
            flen: u32_at(8),
            tlen: u32_at(12),
            padding: i32::from_ne_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

/// Summary flags carried by `CFG_DONE` from the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CfgSummary {
    pub opts: u32,
    pub flags: u32,
}

impl CfgSummary {
    pub const WIRE_LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.opts.to_ne_bytes());
        out[4..8].copy_from_slice(&self.flags.to_ne_bytes());
        out
    }

    pub fn decode(msg: &Message) -> Result<CfgSummary, WireError> {
        check_len("cfg summary", msg, Self::WIRE_LEN)?;
        Ok(CfgSummary {
            opts: u32::from_ne_bytes(msg.data[0..4].try_into().unwrap()),
            flags: u32::from_ne_bytes(msg.data[4..8].try_into().unwrap()),
        })
    }
}

/// Reset level carried by `CTL_RESET`.
pub const RESET_ALL: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Relay -> parent: bind this address with privilege and pass the socket
/// back. The ack payload is the redirected entity id, descriptor attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindReq {
    pub id: ObjectId,
    pub addr: SocketAddr,
    pub transport: Transport,
}

pub const BIND_ACK_LEN: usize = 4;

/// HCE -> parent: run a host check script; parent -> HCE: same record with
/// `retval` filled in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptReq {
    pub host: ObjectId,
    pub path: PathBuf,
    pub retval: i32,
}

// Config distribution records. One message per entity; variable-size
// fields make these serde-encoded rather than fixed-layout.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMsg {
    pub id: ObjectId,
    pub name: String,
    pub check_script: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMsg {
    pub id: ObjectId,
    pub table: ObjectId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdrMsg {
    pub id: ObjectId,
    pub name: String,
    pub table: ObjectId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterMsg {
    pub id: ObjectId,
    pub name: String,
    pub gateways: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtoMsg {
    pub id: ObjectId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleDir {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Set,
    Append,
    Remove,
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMsg {
    pub id: ObjectId,
    pub proto: ObjectId,
    pub dir: RuleDir,
    pub action: RuleAction,
    pub key: String,
    pub value: Option<String>,
}

/// Relay description for the dataplane workers. Certificates are public;
/// the private key never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMsg {
    pub id: ObjectId,
    pub name: String,
    pub listen: SocketAddr,
    pub transport: Transport,
    pub proto: Option<ObjectId>,
    pub tls_cert: Option<Vec<u8>>,
    /// Key handle id; the key itself lives in the custodian.
    pub tls_keyid: Option<ObjectId>,
}

/// Relay description for the key custodian: the key handle id plus the PEM
/// blob it must parse and own.
#[derive(Debug, Serialize, Deserialize)]
pub struct CaKeyMsg {
    pub relay: ObjectId,
    pub keyid: ObjectId,
    pub pem: SecretBuf,
}

pub fn to_wire<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>, WireError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| {
        WireError::Codec {
            what,
            detail: e.to_string(),
        }
    })
}

pub fn from_wire<T: DeserializeOwned>(what: &'static str, msg: &Message) -> Result<T, WireError> {
    let (value, used) = bincode::serde::decode_from_slice(&msg.data, bincode::config::standard())
        .map_err(|e| WireError::Codec {
        what,
        detail: e.to_string(),
    })?;
    if used != msg.data.len() {
        return Err(WireError::SizeMismatch {
            what,
            want: used,
            got: msg.data.len(),
        });
    }
    Ok(value)
}
