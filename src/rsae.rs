use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use openssl::bn::{BigNum, BigNumContext};
use openssl::pkey::{Private, Public};
use openssl::rsa::{Padding, Rsa};
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::message::{check_len, KeyOp, MsgType};
use crate::registry::ObjectId;

/// Numeric padding modes as carried on the wire.
pub const PADDING_PKCS1: i32 = 1;
pub const PADDING_NONE: i32 = 3;

pub fn padding_from_raw(raw: i32) -> Option<Padding> {
    match raw {
        PADDING_PKCS1 => Some(Padding::PKCS1),
        PADDING_NONE => Some(Padding::NONE),
        _ => None,
    }
}

/// An RSA key as seen by a relay worker. The custodian-held keys carry
/// their handle id; ephemeral or test keys carry the private half locally.
pub struct KeyHandle {
    /// Side-channel tag: present means "ask the custodian".
    pub id: Option<ObjectId>,
    pub public: Rsa<Public>,
    pub local: Option<Rsa<Private>>,
}

impl KeyHandle {
    /// Custodian-backed handle built from public material only.
    pub fn remote(id: ObjectId, public: Rsa<Public>) -> Self {
        Self {
            id: Some(id),
            public,
            local: None,
        }
    }

    /// Local handle around a full keypair.
    pub fn local(key: Rsa<Private>) -> Result<Self> {
        let public = Rsa::from_public_components(key.n().to_owned()?, key.e().to_owned()?)?;
        Ok(Self {
            id: None,
            public,
            local: Some(key),
        })
    }

    /// Modulus size in bytes; also the output capacity of any private op.
    pub fn size(&self) -> usize {
        self.public.size() as usize
    }
}

/// The primitive method slots a TLS stack dispatches RSA operations to.
/// Public-half operations never involve sensitive material; the private
/// ones are the privilege boundary.
pub trait RsaBackend {
    fn public_encrypt(&self, key: &KeyHandle, from: &[u8], to: &mut [u8], padding: i32)
        -> Result<usize>;
    fn public_decrypt(&self, key: &KeyHandle, from: &[u8], to: &mut [u8], padding: i32)
        -> Result<usize>;
    fn private_encrypt(
        &self,
        key: &KeyHandle,
        from: &[u8],
        to: &mut [u8],
        padding: i32,
    ) -> Result<usize>;
    fn private_decrypt(
        &self,
        key: &KeyHandle,
        from: &[u8],
        to: &mut [u8],
        padding: i32,
    ) -> Result<usize>;
    /// r = i^d mod n with the handle's private exponent.
    fn mod_exp(&self, key: &KeyHandle, i: &BigNum, r: &mut BigNum) -> Result<()>;
    /// Generic r = a^p mod m.
    fn bn_mod_exp(&self, r: &mut BigNum, a: &BigNum, p: &BigNum, m: &BigNum) -> Result<()>;
    fn keygen(&self, bits: u32) -> Result<Rsa<Private>>;
    fn init(&self, _key: &KeyHandle) -> Result<()> {
        Ok(())
    }
    fn finish(&self, _key: &KeyHandle) -> Result<()> {
        Ok(())
    }
}

/// Direct implementation of all slots against the crypto library.
pub struct LocalRsa;

impl LocalRsa {
    fn need_padding(raw: i32) -> Result<Padding> {
        padding_from_raw(raw).ok_or_else(|| anyhow!("unsupported padding mode {raw}"))
    }

    fn need_private<'a>(key: &'a KeyHandle) -> Result<&'a Rsa<Private>> {
        key.local
            .as_ref()
            .ok_or_else(|| anyhow!("no private key material for local operation"))
    }
}

impl RsaBackend for LocalRsa {
    fn public_encrypt(
        &self,
        key: &KeyHandle,
        from: &[u8],
        to: &mut [u8],
        padding: i32,
    ) -> Result<usize> {
        Ok(key.public.public_encrypt(from, to, Self::need_padding(padding)?)?)
    }

    fn public_decrypt(
        &self,
        key: &KeyHandle,
        from: &[u8],
        to: &mut [u8],
        padding: i32,
    ) -> Result<usize> {
        Ok(key.public.public_decrypt(from, to, Self::need_padding(padding)?)?)
    }

    fn private_encrypt(
        &self,
        key: &KeyHandle,
        from: &[u8],
        to: &mut [u8],
        padding: i32,
    ) -> Result<usize> {
        Ok(Self::need_private(key)?.private_encrypt(from, to, Self::need_padding(padding)?)?)
    }

    fn private_decrypt(
        &self,
        key: &KeyHandle,
        from: &[u8],
        to: &mut [u8],
        padding: i32,
    ) -> Result<usize> {
        Ok(Self::need_private(key)?.private_decrypt(from, to, Self::need_padding(padding)?)?)
    }

    fn mod_exp(&self, key: &KeyHandle, i: &BigNum, r: &mut BigNum) -> Result<()> {
        let private = Self::need_private(key)?;
        let mut ctx = BigNumContext::new()?;
        r.mod_exp(i, private.d(), private.n(), &mut ctx)?;
        Ok(())
    }

    fn bn_mod_exp(&self, r: &mut BigNum, a: &BigNum, p: &BigNum, m: &BigNum) -> Result<()> {
        let mut ctx = BigNumContext::new()?;
        r.mod_exp(a, p, m, &mut ctx)?;
        Ok(())
    }

    fn keygen(&self, bits: u32) -> Result<Rsa<Private>> {
        Ok(Rsa::generate(bits)?)
    }
}

/// Privilege-separated backend for relay workers. Private operations on a
/// tagged key turn into a synchronous request to the key custodian over
/// the worker's dedicated channel; everything else is delegated to
/// [`LocalRsa`].
///
/// The request blocks the worker mid-handshake because the TLS stack's
/// method interface cannot suspend and resume; worst case is the wall time
/// of one RSA operation in the custodian, which is local and trusted.
pub struct PrivsepRsa {
    chan: Rc<RefCell<Channel>>,
    instance: u32,
    fallback: LocalRsa,
}

impl PrivsepRsa {
    pub fn new(chan: Rc<RefCell<Channel>>, instance: u32) -> Self {
        Self {
            chan,
            instance,
            fallback: LocalRsa,
        }
    }

    fn key_op(
        &self,
        cmd: MsgType,
        id: ObjectId,
        key: &KeyHandle,
        from: &[u8],
        to: &mut [u8],
        padding: i32,
    ) -> Result<usize> {
        let op = KeyOp {
            id,
            requester: self.instance,
            flen: from.len() as u32,
            tlen: key.size() as u32,
            padding,
        };
        trace!(key = id, ?cmd, flen = op.flen, "key operation to custodian");

        let mut chan = self.chan.borrow_mut();
        chan.composev(cmd.into(), self.instance, None, &[&op.encode(), from])?;
        chan.flush_blocking()?;

        // The custodian only ever sends replies, so the next message must
        // answer this request; anything else is a protocol violation.
        let msg = chan.recv_blocking()?;
        if msg.hdr.kind != u32::from(cmd) {
            bail!(
                "unexpected message type {} in key operation reply",
                msg.hdr.kind
            );
        }
        let reply = KeyOp::decode(&msg.data)?;
        check_len("key op reply", &msg, KeyOp::WIRE_LEN + reply.tlen as usize)?;

        let tlen = reply.tlen as usize;
        if tlen > 0 {
            if tlen > to.len() {
                bail!("key operation reply of {tlen} bytes overflows caller buffer");
            }
            to[..tlen].copy_from_slice(&msg.data[KeyOp::WIRE_LEN..]);
        } else {
            debug!(key = id, "custodian reported failed key operation");
        }
        Ok(tlen)
    }
}

impl RsaBackend for PrivsepRsa {
    fn public_encrypt(
        &self,
        key: &KeyHandle,
        from: &[u8],
        to: &mut [u8],
        padding: i32,
    ) -> Result<usize> {
        self.fallback.public_encrypt(key, from, to, padding)
    }

    fn public_decrypt(
        &self,
        key: &KeyHandle,
        from: &[u8],
        to: &mut [u8],
        padding: i32,
    ) -> Result<usize> {
        self.fallback.public_decrypt(key, from, to, padding)
    }

    fn private_encrypt(
        &self,
        key: &KeyHandle,
        from: &[u8],
        to: &mut [u8],
        padding: i32,
    ) -> Result<usize> {
        match key.id {
            Some(id) => self.key_op(MsgType::CaPrivEnc, id, key, from, to, padding),
            None => self.fallback.private_encrypt(key, from, to, padding),
        }
    }

    fn private_decrypt(
        &self,
        key: &KeyHandle,
        from: &[u8],
        to: &mut [u8],
        padding: i32,
    ) -> Result<usize> {
        match key.id {
            Some(id) => self.key_op(MsgType::CaPrivDec, id, key, from, to, padding),
            None => self.fallback.private_decrypt(key, from, to, padding),
        }
    }

    fn mod_exp(&self, key: &KeyHandle, i: &BigNum, r: &mut BigNum) -> Result<()> {
        self.fallback.mod_exp(key, i, r)
    }

    fn bn_mod_exp(&self, r: &mut BigNum, a: &BigNum, p: &BigNum, m: &BigNum) -> Result<()> {
        self.fallback.bn_mod_exp(r, a, p, m)
    }

    fn keygen(&self, bits: u32) -> Result<Rsa<Private>> {
        self.fallback.keygen(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Rsa<Private> {
        Rsa::generate(2048).unwrap()
    }

    #[test]
    fn local_sign_verifies_with_public_half() {
        let backend = LocalRsa;
        let key = KeyHandle::local(test_key()).unwrap();

        let input: Vec<u8> = (1..=32).collect();
        let mut sig = vec![0u8; key.size()];
        let n = backend
            .private_encrypt(&key, &input, &mut sig, PADDING_PKCS1)
            .unwrap();
        assert_eq!(n, key.size());

        let mut out = vec![0u8; key.size()];
        let m = backend
            .public_decrypt(&key, &sig[..n], &mut out, PADDING_PKCS1)
            .unwrap();
        assert_eq!(&out[..m], &input[..]);
    }

    #[test]
    fn local_private_ops_need_material() {
        let backend = LocalRsa;
        let full = test_key();
        let key = KeyHandle::remote(
            9,
            Rsa::from_public_components(full.n().to_owned().unwrap(), full.e().to_owned().unwrap())
                .unwrap(),
        );
        let mut out = vec![0u8; key.size()];
        assert!(backend
            .private_encrypt(&key, b"x", &mut out, PADDING_PKCS1)
            .is_err());
    }

    #[test]
    fn unsupported_padding_is_rejected() {
        let backend = LocalRsa;
        let key = KeyHandle::local(test_key()).unwrap();
        let mut out = vec![0u8; key.size()];
        assert!(backend
            .private_encrypt(&key, b"x", &mut out, 99)
            .is_err());
    }

    #[test]
    fn bn_mod_exp_matches_direct_exponentiation() {
        let backend = LocalRsa;
        let a = BigNum::from_u32(4).unwrap();
        let p = BigNum::from_u32(13).unwrap();
        let m = BigNum::from_u32(497).unwrap();
        let mut r = BigNum::new().unwrap();
        backend.bn_mod_exp(&mut r, &a, &p, &m).unwrap();
        // 4^13 mod 497 = 445
        assert_eq!(r, BigNum::from_u32(445).unwrap());
    }

    #[test]
    fn mod_exp_equals_raw_private_op() {
        let backend = LocalRsa;
        let key = KeyHandle::local(test_key()).unwrap();

        // compare the dedicated slot against a raw (unpadded) private op
        let mut input = vec![0u8; key.size()];
        input[key.size() - 1] = 0x2a;
        let mut raw = vec![0u8; key.size()];
        let n = backend
            .private_encrypt(&key, &input, &mut raw, PADDING_NONE)
            .unwrap();

        let i = BigNum::from_slice(&input).unwrap();
        let mut r = BigNum::new().unwrap();
        backend.mod_exp(&key, &i, &mut r).unwrap();
        assert_eq!(r.to_vec_padded(n as i32).unwrap(), raw[..n]);
    }
}
