//! InstantSend lock payloads and the request/sign hashes derived from them.

use std::fmt;
use std::io::{Error, Read, Write};

use anyhow::format_err;
use bitcoin::hashes::{hash_newtype, sha256d, Hash as BitcoinHash};
use bitcoin::{BlockHash, OutPoint, Txid};
use serde::{Deserialize, Serialize};

use crate::encoding::{Decodable, DecodeError, Encodable};

const INPUTLOCK_REQUESTID_PREFIX: &str = "inlock";
const ISLOCK_REQUESTID_PREFIX: &str = "islock";

hash_newtype! {
    /// Identifies an InstantSend lock: the double-SHA256 of its serialization
    pub struct LockHash(sha256d::Hash);

    /// Identifies a threshold signing request towards the quorum network
    pub struct RequestId(sha256d::Hash);

    /// The digest a quorum actually signs: commits to the quorum, the request
    /// and the message
    pub struct SignHash(sha256d::Hash);
}

macro_rules! impl_encode_decode_newtype_hash {
    ($hash_type:ty) => {
        impl Encodable for $hash_type {
            fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
                writer.write_all(&self.to_byte_array())?;
                Ok(32)
            }
        }

        impl Decodable for $hash_type {
            fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
                let mut bytes = [0u8; 32];
                r.read_exact(&mut bytes).map_err(DecodeError::from_err)?;
                Ok(<$hash_type>::from_byte_array(bytes))
            }
        }
    };
}

impl_encode_decode_newtype_hash!(LockHash);
impl_encode_decode_newtype_hash!(RequestId);
impl_encode_decode_newtype_hash!(SignHash);

/// The quorum type InstantSend signing requests are directed at
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LlmqType(pub u8);

impl fmt::Display for LlmqType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "llmq_{}", self.0)
    }
}

/// Wire variant of an InstantSend lock. The variant is explicit in the
/// envelope (inventory kind / message command); payloads carry a matching
/// version byte and decoding never falls back across variants.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockVersion {
    Legacy = 0,
    Deterministic = 1,
}

/// A quorum attestation that a transaction's inputs are locked for it.
///
/// Deterministic locks additionally commit to the block anchoring the signing
/// quorum's rotation cycle, so `cycle_hash` is `Some` exactly for
/// [`LockVersion::Deterministic`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstantSendLock {
    pub txid: Txid,
    pub inputs: Vec<OutPoint>,
    pub cycle_hash: Option<BlockHash>,
    pub sig: tbls::Signature,
}

impl InstantSendLock {
    pub fn version(&self) -> LockVersion {
        if self.cycle_hash.is_some() {
            LockVersion::Deterministic
        } else {
            LockVersion::Legacy
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.cycle_hash.is_some()
    }

    /// The hash under which this lock is stored, relayed and deduplicated
    pub fn hash(&self) -> LockHash {
        LockHash::from_raw_hash(self.consensus_hash())
    }

    /// The signing request id of the aggregated lock. Depends only on the
    /// spent outpoints, so every node deterministically requests the same
    /// signature for a given input set.
    pub fn request_id(&self) -> RequestId {
        islock_request_id(&self.inputs)
    }
}

/// The signing request id for the aggregated lock over `inputs`. Available
/// separately from [`InstantSendLock`] because the id is needed while the
/// lock's signature is still being recovered.
pub fn islock_request_id(inputs: &[OutPoint]) -> RequestId {
    let mut engine = sha256d::Hash::engine();
    ISLOCK_REQUESTID_PREFIX
        .consensus_encode(&mut engine)
        .expect("writing to a HashEngine can't fail");
    crate::encoding::CompactSize(inputs.len() as u64)
        .consensus_encode(&mut engine)
        .expect("writing to a HashEngine can't fail");
    for input in inputs {
        input
            .consensus_encode(&mut engine)
            .expect("writing to a HashEngine can't fail");
    }
    RequestId::from_raw_hash(sha256d::Hash::from_engine(engine))
}

impl Encodable for InstantSendLock {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
        let mut len = (self.version() as u8).consensus_encode(writer)?;
        len += self.txid.consensus_encode(writer)?;
        len += self.inputs.consensus_encode(writer)?;
        if let Some(cycle_hash) = self.cycle_hash {
            len += cycle_hash.consensus_encode(writer)?;
        }
        len += self.sig.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for InstantSendLock {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let version = u8::consensus_decode(r)?;
        let txid = Txid::consensus_decode(r)?;
        let inputs = Vec::<OutPoint>::consensus_decode(r)?;
        let cycle_hash = match version {
            0 => None,
            1 => Some(BlockHash::consensus_decode(r)?),
            v => {
                return Err(DecodeError::new_custom(format_err!(
                    "unknown instant send lock version {v}"
                )))
            }
        };
        let sig = tbls::Signature::consensus_decode(r)?;
        Ok(InstantSendLock {
            txid,
            inputs,
            cycle_hash,
            sig,
        })
    }
}

/// The signing request id for a single input lock
pub fn input_request_id(outpoint: &OutPoint) -> RequestId {
    let mut engine = sha256d::Hash::engine();
    INPUTLOCK_REQUESTID_PREFIX
        .consensus_encode(&mut engine)
        .expect("writing to a HashEngine can't fail");
    outpoint
        .consensus_encode(&mut engine)
        .expect("writing to a HashEngine can't fail");
    RequestId::from_raw_hash(sha256d::Hash::from_engine(engine))
}

/// The digest a quorum signs for a `(request, message)` pair. Commits to the
/// quorum so that signatures recovered under one rotation cannot be replayed
/// against another.
pub fn build_sign_hash(
    llmq_type: LlmqType,
    quorum_hash: BlockHash,
    id: RequestId,
    msg_hash: Txid,
) -> SignHash {
    let mut engine = sha256d::Hash::engine();
    llmq_type
        .0
        .consensus_encode(&mut engine)
        .expect("writing to a HashEngine can't fail");
    quorum_hash
        .consensus_encode(&mut engine)
        .expect("writing to a HashEngine can't fail");
    id.consensus_encode(&mut engine)
        .expect("writing to a HashEngine can't fail");
    msg_hash
        .consensus_encode(&mut engine)
        .expect("writing to a HashEngine can't fail");
    SignHash::from_raw_hash(sha256d::Hash::from_engine(engine))
}

impl SignHash {
    /// The curve point quorum members sign and verifiers check against
    pub fn to_message(self) -> tbls::Message {
        tbls::Message::from_bytes(&self.to_byte_array())
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash as BitcoinHash;
    use bitcoin::{OutPoint, Txid};

    use super::{build_sign_hash, input_request_id, InstantSendLock, LlmqType, LockVersion};
    use crate::encoding::{Decodable, Encodable};

    fn outpoint(n: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([n; 32]),
            vout,
        }
    }

    fn dummy_sig() -> tbls::Signature {
        let msg = tbls::Message::from_bytes(b"test");
        let (_pk, _pks, sks) = tbls::dealer_keygen(1, 1);
        tbls::combine_signature_shares(vec![(0, tbls::sign(msg, sks[0]))].into_iter(), 1)
    }

    fn lock(cycle: bool) -> InstantSendLock {
        InstantSendLock {
            txid: Txid::from_byte_array([0xAB; 32]),
            inputs: vec![outpoint(1, 0), outpoint(2, 7)],
            cycle_hash: cycle.then(|| bitcoin::BlockHash::from_byte_array([0xCD; 32])),
            sig: dummy_sig(),
        }
    }

    #[test]
    fn roundtrip_both_versions() {
        for deterministic in [false, true] {
            let islock = lock(deterministic);
            let bytes = islock.consensus_encode_to_vec();
            let decoded = InstantSendLock::consensus_decode_whole(&bytes).expect("decodes");
            assert_eq!(islock, decoded);
            assert_eq!(bytes, decoded.consensus_encode_to_vec());
        }
    }

    #[test]
    fn version_follows_cycle_hash() {
        assert_eq!(lock(false).version(), LockVersion::Legacy);
        assert_eq!(lock(true).version(), LockVersion::Deterministic);
    }

    #[test]
    fn versions_hash_differently() {
        assert_ne!(lock(false).hash(), lock(true).hash());
    }

    #[test]
    fn request_id_depends_only_on_inputs() {
        let a = lock(false);
        let mut b = lock(true);
        b.txid = Txid::from_byte_array([0x11; 32]);
        assert_eq!(a.request_id(), b.request_id());

        let mut c = lock(false);
        c.inputs.reverse();
        assert_ne!(a.request_id(), c.request_id());
    }

    #[test]
    fn input_request_ids_are_unique_per_outpoint() {
        assert_ne!(
            input_request_id(&outpoint(1, 0)),
            input_request_id(&outpoint(1, 1))
        );
    }

    #[test]
    fn sign_hash_commits_to_quorum() {
        let islock = lock(true);
        let id = islock.request_id();
        let quorum_a = bitcoin::BlockHash::from_byte_array([1; 32]);
        let quorum_b = bitcoin::BlockHash::from_byte_array([2; 32]);
        assert_ne!(
            build_sign_hash(LlmqType(1), quorum_a, id, islock.txid),
            build_sign_hash(LlmqType(1), quorum_b, id, islock.txid)
        );
    }
}
