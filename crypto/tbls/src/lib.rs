//! # Threshold BLS Signatures
//!
//! This library implements an ad-hoc threshold signature scheme based on BLS
//! signatures using the BLS12-381 curve. Messages are hashed to G2, so
//! signatures are 96 byte compressed G2 points while public keys are 48 byte
//! compressed G1 points. Signature shares are produced by evaluating a shared
//! secret polynomial and a full signature is recovered by Lagrange
//! interpolation of a threshold amount of shares.

use bls12_381::{pairing, G1Affine, G1Projective, G2Affine, G2Projective};
use ff::Field;
use group::Curve;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::digest::generic_array::typenum::U32;
use sha3::Digest;
use std::hash::Hasher;

use crate::hash::{hash_bytes_to_curve, hash_to_curve};
use crate::poly::Poly;

pub use bls12_381::Scalar;

pub mod batch;
pub mod hash;
pub mod poly;
mod serde_impl;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PublicKeyShare(#[serde(with = "serde_impl::g1")] pub G1Affine);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SecretKeyShare(#[serde(with = "serde_impl::scalar")] pub Scalar);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AggregatePublicKey(#[serde(with = "serde_impl::g1")] pub G1Affine);

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct SignatureShare(#[serde(with = "serde_impl::g2")] pub G2Affine);

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_impl::g2")] pub G2Affine);

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct Message(#[serde(with = "serde_impl::g2")] pub G2Affine);

pub trait FromRandom {
    fn from_random(rng: &mut impl RngCore) -> Self;
}

impl FromRandom for Scalar {
    fn from_random(rng: &mut impl RngCore) -> Self {
        Field::random(rng)
    }
}

impl Message {
    pub fn from_bytes(msg: &[u8]) -> Message {
        Message(hash_bytes_to_curve::<G2Projective>(msg).to_affine())
    }

    /// **IMPORTANT**: `from_bytes` includes a tag in the hash, this doesn't
    pub fn from_hash(hash: impl Digest<OutputSize = U32>) -> Message {
        Message(hash_to_curve::<G2Projective, _>(hash).to_affine())
    }
}

#[allow(clippy::derived_hash_with_manual_eq)]
impl std::hash::Hash for AggregatePublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let serialized = self.0.to_compressed();
        state.write(&serialized);
    }
}

macro_rules! point_impl {
    ($type:ty, $group:ty, $len:expr) => {
        impl std::hash::Hash for $type {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                let serialized = self.0.to_compressed();
                state.write(&serialized);
            }
        }

        impl $type {
            pub fn encode_compressed(&self) -> [u8; $len] {
                self.0.to_compressed()
            }

            pub fn decode_compressed(bytes: &[u8; $len]) -> Option<Self> {
                let point = <$group>::from_compressed(bytes);
                if point.is_some().into() {
                    Some(Self(point.unwrap()))
                } else {
                    None
                }
            }
        }

        impl PartialEq for $type {
            fn eq(&self, other: &$type) -> bool {
                self.0 == other.0
            }
        }

        impl Eq for $type {}
    };
}

point_impl!(Message, G2Affine, 96);
point_impl!(Signature, G2Affine, 96);
point_impl!(SignatureShare, G2Affine, 96);

impl AggregatePublicKey {
    pub fn encode_compressed(&self) -> [u8; 48] {
        self.0.to_compressed()
    }

    pub fn decode_compressed(bytes: &[u8; 48]) -> Option<Self> {
        let point = G1Affine::from_compressed(bytes);
        if point.is_some().into() {
            Some(AggregatePublicKey(point.unwrap()))
        } else {
            None
        }
    }
}

impl SecretKeyShare {
    pub fn to_pub_key_share(self) -> PublicKeyShare {
        PublicKeyShare((G1Projective::generator() * self.0).to_affine())
    }
}

/// * `threshold`: how many signature shares are needed to produce a signature
/// * `keys`: how many keys to generate
pub fn dealer_keygen(
    threshold: usize,
    keys: usize,
) -> (AggregatePublicKey, Vec<PublicKeyShare>, Vec<SecretKeyShare>) {
    let mut rng = OsRng;
    let poly = Poly::<Scalar, Scalar>::random(threshold - 1, &mut rng);
    let (pub_shares, sec_shares) = (1..=keys)
        .map(|idx| {
            let sk = poly.evaluate(idx as u64);
            let pk = G1Projective::generator() * sk;

            (PublicKeyShare(pk.to_affine()), SecretKeyShare(sk))
        })
        .unzip();
    let pub_key = G1Projective::generator() * poly.evaluate(0);

    (
        AggregatePublicKey(pub_key.to_affine()),
        pub_shares,
        sec_shares,
    )
}

pub fn sign(msg: Message, sks: SecretKeyShare) -> SignatureShare {
    let sig = msg.0 * sks.0;
    SignatureShare(sig.to_affine())
}

/// Combines a sufficient amount of valid signature shares to a signature. The
/// responsibility of verifying the supplied shares lies with the caller.
///
/// * `sig_shares`: an iterator yielding pairs of key indices and signature shares from said key
/// * `threshold`: number of shares needed to combine a signature
///
/// # Panics
/// If the amount of shares supplied is less than the necessary amount
pub fn combine_signature_shares<I>(sig_shares: I, threshold: usize) -> Signature
where
    I: IntoIterator<Item = (usize, SignatureShare)>,
{
    let points = sig_shares
        .into_iter()
        .take(threshold)
        .map(|(idx, share)| {
            let x = Scalar::from((idx as u64) + 1);
            let y = share.0.into();
            (x, y)
        })
        .collect::<Vec<(Scalar, G2Projective)>>();
    if points.len() < threshold {
        panic!("Not enough signature shares");
    }

    if points.len() == 1 {
        return Signature(points.first().unwrap().1.to_affine());
    }

    let sig: G2Projective = poly::interpolate_zero(&points);
    Signature(sig.to_affine())
}

pub fn verify(msg: Message, sig: Signature, pk: AggregatePublicKey) -> bool {
    pairing(&pk.0, &msg.0) == pairing(&G1Affine::generator(), &sig.0)
}

pub fn verify_share(msg: Message, sig: SignatureShare, pk: PublicKeyShare) -> bool {
    pairing(&pk.0, &msg.0) == pairing(&G1Affine::generator(), &sig.0)
}

pub trait Aggregatable {
    type Aggregate;

    fn aggregate(&self, threshold: usize) -> Self::Aggregate;
}

impl Aggregatable for Vec<PublicKeyShare> {
    type Aggregate = AggregatePublicKey;

    fn aggregate(&self, threshold: usize) -> Self::Aggregate {
        if self.len() == 1 {
            return AggregatePublicKey(self.first().unwrap().0);
        }

        let elements = self
            .iter()
            .enumerate()
            .map(|(idx, PublicKeyShare(pk))| (Scalar::from((idx + 1) as u64), pk.into()))
            .take(threshold)
            .collect::<Vec<(Scalar, G1Projective)>>();
        let pk: G1Projective = poly::interpolate_zero(&elements);
        AggregatePublicKey(pk.to_affine())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        combine_signature_shares, dealer_keygen, sign, verify, verify_share, Aggregatable, Message,
    };

    #[test]
    fn test_keygen() {
        let (pk, pks, _sks) = dealer_keygen(5, 15);
        assert_eq!(pks.len(), 15);

        let pka = pks.aggregate(5);
        assert_eq!(pka, pk);
    }

    #[test]
    fn test_roundtrip() {
        let msg = Message::from_bytes(b"Hello World!");
        let threshold = 5;

        let (pk, pks, sks) = dealer_keygen(threshold, 15);

        let mut sigs = sks
            .iter()
            .enumerate()
            .map(|(idx, sk)| (idx, sign(msg, *sk)))
            .collect::<Vec<_>>();

        for (idx, share) in &sigs {
            assert!(verify_share(msg, *share, pks[*idx]));
        }

        // All sig shares available
        let sig = combine_signature_shares(sigs.clone().into_iter(), threshold);
        assert!(verify(msg, sig, pk));

        // Missing sig shares
        for _ in 0..5 {
            sigs.pop();
        }
        let sig = combine_signature_shares(sigs.clone().into_iter(), threshold);
        assert!(verify(msg, sig, pk));

        let new_order = [9, 5, 4, 7, 8, 6, 0, 1, 3, 2];

        let shuffle_sigs = new_order.iter().map(|idx| sigs[*idx]);
        let sig = combine_signature_shares(shuffle_sigs, threshold);
        assert!(verify(msg, sig, pk));
    }

    #[test]
    #[should_panic(expected = "Not enough signature shares")]
    fn test_insufficient_shares() {
        let msg = Message::from_bytes(b"Hello World!");
        let threshold = 5;

        let (_, _pks, sks) = dealer_keygen(threshold, 4);

        let sigs = sks.iter().enumerate().map(|(idx, sk)| (idx, sign(msg, *sk)));

        // Combining an insufficient number of signature shares should panic
        combine_signature_shares(sigs, threshold);
    }

    #[test]
    fn test_wrong_key_fails() {
        let msg = Message::from_bytes(b"Hello World!");
        let (_, _, sks) = dealer_keygen(2, 4);
        let (other_pk, _, _) = dealer_keygen(2, 4);

        let sigs = sks.iter().enumerate().map(|(idx, sk)| (idx, sign(msg, *sk)));
        let sig = combine_signature_shares(sigs, 2);
        assert!(!verify(msg, sig, other_pk));
    }

    #[test]
    fn test_compressed_encoding_lengths() {
        let msg = Message::from_bytes(b"encode me");
        let (pk, _, sks) = dealer_keygen(1, 1);
        let sig = combine_signature_shares(
            sks.iter().enumerate().map(|(idx, sk)| (idx, sign(msg, *sk))),
            1,
        );

        assert_eq!(pk.encode_compressed().len(), 48);
        assert_eq!(sig.encode_compressed().len(), 96);
        assert_eq!(
            crate::Signature::decode_compressed(&sig.encode_compressed()),
            Some(sig)
        );
    }
}
