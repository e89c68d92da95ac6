//! Batched verification of BLS signatures.
//!
//! Messages from multiple sources are accumulated and checked with a single
//! random-linear-combination pairing equation. Only if that aggregate check
//! fails is each message verified individually, attributing the failure to
//! the message and the source that delivered it.

use std::collections::BTreeSet;

use bls12_381::{pairing, G1Affine, G2Projective, Gt, Scalar};
use ff::Field;
use group::Curve;
use rand::rngs::OsRng;

use crate::{verify, AggregatePublicKey, Message, Signature};

struct BatchEntry<S, M> {
    source: S,
    msg_id: M,
    msg: Message,
    sig: Signature,
    pubkey: AggregatePublicKey,
}

pub struct BatchVerifier<S, M> {
    entries: Vec<BatchEntry<S, M>>,
    pub bad_sources: BTreeSet<S>,
    pub bad_messages: BTreeSet<M>,
}

impl<S, M> Default for BatchVerifier<S, M>
where
    S: Ord + Clone,
    M: Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, M> BatchVerifier<S, M>
where
    S: Ord + Clone,
    M: Ord + Clone,
{
    pub fn new() -> Self {
        BatchVerifier {
            entries: Vec::new(),
            bad_sources: BTreeSet::new(),
            bad_messages: BTreeSet::new(),
        }
    }

    pub fn push_message(
        &mut self,
        source: S,
        msg_id: M,
        msg: Message,
        sig: Signature,
        pubkey: AggregatePublicKey,
    ) {
        self.entries.push(BatchEntry {
            source,
            msg_id,
            msg,
            sig,
            pubkey,
        });
    }

    pub fn message_count(&self) -> usize {
        self.entries.len()
    }

    pub fn unique_source_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| &e.source)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Runs the aggregated check and, on failure, the per-message fallback.
    /// Afterwards `bad_messages` and `bad_sources` contain every message that
    /// failed verification and every source that delivered such a message.
    pub fn verify(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        if self.verify_aggregate() {
            return;
        }

        for entry in &self.entries {
            if !verify(entry.msg, entry.sig, entry.pubkey) {
                self.bad_messages.insert(entry.msg_id.clone());
                self.bad_sources.insert(entry.source.clone());
            }
        }
    }

    fn verify_aggregate(&self) -> bool {
        let coefficients = self
            .entries
            .iter()
            .map(|_| Scalar::random(OsRng))
            .collect::<Vec<_>>();

        let lhs = self
            .entries
            .iter()
            .zip(&coefficients)
            .map(|(entry, r)| pairing(&entry.pubkey.0, &(entry.msg.0 * r).to_affine()))
            .fold(Gt::identity(), |acc, term| acc + term);

        let aggregate_sig = self
            .entries
            .iter()
            .zip(&coefficients)
            .map(|(entry, r)| entry.sig.0 * r)
            .fold(G2Projective::identity(), |acc, term| acc + term);

        lhs == pairing(&G1Affine::generator(), &aggregate_sig.to_affine())
    }
}

#[cfg(test)]
mod tests {
    use super::BatchVerifier;
    use crate::{combine_signature_shares, dealer_keygen, sign, Message};

    fn sign_with_quorum(
        msg: Message,
        threshold: usize,
        keys: usize,
    ) -> (crate::AggregatePublicKey, crate::Signature) {
        let (pk, _pks, sks) = dealer_keygen(threshold, keys);
        let shares = sks
            .iter()
            .enumerate()
            .map(|(idx, sk)| (idx, sign(msg, *sk)))
            .collect::<Vec<_>>();
        (pk, combine_signature_shares(shares.into_iter(), threshold))
    }

    #[test]
    fn batch_of_valid_messages_passes() {
        let mut verifier = BatchVerifier::<u8, u8>::new();
        for i in 0..4u8 {
            let msg = Message::from_bytes(&[i]);
            let (pk, sig) = sign_with_quorum(msg, 2, 3);
            verifier.push_message(i, i, msg, sig, pk);
        }

        verifier.verify();
        assert!(verifier.bad_messages.is_empty());
        assert!(verifier.bad_sources.is_empty());
        assert_eq!(verifier.unique_source_count(), 4);
    }

    #[test]
    fn bad_message_is_attributed_to_its_source() {
        let mut verifier = BatchVerifier::<u8, u8>::new();

        let msg = Message::from_bytes(b"good");
        let (pk, sig) = sign_with_quorum(msg, 2, 3);
        verifier.push_message(0, 0, msg, sig, pk);

        // signature over `msg`, verified against `forged`
        let forged = Message::from_bytes(b"forged");
        verifier.push_message(1, 1, forged, sig, pk);

        verifier.verify();
        assert_eq!(verifier.bad_messages.into_iter().collect::<Vec<_>>(), [1]);
        assert_eq!(verifier.bad_sources.into_iter().collect::<Vec<_>>(), [1]);
    }

    #[test]
    fn empty_batch_is_trivially_valid() {
        let mut verifier = BatchVerifier::<u8, u8>::new();
        verifier.verify();
        assert!(verifier.bad_messages.is_empty());
    }
}
