//! Hashing arbitrary data onto the curve. The digest seeds a deterministic
//! RNG from which a group element is sampled, so equal inputs map to equal
//! points on every node.

use group::Group;
use rand::SeedableRng;
use rand_chacha::ChaChaRng;
use sha3::digest::generic_array::typenum::U32;
use sha3::Digest;

const HASH_TAG: &[u8] = b"TBLS_BLS12-381_";

pub fn hash_bytes_to_curve<G: Group>(data: &[u8]) -> G {
    let mut engine = sha3::Sha3_256::new();
    engine.update(HASH_TAG);
    engine.update(data);
    hash_to_curve(engine)
}

/// **IMPORTANT**: unlike [`hash_bytes_to_curve`] this does not mix a domain
/// tag into the digest
pub fn hash_to_curve<G: Group, H: Digest<OutputSize = U32>>(hash: H) -> G {
    let mut rng = ChaChaRng::from_seed(hash.finalize().into());
    G::random(&mut rng)
}
