//! Serde helpers for curve points and scalars: canonical compressed bytes in
//! binary formats, hex strings in human readable ones.

macro_rules! impl_serde_compressed {
    ($repr:ty, $len:expr, $to_bytes:ident, $from_bytes:ident) => {
        use serde::de::Error;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &$repr, s: S) -> Result<S::Ok, S::Error> {
            let bytes = value.$to_bytes();
            if s.is_human_readable() {
                s.serialize_str(&hex::encode(bytes))
            } else {
                s.serialize_bytes(&bytes)
            }
        }

        pub fn deserialize<'d, D: Deserializer<'d>>(d: D) -> Result<$repr, D::Error> {
            let bytes: Vec<u8> = if d.is_human_readable() {
                let hex_str: String = Deserialize::deserialize(d)?;
                hex::decode(hex_str).map_err(Error::custom)?
            } else {
                Deserialize::deserialize(d)?
            };

            let byte_array: [u8; $len] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::invalid_length(bytes.len(), &concat!($len, " bytes")))?;

            Option::<$repr>::from(<$repr>::$from_bytes(&byte_array))
                .ok_or_else(|| Error::custom("not a canonical encoding"))
        }
    };
}

pub mod g1 {
    use bls12_381::G1Affine;

    impl_serde_compressed!(G1Affine, 48, to_compressed, from_compressed);
}

pub mod g2 {
    use bls12_381::G2Affine;

    impl_serde_compressed!(G2Affine, 96, to_compressed, from_compressed);
}

pub mod scalar {
    use bls12_381::Scalar;

    impl_serde_compressed!(Scalar, 32, to_bytes, from_bytes);
}

#[cfg(test)]
mod tests {
    use crate::{dealer_keygen, SecretKeyShare};

    #[test]
    fn roundtrip_through_serde() {
        let (pk, pub_shares, sec_shares) = dealer_keygen(2, 3);

        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(pk, serde_json::from_str(&json).unwrap());

        let json = serde_json::to_string(&pub_shares[0]).unwrap();
        assert_eq!(pub_shares[0], serde_json::from_str(&json).unwrap());

        let json = serde_json::to_string(&sec_shares[0]).unwrap();
        let decoded: SecretKeyShare = serde_json::from_str(&json).unwrap();
        assert_eq!(sec_shares[0], decoded);
    }
}
