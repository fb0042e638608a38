use ff::PrimeField;
use serde::{de::DeserializeOwned, Serialize};

/// Prime field usable for MPC computations.
pub trait MpcField: PrimeField + Serialize + DeserializeOwned {
    /// Decimal representation of the field modulus.
    const MODULUS: &'static str;
}

/// Serialize field elements as their canonical representation and reject
/// non-canonical encodings on deserialization.
macro_rules! impl_serde_for_field {
    ($field:ident, $repr:ident) => {
        impl serde::Serialize for $field {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                self.to_repr().0.serialize(serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $field {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let repr = $repr(serde::Deserialize::deserialize(deserializer)?);
                Self::from_repr_vartime(repr)
                    .ok_or_else(|| serde::de::Error::custom("Invalid field element"))
            }
        }
    };
}

mod mersenne_61 {
    use ff::PrimeField;

    /// Finite field mod 2^61-1.
    #[derive(PrimeField)]
    #[PrimeFieldModulus = "2305843009213693951"]
    #[PrimeFieldGenerator = "37"]
    #[PrimeFieldReprEndianness = "little"]
    pub struct Mersenne61([u64; 1]);

    impl_serde_for_field!(Mersenne61, Mersenne61Repr);

    impl super::MpcField for Mersenne61 {
        const MODULUS: &'static str = "2305843009213693951";
    }
}

mod mersenne_127 {
    use ff::PrimeField;

    /// Finite field mod 2^127-1.
    #[derive(PrimeField)]
    #[PrimeFieldModulus = "170141183460469231731687303715884105727"]
    #[PrimeFieldGenerator = "43"]
    #[PrimeFieldReprEndianness = "little"]
    pub struct Mersenne127([u64; 2]);

    impl_serde_for_field!(Mersenne127, Mersenne127Repr);

    impl super::MpcField for Mersenne127 {
        const MODULUS: &'static str = "170141183460469231731687303715884105727";
    }
}

mod toy_251 {
    use ff::PrimeField;

    /// Finite field mod 251. Far too small for security, handy for examples and tests.
    #[derive(PrimeField)]
    #[PrimeFieldModulus = "251"]
    #[PrimeFieldGenerator = "6"]
    #[PrimeFieldReprEndianness = "little"]
    pub struct F251([u64; 1]);

    impl_serde_for_field!(F251, F251Repr);

    impl super::MpcField for F251 {
        const MODULUS: &'static str = "251";
    }
}

pub use mersenne_127::{Mersenne127, Mersenne127Repr};
pub use mersenne_61::{Mersenne61, Mersenne61Repr};
pub use toy_251::{F251Repr, F251};

#[cfg(test)]
mod tests {
    use ff::Field;

    use super::*;

    /// Low 64 bits of the little endian representation.
    fn low_u64<F: PrimeField>(x: F) -> u64 {
        let repr = x.to_repr();
        let bytes = repr.as_ref();
        let len = bytes.len().min(8);
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(&bytes[..len]);
        u64::from_le_bytes(buf)
    }

    #[test]
    fn test_reduction_mod_251() {
        let x = F251::from(12345);
        assert_eq!(low_u64(x), 12345 % 251);
        assert_eq!(low_u64(-F251::one()), 250);
    }

    #[test]
    fn test_serde_rejects_values_outside_field() {
        let x = Mersenne61::from(42);
        let bytes = bincode::serialize(&x).unwrap();
        assert_eq!(bincode::deserialize::<Mersenne61>(&bytes).unwrap(), x);

        let too_big = bincode::serialize(&[0xffu8; 8]).unwrap();
        assert!(bincode::deserialize::<Mersenne61>(&too_big).is_err());
    }
}
