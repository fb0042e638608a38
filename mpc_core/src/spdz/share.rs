use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

use crate::{fields::MpcField, session::CANONICAL_PARTY, MpcShare};

/// Value share in SPDZ protocol.
/// Summing `value` over all parties gives the shared value `v`, summing `mac` gives `v * alpha`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpdzShare<T> {
    pub(crate) value: T,
    pub(crate) mac: T,
}

impl<T: MpcField> SpdzShare<T> {
    pub fn new(value: T, mac: T) -> Self {
        Self { value, mac }
    }

    /// Additive share of the value.
    pub fn value(&self) -> T {
        self.value
    }

    /// Additive share of the value's MAC.
    pub fn mac(&self) -> T {
        self.mac
    }

    /// Sharing of a public constant: the canonical party holds the value,
    /// every party holds its share of the MAC.
    pub fn from_plain(x: T, auth_key_share: T, party_id: usize) -> Self {
        Self {
            value: if party_id == CANONICAL_PARTY {
                x
            } else {
                T::zero()
            },
            mac: x * auth_key_share,
        }
    }
}

impl<T: MpcField> MpcShare for SpdzShare<T> {
    type Field = T;

    fn zero() -> Self {
        SpdzShare {
            value: T::zero(),
            mac: T::zero(),
        }
    }
}

impl<T: MpcField> Add for SpdzShare<T> {
    type Output = SpdzShare<T>;
    fn add(self, rhs: Self) -> Self::Output {
        SpdzShare {
            value: self.value + rhs.value,
            mac: self.mac + rhs.mac,
        }
    }
}

impl<T: MpcField> Sub for SpdzShare<T> {
    type Output = SpdzShare<T>;
    fn sub(self, rhs: Self) -> Self::Output {
        SpdzShare {
            value: self.value - rhs.value,
            mac: self.mac - rhs.mac,
        }
    }
}

impl<T: MpcField> Neg for SpdzShare<T> {
    type Output = SpdzShare<T>;
    fn neg(self) -> Self::Output {
        SpdzShare {
            value: -self.value,
            mac: -self.mac,
        }
    }
}

impl<T: MpcField> Mul<T> for SpdzShare<T> {
    type Output = SpdzShare<T>;
    fn mul(self, rhs: T) -> Self::Output {
        SpdzShare {
            value: self.value * rhs,
            mac: self.mac * rhs,
        }
    }
}
