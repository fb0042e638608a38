use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{error::Preprocessed, Misuse, MpcContext, MpcDealer, MpcError, MpcField, MpcShare};

use super::{InputMask, SpdzDealer, SpdzShare};

/// Amount of correlated randomness to generate for a computation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PreprocessingCounts {
    pub beaver_triples: usize,
    pub random_bits: usize,
    /// Input masks per party.
    pub input_masks: usize,
}

/// Precomputed data for SPDZ protocol.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PrecomputedSpdzData<T> {
    pub num_parties: usize,
    pub party_id: usize,
    pub auth_key: T,
    pub beaver_triples: Vec<(SpdzShare<T>, SpdzShare<T>, SpdzShare<T>)>,
    pub random_bits: Vec<SpdzShare<T>>,
    pub input_masks: Vec<Vec<SpdzShare<T>>>,
    pub input_masks_plain: Vec<T>,
}

impl<T: MpcField> PrecomputedSpdzData<T> {
    /// Generate data of every party for a key shared as `key_shares`, one share per party.
    pub fn generate(key_shares: &[T], counts: PreprocessingCounts, rng: impl Rng) -> Vec<Self> {
        let num_parties = key_shares.len();
        let mut data: Vec<Self> = key_shares
            .iter()
            .enumerate()
            .map(|(id, &auth_key)| Self {
                num_parties,
                party_id: id,
                auth_key,
                input_masks: (0..num_parties).map(|_| Vec::new()).collect(),
                ..Default::default()
            })
            .collect();

        let auth_key = key_shares.iter().fold(T::zero(), |acc, &x| acc + x);
        let mut share_gen = ShareGenerator {
            num_parties,
            auth_key,
            rng,
        };

        share_gen.fill_beaver_triples(&mut data, counts.beaver_triples);
        share_gen.fill_random_bits(&mut data, counts.random_bits);
        for party_id in 0..num_parties {
            share_gen.fill_input_masks_for(&mut data, party_id, counts.input_masks);
        }

        data
    }

    /// Generate data of every party for a random key.
    pub fn generate_random(
        num_parties: usize,
        counts: PreprocessingCounts,
        mut rng: impl Rng,
    ) -> Vec<Self> {
        let key_shares: Vec<T> = (0..num_parties).map(|_| T::random(&mut rng)).collect();
        Self::generate(&key_shares, counts, rng)
    }
}

/// Generator of random SPDZ sharings.
struct ShareGenerator<T, R> {
    num_parties: usize,
    auth_key: T,
    rng: R,
}

impl<T, R> ShareGenerator<T, R>
where
    T: MpcField,
    R: Rng,
{
    /// Generate random sharing of given value.
    fn share(&mut self, value: T) -> Vec<SpdzShare<T>> {
        let mut shares: Vec<_> = (1..self.num_parties)
            .map(|_| SpdzShare {
                value: T::random(&mut self.rng),
                mac: T::random(&mut self.rng),
            })
            .collect();
        let sum = shares.iter().fold(SpdzShare::zero(), |acc, &x| acc + x);
        shares.push(SpdzShare {
            value: value - sum.value,
            mac: value * self.auth_key - sum.mac,
        });
        shares
    }

    fn share_random(&mut self) -> (Vec<SpdzShare<T>>, T) {
        let value = T::random(&mut self.rng);
        (self.share(value), value)
    }

    fn fill_beaver_triples(&mut self, data: &mut [PrecomputedSpdzData<T>], count: usize) {
        for _ in 0..count {
            let (shares_a, a) = self.share_random();
            let (shares_b, b) = self.share_random();
            let shares_ab = self.share(a * b);
            for (i, party_data) in data.iter_mut().enumerate() {
                party_data
                    .beaver_triples
                    .push((shares_a[i], shares_b[i], shares_ab[i]));
            }
        }
    }

    fn fill_random_bits(&mut self, data: &mut [PrecomputedSpdzData<T>], count: usize) {
        for _ in 0..count {
            let bit = T::from(self.rng.gen_range(0..=1));
            let shares = self.share(bit);
            for (i, party_data) in data.iter_mut().enumerate() {
                party_data.random_bits.push(shares[i]);
            }
        }
    }

    /// Masks of `party_id`: every party gets a share, the owner also gets the plaintext.
    fn fill_input_masks_for(
        &mut self,
        data: &mut [PrecomputedSpdzData<T>],
        party_id: usize,
        count: usize,
    ) {
        for _ in 0..count {
            let (shares, plain) = self.share_random();
            for (i, party_data) in data.iter_mut().enumerate() {
                party_data.input_masks[party_id].push(shares[i]);
            }
            data[party_id].input_masks_plain.push(plain);
        }
    }
}

/// Dealer for SPDZ protocol that serves precomputed data. Every item is handed out once.
pub struct PrecomputedSpdzDealer<T> {
    data: PrecomputedSpdzData<T>,
}

impl<T: MpcField> PrecomputedSpdzDealer<T> {
    /// Create new dealer given precomputed data.
    pub fn new(data: PrecomputedSpdzData<T>) -> Self {
        Self { data }
    }

    /// Material not consumed yet. Input masks are counted for the current party.
    pub fn remaining(&self) -> PreprocessingCounts {
        PreprocessingCounts {
            beaver_triples: self.data.beaver_triples.len(),
            random_bits: self.data.random_bits.len(),
            input_masks: self.data.input_masks_plain.len(),
        }
    }
}

impl<T: MpcField> MpcContext for PrecomputedSpdzDealer<T> {
    type Field = T;
    type Share = SpdzShare<T>;

    fn num_parties(&self) -> usize {
        self.data.num_parties
    }

    fn party_id(&self) -> usize {
        self.data.party_id
    }
}

impl<T: MpcField> MpcDealer for PrecomputedSpdzDealer<T> {
    fn share_plain(&self, x: Self::Field) -> Self::Share {
        SpdzShare::from_plain(x, self.data.auth_key, self.party_id())
    }

    fn next_beaver_triple(&mut self) -> Result<(Self::Share, Self::Share, Self::Share), MpcError> {
        self.data
            .beaver_triples
            .pop()
            .ok_or(MpcError::Exhausted(Preprocessed::BeaverTriple))
    }

    fn next_random_bit(&mut self) -> Result<Self::Share, MpcError> {
        self.data
            .random_bits
            .pop()
            .ok_or(MpcError::Exhausted(Preprocessed::RandomBit))
    }
}

impl<T: MpcField> SpdzDealer for PrecomputedSpdzDealer<T> {
    fn authentication_key_share(&self) -> Self::Field {
        self.data.auth_key
    }

    fn next_input_mask(&mut self, owner: usize) -> Result<InputMask<Self::Field>, MpcError> {
        let exhausted = MpcError::Exhausted(Preprocessed::InputMask { owner });
        let share = self
            .data
            .input_masks
            .get_mut(owner)
            .ok_or(Misuse::InvalidParty(owner))?
            .pop()
            .ok_or(exhausted)?;
        let plain = if owner == self.data.party_id {
            let plain = self
                .data
                .input_masks_plain
                .pop()
                .ok_or(MpcError::Exhausted(Preprocessed::InputMask { owner }))?;
            Some(plain)
        } else {
            None
        };
        Ok(InputMask { share, plain })
    }
}

#[cfg(test)]
mod tests {
    use ff::Field;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::fields::F251;

    type Fp = F251;

    fn counts(beaver_triples: usize) -> PreprocessingCounts {
        PreprocessingCounts {
            beaver_triples,
            random_bits: 2,
            input_masks: 1,
        }
    }

    #[test]
    fn test_generated_data_uses_given_key_shares() {
        let keys = [Fp::from(11231), Fp::from(7719)];
        let data = PrecomputedSpdzData::generate(&keys, counts(3), StdRng::seed_from_u64(1));
        let alpha = keys[0] + keys[1];

        assert_eq!(data[0].auth_key, Fp::from(11231 % 251));
        let bits: Vec<SpdzShare<Fp>> = (0..2)
            .map(|i| data[0].random_bits[i] + data[1].random_bits[i])
            .collect();
        for bit in bits {
            assert!(bit.value() == Fp::zero() || bit.value() == Fp::one());
            assert_eq!(bit.mac(), bit.value() * alpha);
        }
    }

    #[test]
    fn test_triples_are_used_once() {
        let data =
            PrecomputedSpdzData::<Fp>::generate_random(2, counts(2), StdRng::seed_from_u64(2));
        let mut dealer = PrecomputedSpdzDealer::new(data[0].clone());

        let first = dealer.next_beaver_triple().unwrap();
        let second = dealer.next_beaver_triple().unwrap();
        assert_ne!(first, second);
        assert_eq!(dealer.remaining().beaver_triples, 0);
        assert!(matches!(
            dealer.next_beaver_triple(),
            Err(MpcError::Exhausted(Preprocessed::BeaverTriple))
        ));
    }

    #[test]
    fn test_input_masks_exhaust_per_owner() {
        let data =
            PrecomputedSpdzData::<Fp>::generate_random(2, counts(0), StdRng::seed_from_u64(3));
        let mut dealer = PrecomputedSpdzDealer::new(data[1].clone());

        assert!(dealer.next_input_mask(1).unwrap().plain.is_some());
        assert!(dealer.next_input_mask(0).unwrap().plain.is_none());
        assert!(matches!(
            dealer.next_input_mask(0),
            Err(MpcError::Exhausted(Preprocessed::InputMask { owner: 0 }))
        ));
        assert!(matches!(
            dealer.next_input_mask(5),
            Err(MpcError::Misuse(Misuse::InvalidParty(5)))
        ));
    }
}
