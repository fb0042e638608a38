use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::fields::MpcField;
use crate::{Misuse, MpcContext, MpcDealer, MpcError, Session};

use super::{InputMask, SpdzDealer, SpdzShare};

/// Insecure dealer for SPDZ protocol that can be used for tests.
/// Dealers of all parties must be created with the same seed; they then derive consistent
/// sharings locally, without communication, and never run out.
pub struct FakeSpdzDealer<T> {
    auth_key: FakeAuthKey<T>,
    beaver_triple_gen: FakeShareGenerator<T>,
    bits_gen: FakeShareGenerator<T>,
    input_masks_gen: Vec<FakeShareGenerator<T>>,
}

impl<T: MpcField> FakeSpdzDealer<T> {
    /// Create dealer of the current party of given session.
    pub fn new(session: &Session, seed: u64) -> Self {
        let (num_parties, party_id) = (session.num_parties(), session.party_id());
        let mut rng = SmallRng::seed_from_u64(seed);
        let auth_key = FakeAuthKey::random(&mut rng, party_id, num_parties);
        Self {
            auth_key,
            beaver_triple_gen: FakeShareGenerator::new(auth_key, rng.gen()),
            bits_gen: FakeShareGenerator::new(auth_key, rng.gen()),
            input_masks_gen: (0..num_parties)
                .map(|_| FakeShareGenerator::new(auth_key, rng.gen()))
                .collect(),
        }
    }

    /// Full authentication key. Only a fake dealer can reveal it.
    pub fn authentication_key(&self) -> T {
        self.auth_key.plain_value
    }
}

impl<T: MpcField> MpcContext for FakeSpdzDealer<T> {
    type Field = T;
    type Share = SpdzShare<T>;

    fn num_parties(&self) -> usize {
        self.auth_key.num_parties
    }

    fn party_id(&self) -> usize {
        self.auth_key.party_id
    }
}

impl<T: MpcField> MpcDealer for FakeSpdzDealer<T> {
    fn share_plain(&self, x: Self::Field) -> Self::Share {
        SpdzShare::from_plain(x, self.auth_key.share_value, self.auth_key.party_id)
    }

    fn next_beaver_triple(&mut self) -> Result<(Self::Share, Self::Share, Self::Share), MpcError> {
        let (a_share, a_plain) = self.beaver_triple_gen.gen_random_authenticated_share();
        let (b_share, b_plain) = self.beaver_triple_gen.gen_random_authenticated_share();
        let c_share = self
            .beaver_triple_gen
            .gen_authenticated_share(a_plain * b_plain);
        Ok((a_share, b_share, c_share))
    }

    fn next_random_bit(&mut self) -> Result<Self::Share, MpcError> {
        let value = if self.bits_gen.rng().gen() {
            Self::Field::one()
        } else {
            Self::Field::zero()
        };
        Ok(self.bits_gen.gen_authenticated_share(value))
    }
}

impl<T: MpcField> SpdzDealer for FakeSpdzDealer<T> {
    fn authentication_key_share(&self) -> Self::Field {
        self.auth_key.share_value
    }

    fn next_input_mask(&mut self, owner: usize) -> Result<InputMask<Self::Field>, MpcError> {
        let generator = self
            .input_masks_gen
            .get_mut(owner)
            .ok_or(Misuse::InvalidParty(owner))?;
        let (share, plain) = generator.gen_random_authenticated_share();
        let plain = (owner == self.auth_key.party_id).then(|| plain);
        Ok(InputMask { share, plain })
    }
}

/// Authentication key in plain and its share.
#[derive(Copy, Clone)]
struct FakeAuthKey<T> {
    num_parties: usize,
    party_id: usize,
    share_value: T,
    plain_value: T,
}

impl<T: MpcField> FakeAuthKey<T> {
    /// Generate fake authentication key and its share.
    fn random(rng: &mut impl Rng, party_id: usize, num_parties: usize) -> Self {
        let (share_value, plain_value) = gen_random_raw_share(rng, party_id, num_parties);
        Self {
            num_parties,
            party_id,
            share_value,
            plain_value,
        }
    }
}

/// Insecure generator of SPDZ-shared values.
struct FakeShareGenerator<T> {
    auth_key: FakeAuthKey<T>,
    rng: SmallRng,
}

impl<T: MpcField> FakeShareGenerator<T> {
    /// Create new generator.
    fn new(auth_key: FakeAuthKey<T>, seed: [u8; 32]) -> Self {
        Self {
            rng: SmallRng::from_seed(seed),
            auth_key,
        }
    }

    /// Get underlying random number generator.
    fn rng(&mut self) -> &mut impl Rng {
        &mut self.rng
    }

    /// Generate local unauthenticated share of specified value.
    fn gen_raw_share(&mut self, value: T) -> T {
        gen_raw_share(
            &mut self.rng,
            self.auth_key.party_id,
            self.auth_key.num_parties,
            value,
        )
    }

    /// Generate local authenticated share of specified value.
    fn gen_authenticated_share(&mut self, value: T) -> SpdzShare<T> {
        SpdzShare {
            value: self.gen_raw_share(value),
            mac: self.gen_raw_share(value * self.auth_key.plain_value),
        }
    }

    /// Generate random value and its local authenticated share.
    fn gen_random_authenticated_share(&mut self) -> (SpdzShare<T>, T) {
        let value = T::random(&mut self.rng);
        (self.gen_authenticated_share(value), value)
    }
}

/// Generate local unauthenticated share of specified value.
fn gen_raw_share<T: MpcField>(
    mut rng: &mut impl Rng,
    party_id: usize,
    num_parties: usize,
    value: T,
) -> T {
    let start = T::random(&mut rng);
    let step = T::random(&mut rng);
    let share = arithmetic_progression(start, step, party_id as u64);
    let sum = arithmetic_progression_sum(start, step, num_parties as u64);
    if party_id == 0 {
        share + value - sum
    } else {
        share
    }
}

/// Generate random value and its local unauthenticated share.
fn gen_random_raw_share<T: MpcField>(
    mut rng: &mut impl Rng,
    party_id: usize,
    num_parties: usize,
) -> (T, T) {
    let value = T::random(&mut rng);
    (gen_raw_share(rng, party_id, num_parties, value), value)
}

/// Compute n-th term of linear progression.
fn arithmetic_progression<T: MpcField>(start: T, step: T, n: u64) -> T {
    start + step * T::from(n)
}

/// Compute sum of terms 0..n-1 of linear progression.
fn arithmetic_progression_sum<T: MpcField>(start: T, step: T, n: u64) -> T {
    let sum = if n % 2 == 0 {
        T::from(n / 2) * T::from(n - 1)
    } else {
        T::from(n) * T::from((n - 1) / 2)
    };
    start * T::from(n) + step * sum
}

#[cfg(test)]
mod tests {
    use ff::Field;

    use super::*;
    use crate::{fields::F251, MpcShare};

    type Fp = F251;

    fn dealers(n: usize) -> Vec<FakeSpdzDealer<Fp>> {
        Session::all::<Fp>(n)
            .unwrap()
            .iter()
            .map(|session| FakeSpdzDealer::new(session, 3))
            .collect()
    }

    fn reconstruct(shares: impl IntoIterator<Item = SpdzShare<Fp>>) -> SpdzShare<Fp> {
        shares.into_iter().fold(SpdzShare::zero(), |acc, x| acc + x)
    }

    #[test]
    fn test_triples_are_consistent() {
        let mut dealers = dealers(3);
        let alpha = dealers[0].authentication_key();
        let key_shares = dealers
            .iter()
            .fold(Fp::zero(), |acc, d| acc + d.authentication_key_share());
        assert_eq!(alpha, key_shares);

        for _ in 0..5 {
            let triples: Vec<_> = dealers
                .iter_mut()
                .map(|d| d.next_beaver_triple().unwrap())
                .collect();
            let a = reconstruct(triples.iter().map(|t| t.0));
            let b = reconstruct(triples.iter().map(|t| t.1));
            let c = reconstruct(triples.iter().map(|t| t.2));
            assert_eq!(a.value() * b.value(), c.value());
            for x in [a, b, c] {
                assert_eq!(x.mac(), x.value() * alpha);
            }
        }
    }

    #[test]
    fn test_input_mask_plain_known_to_owner_only() {
        let mut dealers = dealers(2);
        let masks: Vec<_> = dealers
            .iter_mut()
            .map(|d| d.next_input_mask(1).unwrap())
            .collect();
        assert!(masks[0].plain.is_none());
        let plain = masks[1].plain.unwrap();
        assert_eq!(reconstruct(masks.iter().map(|m| m.share)).value(), plain);
        assert!(dealers[0].next_input_mask(2).is_err());
    }
}
