use std::{
    marker::PhantomData,
    ops::{Add, Mul, Neg, Sub},
};

use ff::Field;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::*;

/// Seed used when no seed is given. All parties of a mock computation must use the same seed.
const DEFAULT_SEED: u64 = 0x5eed;

/// Mock MPC engine that computes results in plain, replicated at every party.
/// Interactive operations take as many network rounds as in SPDZ.
pub struct MockMpcEngine<T: MpcField> {
    _phantom: PhantomData<T>,
    session: Session,
    rng: SmallRng,
    num_openings: usize,
    num_multiplications: usize,
}

impl<T: MpcField> MockMpcEngine<T> {
    /// Create a new instance of mock.
    pub fn new(session: Session) -> Self {
        Self::with_seed(session, DEFAULT_SEED)
    }

    /// Create mock whose random bits are drawn from given seed.
    pub fn with_seed(session: Session, seed: u64) -> Self {
        Self {
            _phantom: PhantomData,
            session,
            rng: SmallRng::seed_from_u64(seed),
            num_openings: 0,
            num_multiplications: 0,
        }
    }

    /// Total count of opened values.
    pub fn num_openings(&self) -> usize {
        self.num_openings
    }

    /// Total count of secret multiplications.
    pub fn num_multiplications(&self) -> usize {
        self.num_multiplications
    }
}

impl<T: MpcField> MpcContext for MockMpcEngine<T> {
    type Field = T;
    type Share = PlainShare<T>;

    fn num_parties(&self) -> usize {
        self.session.num_parties()
    }

    fn party_id(&self) -> usize {
        self.session.party_id()
    }
}

impl<T: MpcField> MpcDealer for MockMpcEngine<T> {
    fn share_plain(&self, x: Self::Field) -> Self::Share {
        PlainShare(x)
    }

    fn next_beaver_triple(&mut self) -> Result<(Self::Share, Self::Share, Self::Share), MpcError> {
        let a = T::random(&mut self.rng);
        let b = T::random(&mut self.rng);
        Ok((PlainShare(a), PlainShare(b), PlainShare(a * b)))
    }

    fn next_random_bit(&mut self) -> Result<Self::Share, MpcError> {
        let bit = if self.rng.gen::<bool>() { T::one() } else { T::zero() };
        Ok(PlainShare(bit))
    }
}

impl<T: MpcField> MpcEngine for MockMpcEngine<T> {
    type Message = PlainMessage<T>;
    type Op = PlainOp<T>;

    fn session(&self) -> &Session {
        &self.session
    }
}

impl<T: MpcField> Arithmetic for MockMpcEngine<T> {
    fn linear(combination: LinearCombination<T>, output: Wire) -> PlainOp<T> {
        PlainOp::Linear {
            combination,
            output,
        }
    }

    fn mul_public(secret: Secret, public: Public, output: Secret) -> PlainOp<T> {
        PlainOp::MulPublic {
            secret,
            public,
            output,
        }
    }

    fn known_value(value: T, output: Secret) -> PlainOp<T> {
        PlainOp::Known { value, output }
    }

    fn multiply(lhs: Secret, rhs: Secret, output: Secret) -> PlainOp<T> {
        PlainOp::Multiply { lhs, rhs, output }
    }
}

impl<T: MpcField> Opening for MockMpcEngine<T> {
    fn open_to_all(input: Secret, output: Public) -> PlainOp<T> {
        PlainOp::Open {
            input,
            output,
            target: None,
        }
    }

    fn open_to(party: usize, input: Secret, output: Public) -> PlainOp<T> {
        PlainOp::Open {
            input,
            output,
            target: Some(party),
        }
    }

    fn open_unchecked(input: Secret, output: Public) -> PlainOp<T> {
        Self::open_to_all(input, output)
    }

    fn broadcast(input: Public, outputs: Vec<Public>) -> PlainOp<T> {
        PlainOp::Broadcast { input, outputs }
    }
}

impl<T: MpcField> Randomness for MockMpcEngine<T> {
    fn input(owner: usize, value: Option<T>, output: Secret) -> PlainOp<T> {
        PlainOp::Input {
            owner,
            value,
            output,
        }
    }

    fn random_bit(output: Secret) -> PlainOp<T> {
        PlainOp::RandomBit { output }
    }
}

/// Message exchanged by plaintext operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PlainMessage<T> {
    /// Round marker without payload.
    Sync,
    Value(T),
}

/// Native operation of the plaintext engine.
pub enum PlainOp<T> {
    Linear {
        combination: LinearCombination<T>,
        output: Wire,
    },
    MulPublic {
        secret: Secret,
        public: Public,
        output: Secret,
    },
    Known {
        value: T,
        output: Secret,
    },
    Multiply {
        lhs: Secret,
        rhs: Secret,
        output: Secret,
    },
    Open {
        input: Secret,
        output: Public,
        target: Option<usize>,
    },
    Input {
        owner: usize,
        value: Option<T>,
        output: Secret,
    },
    RandomBit {
        output: Secret,
    },
    Broadcast {
        input: Public,
        outputs: Vec<Public>,
    },
}

impl<T: MpcField> NativeOp<MockMpcEngine<T>> for PlainOp<T> {
    fn name(&self) -> &'static str {
        match self {
            Self::Linear { .. } => "linear",
            Self::MulPublic { .. } => "mul_public",
            Self::Known { .. } => "known_value",
            Self::Multiply { .. } => "multiply",
            Self::Open { .. } => "open",
            Self::Input { .. } => "input",
            Self::RandomBit { .. } => "random_bit",
            Self::Broadcast { .. } => "broadcast",
        }
    }

    fn advance(
        &mut self,
        round: usize,
        engine: &mut MockMpcEngine<T>,
        io: &mut RoundIo<'_, MockMpcEngine<T>>,
    ) -> Result<Step, MpcError> {
        match (self, round) {
            (Self::Linear { combination, output }, 0) => {
                let mut acc = combination.constant;
                for (k, wire) in &combination.terms {
                    let x = match io.read(*wire)? {
                        SharedValue::Secret(share) => share.0,
                        SharedValue::Public(x) => x,
                        SharedValue::Withheld => {
                            return Err(Misuse::ValueWithheld(wire.cell().index()).into())
                        }
                    };
                    acc += *k * x;
                }
                let value = match output {
                    Wire::Secret(_) => SharedValue::Secret(PlainShare(acc)),
                    Wire::Public(_) => SharedValue::Public(acc),
                };
                io.write(*output, value)?;
                Ok(Step::Done)
            }
            (Self::MulPublic { secret, public, output }, 0) => {
                let share = io.read_secret(*secret)?;
                let k = io.read_public(*public)?;
                io.write_secret(*output, share * k)?;
                Ok(Step::Done)
            }
            (Self::Known { value, output }, 0) => {
                io.write_secret(*output, PlainShare(*value))?;
                Ok(Step::Done)
            }
            (Self::RandomBit { output }, 0) => {
                let bit = engine.next_random_bit()?;
                io.write_secret(*output, bit)?;
                Ok(Step::Done)
            }
            (Self::Multiply { .. }, 0) | (Self::Open { .. }, 0) => {
                io.broadcast(PlainMessage::Sync)?;
                Ok(Step::MoreRounds)
            }
            (Self::Multiply { lhs, rhs, output }, 1) => {
                expect_sync(io.receive_from_all()?)?;
                let x = io.read_secret(*lhs)?;
                let y = io.read_secret(*rhs)?;
                io.write_secret(*output, PlainShare(x.0 * y.0))?;
                engine.num_multiplications += 1;
                Ok(Step::Done)
            }
            (Self::Open { input, output, target }, 1) => {
                expect_sync(io.receive_from_all()?)?;
                let value = io.read_secret(*input)?.0;
                match target {
                    Some(party) if *party != engine.party_id() => io.write_withheld(*output)?,
                    _ => io.write_public(*output, value)?,
                }
                engine.num_openings += 1;
                Ok(Step::Done)
            }
            (Self::Input { owner, value, .. }, 0) => {
                if *owner == engine.party_id() {
                    let value = value.ok_or(Misuse::MissingInput)?;
                    io.broadcast(PlainMessage::Value(value))?;
                }
                Ok(Step::MoreRounds)
            }
            (Self::Input { owner, value, output }, 1) => {
                let value = match value {
                    Some(value) if *owner == engine.party_id() => *value,
                    _ => expect_value(*owner, io.receive_from(*owner)?)?,
                };
                io.write_secret(*output, PlainShare(value))?;
                Ok(Step::Done)
            }
            (Self::Broadcast { input, .. }, 0) => {
                let value = io.read_public(*input)?;
                io.broadcast(PlainMessage::Value(value))?;
                Ok(Step::MoreRounds)
            }
            (Self::Broadcast { input, outputs }, 1) => {
                let own = io.read_public(*input)?;
                let me = engine.party_id();
                let received = io.receive_from_all()?;
                io.write_public(outputs[me], own)?;
                for (party, msg) in received {
                    let value = expect_value(party, msg)?;
                    io.write_public(outputs[party], value)?;
                }
                Ok(Step::Done)
            }
            _ => Err(Misuse::OperationFinished(io.node()).into()),
        }
    }
}

fn expect_sync<T>(messages: Vec<(usize, PlainMessage<T>)>) -> Result<(), MpcError> {
    for (party, msg) in messages {
        if !matches!(msg, PlainMessage::Sync) {
            return Err(MpcError::malformed(party, "expected round marker"));
        }
    }
    Ok(())
}

fn expect_value<T>(party: usize, msg: PlainMessage<T>) -> Result<T, MpcError> {
    match msg {
        PlainMessage::Value(x) => Ok(x),
        PlainMessage::Sync => Err(MpcError::malformed(party, "expected value")),
    }
}

/// Mock share of a computation. Wraps plaintext value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlainShare<T>(pub T);

impl<T: MpcField> MpcShare for PlainShare<T> {
    type Field = T;

    fn zero() -> Self {
        PlainShare(T::zero())
    }
}

impl<T: Field> Add for PlainShare<T> {
    type Output = PlainShare<T>;
    fn add(self, rhs: Self) -> Self::Output {
        PlainShare(self.0 + rhs.0)
    }
}

impl<T: Field> Sub for PlainShare<T> {
    type Output = PlainShare<T>;
    fn sub(self, rhs: Self) -> Self::Output {
        PlainShare(self.0 - rhs.0)
    }
}

impl<T: Field> Neg for PlainShare<T> {
    type Output = PlainShare<T>;
    fn neg(self) -> Self::Output {
        PlainShare(-self.0)
    }
}

impl<T: Field> Mul<T> for PlainShare<T> {
    type Output = PlainShare<T>;
    fn mul(self, rhs: T) -> Self::Output {
        PlainShare(self.0 * rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fields::F251, testing::run_parties};

    type Fp = F251;

    fn engines(n: usize) -> Vec<MockMpcEngine<Fp>> {
        Session::all::<Fp>(n)
            .unwrap()
            .into_iter()
            .map(MockMpcEngine::new)
            .collect()
    }

    #[tokio::test]
    async fn test_linear_combination_of_mixed_values() {
        let results = run_parties(engines(1), |s| {
            let x = s.input(0, Some(Fp::from(10)))?;
            let p = s.constant(Fp::from(3))?;
            let y = s.linear(&[(Fp::from(2), x.into()), (Fp::from(5), p.into())], Fp::from(1))?;
            let q = s.add_constant_public(p, Fp::from(4))?;
            Ok((y.as_secret()?, q))
        })
        .await;

        let (execution, (y, q), _) = results.into_iter().next().unwrap().unwrap();
        assert_eq!(execution.resolve(&y).unwrap(), PlainShare(Fp::from(36)));
        assert_eq!(execution.resolve(&q).unwrap(), Fp::from(7));
        assert_eq!(execution.stats().rounds, 1);
    }

    #[tokio::test]
    async fn test_open_to_single_party_withholds_value() {
        let results = run_parties(engines(3), |s| {
            let value = (s.party_id() == 1).then(|| Fp::from(42));
            let x = s.input(1, value)?;
            s.open_to(2, x)
        })
        .await;

        for (party, result) in results.into_iter().enumerate() {
            let (execution, opened, engine) = result.unwrap();
            if party == 2 {
                assert_eq!(execution.resolve(&opened).unwrap(), Fp::from(42));
            } else {
                assert!(matches!(
                    execution.resolve(&opened),
                    Err(MpcError::Misuse(Misuse::ValueWithheld(_)))
                ));
            }
            assert_eq!(engine.num_openings(), 1);
        }
    }

    #[tokio::test]
    async fn test_broadcast_collects_value_of_every_party() {
        let results = run_parties(engines(3), |s| {
            let own = s.constant(Fp::from(10 + s.party_id() as u64))?;
            s.broadcast(own)
        })
        .await;

        for result in results {
            let (execution, values, _) = result.unwrap();
            assert_eq!(
                execution.resolve(&values).unwrap(),
                vec![Fp::from(10), Fp::from(11), Fp::from(12)]
            );
        }
    }

    #[tokio::test]
    async fn test_random_bits_agree_across_parties() {
        let results = run_parties(engines(2), |s| {
            s.parallel(0..16, |s, _| {
                let bit = s.random_bit()?;
                s.open_to_all(bit)
            })
        })
        .await;

        let bits: Vec<Vec<Fp>> = results
            .into_iter()
            .map(|result| {
                let (execution, bits, _) = result.unwrap();
                execution.resolve(&bits).unwrap()
            })
            .collect();
        assert_eq!(bits[0], bits[1]);
        assert!(bits[0].iter().all(|&b| b == Fp::zero() || b == Fp::one()));
    }
}
