use std::mem;

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    Arithmetic, LinearCombination, Misuse, MpcContext, MpcDealer, MpcEngine, MpcError, MpcField,
    MpcShare, NativeOp, Opening, ProtocolViolation, Public, Randomness, RoundIo, Secret, Session,
    SharedValue, Step, Wire,
};

use super::{
    commitment::{self, BroadcastState, BroadcastValidator, Commitment, OpeningsDigest},
    SpdzDealer, SpdzShare,
};

/// SPDZ protocol message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SpdzMessage<T> {
    /// Value components of shares being opened.
    Shares(Vec<T>),
    /// Input minus mask, sent by the input owner.
    Masked(T),
    Commitment(Commitment),
    Opening(commitment::Opening<T>),
    Digest(OpeningsDigest),
}

/// Values revealed without MAC check, together with the shares they were opened from.
#[derive(Clone, Debug, Default)]
pub struct OpeningLog<T> {
    pub opened: Vec<T>,
    pub closed: Vec<SpdzShare<T>>,
}

impl<T> OpeningLog<T> {
    fn record(&mut self, value: T, share: SpdzShare<T>) {
        self.opened.push(value);
        self.closed.push(share);
    }

    pub fn len(&self) -> usize {
        self.opened.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opened.is_empty()
    }
}

/// SPDZ protocol implementation.
pub struct SpdzEngine<T, Dealer> {
    session: Session,
    dealer: Dealer,
    rng: StdRng,
    log: OpeningLog<T>,
}

impl<T, Dealer> SpdzEngine<T, Dealer>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    /// Create engine for given session. Dealer must serve the same party.
    pub fn new(session: Session, dealer: Dealer) -> Result<Self, MpcError> {
        session.ensure_matches("dealer", dealer.num_parties(), dealer.party_id())?;
        Ok(Self {
            session,
            dealer,
            rng: StdRng::from_entropy(),
            log: OpeningLog::default(),
        })
    }

    pub fn dealer(&self) -> &Dealer {
        &self.dealer
    }

    /// Values opened without MAC check so far.
    pub fn opening_log(&self) -> &OpeningLog<T> {
        &self.log
    }

    fn share_plain(&self, x: T) -> SpdzShare<T> {
        self.dealer.share_plain(x)
    }
}

impl<T, Dealer> MpcContext for SpdzEngine<T, Dealer>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    type Field = T;
    type Share = SpdzShare<T>;

    fn num_parties(&self) -> usize {
        self.session.num_parties()
    }

    fn party_id(&self) -> usize {
        self.session.party_id()
    }
}

impl<T, Dealer> MpcEngine for SpdzEngine<T, Dealer>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    type Message = SpdzMessage<T>;
    type Op = SpdzOp<T>;

    fn session(&self) -> &Session {
        &self.session
    }
}

impl<T, Dealer> Arithmetic for SpdzEngine<T, Dealer>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    fn linear(combination: LinearCombination<T>, output: Wire) -> SpdzOp<T> {
        SpdzOp::Linear {
            combination,
            output,
        }
    }

    fn mul_public(secret: Secret, public: Public, output: Secret) -> SpdzOp<T> {
        SpdzOp::MulPublic {
            secret,
            public,
            output,
        }
    }

    fn known_value(value: T, output: Secret) -> SpdzOp<T> {
        SpdzOp::Known { value, output }
    }

    fn multiply(lhs: Secret, rhs: Secret, output: Secret) -> SpdzOp<T> {
        SpdzOp::Multiply {
            lhs,
            rhs,
            output,
            state: MultiplyState::AwaitingSend,
        }
    }
}

impl<T, Dealer> Opening for SpdzEngine<T, Dealer>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    fn open_to_all(input: Secret, output: Public) -> SpdzOp<T> {
        SpdzOp::open(OpenMode::ToAll, input, output)
    }

    fn open_to(party: usize, input: Secret, output: Public) -> SpdzOp<T> {
        SpdzOp::open(OpenMode::ToParty(party), input, output)
    }

    fn open_unchecked(input: Secret, output: Public) -> SpdzOp<T> {
        SpdzOp::open(OpenMode::Unchecked, input, output)
    }

    fn broadcast(input: Public, outputs: Vec<Public>) -> SpdzOp<T> {
        SpdzOp::Broadcast {
            input,
            outputs,
            state: BroadcastOpState::AwaitingSend,
        }
    }
}

impl<T, Dealer> Randomness for SpdzEngine<T, Dealer>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    fn input(owner: usize, value: Option<T>, output: Secret) -> SpdzOp<T> {
        SpdzOp::Input {
            owner,
            value,
            output,
            state: InputState::AwaitingSend,
        }
    }

    fn random_bit(output: Secret) -> SpdzOp<T> {
        SpdzOp::RandomBit { output }
    }
}

/// How an opened value is revealed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Reveal to all parties, then check MAC.
    ToAll,
    /// Reveal to one party by opening the value masked with an input mask of that party.
    ToParty(usize),
    /// Reveal to all parties and only log the opening.
    Unchecked,
}

pub enum MultiplyState<T> {
    AwaitingSend,
    AwaitingReceive {
        epsilon: SpdzShare<T>,
        delta: SpdzShare<T>,
        triple: (SpdzShare<T>, SpdzShare<T>, SpdzShare<T>),
    },
}

pub enum InputState<T> {
    AwaitingSend,
    AwaitingReceive {
        mask: SpdzShare<T>,
        /// Input minus mask. Known up front only at the owner.
        masked: Option<T>,
    },
}

pub enum OpenState<T> {
    AwaitingSend,
    AwaitingShares {
        share: SpdzShare<T>,
        /// Plaintext input mask, held by the target of a single-party opening.
        mask: Option<T>,
    },
    Checking {
        value: T,
        mask: Option<T>,
        validator: BroadcastValidator<T>,
    },
}

pub enum BroadcastOpState<T> {
    AwaitingSend,
    Validating(BroadcastValidator<T>),
}

/// SPDZ native operation with its round state.
pub enum SpdzOp<T> {
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
    RandomBit {
        output: Secret,
    },
    Multiply {
        lhs: Secret,
        rhs: Secret,
        output: Secret,
        state: MultiplyState<T>,
    },
    Input {
        owner: usize,
        value: Option<T>,
        output: Secret,
        state: InputState<T>,
    },
    Open {
        mode: OpenMode,
        input: Secret,
        output: Public,
        state: OpenState<T>,
    },
    Broadcast {
        input: Public,
        outputs: Vec<Public>,
        state: BroadcastOpState<T>,
    },
}

impl<T> SpdzOp<T> {
    fn open(mode: OpenMode, input: Secret, output: Public) -> Self {
        Self::Open {
            mode,
            input,
            output,
            state: OpenState::AwaitingSend,
        }
    }
}

type Io<'a, 'b, T, Dealer> = &'a mut RoundIo<'b, SpdzEngine<T, Dealer>>;

impl<T, Dealer> NativeOp<SpdzEngine<T, Dealer>> for SpdzOp<T>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    fn name(&self) -> &'static str {
        match self {
            Self::Linear { .. } => "linear",
            Self::MulPublic { .. } => "mul_public",
            Self::Known { .. } => "known_value",
            Self::RandomBit { .. } => "random_bit",
            Self::Multiply { .. } => "multiply",
            Self::Input { .. } => "input",
            Self::Open {
                mode: OpenMode::Unchecked,
                ..
            } => "open_unchecked",
            Self::Open { .. } => "open",
            Self::Broadcast { .. } => "broadcast",
        }
    }

    fn advance(
        &mut self,
        _round: usize,
        engine: &mut SpdzEngine<T, Dealer>,
        io: Io<'_, '_, T, Dealer>,
    ) -> Result<Step, MpcError> {
        match self {
            Self::Linear {
                combination,
                output,
            } => {
                let value = linear(engine, io, combination, *output)?;
                io.write(*output, value)?;
                Ok(Step::Done)
            }
            Self::MulPublic {
                secret,
                public,
                output,
            } => {
                let share = io.read_secret(*secret)?;
                let k = io.read_public(*public)?;
                io.write_secret(*output, share * k)?;
                Ok(Step::Done)
            }
            Self::Known { value, output } => {
                io.write_secret(*output, engine.share_plain(*value))?;
                Ok(Step::Done)
            }
            Self::RandomBit { output } => {
                let bit = engine.dealer.next_random_bit()?;
                io.write_secret(*output, bit)?;
                Ok(Step::Done)
            }
            Self::Multiply {
                lhs,
                rhs,
                output,
                state,
            } => multiply(engine, io, *lhs, *rhs, *output, state),
            Self::Input {
                owner,
                value,
                output,
                state,
            } => input(engine, io, *owner, *value, *output, state),
            Self::Open {
                mode,
                input,
                output,
                state,
            } => open(engine, io, *mode, *input, *output, state),
            Self::Broadcast {
                input,
                outputs,
                state,
            } => broadcast(engine, io, *input, outputs, state),
        }
    }
}

/// Evaluate linear combination. Public parts enter the sharing at the canonical party only.
fn linear<T, Dealer>(
    engine: &SpdzEngine<T, Dealer>,
    io: Io<'_, '_, T, Dealer>,
    combination: &LinearCombination<T>,
    output: Wire,
) -> Result<SharedValue<SpdzShare<T>, T>, MpcError>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    let mut public = combination.constant;
    let mut secret = SpdzShare::zero();
    for &(k, wire) in &combination.terms {
        match io.read(wire)? {
            SharedValue::Secret(share) => secret = secret + share * k,
            SharedValue::Public(x) => public += k * x,
            SharedValue::Withheld => return Err(Misuse::ValueWithheld(wire.cell().index()).into()),
        }
    }
    Ok(match output {
        Wire::Secret(_) => SharedValue::Secret(secret + engine.share_plain(public)),
        Wire::Public(_) => SharedValue::Public(public),
    })
}

fn multiply<T, Dealer>(
    engine: &mut SpdzEngine<T, Dealer>,
    io: Io<'_, '_, T, Dealer>,
    lhs: Secret,
    rhs: Secret,
    output: Secret,
    state: &mut MultiplyState<T>,
) -> Result<Step, MpcError>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    match mem::replace(state, MultiplyState::AwaitingSend) {
        MultiplyState::AwaitingSend => {
            let x = io.read_secret(lhs)?;
            let y = io.read_secret(rhs)?;
            let triple = engine.dealer.next_beaver_triple()?;
            let epsilon = x - triple.0;
            let delta = y - triple.1;
            io.broadcast(SpdzMessage::Shares(vec![epsilon.value, delta.value]))?;
            *state = MultiplyState::AwaitingReceive {
                epsilon,
                delta,
                triple,
            };
            Ok(Step::MoreRounds)
        }
        MultiplyState::AwaitingReceive {
            epsilon,
            delta,
            triple: (a, b, c),
        } => {
            let opened = sum_shares(io, vec![epsilon.value, delta.value])?;
            let (e, d) = (opened[0], opened[1]);
            engine.log.record(e, epsilon);
            engine.log.record(d, delta);

            let product = c + b * e + a * d + engine.share_plain(e * d);
            io.write_secret(output, product)?;
            Ok(Step::Done)
        }
    }
}

fn input<T, Dealer>(
    engine: &mut SpdzEngine<T, Dealer>,
    io: Io<'_, '_, T, Dealer>,
    owner: usize,
    value: Option<T>,
    output: Secret,
    state: &mut InputState<T>,
) -> Result<Step, MpcError>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    match mem::replace(state, InputState::AwaitingSend) {
        InputState::AwaitingSend => {
            let mask = engine.dealer.next_input_mask(owner)?;
            let masked = match (owner == engine.party_id(), mask.plain) {
                (true, Some(plain)) => {
                    let masked = value.ok_or(Misuse::MissingInput)? - plain;
                    io.broadcast(SpdzMessage::Masked(masked))?;
                    Some(masked)
                }
                (true, None) => return Err(Misuse::MissingInput.into()),
                (false, _) => None,
            };
            *state = InputState::AwaitingReceive {
                mask: mask.share,
                masked,
            };
            Ok(Step::MoreRounds)
        }
        InputState::AwaitingReceive { mask, masked } => {
            let masked = match masked {
                Some(masked) => masked,
                None => match io.receive_from(owner)? {
                    SpdzMessage::Masked(masked) => masked,
                    _ => return Err(MpcError::malformed(owner, "expected masked input")),
                },
            };
            io.write_secret(output, mask + engine.share_plain(masked))?;
            Ok(Step::Done)
        }
    }
}

fn open<T, Dealer>(
    engine: &mut SpdzEngine<T, Dealer>,
    io: Io<'_, '_, T, Dealer>,
    mode: OpenMode,
    input: Secret,
    output: Public,
    state: &mut OpenState<T>,
) -> Result<Step, MpcError>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    match mem::replace(state, OpenState::AwaitingSend) {
        OpenState::AwaitingSend => {
            let mut share = io.read_secret(input)?;
            let mut mask = None;
            if let OpenMode::ToParty(target) = mode {
                let input_mask = engine.dealer.next_input_mask(target)?;
                share = share + input_mask.share;
                mask = input_mask.plain;
            }
            io.broadcast(SpdzMessage::Shares(vec![share.value]))?;
            *state = OpenState::AwaitingShares { share, mask };
            Ok(Step::MoreRounds)
        }
        OpenState::AwaitingShares { share, mask } => {
            let value = sum_shares(io, vec![share.value])?[0];
            if mode == OpenMode::Unchecked {
                engine.log.record(value, share);
                io.write_public(output, value)?;
                return Ok(Step::Done);
            }

            // Share of MAC of the opened value minus the key times the value. Sums to zero.
            let sigma = share.mac - engine.dealer.authentication_key_share() * value;
            let validator = BroadcastValidator::new(
                engine.num_parties(),
                engine.party_id(),
                vec![sigma],
                &mut engine.rng,
            )?;
            io.broadcast(SpdzMessage::Commitment(validator.commitment()?))?;
            *state = OpenState::Checking {
                value,
                mask,
                validator,
            };
            Ok(Step::MoreRounds)
        }
        OpenState::Checking {
            value,
            mask,
            mut validator,
        } => {
            if validate(io, &mut validator)? == Step::MoreRounds {
                *state = OpenState::Checking {
                    value,
                    mask,
                    validator,
                };
                return Ok(Step::MoreRounds);
            }

            let sigma_sum = validator
                .values()?
                .into_iter()
                .flatten()
                .fold(T::zero(), |acc, x| acc + x);
            if sigma_sum != T::zero() {
                return Err(ProtocolViolation::MacMismatch.into());
            }
            trace!(node = io.node(), "MAC check passed");

            match mode {
                OpenMode::ToParty(target) if target != engine.party_id() => {
                    io.write_withheld(output)?
                }
                OpenMode::ToParty(_) => {
                    let mask = mask.ok_or(Misuse::ValueWithheld(output.cell().index()))?;
                    io.write_public(output, value - mask)?
                }
                _ => io.write_public(output, value)?,
            }
            Ok(Step::Done)
        }
    }
}

fn broadcast<T, Dealer>(
    engine: &mut SpdzEngine<T, Dealer>,
    io: Io<'_, '_, T, Dealer>,
    input: Public,
    outputs: &[Public],
    state: &mut BroadcastOpState<T>,
) -> Result<Step, MpcError>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    match mem::replace(state, BroadcastOpState::AwaitingSend) {
        BroadcastOpState::AwaitingSend => {
            let value = io.read_public(input)?;
            let validator = BroadcastValidator::new(
                engine.num_parties(),
                engine.party_id(),
                vec![value],
                &mut engine.rng,
            )?;
            io.broadcast(SpdzMessage::Commitment(validator.commitment()?))?;
            *state = BroadcastOpState::Validating(validator);
            Ok(Step::MoreRounds)
        }
        BroadcastOpState::Validating(mut validator) => {
            if validate(io, &mut validator)? == Step::MoreRounds {
                *state = BroadcastOpState::Validating(validator);
                return Ok(Step::MoreRounds);
            }
            for (values, &output) in validator.values()?.into_iter().zip(outputs) {
                let value = values
                    .first()
                    .copied()
                    .ok_or(Misuse::ValidatorOutOfOrder("empty broadcast"))?;
                io.write_public(output, value)?;
            }
            Ok(Step::Done)
        }
    }
}

/// Advance commitment-validated broadcast by one network round.
/// Returns `Step::Done` once the values of all parties are validated.
fn validate<T, Dealer>(
    io: Io<'_, '_, T, Dealer>,
    validator: &mut BroadcastValidator<T>,
) -> Result<Step, MpcError>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    match validator.state() {
        BroadcastState::AwaitingCommitments => {
            let commitments = receive_all(io, |msg| match msg {
                SpdzMessage::Commitment(commitment) => Some(commitment),
                _ => None,
            })?;
            validator.receive_commitments(commitments)?;
            io.broadcast(SpdzMessage::Opening(validator.opening()))?;
            Ok(Step::MoreRounds)
        }
        BroadcastState::AwaitingOpenings => {
            let openings = receive_all(io, |msg| match msg {
                SpdzMessage::Opening(opening) => Some(opening),
                _ => None,
            })?;
            validator.receive_openings(openings)?;
            if validator.state() == BroadcastState::AwaitingDigests {
                io.broadcast(SpdzMessage::Digest(validator.digest()?))?;
                Ok(Step::MoreRounds)
            } else {
                Ok(Step::Done)
            }
        }
        BroadcastState::AwaitingDigests => {
            let digests = receive_all(io, |msg| match msg {
                SpdzMessage::Digest(digest) => Some(digest),
                _ => None,
            })?;
            validator.receive_digests(digests)?;
            Ok(Step::Done)
        }
        BroadcastState::Validated | BroadcastState::Inconsistent => {
            Err(Misuse::ValidatorOutOfOrder("another round").into())
        }
    }
}

/// Receive one message of the expected kind from every other party.
fn receive_all<T, Dealer, M>(
    io: Io<'_, '_, T, Dealer>,
    extract: impl Fn(SpdzMessage<T>) -> Option<M>,
) -> Result<Vec<(usize, M)>, MpcError>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    io.receive_from_all()?
        .into_iter()
        .map(|(party, msg)| {
            extract(msg)
                .map(|x| (party, x))
                .ok_or_else(|| MpcError::malformed(party, "unexpected message kind"))
        })
        .collect()
}

/// Add value components received from every other party to own components.
fn sum_shares<T, Dealer>(io: Io<'_, '_, T, Dealer>, own: Vec<T>) -> Result<Vec<T>, MpcError>
where
    T: MpcField,
    Dealer: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    let received = receive_all(io, |msg| match msg {
        SpdzMessage::Shares(parts) => Some(parts),
        _ => None,
    })?;

    let mut sums = own;
    for (party, parts) in received {
        if parts.len() != sums.len() {
            return Err(MpcError::malformed(party, "number of shares mismatched"));
        }
        for (sum, part) in sums.iter_mut().zip(parts) {
            *sum += part;
        }
    }
    Ok(sums)
}

#[cfg(test)]
mod tests {
    use ff::Field;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        error::Preprocessed,
        fields::F251,
        spdz::{
            FakeSpdzDealer, InputMask, PrecomputedSpdzData, PrecomputedSpdzDealer,
            PreprocessingCounts,
        },
        executor::RoundBundle,
        testing::run_parties,
        transport::{mock_multiparty_channels, LocalTransport, Network},
        Circuit, MpcExecutor, Scope,
    };

    type Fp = F251;
    type FakeEngine = SpdzEngine<Fp, FakeSpdzDealer<Fp>>;

    fn fake_engines(n: usize) -> Vec<FakeEngine> {
        Session::all::<Fp>(n)
            .unwrap()
            .into_iter()
            .map(|session| {
                let dealer = FakeSpdzDealer::new(&session, 17);
                SpdzEngine::new(session, dealer).unwrap()
            })
            .collect()
    }

    fn precomputed_engines(
        key_shares: &[Fp],
        counts: PreprocessingCounts,
    ) -> Vec<SpdzEngine<Fp, PrecomputedSpdzDealer<Fp>>> {
        let data = PrecomputedSpdzData::generate(key_shares, counts, StdRng::seed_from_u64(5));
        Session::all::<Fp>(key_shares.len())
            .unwrap()
            .into_iter()
            .zip(data)
            .map(|(session, data)| {
                SpdzEngine::new(session, PrecomputedSpdzDealer::new(data)).unwrap()
            })
            .collect()
    }

    fn reconstruct(shares: impl IntoIterator<Item = SpdzShare<Fp>>) -> SpdzShare<Fp> {
        shares.into_iter().fold(SpdzShare::zero(), |acc, x| acc + x)
    }

    /// Input value as passed by party of given scope: only the owner knows it.
    fn input_of<E: MpcEngine>(s: &Scope<'_, E>, owner: usize, x: u64) -> Option<Fp> {
        (s.party_id() == owner).then(|| Fp::from(x))
    }

    #[tokio::test]
    async fn test_multiplication_keeps_mac_relation() {
        let engines = fake_engines(3);
        let alpha = engines[0].dealer().authentication_key();

        let results = run_parties(engines, |s| {
            let x = s.input(0, input_of(s, 0, 12))?;
            let y = s.input(1, input_of(s, 1, 20))?;
            let z = s.multiply(x, y)?;
            let opened = s.open_to_all(z)?;
            Ok((z, opened))
        })
        .await;

        let mut shares = Vec::new();
        for result in results {
            let (execution, (z, opened), engine) = result.unwrap();
            assert_eq!(execution.resolve(&opened).unwrap(), Fp::from(240));
            assert_eq!(engine.opening_log().len(), 2);
            shares.push(execution.resolve(&z).unwrap());
        }
        let z = reconstruct(shares);
        assert_eq!(z.value(), Fp::from(240));
        assert_eq!(z.mac(), z.value() * alpha);
    }

    #[tokio::test]
    async fn test_linear_operations_with_constants() {
        let results = run_parties(fake_engines(2), |s| {
            let x = s.input(1, input_of(s, 1, 7))?;
            let k = s.constant(Fp::from(3))?;
            let y = s.scale(x, Fp::from(5))?;
            let y = s.add_constant(y, Fp::from(2))?;
            let y = s.add_public(y, k)?;
            let y = s.sub(y, x)?;
            let y = s.mul_public(y, k)?;
            let y = s.neg(y)?;
            s.open_to_all(y)
        })
        .await;

        // -((5 * 7 + 2 + 3 - 7) * 3) = -99
        for result in results {
            let (execution, opened, _) = result.unwrap();
            assert_eq!(execution.resolve(&opened).unwrap(), -Fp::from(99));
        }
    }

    #[tokio::test]
    async fn test_end_to_end_input_over_small_field() {
        let key_shares = [Fp::from(11231), Fp::from(7719)];
        let counts = PreprocessingCounts {
            beaver_triples: 0,
            random_bits: 0,
            input_masks: 1,
        };
        let engines = precomputed_engines(&key_shares, counts);

        let results = run_parties(engines, |s| {
            let value = (s.party_id() == 0).then(|| Fp::from(12345));
            s.input(0, value)
        })
        .await;

        let shares: Vec<_> = results
            .into_iter()
            .map(|result| {
                let (execution, x, _) = result.unwrap();
                execution.resolve(&x).unwrap()
            })
            .collect();
        let x = reconstruct(shares);
        assert_eq!(x.value(), Fp::from(46));
        assert_eq!(x.mac(), Fp::from(46) * Fp::from(125));
    }

    #[tokio::test]
    async fn test_triples_run_out_on_third_multiplication() {
        let counts = PreprocessingCounts {
            beaver_triples: 2,
            random_bits: 0,
            input_masks: 0,
        };
        let engines = precomputed_engines(&[Fp::from(3), Fp::from(4)], counts);

        let results = run_parties(engines, |s| {
            let x = s.known_value(Fp::from(2))?;
            let mut acc = x;
            for _ in 0..3 {
                acc = s.multiply(acc, x)?;
            }
            Ok(acc)
        })
        .await;

        for result in results {
            assert!(matches!(
                result,
                Err(MpcError::Exhausted(Preprocessed::BeaverTriple))
            ));
        }
    }

    #[tokio::test]
    async fn test_independent_multiplications_share_one_exchange() {
        let results = run_parties(fake_engines(3), |s| {
            let x = s.known_value(Fp::from(3))?;
            s.parallel(1..=8u64, |s, i| {
                let y = s.known_value(Fp::from(i))?;
                s.multiply(x, y)
            })
        })
        .await;

        for result in results {
            let (execution, products, engine) = result.unwrap();
            assert_eq!(execution.stats().rounds, 1);
            assert_eq!(engine.opening_log().len(), 16);
            assert_eq!(products.len(), 8);
        }
    }

    #[tokio::test]
    async fn test_open_to_single_party() {
        let results = run_parties(fake_engines(3), |s| {
            let x = s.input(0, input_of(s, 0, 99))?;
            s.open_to(1, x)
        })
        .await;

        for (party, result) in results.into_iter().enumerate() {
            let (execution, opened, _) = result.unwrap();
            match party {
                1 => assert_eq!(execution.resolve(&opened).unwrap(), Fp::from(99)),
                _ => assert!(execution.resolve(&opened).is_err()),
            }
        }
    }

    #[tokio::test]
    async fn test_validated_broadcast() {
        let results = run_parties(fake_engines(3), |s| {
            let own = s.constant(Fp::from(100 + s.party_id() as u64))?;
            s.broadcast(own)
        })
        .await;

        for result in results {
            let (execution, values, _) = result.unwrap();
            assert_eq!(
                execution.resolve(&values).unwrap(),
                vec![Fp::from(100), Fp::from(101), Fp::from(102)]
            );
            // Commitments, openings and digests.
            assert_eq!(execution.stats().rounds, 3);
        }
    }

    #[tokio::test]
    async fn test_random_bits_are_bits() {
        let results = run_parties(fake_engines(2), |s| {
            s.parallel(0..8, |s, _| {
                let bit = s.random_bit()?;
                s.open_unchecked(bit)
            })
        })
        .await;

        for result in results {
            let (execution, bits, _) = result.unwrap();
            for bit in execution.resolve(&bits).unwrap() {
                assert!(bit == Fp::zero() || bit == Fp::one());
            }
        }
    }

    /// Dealer that hands out triples whose product share is off by one at party 1.
    struct CorruptingDealer(FakeSpdzDealer<Fp>);

    impl MpcContext for CorruptingDealer {
        type Field = Fp;
        type Share = SpdzShare<Fp>;

        fn num_parties(&self) -> usize {
            self.0.num_parties()
        }

        fn party_id(&self) -> usize {
            self.0.party_id()
        }
    }

    impl MpcDealer for CorruptingDealer {
        fn share_plain(&self, x: Fp) -> SpdzShare<Fp> {
            self.0.share_plain(x)
        }

        fn next_beaver_triple(
            &mut self,
        ) -> Result<(SpdzShare<Fp>, SpdzShare<Fp>, SpdzShare<Fp>), MpcError> {
            let (a, b, c) = self.0.next_beaver_triple()?;
            if self.party_id() == 1 {
                return Ok((a, b, SpdzShare::new(c.value() + Fp::one(), c.mac())));
            }
            Ok((a, b, c))
        }

        fn next_random_bit(&mut self) -> Result<SpdzShare<Fp>, MpcError> {
            self.0.next_random_bit()
        }
    }

    impl SpdzDealer for CorruptingDealer {
        fn authentication_key_share(&self) -> Fp {
            self.0.authentication_key_share()
        }

        fn next_input_mask(&mut self, owner: usize) -> Result<InputMask<Fp>, MpcError> {
            self.0.next_input_mask(owner)
        }
    }

    #[tokio::test]
    async fn test_corrupted_triple_fails_mac_check() {
        let engines: Vec<_> = Session::all::<Fp>(2)
            .unwrap()
            .into_iter()
            .map(|session| {
                let dealer = CorruptingDealer(FakeSpdzDealer::new(&session, 23));
                SpdzEngine::new(session, dealer).unwrap()
            })
            .collect();

        let results = run_parties(engines, |s| {
            let x = s.known_value(Fp::from(6))?;
            let y = s.known_value(Fp::from(7))?;
            let z = s.multiply(x, y)?;
            let unchecked = s.open_unchecked(z)?;
            let checked = s.open_to_all(z)?;
            Ok((unchecked, checked))
        })
        .await;

        for result in results {
            assert!(matches!(
                result,
                Err(MpcError::Protocol(ProtocolViolation::MacMismatch))
            ));
        }
    }

    #[test]
    fn test_rejects_dealer_of_other_party() {
        let sessions = Session::all::<Fp>(2).unwrap();
        let dealer = FakeSpdzDealer::<Fp>::new(&sessions[1], 1);
        assert!(matches!(
            SpdzEngine::new(sessions[0].clone(), dealer),
            Err(MpcError::Config(_))
        ));
    }

    /// Play party 2 of a three-party opening that shows party 0 and party 1 different
    /// MAC check shares, each under a commitment matching what that party receives.
    async fn equivocate_in_mac_check(peer: &mut LocalTransport, to_first: Fp, to_second: Fp) {
        let mut rng = StdRng::seed_from_u64(21);
        let faces = [
            BroadcastValidator::new(3, 2, vec![to_first], &mut rng).unwrap(),
            BroadcastValidator::new(3, 2, vec![to_second], &mut rng).unwrap(),
        ];
        // Shares, commitments, openings and digests.
        for _ in 0..4 {
            let mut replies = Vec::new();
            for party in 0..2 {
                let bytes = peer.receive_from(party).await.unwrap();
                let bundle: RoundBundle<SpdzMessage<Fp>> = bincode::deserialize(&bytes).unwrap();
                let face = &faces[party];
                let entries = bundle
                    .entries
                    .into_iter()
                    .map(|(node, msg)| {
                        let reply = match msg {
                            SpdzMessage::Shares(_) => SpdzMessage::Shares(vec![Fp::zero()]),
                            SpdzMessage::Commitment(_) => {
                                SpdzMessage::Commitment(face.commitment().unwrap())
                            }
                            SpdzMessage::Opening(_) => SpdzMessage::Opening(face.opening()),
                            // Echo the digest of the recipient.
                            other => other,
                        };
                        (node, reply)
                    })
                    .collect();
                let round = bundle.round;
                replies.push((party, RoundBundle { round, entries }));
            }
            for (party, bundle) in replies {
                let bytes = bincode::serialize(&bundle).unwrap();
                peer.send_to(party, bytes).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_equivocation_in_mac_check_fails_opening() {
        let mut engines = fake_engines(3);
        engines.truncate(2);
        let mut networks = mock_multiparty_channels::<Vec<u8>>(3, 1 << 16);
        let mut peer = networks.pop().unwrap();

        let honest = engines
            .into_iter()
            .zip(networks)
            .map(|(mut engine, mut network)| async move {
                let session = engine.session().clone();
                let (circuit, _) = Circuit::<FakeEngine>::build(session, |s| {
                    let x = s.known_value(Fp::from(5))?;
                    s.open_to_all(x)
                })?;
                MpcExecutor::new(&mut engine, &mut network)
                    .run_circuit(circuit)
                    .await
                    .map(|_| ())
            });
        let (results, ()) = futures::join!(
            futures::future::join_all(honest),
            equivocate_in_mac_check(&mut peer, Fp::from(1), Fp::from(2)),
        );

        assert_eq!(results.len(), 2);
        for result in results {
            assert!(matches!(
                result,
                Err(MpcError::Protocol(ProtocolViolation::InconsistentBroadcast { .. }))
            ));
        }
    }
}
