use std::{
    fmt::Debug,
    ops::{Add, Mul, Neg, Sub},
};

use serde::{de::DeserializeOwned, Serialize};

pub mod circuits;
pub mod error;
pub mod executor;
pub mod fields;
pub mod graph;
pub mod plaintext;
pub mod scope;
pub mod session;
pub mod spdz;
pub mod testing;
pub mod transport;
pub mod value;

pub use ff;

pub use error::{Misuse, MpcError, Preprocessed, ProtocolViolation};
pub use executor::{MpcExecution, MpcExecutionStats, MpcExecutor, NodeTiming, RoundIo};
pub use fields::MpcField;
pub use scope::{Circuit, Scope};
pub use session::{Session, SessionConfig};
pub use value::{LinearCombination, Public, Secret, SharedValue, Wire};

/// Private share of a field element.
/// Sharing is linear: addition and scaling by public field elements need no communication.
pub trait MpcShare:
    Copy
    + Clone
    + Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Neg<Output = Self>
    + Mul<Self::Field, Output = Self>
{
    /// Field type of value represented by this share.
    type Field: MpcField;

    /// Sharing of zero that every party can compute locally.
    fn zero() -> Self;
}

/// Sharing-based MPC computation context.
pub trait MpcContext {
    /// Field type used by this MPC protocol.
    type Field: MpcField;

    /// Share type used by this MPC protocol.
    type Share: MpcShare<Field = Self::Field>;

    /// Number of parties participating in MPC computation.
    fn num_parties(&self) -> usize;

    /// ID of current party.
    fn party_id(&self) -> usize;
}

/// Supplier of precomputed correlated randomness.
/// Each call consumes material for good; running out is fatal.
pub trait MpcDealer: MpcContext {
    /// Sharing of a public value.
    fn share_plain(&self, x: Self::Field) -> Self::Share;

    /// Random sharing of a secret random triple (a, b, c) that satisfies ab = c.
    fn next_beaver_triple(&mut self) -> Result<(Self::Share, Self::Share, Self::Share), MpcError>;

    /// Random sharing of a secret random bit.
    fn next_random_bit(&mut self) -> Result<Self::Share, MpcError>;

    /// Decimal representation of the field modulus.
    fn modulus(&self) -> &'static str {
        Self::Field::MODULUS
    }
}

/// Outcome of advancing a native operation by one round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Operation sent messages and waits for the next network round.
    MoreRounds,
    /// Operation wrote its outputs and holds no more state.
    Done,
}

/// Atomic protocol step driven round by round by the executor.
pub trait NativeOp<E: MpcEngine> {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Advance operation. `round` is 0 on first call and grows by one after every network round.
    /// Messages received for this operation during the last network round are available in `io`.
    fn advance(&mut self, round: usize, engine: &mut E, io: &mut RoundIo<'_, E>)
        -> Result<Step, MpcError>;
}

/// Protocol suite that evaluates native operations of a circuit.
pub trait MpcEngine: MpcContext + Sized {
    /// Payload exchanged between instances of the same operation at different parties.
    type Message: Clone + Debug + Serialize + DeserializeOwned;

    /// Native operation with its round state.
    type Op: NativeOp<Self>;

    /// Session this engine was set up for.
    fn session(&self) -> &Session;
}

/// Local linear algebra and multiplication.
pub trait Arithmetic: MpcEngine {
    /// Evaluate linear combination. Output is secret iff some term is secret.
    fn linear(combination: LinearCombination<Self::Field>, output: Wire) -> Self::Op;

    /// Multiply secret value by public value computed at runtime.
    fn mul_public(secret: Secret, public: Public, output: Secret) -> Self::Op;

    /// Sharing of a constant known to everybody.
    fn known_value(value: Self::Field, output: Secret) -> Self::Op;

    /// Multiply two secret values. Requires communication.
    fn multiply(lhs: Secret, rhs: Secret, output: Secret) -> Self::Op;
}

/// Revealing of secret values.
pub trait Opening: MpcEngine {
    /// Reveal value to all parties and check its integrity.
    fn open_to_all(input: Secret, output: Public) -> Self::Op;

    /// Reveal value to a single party. Other parties learn nothing.
    fn open_to(party: usize, input: Secret, output: Public) -> Self::Op;

    /// Reveal value to all parties without integrity check.
    fn open_unchecked(input: Secret, output: Public) -> Self::Op;

    /// Broadcast local public value and check that every party received the same values.
    fn broadcast(input: Public, outputs: Vec<Public>) -> Self::Op;
}

/// Private inputs and shared randomness.
pub trait Randomness: MpcEngine {
    /// Share value provided by party `owner`. Only the owner passes `Some`.
    fn input(owner: usize, value: Option<Self::Field>, output: Secret) -> Self::Op;

    /// Sharing of a random bit unknown to every party.
    fn random_bit(output: Secret) -> Self::Op;
}
