pub mod commitment;
pub use commitment::{BroadcastState, BroadcastValidator, Commitment, OpeningsDigest};

mod engine;
pub use engine::{OpenMode, OpeningLog, SpdzEngine, SpdzMessage, SpdzOp};

mod fake_dealer;
pub use fake_dealer::FakeSpdzDealer;

mod precomp_dealer;
pub use precomp_dealer::{PrecomputedSpdzData, PrecomputedSpdzDealer, PreprocessingCounts};

mod share;
pub use share::SpdzShare;

use crate::{MpcDealer, MpcError};

/// Sharing of a random value whose plaintext is known to one party only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputMask<T> {
    pub share: SpdzShare<T>,
    /// Plaintext mask. `Some` only at the party the mask belongs to.
    pub plain: Option<T>,
}

/// Dealer of precomputed parameters for SPDZ protocol.
pub trait SpdzDealer: MpcDealer {
    /// Raw sharing of random authentication key.
    fn authentication_key_share(&self) -> Self::Field;

    /// Next input mask of party `owner`. Every party must request masks of the same owners
    /// in the same order.
    fn next_input_mask(&mut self, owner: usize) -> Result<InputMask<Self::Field>, MpcError>;
}
