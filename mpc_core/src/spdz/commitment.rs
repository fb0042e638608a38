use digest::Digest;
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha3::Sha3_256;
use tracing::error;

use crate::{transport::TransportError, Misuse, MpcError, ProtocolViolation};

/// Binding commitment to the values of one party.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    hash: [u8; 32],
}

/// Values of one party together with the randomness of its commitment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opening<F> {
    pub values: Vec<F>,
    pub nonce: [u8; 32],
}

/// Hash of all openings a party received, in party order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningsDigest {
    hash: [u8; 32],
}

impl<F: Serialize> Opening<F> {
    /// Commitment of `party` to these values.
    pub fn commit(&self, party: usize) -> Result<Commitment, MpcError> {
        let mut hasher = Sha3_256::new();
        hasher.update(encode(&self.values)?);
        hasher.update((party as u64).to_le_bytes());
        hasher.update(self.nonce);
        Ok(Commitment {
            hash: hasher.finalize().into(),
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MpcError> {
    bincode::serialize(value).map_err(|err| TransportError::Encode(err.to_string()).into())
}

/// Step of the validation protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastState {
    AwaitingCommitments,
    AwaitingOpenings,
    AwaitingDigests,
    Validated,
    Inconsistent,
}

/// Validation state machine of one party for one broadcast.
/// Independent of the network: the caller carries commitments, openings and digests.
pub struct BroadcastValidator<F> {
    num_parties: usize,
    party_id: usize,
    state: BroadcastState,
    own: Opening<F>,
    commitments: Vec<Option<Commitment>>,
    values: Vec<Option<Vec<F>>>,
}

impl<F> BroadcastValidator<F>
where
    F: Clone + Serialize + DeserializeOwned,
{
    /// Start broadcast of `values` by party `party_id`.
    pub fn new(
        num_parties: usize,
        party_id: usize,
        values: Vec<F>,
        rng: &mut impl RngCore,
    ) -> Result<Self, MpcError> {
        let mut nonce = [0u8; 32];
        rng.fill_bytes(&mut nonce);
        let own = Opening { values, nonce };

        let mut commitments = vec![None; num_parties];
        commitments[party_id] = Some(own.commit(party_id)?);
        let mut received = vec![None; num_parties];
        received[party_id] = Some(own.values.clone());

        Ok(Self {
            num_parties,
            party_id,
            state: BroadcastState::AwaitingCommitments,
            own,
            commitments,
            values: received,
        })
    }

    pub fn state(&self) -> BroadcastState {
        self.state
    }

    /// Own commitment, to be sent to every other party.
    pub fn commitment(&self) -> Result<Commitment, MpcError> {
        self.own.commit(self.party_id)
    }

    /// Own opening, to be sent once all commitments arrived.
    pub fn opening(&self) -> Opening<F> {
        self.own.clone()
    }

    /// Store commitments of every other party.
    pub fn receive_commitments(
        &mut self,
        commitments: Vec<(usize, Commitment)>,
    ) -> Result<(), MpcError> {
        self.expect_state(BroadcastState::AwaitingCommitments, "commitments")?;
        let result = self.store_commitments(commitments);
        self.settle(result)
    }

    fn store_commitments(
        &mut self,
        commitments: Vec<(usize, Commitment)>,
    ) -> Result<BroadcastState, MpcError> {
        for (party, commitment) in commitments {
            self.check_sender(party)?;
            self.commitments[party] = Some(commitment);
        }
        if let Some(party) = self.commitments.iter().position(Option::is_none) {
            return Err(MpcError::malformed(party, "no commitment received"));
        }
        Ok(BroadcastState::AwaitingOpenings)
    }

    /// Check openings of every other party against their commitments.
    pub fn receive_openings(&mut self, openings: Vec<(usize, Opening<F>)>) -> Result<(), MpcError> {
        self.expect_state(BroadcastState::AwaitingOpenings, "openings")?;
        let result = self.check_openings(openings);
        self.settle(result)
    }

    fn check_openings(
        &mut self,
        openings: Vec<(usize, Opening<F>)>,
    ) -> Result<BroadcastState, MpcError> {
        for (party, opening) in openings {
            self.check_sender(party)?;
            if opening.values.len() != self.own.values.len() {
                return Err(MpcError::malformed(party, "opening has wrong number of values"));
            }
            let commitment = self.commitments[party]
                .ok_or_else(|| MpcError::malformed(party, "opening without commitment"))?;
            if opening.commit(party)? != commitment {
                error!(party, "opening does not match commitment");
                return Err(ProtocolViolation::CommitmentMismatch { party }.into());
            }
            self.values[party] = Some(opening.values);
        }

        if let Some(party) = self.values.iter().position(Option::is_none) {
            return Err(MpcError::malformed(party, "no opening received"));
        }
        Ok(if self.num_parties >= 3 {
            BroadcastState::AwaitingDigests
        } else {
            BroadcastState::Validated
        })
    }

    /// Digest of all values seen by this party, to be sent to every other party.
    pub fn digest(&self) -> Result<OpeningsDigest, MpcError> {
        let mut hasher = Sha3_256::new();
        for (party, values) in self.values.iter().enumerate() {
            hasher.update((party as u64).to_le_bytes());
            hasher.update(encode(values)?);
        }
        Ok(OpeningsDigest {
            hash: hasher.finalize().into(),
        })
    }

    /// Compare digests of every other party with own digest.
    pub fn receive_digests(
        &mut self,
        digests: Vec<(usize, OpeningsDigest)>,
    ) -> Result<(), MpcError> {
        self.expect_state(BroadcastState::AwaitingDigests, "digests")?;
        let result = self.compare_digests(digests);
        self.settle(result)
    }

    fn compare_digests(
        &self,
        digests: Vec<(usize, OpeningsDigest)>,
    ) -> Result<BroadcastState, MpcError> {
        let own = self.digest()?;
        let mut received = vec![false; self.num_parties];
        received[self.party_id] = true;
        for (party, digest) in digests {
            self.check_sender(party)?;
            if digest != own {
                error!(party, "party saw different broadcast values");
                return Err(ProtocolViolation::InconsistentBroadcast { party }.into());
            }
            received[party] = true;
        }
        if let Some(party) = received.iter().position(|&seen| !seen) {
            return Err(MpcError::malformed(party, "no digest received"));
        }
        Ok(BroadcastState::Validated)
    }

    /// Values of all parties, ordered by party ID. Available once validated.
    pub fn values(&self) -> Result<Vec<Vec<F>>, MpcError> {
        self.expect_state(BroadcastState::Validated, "value lookup")?;
        self.values
            .iter()
            .map(|values| {
                values
                    .clone()
                    .ok_or_else(|| Misuse::ValidatorOutOfOrder("value lookup").into())
            })
            .collect()
    }

    fn expect_state(&self, expected: BroadcastState, what: &'static str) -> Result<(), MpcError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Misuse::ValidatorOutOfOrder(what).into())
        }
    }

    /// Move to the next step, or to `Inconsistent` for good on any failure.
    fn settle(&mut self, result: Result<BroadcastState, MpcError>) -> Result<(), MpcError> {
        match result {
            Ok(next) => {
                self.state = next;
                Ok(())
            }
            Err(err) => {
                self.state = BroadcastState::Inconsistent;
                Err(err)
            }
        }
    }

    fn check_sender(&self, party: usize) -> Result<(), MpcError> {
        if party < self.num_parties && party != self.party_id {
            Ok(())
        } else {
            Err(MpcError::malformed(party, "not a peer"))
        }
    }
}
