use std::fmt;

use thiserror::Error;

use crate::{session::ConfigError, transport::TransportError};

/// Failure of an MPC computation. Every variant is fatal for the computation in flight.
#[derive(Debug, Error)]
pub enum MpcError {
    /// Some party deviated from the protocol, or a message could not be interpreted.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    /// Preprocessing supplier ran out of correlated randomness.
    #[error("preprocessing exhausted: no {0} left")]
    Exhausted(Preprocessed),
    /// Circuit was built or evaluated incorrectly by the caller.
    #[error("invalid circuit: {0}")]
    Misuse(#[from] Misuse),
    /// Network failure, reported unchanged.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    /// Session configuration is inconsistent.
    #[error("invalid session configuration: {0}")]
    Config(#[from] ConfigError),
}

impl MpcError {
    /// Shortcut for a malformed message from given party.
    pub fn malformed(party: usize, reason: impl Into<String>) -> Self {
        ProtocolViolation::MalformedMessage {
            party,
            reason: reason.into(),
        }
        .into()
    }

    /// Is this a detected deviation from the protocol?
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

/// Detected deviation from the protocol.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("MAC check failed for opened value")]
    MacMismatch,
    #[error("opening of party {party} does not match its commitment")]
    CommitmentMismatch { party: usize },
    #[error("party {party} observed a different set of broadcast values")]
    InconsistentBroadcast { party: usize },
    #[error("malformed message from party {party}: {reason}")]
    MalformedMessage { party: usize, reason: String },
    #[error("missing message from party {party} for operation {node}")]
    MissingMessage { party: usize, node: usize },
    #[error("unexpected message from party {party} for operation {node}")]
    UnexpectedMessage { party: usize, node: usize },
}

/// Kind of preprocessed material.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preprocessed {
    BeaverTriple,
    InputMask { owner: usize },
    RandomBit,
}

impl fmt::Display for Preprocessed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BeaverTriple => write!(f, "beaver triples"),
            Self::InputMask { owner } => write!(f, "input masks for party {}", owner),
            Self::RandomBit => write!(f, "random bits"),
        }
    }
}

/// Programming error in circuit construction, rejected before any network traffic where possible.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Misuse {
    #[error("cell {0} does not belong to this circuit")]
    UnknownCell(usize),
    #[error("cell {0} was read before its producer completed")]
    UnresolvedCell(usize),
    #[error("cell {0} was written twice")]
    CellWrittenTwice(usize),
    #[error("cell {cell} does not hold a {expected} value")]
    KindMismatch { cell: usize, expected: &'static str },
    #[error("cell {0} holds a value revealed to another party")]
    ValueWithheld(usize),
    #[error("paired inputs have different lengths ({left} and {right})")]
    DimensionMismatch { left: usize, right: usize },
    #[error("party {0} does not participate in this session")]
    InvalidParty(usize),
    #[error("input owner must provide a value")]
    MissingInput,
    #[error("only the input owner may provide a value")]
    UnexpectedInput,
    #[error("loop body returned {actual:?} instead of {expected:?}")]
    LoopShapeMismatch {
        expected: Vec<&'static str>,
        actual: Vec<&'static str>,
    },
    #[error("loop exceeded {0} iterations")]
    LoopBoundExceeded(usize),
    #[error("operation {0} advanced after completion")]
    OperationFinished(usize),
    #[error("{0} operations can never become runnable")]
    Stalled(usize),
    #[error("broadcast validator cannot accept {0} in its current state")]
    ValidatorOutOfOrder(&'static str),
}
