use std::{
    fs::File,
    io::{self, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MpcField;

/// Party that injects public constants into additive sharings.
pub const CANONICAL_PARTY: usize = 0;

/// Default statistical security parameter in bits.
pub const DEFAULT_STATISTICAL_SECURITY: usize = 40;

/// Largest statistical security parameter supported by 256-bit commitments.
pub const MAX_STATISTICAL_SECURITY: usize = 128;

/// Default cap on the number of iterations of a single loop.
pub const DEFAULT_MAX_LOOP_ITERATIONS: usize = 1 << 20;

/// Invalid session configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("session needs at least one party")]
    NoParties,
    #[error("party ID {party_id} is out of range for {num_parties} parties")]
    InvalidPartyId { party_id: usize, num_parties: usize },
    #[error("configured modulus {configured} does not match field modulus {actual}")]
    ModulusMismatch {
        configured: String,
        actual: &'static str,
    },
    #[error("statistical security parameter {0} is not supported")]
    SecurityParameter(usize),
    #[error("{component} is configured for {actual} parties and party {actual_id}, session has {expected} parties and party {expected_id}")]
    PartyMismatch {
        component: &'static str,
        expected: usize,
        expected_id: usize,
        actual: usize,
        actual_id: usize,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Raw session configuration, as read from a JSON file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionConfig {
    pub num_parties: usize,
    pub party_id: usize,
    /// Expected field modulus in decimal. Checked against the field type when present.
    #[serde(default)]
    pub modulus: Option<String>,
    #[serde(default = "default_statistical_security")]
    pub statistical_security: usize,
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,
}

fn default_statistical_security() -> usize {
    DEFAULT_STATISTICAL_SECURITY
}

fn default_max_loop_iterations() -> usize {
    DEFAULT_MAX_LOOP_ITERATIONS
}

impl SessionConfig {
    /// Configuration with default parameters.
    pub fn new(num_parties: usize, party_id: usize) -> Self {
        Self {
            num_parties,
            party_id,
            modulus: None,
            statistical_security: DEFAULT_STATISTICAL_SECURITY,
            max_loop_iterations: DEFAULT_MAX_LOOP_ITERATIONS,
        }
    }

    /// Load configuration from JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Parse configuration from JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Same configuration seen by another party.
    pub fn for_party(&self, party_id: usize) -> Self {
        Self {
            party_id,
            ..self.clone()
        }
    }

    /// Validate configuration for computations over field `F`.
    pub fn into_session<F: MpcField>(self) -> Result<Session, ConfigError> {
        if self.num_parties == 0 {
            return Err(ConfigError::NoParties);
        }
        if self.party_id >= self.num_parties {
            return Err(ConfigError::InvalidPartyId {
                party_id: self.party_id,
                num_parties: self.num_parties,
            });
        }
        if let Some(configured) = self.modulus {
            if configured.trim() != F::MODULUS {
                return Err(ConfigError::ModulusMismatch {
                    configured,
                    actual: F::MODULUS,
                });
            }
        }
        if self.statistical_security == 0 || self.statistical_security > MAX_STATISTICAL_SECURITY
        {
            return Err(ConfigError::SecurityParameter(self.statistical_security));
        }

        Ok(Session {
            num_parties: self.num_parties,
            party_id: self.party_id,
            modulus: F::MODULUS,
            statistical_security: self.statistical_security,
            max_loop_iterations: self.max_loop_iterations,
        })
    }
}

/// Immutable parameters of a computation, threaded explicitly through every component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    num_parties: usize,
    party_id: usize,
    modulus: &'static str,
    statistical_security: usize,
    max_loop_iterations: usize,
}

impl Session {
    /// Session with default parameters over field `F`.
    pub fn new<F: MpcField>(num_parties: usize, party_id: usize) -> Result<Self, ConfigError> {
        SessionConfig::new(num_parties, party_id).into_session::<F>()
    }

    /// Sessions of all parties with default parameters over field `F`.
    pub fn all<F: MpcField>(num_parties: usize) -> Result<Vec<Self>, ConfigError> {
        (0..num_parties)
            .map(|id| Self::new::<F>(num_parties, id))
            .collect()
    }

    /// Number of parties participating in computation.
    pub fn num_parties(&self) -> usize {
        self.num_parties
    }

    /// ID of current party.
    pub fn party_id(&self) -> usize {
        self.party_id
    }

    /// Decimal representation of field modulus.
    pub fn modulus(&self) -> &'static str {
        self.modulus
    }

    pub fn statistical_security(&self) -> usize {
        self.statistical_security
    }

    pub fn max_loop_iterations(&self) -> usize {
        self.max_loop_iterations
    }

    /// IDs of all other parties.
    pub fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_parties).filter(move |&id| id != self.party_id)
    }

    /// Check that a component was set up for this session.
    pub fn ensure_matches(
        &self,
        component: &'static str,
        num_parties: usize,
        party_id: usize,
    ) -> Result<(), ConfigError> {
        if num_parties == self.num_parties && party_id == self.party_id {
            Ok(())
        } else {
            Err(ConfigError::PartyMismatch {
                component,
                expected: self.num_parties,
                expected_id: self.party_id,
                actual: num_parties,
                actual_id: party_id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{Mersenne61, F251};

    #[test]
    fn test_load_json_with_defaults() {
        let config = SessionConfig::from_json(r#"{ "num_parties": 3, "party_id": 2 }"#).unwrap();
        let session = config.into_session::<F251>().unwrap();
        assert_eq!(session.num_parties(), 3);
        assert_eq!(session.party_id(), 2);
        assert_eq!(session.modulus(), "251");
        assert_eq!(session.statistical_security(), DEFAULT_STATISTICAL_SECURITY);
        assert_eq!(session.peers().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_rejects_modulus_of_other_field() {
        let config = SessionConfig::from_json(
            r#"{ "num_parties": 2, "party_id": 0, "modulus": "251" }"#,
        )
        .unwrap();
        assert!(matches!(
            config.into_session::<Mersenne61>(),
            Err(ConfigError::ModulusMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_party_out_of_range() {
        assert!(matches!(
            Session::new::<F251>(2, 2),
            Err(ConfigError::InvalidPartyId { .. })
        ));
        assert!(matches!(
            Session::new::<F251>(0, 0),
            Err(ConfigError::NoParties)
        ));
    }
}
