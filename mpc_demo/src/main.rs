use std::str::FromStr;

use argh::FromArgs;
use mpc_core::{
    circuits::{dot_product, product},
    fields::{Mersenne127, Mersenne61},
    spdz::{
        FakeSpdzDealer, PrecomputedSpdzData, PrecomputedSpdzDealer, PreprocessingCounts,
        SpdzDealer, SpdzEngine, SpdzShare,
    },
    testing::run_parties,
    MpcField, Session, SessionConfig,
};
use rand::{rngs::StdRng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Field for the computation.
enum FieldType {
    Mersenne61,
    Mersenne127,
}

impl FromStr for FieldType {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "61" => Ok(FieldType::Mersenne61),
            "127" => Ok(FieldType::Mersenne127),
            _ => Err("Unsupported field type. Available options: 61, 127"),
        }
    }
}

/// Source of preprocessed material.
enum DealerType {
    Fake,
    Precomputed,
}

impl FromStr for DealerType {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fake" => Ok(DealerType::Fake),
            "precomputed" => Ok(DealerType::Precomputed),
            _ => Err("Unsupported dealer. Available options: fake, precomputed"),
        }
    }
}

#[derive(FromArgs)]
/// Run all parties of a SPDZ computation in one process: every party inputs a private value,
/// everybody learns the sum and the product, party 0 alone learns the sum of squares.
struct Options {
    /// private inputs, one per party, comma separated
    #[argh(option, default = "String::from(\"3,5,7\")")]
    inputs: String,

    /// path to session configuration, shared by all parties
    #[argh(option)]
    config: Option<String>,

    /// target field
    #[argh(option, default = "FieldType::Mersenne61")]
    field: FieldType,

    /// preprocessing supplier
    #[argh(option, default = "DealerType::Precomputed")]
    dealer: DealerType,

    /// seed for the fake dealer
    #[argh(option, default = "123")]
    seed: u64,
}

/// Sessions of all parties, from the configuration file if given.
fn sessions<T: MpcField>(options: &Options, num_parties: usize) -> Vec<Session> {
    let config = match &options.config {
        Some(path) => SessionConfig::load(path).expect("Invalid session config"),
        None => SessionConfig::new(num_parties, 0),
    };
    assert_eq!(
        config.num_parties, num_parties,
        "Number of inputs must match number of parties"
    );
    (0..num_parties)
        .map(|id| {
            config
                .for_party(id)
                .into_session::<T>()
                .expect("Invalid session config")
        })
        .collect()
}

async fn compute<T, D>(engines: Vec<SpdzEngine<T, D>>, inputs: &[u64])
where
    T: MpcField,
    D: SpdzDealer<Field = T, Share = SpdzShare<T>>,
{
    let results = run_parties(engines, |s| {
        let me = s.party_id();
        let values = s.parallel(0..s.num_parties(), |s, owner| {
            let value = (owner == me).then(|| T::from(inputs[owner]));
            s.input(owner, value)
        })?;
        let sum = s.sum(&values)?;
        let prod = product(s, &values)?;
        let squares = dot_product(s, &values, &values)?;
        let sum = s.open_to_all(sum)?;
        let prod = s.open_to_all(prod)?;
        let squares = s.open_to(0, squares)?;
        Ok((sum, prod, squares))
    })
    .await;

    for (party_id, result) in results.into_iter().enumerate() {
        let (execution, (sum, prod, squares), _) = result.expect("Computation failed");
        let stats = execution.stats();
        info!(
            party_id,
            rounds = stats.rounds,
            native_ops = stats.native_ops,
            bytes_sent = stats.bytes_sent,
            "party finished"
        );
        println!(
            "party {party_id}: sum = {:?}, product = {:?}, sum of squares = {:?}",
            execution.resolve(&sum).expect("Unresolved sum"),
            execution.resolve(&prod).expect("Unresolved product"),
            execution.resolve(&squares).ok(),
        );
    }
}

async fn run<T: MpcField>(options: Options, inputs: Vec<u64>) {
    let sessions = sessions::<T>(&options, inputs.len());
    match options.dealer {
        DealerType::Fake => {
            let engines = sessions
                .into_iter()
                .map(|session| {
                    let dealer = FakeSpdzDealer::new(&session, options.seed);
                    SpdzEngine::new(session, dealer).expect("Invalid dealer")
                })
                .collect();
            compute::<T, _>(engines, &inputs).await
        }
        DealerType::Precomputed => {
            let n = inputs.len();
            let counts = PreprocessingCounts {
                beaver_triples: 2 * n,
                random_bits: 0,
                input_masks: 2,
            };
            info!(?counts, "generating preprocessed data");
            let data = PrecomputedSpdzData::generate_random(n, counts, StdRng::from_entropy());
            let engines = sessions
                .into_iter()
                .zip(data)
                .map(|(session, data)| {
                    SpdzEngine::new(session, PrecomputedSpdzDealer::new(data))
                        .expect("Invalid dealer")
                })
                .collect();
            compute::<T, _>(engines, &inputs).await
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let options: Options = argh::from_env();
    let inputs: Vec<u64> = options
        .inputs
        .split(',')
        .map(|x| x.trim().parse())
        .collect::<Result<_, _>>()
        .expect("Invalid inputs");

    match options.field {
        FieldType::Mersenne61 => run::<Mersenne61>(options, inputs).await,
        FieldType::Mersenne127 => run::<Mersenne127>(options, inputs).await,
    }
}
