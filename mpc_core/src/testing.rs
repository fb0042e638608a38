use futures::future::join_all;

use crate::{
    transport::mock_multiparty_channels, Circuit, MpcEngine, MpcError, MpcExecution, MpcExecutor,
    Scope,
};

/// Capacity of each in-memory channel.
const CHANNEL_BUFFER_SIZE: usize = 1 << 20;

/// Result of one party: its execution, the handles returned by the circuit builder and its engine.
pub type PartyOutcome<E, T> = (MpcExecution<E>, T, E);

/// Build the same circuit at every party and run all parties concurrently over in-memory channels.
/// Engines must be ordered by party ID. Returns one result per party.
pub async fn run_parties<E, T, B>(
    engines: Vec<E>,
    build: B,
) -> Vec<Result<PartyOutcome<E, T>, MpcError>>
where
    E: MpcEngine,
    B: Fn(&mut Scope<'_, E>) -> Result<T, MpcError>,
{
    let build = &build;
    let channels = mock_multiparty_channels::<Vec<u8>>(engines.len(), CHANNEL_BUFFER_SIZE);

    join_all(
        engines
            .into_iter()
            .zip(channels)
            .map(|(mut engine, mut network)| async move {
                let session = engine.session().clone();
                let (circuit, output) = Circuit::build(session, build)?;
                // A failed party drops its channels here, so its peers stop waiting for it.
                let execution = MpcExecutor::new(&mut engine, &mut network)
                    .run_circuit(circuit)
                    .await?;
                Ok((execution, output, engine))
            }),
    )
    .await
}
