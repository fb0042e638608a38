//! Round-based evaluation of a circuit graph.
//!
//! Each network round consists of a compute phase and a single exchange. In the compute phase
//! operations that sent messages during the previous round are advanced first, in ascending node
//! order, then newly runnable operations in the order they became runnable. Operations that
//! complete locally unblock their dependents within the same phase. During the exchange every
//! party sends one [`RoundBundle`] to each peer and receives one from each peer.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    mem,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{
    graph::{Graph, NodeId, NodeKind},
    scope::{Circuit, Scope},
    transport::{Network, TransportError},
    value::{CellArena, Public, Resolve, Secret, SharedValue, Wire},
    Misuse, MpcEngine, MpcError, NativeOp, ProtocolViolation, Session, Step,
};

/// Messages of all operations for a single peer in a single network round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundBundle<M> {
    pub round: u64,
    pub entries: Vec<(u64, M)>,
}

/// Network rounds during which a node was active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeTiming {
    /// Network round in which node was first advanced.
    pub started: usize,
    /// Network round in which node completed.
    pub finished: usize,
}

/// Statistics of a completed execution.
#[derive(Clone, Debug, Default)]
pub struct MpcExecutionStats {
    /// Number of network exchanges.
    pub rounds: usize,
    /// Number of native operations that completed.
    pub native_ops: usize,
    /// Total bytes sent to peers.
    pub bytes_sent: usize,
    timings: Vec<Option<NodeTiming>>,
}

impl MpcExecutionStats {
    /// Timing of given node, if it ran.
    pub fn node_timing(&self, node: NodeId) -> Option<NodeTiming> {
        self.timings.get(node).copied().flatten()
    }

    fn start(&mut self, node: NodeId, round: usize) {
        if self.timings.len() <= node {
            self.timings.resize(node + 1, None);
        }
        if self.timings[node].is_none() {
            self.timings[node] = Some(NodeTiming {
                started: round,
                finished: round,
            });
        }
    }

    fn finish(&mut self, node: NodeId, round: usize) {
        if let Some(Some(timing)) = self.timings.get_mut(node) {
            timing.finished = round;
        }
    }
}

/// Outcome of a completed circuit: resolved cells and execution statistics.
pub struct MpcExecution<E: MpcEngine> {
    cells: CellArena<E::Share, E::Field>,
    producers: Vec<Option<NodeId>>,
    stats: MpcExecutionStats,
}

impl<E: MpcEngine> MpcExecution<E> {
    /// Look up value of deferred result. Can be called any number of times.
    pub fn resolve<R>(&self, handle: &R) -> Result<R::Output, MpcError>
    where
        R: Resolve<E::Share, E::Field>,
    {
        handle.resolve(&self.cells)
    }

    pub fn stats(&self) -> &MpcExecutionStats {
        &self.stats
    }

    /// Rounds during which the producer of given value was active.
    pub fn timing(&self, wire: impl Into<Wire>) -> Option<NodeTiming> {
        let cell = wire.into().cell();
        let node = self.producers.get(cell.index()).copied().flatten()?;
        self.stats.node_timing(node)
    }
}

/// Messages received in the last exchange, keyed by node and sender.
struct Inbox<M> {
    messages: HashMap<(NodeId, usize), M>,
}

/// Messages queued for the next exchange, one list per party.
struct Outbox<M> {
    entries: Vec<Vec<(u64, M)>>,
}

/// View of the executor given to a native operation while it advances.
pub struct RoundIo<'a, E: MpcEngine> {
    session: &'a Session,
    node: NodeId,
    cells: &'a mut CellArena<E::Share, E::Field>,
    inbox: &'a mut Inbox<E::Message>,
    outbox: &'a mut Outbox<E::Message>,
}

impl<'a, E: MpcEngine> RoundIo<'a, E> {
    pub fn session(&self) -> &Session {
        self.session
    }

    /// Node of operation being advanced.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn read_secret(&self, handle: Secret) -> Result<E::Share, MpcError> {
        self.cells.secret(handle)
    }

    pub fn read_public(&self, handle: Public) -> Result<E::Field, MpcError> {
        self.cells.public(handle)
    }

    pub fn read(&self, wire: Wire) -> Result<SharedValue<E::Share, E::Field>, MpcError> {
        self.cells.read(wire.cell())
    }

    pub fn write_secret(&mut self, handle: Secret, share: E::Share) -> Result<(), MpcError> {
        self.cells.write(handle.cell(), SharedValue::Secret(share))
    }

    pub fn write_public(&mut self, handle: Public, value: E::Field) -> Result<(), MpcError> {
        self.cells.write(handle.cell(), SharedValue::Public(value))
    }

    /// Mark public value as known to some other party only.
    pub fn write_withheld(&mut self, handle: Public) -> Result<(), MpcError> {
        self.cells.write(handle.cell(), SharedValue::Withheld)
    }

    pub fn write(
        &mut self,
        wire: Wire,
        value: SharedValue<E::Share, E::Field>,
    ) -> Result<(), MpcError> {
        self.cells.write(wire.cell(), value)
    }

    /// Queue message for instance of this operation at `party`.
    /// It is delivered in the next exchange, so the operation must return `Step::MoreRounds`.
    pub fn send_to(&mut self, party: usize, msg: E::Message) -> Result<(), MpcError> {
        if party == self.session.party_id() {
            return Err(TransportError::NoChannel(party).into());
        }
        let queue = self
            .outbox
            .entries
            .get_mut(party)
            .ok_or(Misuse::InvalidParty(party))?;
        queue.push((self.node as u64, msg));
        Ok(())
    }

    /// Queue the same message for all other parties.
    pub fn broadcast(&mut self, msg: E::Message) -> Result<(), MpcError> {
        let me = self.session.party_id();
        for (party, queue) in self.outbox.entries.iter_mut().enumerate() {
            if party != me {
                queue.push((self.node as u64, msg.clone()));
            }
        }
        Ok(())
    }

    /// Take message sent by `party` to this operation in the last exchange.
    pub fn receive_from(&mut self, party: usize) -> Result<E::Message, MpcError> {
        self.inbox
            .messages
            .remove(&(self.node, party))
            .ok_or_else(|| {
                ProtocolViolation::MissingMessage {
                    party,
                    node: self.node,
                }
                .into()
            })
    }

    /// Take messages sent by every other party to this operation, ordered by party ID.
    pub fn receive_from_all(&mut self) -> Result<Vec<(usize, E::Message)>, MpcError> {
        let peers: Vec<usize> = self.session.peers().collect();
        peers
            .into_iter()
            .map(|party| Ok((party, self.receive_from(party)?)))
            .collect()
    }
}

/// MPC circuit executor.
pub struct MpcExecutor<'a, E, N> {
    engine: &'a mut E,
    network: &'a mut N,
}

impl<'a, E, N> MpcExecutor<'a, E, N>
where
    E: MpcEngine,
    N: Network,
{
    /// Create new MPC circuit executor.
    pub fn new(engine: &'a mut E, network: &'a mut N) -> Self {
        Self { engine, network }
    }

    /// Evaluate circuit until every operation completed.
    /// On failure no further rounds are issued and all intermediate values are discarded.
    pub async fn run_circuit(&mut self, circuit: Circuit<E>) -> Result<MpcExecution<E>, MpcError> {
        let graph = circuit.into_graph();
        let session = graph.session().clone();
        session.ensure_matches("engine", self.engine.num_parties(), self.engine.party_id())?;
        session.ensure_matches("network", self.network.num_parties(), self.network.party_id())?;

        let result = self.evaluate(graph).await;
        match &result {
            Ok(execution) => info!(
                party = session.party_id(),
                rounds = execution.stats.rounds,
                ops = execution.stats.native_ops,
                "circuit completed"
            ),
            Err(err) => warn!(party = session.party_id(), %err, "circuit aborted"),
        }
        result
    }

    async fn evaluate(&mut self, graph: Graph<E>) -> Result<MpcExecution<E>, MpcError> {
        let mut state = Evaluation::new(graph);
        let mut round = 0;

        loop {
            state.compute(self.engine, round)?;
            if state.waiting.is_empty() {
                let unfinished = state.graph.num_unfinished();
                if unfinished > 0 {
                    return Err(Misuse::Stalled(unfinished).into());
                }
                break;
            }

            let outgoing = state.take_outgoing(round)?;
            let bytes: usize = outgoing.iter().map(|(_, msg)| msg.len()).sum();
            debug!(
                party = state.graph.session.party_id(),
                round,
                waiting = state.waiting.len(),
                bytes,
                "network round"
            );
            state.stats.bytes_sent += bytes;

            let incoming = self.network.exchange(outgoing).await?;
            state.deliver(round, incoming)?;
            round += 1;
            state.stats.rounds = round;
        }

        let Graph {
            cells, producers, ..
        } = state.graph;
        Ok(MpcExecution {
            cells,
            producers,
            stats: state.stats,
        })
    }
}

/// Mutable state of one circuit evaluation.
struct Evaluation<E: MpcEngine> {
    graph: Graph<E>,
    /// Runnable nodes that were not advanced yet.
    ready: VecDeque<NodeId>,
    /// Nodes that sent messages and wait for the exchange.
    waiting: BTreeSet<NodeId>,
    inbox: Inbox<E::Message>,
    outbox: Outbox<E::Message>,
    stats: MpcExecutionStats,
}

impl<E: MpcEngine> Evaluation<E> {
    fn new(graph: Graph<E>) -> Self {
        let num_parties = graph.session.num_parties();
        let ready = graph.runnable_since(0).into();
        Self {
            graph,
            ready,
            waiting: BTreeSet::new(),
            inbox: Inbox {
                messages: HashMap::new(),
            },
            outbox: Outbox {
                entries: (0..num_parties).map(|_| Vec::new()).collect(),
            },
            stats: MpcExecutionStats::default(),
        }
    }

    /// Advance every node that can make progress before the next exchange.
    fn compute(&mut self, engine: &mut E, round: usize) -> Result<(), MpcError> {
        for id in mem::take(&mut self.waiting) {
            self.advance(engine, id, round)?;
        }
        while let Some(id) = self.ready.pop_front() {
            self.advance(engine, id, round)?;
        }

        if let Some(&(node, party)) = self.inbox.messages.keys().next() {
            return Err(ProtocolViolation::UnexpectedMessage { party, node }.into());
        }
        Ok(())
    }

    fn advance(&mut self, engine: &mut E, id: NodeId, round: usize) -> Result<(), MpcError> {
        match self.graph.nodes[id].kind {
            NodeKind::Native(_) => self.stats.start(id, round),
            NodeKind::Loop(_) => {
                self.stats.start(id, round);
                return self.expand_loop(id, round);
            }
            NodeKind::Finished => return Err(Misuse::OperationFinished(id).into()),
        }

        let Graph {
            session,
            nodes,
            cells,
            ..
        } = &mut self.graph;
        let node = &mut nodes[id];
        let op = match &mut node.kind {
            NodeKind::Native(op) => op,
            _ => return Err(Misuse::OperationFinished(id).into()),
        };

        let mut io = RoundIo {
            session,
            node: id,
            cells,
            inbox: &mut self.inbox,
            outbox: &mut self.outbox,
        };
        trace!(node = id, op = op.name(), round = node.round, "advance");
        let step = op.advance(node.round, engine, &mut io).map_err(|err| {
            if err.is_protocol_violation() {
                warn!(node = id, op = op.name(), %err, "protocol violation");
            }
            err
        })?;

        match step {
            Step::MoreRounds => {
                node.round += 1;
                self.waiting.insert(id);
            }
            Step::Done => self.complete(id, round),
        }
        Ok(())
    }

    fn complete(&mut self, id: NodeId, round: usize) {
        self.stats.finish(id, round);
        if matches!(self.graph.nodes[id].kind, NodeKind::Native(_)) {
            self.stats.native_ops += 1;
        }
        let unblocked = self.graph.finish(id);
        self.ready.extend(unblocked);
    }

    /// Evaluate loop predicate on current state and either finish the loop or schedule
    /// one more iteration of its body.
    fn expand_loop(&mut self, id: NodeId, round: usize) -> Result<(), MpcError> {
        let mut lp = match mem::replace(&mut self.graph.nodes[id].kind, NodeKind::Finished) {
            NodeKind::Loop(lp) => lp,
            other => {
                self.graph.nodes[id].kind = other;
                return Err(Misuse::OperationFinished(id).into());
            }
        };

        let values = lp
            .state
            .iter()
            .map(|wire| self.graph.cells.read(wire.cell()))
            .collect::<Result<Vec<_>, _>>()?;

        if !(lp.predicate)(&values) {
            trace!(node = id, iterations = lp.iterations, "loop finished");
            for (output, value) in lp.outputs.iter().zip(values) {
                self.graph.cells.write(output.cell(), value)?;
            }
            self.complete(id, round);
            return Ok(());
        }

        let max_iterations = self.graph.session.max_loop_iterations();
        if lp.iterations >= max_iterations {
            return Err(Misuse::LoopBoundExceeded(max_iterations).into());
        }
        lp.iterations += 1;

        let first_new = self.graph.len();
        let mut scope = Scope::new(&mut self.graph, Vec::new());
        let next = (lp.body)(&mut scope, lp.state.clone())?;
        let tail = scope.into_tail();

        let expected: Vec<&'static str> = lp.state.iter().map(Wire::kind).collect();
        let actual: Vec<&'static str> = next.iter().map(Wire::kind).collect();
        if expected != actual {
            return Err(Misuse::LoopShapeMismatch { expected, actual }.into());
        }
        for wire in &next {
            self.graph.cells.check(wire.cell())?;
        }

        let mut deps = tail;
        deps.extend(self.graph.producers_of(next.iter().map(Wire::cell)));
        lp.state = next;
        self.graph.nodes[id].kind = NodeKind::Loop(lp);
        self.graph.wait_for(id, &deps);

        trace!(
            node = id,
            new_nodes = self.graph.len() - first_new,
            "loop iteration scheduled"
        );
        self.ready.extend(self.graph.runnable_since(first_new));
        if self.graph.nodes[id].pending == 0 {
            self.ready.push_back(id);
        }
        Ok(())
    }

    /// Encode queued messages into one bundle per peer.
    fn take_outgoing(&mut self, round: usize) -> Result<Vec<(usize, Vec<u8>)>, MpcError> {
        let me = self.graph.session.party_id();
        self.outbox
            .entries
            .iter_mut()
            .enumerate()
            .filter(|(party, _)| *party != me)
            .map(|(party, entries)| {
                let bundle = RoundBundle {
                    round: round as u64,
                    entries: mem::take(entries),
                };
                let bytes = bincode::serialize(&bundle)
                    .map_err(|err| TransportError::Encode(err.to_string()))?;
                Ok((party, bytes))
            })
            .collect()
    }

    /// Decode bundles of the last exchange into the inbox.
    fn deliver(&mut self, round: usize, incoming: Vec<(usize, Vec<u8>)>) -> Result<(), MpcError> {
        for (sender, bytes) in incoming {
            let bundle: RoundBundle<E::Message> = bincode::deserialize(&bytes)
                .map_err(|err| MpcError::malformed(sender, err.to_string()))?;
            if bundle.round != round as u64 {
                return Err(MpcError::malformed(
                    sender,
                    format!("bundle for round {} during round {}", bundle.round, round),
                ));
            }

            for (node, msg) in bundle.entries {
                let node = node as NodeId;
                if !self.waiting.contains(&node) {
                    return Err(ProtocolViolation::UnexpectedMessage {
                        party: sender,
                        node,
                    }
                    .into());
                }
                if self.inbox.messages.insert((node, sender), msg).is_some() {
                    return Err(ProtocolViolation::UnexpectedMessage {
                        party: sender,
                        node,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::EnvFilter;

    use super::*;
    use crate::{
        fields::F251,
        plaintext::{MockMpcEngine, PlainMessage},
        transport::{mock_multiparty_channels, LocalTransport},
    };

    type Fp = F251;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn setup() -> (Session, MockMpcEngine<Fp>, LocalTransport) {
        init_tracing();
        let session = Session::new::<Fp>(1, 0).unwrap();
        let engine = MockMpcEngine::new(session.clone());
        let network = mock_multiparty_channels(1, 1 << 16).pop().unwrap();
        (session, engine, network)
    }

    #[tokio::test]
    async fn test_round_ordering_of_nested_multiplication() {
        let (session, mut engine, mut network) = setup();
        let (circuit, (bc, abc)) = Circuit::build(session, |s| {
            let a = s.input(0, Some(Fp::from(2)))?;
            let b = s.input(0, Some(Fp::from(3)))?;
            let c = s.input(0, Some(Fp::from(5)))?;
            let bc = s.sequential(|s| s.multiply(b, c))?;
            let abc = s.multiply(a, bc)?;
            Ok((bc, abc))
        })
        .unwrap();

        let execution = MpcExecutor::new(&mut engine, &mut network)
            .run_circuit(circuit)
            .await
            .unwrap();

        assert_eq!(execution.resolve(&abc).unwrap().0, Fp::from(30));
        let inner = execution.timing(bc).unwrap();
        let outer = execution.timing(abc).unwrap();
        assert!(inner.finished <= outer.started);
        assert!(inner.started < outer.started);
    }

    #[tokio::test]
    async fn test_independent_multiplications_share_round() {
        let (session, mut engine, mut network) = setup();
        let (circuit, products) = Circuit::build(session, |s| {
            let x = s.known_value(Fp::from(7))?;
            s.parallel(0..10u64, |s, i| {
                let y = s.known_value(Fp::from(i))?;
                s.multiply(x, y)
            })
        })
        .unwrap();

        let execution = MpcExecutor::new(&mut engine, &mut network)
            .run_circuit(circuit)
            .await
            .unwrap();

        assert_eq!(execution.stats().rounds, 1);
        for (i, product) in products.iter().enumerate() {
            assert_eq!(execution.resolve(product).unwrap().0, Fp::from(7 * i as u64));
        }
        assert_eq!(engine.num_multiplications(), 10);
    }

    #[tokio::test]
    async fn test_sequential_multiplications_take_separate_rounds() {
        let (session, mut engine, mut network) = setup();
        let (circuit, last) = Circuit::build(session, |s| {
            let x = s.known_value(Fp::from(2))?;
            let mut acc = x;
            for _ in 0..4 {
                acc = s.multiply(acc, x)?;
            }
            Ok(acc)
        })
        .unwrap();

        let execution = MpcExecutor::new(&mut engine, &mut network)
            .run_circuit(circuit)
            .await
            .unwrap();

        assert_eq!(execution.stats().rounds, 4);
        assert_eq!(execution.resolve(&last).unwrap().0, Fp::from(32));
    }

    #[tokio::test]
    async fn test_loop_runs_until_predicate_fails() {
        let (session, mut engine, mut network) = setup();
        let (circuit, state) = Circuit::build(session, |s| {
            let counter = s.constant(Fp::from(0))?;
            let acc = s.known_value(Fp::from(1))?;
            let two = s.known_value(Fp::from(2))?;
            s.while_loop(
                vec![counter.into(), acc.into()],
                |state| state[0].public() != Some(&Fp::from(5)),
                move |s, state| {
                    let counter = s.add_constant_public(state[0].as_public()?, Fp::from(1))?;
                    let acc = s.multiply(state[1].as_secret()?, two)?;
                    Ok(vec![counter.into(), acc.into()])
                },
            )
        })
        .unwrap();

        let execution = MpcExecutor::new(&mut engine, &mut network)
            .run_circuit(circuit)
            .await
            .unwrap();

        assert_eq!(execution.resolve(&state[0].as_public().unwrap()).unwrap(), Fp::from(5));
        assert_eq!(execution.resolve(&state[1].as_secret().unwrap()).unwrap().0, Fp::from(32));
        assert_eq!(execution.stats().rounds, 5);
    }

    #[tokio::test]
    async fn test_loop_shape_mismatch_is_fatal() {
        let (session, mut engine, mut network) = setup();
        let (circuit, _) = Circuit::build(session, |s| {
            let x = s.known_value(Fp::from(1))?;
            s.while_loop(
                vec![x.into()],
                |_| true,
                |s, state| {
                    let opened = s.open_unchecked(state[0].as_secret()?)?;
                    Ok(vec![opened.into()])
                },
            )
        })
        .unwrap();

        let result = MpcExecutor::new(&mut engine, &mut network)
            .run_circuit(circuit)
            .await;
        assert!(matches!(
            result,
            Err(MpcError::Misuse(Misuse::LoopShapeMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_unbounded_loop_hits_iteration_cap() {
        let session = crate::SessionConfig {
            max_loop_iterations: 3,
            ..crate::SessionConfig::new(1, 0)
        }
        .into_session::<Fp>()
        .unwrap();
        let mut engine = MockMpcEngine::new(session.clone());
        let mut network = mock_multiparty_channels(1, 1 << 16).pop().unwrap();

        let (circuit, _) = Circuit::build(session, |s| {
            let x = s.constant(Fp::from(1))?;
            s.while_loop(vec![x.into()], |_| true, |_, state| Ok(state))
        })
        .unwrap();

        let result = MpcExecutor::new(&mut engine, &mut network)
            .run_circuit(circuit)
            .await;
        assert!(matches!(
            result,
            Err(MpcError::Misuse(Misuse::LoopBoundExceeded(3)))
        ));
    }

    #[tokio::test]
    async fn test_rejects_network_of_other_session() {
        let (session, mut engine, _) = setup();
        let mut network = mock_multiparty_channels(2, 1 << 16).pop().unwrap();
        let (circuit, _) = Circuit::build(session, |s| s.known_value(Fp::from(1))).unwrap();

        let result = MpcExecutor::new(&mut engine, &mut network)
            .run_circuit(circuit)
            .await;
        assert!(matches!(result, Err(MpcError::Config(_))));
    }

    /// Run party 0 of a two-party multiplication against a peer that answers with `bundle`.
    async fn run_against_peer(bundle: RoundBundle<PlainMessage<Fp>>) -> Result<(), MpcError> {
        init_tracing();
        let session = Session::new::<Fp>(2, 0).unwrap();
        let mut engine = MockMpcEngine::new(session.clone());
        let mut networks = mock_multiparty_channels(2, 1 << 16);
        let mut peer = networks.pop().unwrap();
        let mut network = networks.pop().unwrap();

        let (circuit, _) = Circuit::build(session, |s| {
            let x = s.known_value(Fp::from(3))?;
            s.multiply(x, x)
        })
        .unwrap();

        let honest = async {
            MpcExecutor::new(&mut engine, &mut network)
                .run_circuit(circuit)
                .await
                .map(|_| ())
        };
        let malicious = async {
            peer.receive_from(0).await.unwrap();
            let bytes = bincode::serialize(&bundle).unwrap();
            peer.send_to(0, bytes).await.unwrap();
        };
        let (result, ()) = futures::join!(honest, malicious);
        result
    }

    #[tokio::test]
    async fn test_message_for_unknown_node_is_rejected() {
        let result = run_against_peer(RoundBundle {
            round: 0,
            entries: vec![(1, PlainMessage::Sync), (99, PlainMessage::Sync)],
        })
        .await;
        assert!(matches!(
            result,
            Err(MpcError::Protocol(ProtocolViolation::UnexpectedMessage { party: 1, node: 99 }))
        ));
    }

    #[tokio::test]
    async fn test_bundle_of_wrong_round_is_rejected() {
        let result = run_against_peer(RoundBundle {
            round: 4,
            entries: vec![(1, PlainMessage::Sync)],
        })
        .await;
        assert!(matches!(
            result,
            Err(MpcError::Protocol(ProtocolViolation::MalformedMessage { party: 1, .. }))
        ));
    }

    #[tokio::test]
    async fn test_missing_message_is_reported() {
        let result = run_against_peer(RoundBundle {
            round: 0,
            entries: vec![],
        })
        .await;
        assert!(matches!(
            result,
            Err(MpcError::Protocol(ProtocolViolation::MissingMessage { party: 1, node: 1 }))
        ));
    }
}
