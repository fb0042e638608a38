use std::fmt;

use crate::{
    scope::Scope,
    value::{CellArena, CellId, SharedValue, Wire},
    MpcEngine, MpcError, Session,
};

/// Index of a node in the computation graph. Identical at every party running the same circuit.
pub type NodeId = usize;

/// Predicate deciding whether a loop runs another iteration, given its resolved state.
pub(crate) type LoopPredicate<E> = Box<
    dyn FnMut(&[SharedValue<<E as crate::MpcContext>::Share, <E as crate::MpcContext>::Field>]) -> bool,
>;

/// Builder of one loop iteration, mapping current state to next state.
pub(crate) type LoopBody<E> =
    Box<dyn FnMut(&mut Scope<'_, E>, Vec<Wire>) -> Result<Vec<Wire>, MpcError>>;

/// Loop re-entered while its predicate holds. Expanded lazily by the executor.
pub(crate) struct LoopNode<E: MpcEngine> {
    pub state: Vec<Wire>,
    pub outputs: Vec<Wire>,
    pub predicate: LoopPredicate<E>,
    pub body: LoopBody<E>,
    pub iterations: usize,
}

pub(crate) enum NodeKind<E: MpcEngine> {
    Native(E::Op),
    Loop(LoopNode<E>),
    /// Completed node. Round state was dropped.
    Finished,
}

pub(crate) struct Node<E: MpcEngine> {
    pub kind: NodeKind<E>,
    /// Number of unfinished nodes this node waits for.
    pub pending: usize,
    /// Nodes waiting for this one.
    pub dependents: Vec<NodeId>,
    /// Number of network rounds this node went through.
    pub round: usize,
}

impl<E: MpcEngine> Node<E> {
    pub fn is_finished(&self) -> bool {
        matches!(self.kind, NodeKind::Finished)
    }
}

impl<E: MpcEngine> fmt::Debug for Node<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            NodeKind::Native(op) => crate::NativeOp::name(op),
            NodeKind::Loop(_) => "loop",
            NodeKind::Finished => "finished",
        };
        write!(f, "Node({}, pending {})", kind, self.pending)
    }
}

/// Position in graph construction that can be rolled back to.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Checkpoint {
    nodes: usize,
    cells: usize,
}

/// Nodes and value cells of a circuit.
pub struct Graph<E: MpcEngine> {
    pub(crate) session: Session,
    pub(crate) nodes: Vec<Node<E>>,
    pub(crate) cells: CellArena<E::Share, E::Field>,
    /// Producing node of every cell.
    pub(crate) producers: Vec<Option<NodeId>>,
}

impl<E: MpcEngine> Graph<E> {
    pub(crate) fn new(session: Session) -> Self {
        Self {
            session,
            nodes: Vec::new(),
            cells: CellArena::new(),
            producers: Vec::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Number of nodes, including finished ones.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node that writes given cell.
    pub fn producer(&self, cell: CellId) -> Option<NodeId> {
        self.producers.get(cell.index()).copied().flatten()
    }

    /// Reserve new cell.
    pub(crate) fn allocate(&mut self) -> CellId {
        self.producers.push(None);
        self.cells.allocate()
    }

    /// Append node that waits for `deps` and writes `outputs`.
    pub(crate) fn push(
        &mut self,
        kind: NodeKind<E>,
        deps: &[NodeId],
        outputs: &[CellId],
    ) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            kind,
            pending: 0,
            dependents: Vec::new(),
            round: 0,
        });
        self.wait_for(id, deps);
        for cell in outputs {
            self.producers[cell.index()] = Some(id);
        }
        id
    }

    /// Make node wait for every unfinished node in `deps`.
    pub(crate) fn wait_for(&mut self, id: NodeId, deps: &[NodeId]) {
        let mut deps = deps.to_vec();
        deps.sort_unstable();
        deps.dedup();

        let mut pending = 0;
        for dep in deps {
            if dep != id && !self.nodes[dep].is_finished() {
                self.nodes[dep].dependents.push(id);
                pending += 1;
            }
        }
        self.nodes[id].pending = pending;
    }

    /// Producers of given cells, i.e. the data dependencies of a node reading them.
    pub(crate) fn producers_of(&self, cells: impl IntoIterator<Item = CellId>) -> Vec<NodeId> {
        cells
            .into_iter()
            .filter_map(|cell| self.producer(cell))
            .collect()
    }

    /// Mark node as completed and drop its state. Returns dependents that became runnable.
    pub(crate) fn finish(&mut self, id: NodeId) -> Vec<NodeId> {
        let node = &mut self.nodes[id];
        node.kind = NodeKind::Finished;
        let dependents = std::mem::take(&mut node.dependents);

        dependents
            .into_iter()
            .filter(|&dep| {
                let node = &mut self.nodes[dep];
                node.pending -= 1;
                node.pending == 0
            })
            .collect()
    }

    /// Nodes appended at or after `start` that can run immediately.
    pub(crate) fn runnable_since(&self, start: NodeId) -> Vec<NodeId> {
        (start..self.nodes.len())
            .filter(|&id| self.nodes[id].pending == 0 && !self.nodes[id].is_finished())
            .collect()
    }

    /// Number of unfinished nodes.
    pub(crate) fn num_unfinished(&self) -> usize {
        self.nodes.iter().filter(|node| !node.is_finished()).count()
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            nodes: self.nodes.len(),
            cells: self.cells.len(),
        }
    }

    /// Forget every node and cell created after checkpoint.
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        self.nodes.truncate(checkpoint.nodes);
        self.cells.truncate(checkpoint.cells);
        self.producers.truncate(checkpoint.cells);
        for node in &mut self.nodes {
            node.dependents.retain(|&dep| dep < checkpoint.nodes);
        }
    }
}
