use ff::Field;

use crate::{
    graph::{Graph, LoopNode, NodeId, NodeKind},
    value::{CellId, LinearCombination, Public, Secret, SharedValue, Wire},
    Arithmetic, Misuse, MpcEngine, MpcError, Opening, Randomness, Session,
};

/// Complete description of a computation, ready to be run by an executor.
pub struct Circuit<E: MpcEngine> {
    graph: Graph<E>,
}

impl<E: MpcEngine> Circuit<E> {
    /// Build circuit in a root sequential scope. Returns circuit and handles produced by `f`.
    pub fn build<T, F>(session: Session, f: F) -> Result<(Self, T), MpcError>
    where
        F: FnOnce(&mut Scope<'_, E>) -> Result<T, MpcError>,
    {
        let mut graph = Graph::new(session);
        let output = f(&mut Scope::new(&mut graph, Vec::new()))?;
        Ok((Self { graph }, output))
    }

    pub fn session(&self) -> &Session {
        self.graph.session()
    }

    pub(crate) fn into_graph(self) -> Graph<E> {
        self.graph
    }
}

/// Scope of circuit construction. Operations scheduled through one scope run in declaration order.
pub struct Scope<'g, E: MpcEngine> {
    graph: &'g mut Graph<E>,
    /// Nodes that the next scheduled operation has to wait for.
    tail: Vec<NodeId>,
}

impl<'g, E: MpcEngine> Scope<'g, E> {
    pub(crate) fn new(graph: &'g mut Graph<E>, tail: Vec<NodeId>) -> Self {
        Self { graph, tail }
    }

    pub(crate) fn into_tail(self) -> Vec<NodeId> {
        self.tail
    }

    pub fn session(&self) -> &Session {
        self.graph.session()
    }

    pub fn party_id(&self) -> usize {
        self.session().party_id()
    }

    pub fn num_parties(&self) -> usize {
        self.session().num_parties()
    }

    /// Run `f` in a sequential sub-scope ordered after everything already scheduled here
    /// and before anything scheduled afterwards.
    /// If `f` fails, everything it scheduled is discarded and the error is returned.
    pub fn sequential<T, F>(&mut self, f: F) -> Result<T, MpcError>
    where
        F: FnOnce(&mut Scope<'_, E>) -> Result<T, MpcError>,
    {
        let checkpoint = self.graph.checkpoint();
        let mut child = Scope::new(&mut *self.graph, self.tail.clone());
        match f(&mut child) {
            Ok(output) => {
                self.tail = child.into_tail();
                Ok(output)
            }
            Err(err) => {
                self.graph.rollback(checkpoint);
                Err(err)
            }
        }
    }

    /// Build one independent branch per item. Branches must not depend on each other,
    /// so their operations may share network rounds.
    /// If any branch fails, all branches are discarded and the error is returned.
    pub fn parallel<I, T, F>(&mut self, items: I, mut f: F) -> Result<Vec<T>, MpcError>
    where
        I: IntoIterator,
        F: FnMut(&mut Scope<'_, E>, I::Item) -> Result<T, MpcError>,
    {
        let checkpoint = self.graph.checkpoint();
        let mut joined_tail = self.tail.clone();
        let mut outputs = Vec::new();

        for item in items {
            let mut branch = Scope::new(&mut *self.graph, self.tail.clone());
            match f(&mut branch, item) {
                Ok(output) => {
                    joined_tail.extend(branch.into_tail());
                    outputs.push(output);
                }
                Err(err) => {
                    self.graph.rollback(checkpoint);
                    return Err(err);
                }
            }
        }

        joined_tail.sort_unstable();
        joined_tail.dedup();
        self.tail = joined_tail;
        Ok(outputs)
    }

    /// Build two independent branches of different types.
    pub fn join<A, B, FA, FB>(&mut self, fa: FA, fb: FB) -> Result<(A, B), MpcError>
    where
        FA: FnOnce(&mut Scope<'_, E>) -> Result<A, MpcError>,
        FB: FnOnce(&mut Scope<'_, E>) -> Result<B, MpcError>,
    {
        let checkpoint = self.graph.checkpoint();

        let mut first = Scope::new(&mut *self.graph, self.tail.clone());
        let a = match fa(&mut first) {
            Ok(a) => a,
            Err(err) => {
                self.graph.rollback(checkpoint);
                return Err(err);
            }
        };
        let mut joined_tail = first.into_tail();

        let mut second = Scope::new(&mut *self.graph, self.tail.clone());
        let b = match fb(&mut second) {
            Ok(b) => b,
            Err(err) => {
                self.graph.rollback(checkpoint);
                return Err(err);
            }
        };
        joined_tail.extend(second.into_tail());

        joined_tail.sort_unstable();
        joined_tail.dedup();
        self.tail = joined_tail;
        Ok((a, b))
    }

    /// Bounded iteration: while `predicate` holds for the resolved state, build another
    /// sequential iteration of `body` from the state. Returns handles to the final state.
    ///
    /// The predicate runs at every party on its local view, so it must only look at public values
    /// for parties to stay in lockstep. The body must return state of the same shape.
    pub fn while_loop<P, B>(
        &mut self,
        init: Vec<Wire>,
        predicate: P,
        body: B,
    ) -> Result<Vec<Wire>, MpcError>
    where
        E: 'static,
        P: FnMut(&[SharedValue<E::Share, E::Field>]) -> bool + 'static,
        B: FnMut(&mut Scope<'_, E>, Vec<Wire>) -> Result<Vec<Wire>, MpcError> + 'static,
    {
        self.check_inputs(init.iter().map(Wire::cell))?;
        let outputs: Vec<Wire> = init
            .iter()
            .map(|wire| match wire {
                Wire::Secret(_) => Wire::Secret(Secret(self.graph.allocate())),
                Wire::Public(_) => Wire::Public(Public(self.graph.allocate())),
            })
            .collect();
        let inputs: Vec<CellId> = init.iter().map(Wire::cell).collect();
        let output_cells: Vec<CellId> = outputs.iter().map(Wire::cell).collect();

        let node = NodeKind::Loop(LoopNode {
            state: init,
            outputs: outputs.clone(),
            predicate: Box::new(predicate),
            body: Box::new(body),
            iterations: 0,
        });
        self.push(node, &inputs, &output_cells);
        Ok(outputs)
    }

    /// Verify that all cells belong to this circuit.
    fn check_inputs(&self, cells: impl IntoIterator<Item = CellId>) -> Result<(), MpcError> {
        cells
            .into_iter()
            .try_for_each(|cell| self.graph.cells.check(cell))
    }

    /// Append node after current tail and the producers of its inputs.
    fn push(&mut self, kind: NodeKind<E>, inputs: &[CellId], outputs: &[CellId]) -> NodeId {
        let mut deps = self.graph.producers_of(inputs.iter().copied());
        deps.extend_from_slice(&self.tail);
        let id = self.graph.push(kind, &deps, outputs);
        self.tail = vec![id];
        id
    }

    /// Schedule native operation reading `inputs` and writing `outputs`.
    fn schedule(&mut self, op: E::Op, inputs: &[CellId], outputs: &[CellId]) -> NodeId {
        self.push(NodeKind::Native(op), inputs, outputs)
    }

    fn new_secret(&mut self) -> Secret {
        Secret(self.graph.allocate())
    }

    fn new_public(&mut self) -> Public {
        Public(self.graph.allocate())
    }

    fn check_party(&self, party: usize) -> Result<(), MpcError> {
        if party < self.num_parties() {
            Ok(())
        } else {
            Err(Misuse::InvalidParty(party).into())
        }
    }
}

impl<'g, E: Arithmetic> Scope<'g, E> {
    /// Linear combination of values with public coefficients plus a constant.
    /// Result is secret iff some term is secret. Local, no communication.
    pub fn linear(
        &mut self,
        terms: &[(E::Field, Wire)],
        constant: E::Field,
    ) -> Result<Wire, MpcError> {
        let combination = LinearCombination {
            terms: terms.to_vec(),
            constant,
        };
        let inputs: Vec<CellId> = combination.inputs().collect();
        self.check_inputs(inputs.iter().copied())?;

        let output = if combination.is_secret() {
            Wire::Secret(self.new_secret())
        } else {
            Wire::Public(self.new_public())
        };
        self.schedule(E::linear(combination, output), &inputs, &[output.cell()]);
        Ok(output)
    }

    fn linear_secret(
        &mut self,
        terms: &[(E::Field, Wire)],
        constant: E::Field,
    ) -> Result<Secret, MpcError> {
        self.linear(terms, constant)?.as_secret()
    }

    pub fn add(&mut self, a: Secret, b: Secret) -> Result<Secret, MpcError> {
        let one = E::Field::one();
        self.linear_secret(&[(one, a.into()), (one, b.into())], E::Field::zero())
    }

    pub fn sub(&mut self, a: Secret, b: Secret) -> Result<Secret, MpcError> {
        let one = E::Field::one();
        self.linear_secret(&[(one, a.into()), (-one, b.into())], E::Field::zero())
    }

    pub fn neg(&mut self, a: Secret) -> Result<Secret, MpcError> {
        self.linear_secret(&[(-E::Field::one(), a.into())], E::Field::zero())
    }

    /// Multiply by a constant known at construction time.
    pub fn scale(&mut self, a: Secret, k: E::Field) -> Result<Secret, MpcError> {
        self.linear_secret(&[(k, a.into())], E::Field::zero())
    }

    /// Add a constant known at construction time.
    pub fn add_constant(&mut self, a: Secret, k: E::Field) -> Result<Secret, MpcError> {
        self.linear_secret(&[(E::Field::one(), a.into())], k)
    }

    /// Add a public value computed at runtime.
    pub fn add_public(&mut self, a: Secret, p: Public) -> Result<Secret, MpcError> {
        let one = E::Field::one();
        self.linear_secret(&[(one, a.into()), (one, p.into())], E::Field::zero())
    }

    /// Add a constant to a public value.
    pub fn add_constant_public(&mut self, p: Public, k: E::Field) -> Result<Public, MpcError> {
        self.linear(&[(E::Field::one(), p.into())], k)?.as_public()
    }

    /// Sum of secret values.
    pub fn sum(&mut self, elems: &[Secret]) -> Result<Secret, MpcError> {
        let terms: Vec<_> = elems
            .iter()
            .map(|&x| (E::Field::one(), Wire::from(x)))
            .collect();
        if terms.is_empty() {
            return self.known_value(E::Field::zero());
        }
        self.linear_secret(&terms, E::Field::zero())
    }

    /// Multiply by a public value computed at runtime.
    pub fn mul_public(&mut self, a: Secret, p: Public) -> Result<Secret, MpcError> {
        self.check_inputs([a.cell(), p.cell()])?;
        let output = self.new_secret();
        self.schedule(E::mul_public(a, p, output), &[a.cell(), p.cell()], &[output.cell()]);
        Ok(output)
    }

    /// Sharing of a constant known to every party.
    pub fn known_value(&mut self, k: E::Field) -> Result<Secret, MpcError> {
        let output = self.new_secret();
        self.schedule(E::known_value(k, output), &[], &[output.cell()]);
        Ok(output)
    }

    /// Public constant.
    pub fn constant(&mut self, k: E::Field) -> Result<Public, MpcError> {
        self.linear(&[], k)?.as_public()
    }

    /// Multiply secret values. Requires one network round.
    pub fn multiply(&mut self, a: Secret, b: Secret) -> Result<Secret, MpcError> {
        self.check_inputs([a.cell(), b.cell()])?;
        let output = self.new_secret();
        self.schedule(E::multiply(a, b, output), &[a.cell(), b.cell()], &[output.cell()]);
        Ok(output)
    }
}

impl<'g, E: Opening> Scope<'g, E> {
    /// Reveal value to every party, checking its MAC.
    pub fn open_to_all(&mut self, a: Secret) -> Result<Public, MpcError> {
        self.check_inputs([a.cell()])?;
        let output = self.new_public();
        self.schedule(E::open_to_all(a, output), &[a.cell()], &[output.cell()]);
        Ok(output)
    }

    /// Reveal value to `party` only. At other parties the result is withheld.
    pub fn open_to(&mut self, party: usize, a: Secret) -> Result<Public, MpcError> {
        self.check_party(party)?;
        self.check_inputs([a.cell()])?;
        let output = self.new_public();
        self.schedule(E::open_to(party, a, output), &[a.cell()], &[output.cell()]);
        Ok(output)
    }

    /// Reveal value to every party without checking its MAC.
    pub fn open_unchecked(&mut self, a: Secret) -> Result<Public, MpcError> {
        self.check_inputs([a.cell()])?;
        let output = self.new_public();
        self.schedule(E::open_unchecked(a, output), &[a.cell()], &[output.cell()]);
        Ok(output)
    }

    /// Broadcast local public value. Returns values of all parties, ordered by party ID.
    pub fn broadcast(&mut self, p: Public) -> Result<Vec<Public>, MpcError> {
        self.check_inputs([p.cell()])?;
        let outputs: Vec<Public> = (0..self.num_parties()).map(|_| self.new_public()).collect();
        let cells: Vec<CellId> = outputs.iter().map(Public::cell).collect();
        self.schedule(E::broadcast(p, outputs.clone()), &[p.cell()], &cells);
        Ok(outputs)
    }
}

impl<'g, E: Randomness> Scope<'g, E> {
    /// Share private input of `owner`. The owner passes `Some(value)`, everybody else `None`.
    pub fn input(&mut self, owner: usize, value: Option<E::Field>) -> Result<Secret, MpcError> {
        self.check_party(owner)?;
        match (owner == self.party_id(), value.is_some()) {
            (true, false) => return Err(Misuse::MissingInput.into()),
            (false, true) => return Err(Misuse::UnexpectedInput.into()),
            _ => (),
        }
        let output = self.new_secret();
        self.schedule(E::input(owner, value, output), &[], &[output.cell()]);
        Ok(output)
    }

    /// Sharing of a random bit.
    pub fn random_bit(&mut self) -> Result<Secret, MpcError> {
        let output = self.new_secret();
        self.schedule(E::random_bit(output), &[], &[output.cell()]);
        Ok(output)
    }
}
