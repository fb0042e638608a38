use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{Misuse, MpcError};

/// Stable address of a value cell within one circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId {
    circuit: u32,
    index: usize,
}

impl CellId {
    /// Position of cell in its arena.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Deferred secret-shared value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Secret(pub(crate) CellId);

/// Deferred public value, replicated at every party that learns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Public(pub(crate) CellId);

impl Secret {
    pub fn cell(&self) -> CellId {
        self.0
    }
}

impl Public {
    pub fn cell(&self) -> CellId {
        self.0
    }
}

/// Deferred value of either kind. Used where the kind is only known at runtime, e.g. loop state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Wire {
    Secret(Secret),
    Public(Public),
}

impl Wire {
    pub fn cell(&self) -> CellId {
        match self {
            Self::Secret(x) => x.0,
            Self::Public(x) => x.0,
        }
    }

    /// Name of value kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Secret(_) => "secret",
            Self::Public(_) => "public",
        }
    }

    pub fn as_secret(&self) -> Result<Secret, MpcError> {
        match *self {
            Self::Secret(x) => Ok(x),
            Self::Public(x) => Err(kind_mismatch(x.0, "secret")),
        }
    }

    pub fn as_public(&self) -> Result<Public, MpcError> {
        match *self {
            Self::Public(x) => Ok(x),
            Self::Secret(x) => Err(kind_mismatch(x.0, "public")),
        }
    }
}

impl From<Secret> for Wire {
    fn from(x: Secret) -> Self {
        Self::Secret(x)
    }
}

impl From<Public> for Wire {
    fn from(x: Public) -> Self {
        Self::Public(x)
    }
}

/// Content of a value cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SharedValue<S, F> {
    /// Local share of a secret value.
    Secret(S),
    /// Plaintext value known to every party.
    Public(F),
    /// Value revealed to some other party only.
    Withheld,
}

impl<S, F> SharedValue<S, F> {
    /// Public value, if this cell holds one.
    pub fn public(&self) -> Option<&F> {
        match self {
            Self::Public(x) => Some(x),
            _ => None,
        }
    }

    /// Local share, if this cell holds one.
    pub fn secret(&self) -> Option<&S> {
        match self {
            Self::Secret(x) => Some(x),
            _ => None,
        }
    }
}

/// Tag of the next arena created in this process.
static NEXT_CIRCUIT: AtomicU32 = AtomicU32::new(0);

/// Arena of write-once value cells.
#[derive(Clone, Debug)]
pub struct CellArena<S, F> {
    circuit: u32,
    cells: Vec<Option<SharedValue<S, F>>>,
}

impl<S: Copy, F: Copy> CellArena<S, F> {
    /// Create empty arena. Handles of other arenas are rejected.
    pub fn new() -> Self {
        Self {
            circuit: NEXT_CIRCUIT.fetch_add(1, Ordering::Relaxed),
            cells: Vec::new(),
        }
    }

    /// Number of allocated cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Reserve new unwritten cell.
    pub fn allocate(&mut self) -> CellId {
        self.cells.push(None);
        CellId {
            circuit: self.circuit,
            index: self.cells.len() - 1,
        }
    }

    /// Drop cells allocated after arena had `len` cells.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.cells.truncate(len);
    }

    /// Check that cell belongs to this arena.
    pub fn check(&self, id: CellId) -> Result<(), MpcError> {
        if id.circuit == self.circuit && id.index < self.cells.len() {
            Ok(())
        } else {
            Err(Misuse::UnknownCell(id.index).into())
        }
    }

    /// Is the cell written?
    pub fn is_resolved(&self, id: CellId) -> bool {
        self.check(id).is_ok() && self.cells[id.index].is_some()
    }

    /// Write value to cell. Each cell can be written exactly once.
    pub fn write(&mut self, id: CellId, value: SharedValue<S, F>) -> Result<(), MpcError> {
        self.check(id)?;
        let cell = &mut self.cells[id.index];
        if cell.is_some() {
            return Err(Misuse::CellWrittenTwice(id.index).into());
        }
        *cell = Some(value);
        Ok(())
    }

    /// Read written cell.
    pub fn read(&self, id: CellId) -> Result<SharedValue<S, F>, MpcError> {
        self.check(id)?;
        self.cells[id.index]
            .ok_or_else(|| Misuse::UnresolvedCell(id.index).into())
    }

    /// Read local share of a secret value.
    pub fn secret(&self, handle: Secret) -> Result<S, MpcError> {
        match self.read(handle.0)? {
            SharedValue::Secret(x) => Ok(x),
            _ => Err(kind_mismatch(handle.0, "secret")),
        }
    }

    /// Read public value.
    pub fn public(&self, handle: Public) -> Result<F, MpcError> {
        match self.read(handle.0)? {
            SharedValue::Public(x) => Ok(x),
            SharedValue::Withheld => Err(Misuse::ValueWithheld(handle.0.index).into()),
            SharedValue::Secret(_) => Err(kind_mismatch(handle.0, "public")),
        }
    }
}

impl<S: Copy, F: Copy> Default for CellArena<S, F> {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_mismatch(cell: CellId, expected: &'static str) -> MpcError {
    Misuse::KindMismatch {
        cell: cell.index,
        expected,
    }
    .into()
}

/// Deferred result that can be looked up once evaluation finished.
/// Resolving is idempotent: every lookup of the same handle yields the same value.
pub trait Resolve<S, F> {
    type Output;

    fn resolve(&self, cells: &CellArena<S, F>) -> Result<Self::Output, MpcError>;
}

impl<S: Copy, F: Copy> Resolve<S, F> for Secret {
    type Output = S;

    fn resolve(&self, cells: &CellArena<S, F>) -> Result<S, MpcError> {
        cells.secret(*self)
    }
}

impl<S: Copy, F: Copy> Resolve<S, F> for Public {
    type Output = F;

    fn resolve(&self, cells: &CellArena<S, F>) -> Result<F, MpcError> {
        cells.public(*self)
    }
}

impl<S: Copy, F: Copy> Resolve<S, F> for Wire {
    type Output = SharedValue<S, F>;

    fn resolve(&self, cells: &CellArena<S, F>) -> Result<Self::Output, MpcError> {
        cells.read(self.cell())
    }
}

impl<S, F, T: Resolve<S, F>> Resolve<S, F> for Vec<T> {
    type Output = Vec<T::Output>;

    fn resolve(&self, cells: &CellArena<S, F>) -> Result<Self::Output, MpcError> {
        self.iter().map(|x| x.resolve(cells)).collect()
    }
}

impl<S, F, A: Resolve<S, F>, B: Resolve<S, F>> Resolve<S, F> for (A, B) {
    type Output = (A::Output, B::Output);

    fn resolve(&self, cells: &CellArena<S, F>) -> Result<Self::Output, MpcError> {
        Ok((self.0.resolve(cells)?, self.1.resolve(cells)?))
    }
}

impl<S, F, A: Resolve<S, F>, B: Resolve<S, F>, C: Resolve<S, F>> Resolve<S, F> for (A, B, C) {
    type Output = (A::Output, B::Output, C::Output);

    fn resolve(&self, cells: &CellArena<S, F>) -> Result<Self::Output, MpcError> {
        Ok((
            self.0.resolve(cells)?,
            self.1.resolve(cells)?,
            self.2.resolve(cells)?,
        ))
    }
}

/// Linear combination of deferred values with public coefficients.
#[derive(Clone, Debug)]
pub struct LinearCombination<F> {
    pub terms: Vec<(F, Wire)>,
    pub constant: F,
}

impl<F> LinearCombination<F> {
    /// Does combination involve a secret value? If not, its result is public.
    pub fn is_secret(&self) -> bool {
        self.terms
            .iter()
            .any(|(_, wire)| matches!(wire, Wire::Secret(_)))
    }

    /// Cells read by this combination.
    pub fn inputs(&self) -> impl Iterator<Item = CellId> + '_ {
        self.terms.iter().map(|(_, wire)| wire.cell())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_is_written_once() {
        let mut arena = CellArena::<u64, u64>::new();
        let id = arena.allocate();
        assert!(matches!(
            arena.read(id),
            Err(MpcError::Misuse(Misuse::UnresolvedCell(0)))
        ));
        arena.write(id, SharedValue::Public(7)).unwrap();
        assert!(matches!(
            arena.write(id, SharedValue::Public(8)),
            Err(MpcError::Misuse(Misuse::CellWrittenTwice(0)))
        ));
        assert_eq!(arena.public(Public(id)).unwrap(), 7);
    }

    #[test]
    fn test_foreign_handles_are_rejected() {
        let mut first = CellArena::<u64, u64>::new();
        let mut second = CellArena::<u64, u64>::new();
        let id = first.allocate();
        second.allocate();
        assert_ne!(first.circuit, second.circuit);
        assert!(matches!(
            second.check(id),
            Err(MpcError::Misuse(Misuse::UnknownCell(0)))
        ));
        assert!(first.check(id).is_ok());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let mut arena = CellArena::<u64, u64>::new();
        let a = Secret(arena.allocate());
        let b = Public(arena.allocate());
        arena.write(a.0, SharedValue::Secret(5)).unwrap();
        arena.write(b.0, SharedValue::Withheld).unwrap();

        let handles = vec![a, a];
        assert_eq!(handles.resolve(&arena).unwrap(), vec![5, 5]);
        assert!(matches!(
            b.resolve(&arena),
            Err(MpcError::Misuse(Misuse::ValueWithheld(1)))
        ));
        assert!(matches!(
            Wire::from(a).as_public(),
            Err(MpcError::Misuse(Misuse::KindMismatch { .. }))
        ));
    }
}
