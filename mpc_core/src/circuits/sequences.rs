use ff::Field;
use itertools::Itertools;

use crate::{Arithmetic, MpcEngine, MpcError, Scope, Secret};

/// Single element or pair of elements of the same type.
enum SingleOrPair<T> {
    Single(T),
    Pair(T, T),
}

/// Batch iterator into pairs and maybe a leftover single element.
fn batch_pairs<T>(it: impl IntoIterator<Item = T>) -> impl Iterator<Item = SingleOrPair<T>> {
    it.into_iter().batching(|it| {
        it.next().map(|first| match it.next() {
            Some(second) => SingleOrPair::Pair(first, second),
            None => SingleOrPair::Single(first),
        })
    })
}

/// Aggregate elements by combining distinct pairs in parallel, halving their number each level.
/// Returns `None` for no elements.
pub fn fold_tree<E, T, F>(
    s: &mut Scope<'_, E>,
    elems: impl IntoIterator<Item = T>,
    combine_fn: F,
) -> Result<Option<T>, MpcError>
where
    E: MpcEngine,
    F: Fn(&mut Scope<'_, E>, T, T) -> Result<T, MpcError>,
{
    let mut elems: Vec<_> = elems.into_iter().collect();

    while elems.len() > 1 {
        elems = s.parallel(batch_pairs(elems), |s, p| match p {
            SingleOrPair::Single(value) => Ok(value),
            SingleOrPair::Pair(first, second) => combine_fn(s, first, second),
        })?;
    }

    Ok(elems.into_iter().next())
}

/// Compute product of given sequence of shares.
/// Cost: n-1 multiplications, log_2(n) communication rounds, where n is sequence length.
pub fn product<E: Arithmetic>(s: &mut Scope<'_, E>, elems: &[Secret]) -> Result<Secret, MpcError> {
    match fold_tree(s, elems.iter().copied(), |s, a, b| s.multiply(a, b))? {
        Some(result) => Ok(result),
        None => s.known_value(E::Field::one()),
    }
}
