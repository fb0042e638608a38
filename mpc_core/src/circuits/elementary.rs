use ff::Field;

use crate::{Arithmetic, Misuse, MpcError, Scope, Secret};

/// Inner product of two equally long sequences of shares.
/// Cost: n multiplications in a single communication round.
pub fn dot_product<E: Arithmetic>(
    s: &mut Scope<'_, E>,
    a: &[Secret],
    b: &[Secret],
) -> Result<Secret, MpcError> {
    if a.len() != b.len() {
        return Err(Misuse::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        }
        .into());
    }
    let products = s.parallel(a.iter().zip(b), |s, (&x, &y)| s.multiply(x, y))?;
    s.sum(&products)
}

/// Raise share to a power known at construction time by square-and-multiply.
/// Cost: at most 2 log_2(exponent) multiplications, one communication round per exponent bit.
pub fn power<E: Arithmetic>(
    s: &mut Scope<'_, E>,
    x: Secret,
    mut exponent: u64,
) -> Result<Secret, MpcError> {
    let mut base = x;
    let mut result: Option<Secret> = None;

    while exponent > 0 {
        let bit = exponent & 1 == 1;
        exponent >>= 1;
        let square = exponent > 0;

        // Multiply into the result and square the base concurrently.
        let (next_result, next_base) = s.join(
            |s| match (bit, result) {
                (true, Some(acc)) => s.multiply(acc, base).map(Some),
                (true, None) => Ok(Some(base)),
                (false, acc) => Ok(acc),
            },
            |s| if square { s.multiply(base, base) } else { Ok(base) },
        )?;
        result = next_result;
        base = next_base;
    }

    match result {
        Some(result) => Ok(result),
        None => s.known_value(E::Field::one()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fields::F251,
        plaintext::MockMpcEngine,
        spdz::{FakeSpdzDealer, SpdzEngine},
        testing::run_parties,
        Session,
    };

    type Fp = F251;

    fn mock_engine() -> Vec<MockMpcEngine<Fp>> {
        vec![MockMpcEngine::new(Session::new::<Fp>(1, 0).unwrap())]
    }

    #[tokio::test]
    async fn test_dot_product() {
        let engines: Vec<_> = Session::all::<Fp>(2)
            .unwrap()
            .into_iter()
            .map(|session| {
                let dealer = FakeSpdzDealer::new(&session, 41);
                SpdzEngine::new(session, dealer).unwrap()
            })
            .collect();

        let results = run_parties(engines, |s| {
            let a = s.parallel([5u64, 3], |s, x| s.known_value(Fp::from(x)))?;
            let b = s.parallel([7u64, 2], |s, x| s.known_value(Fp::from(x)))?;
            let result = dot_product(s, &a, &b)?;
            s.open_to_all(result)
        })
        .await;

        for result in results {
            let (execution, result, _) = result.unwrap();
            assert_eq!(execution.resolve(&result).unwrap(), Fp::from(41));
        }
    }

    #[tokio::test]
    async fn test_dot_product_dimension_mismatch() {
        let mut results = run_parties(mock_engine(), |s| {
            let x = s.known_value(Fp::from(1))?;
            dot_product(s, &[x, x], &[x])
        })
        .await;

        assert!(matches!(
            results.pop().unwrap(),
            Err(MpcError::Misuse(Misuse::DimensionMismatch { left: 2, right: 1 }))
        ));
    }

    #[tokio::test]
    async fn test_power() {
        for exponent in [0u64, 1, 2, 5, 13] {
            let mut results = run_parties(mock_engine(), move |s| {
                let x = s.known_value(Fp::from(3))?;
                let result = power(s, x, exponent)?;
                s.open_to_all(result)
            })
            .await;

            let (execution, result, _) = results.pop().unwrap().unwrap();
            assert_eq!(
                execution.resolve(&result).unwrap(),
                Fp::from(3).pow_vartime([exponent])
            );
        }
    }

    #[tokio::test]
    async fn test_power_rounds_are_logarithmic() {
        let mut results = run_parties(mock_engine(), |s| {
            let x = s.known_value(Fp::from(2))?;
            power(s, x, 255)
        })
        .await;

        let (execution, _, engine) = results.pop().unwrap().unwrap();
        // Eight set bits: one round per bit, squarings alongside multiplications into the result.
        assert_eq!(execution.stats().rounds, 8);
        assert_eq!(engine.num_multiplications(), 14);
    }
}
