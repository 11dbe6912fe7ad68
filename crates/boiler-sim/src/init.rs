//! Weight initialisers.
//!
//! [`orthogonal`] is used for every stage kernel. Each time step chains three
//! gated updates, so the kernels start with singular values of exactly one.
//! [`glorot_uniform`] is used for the output projection.

use nalgebra::DMatrix;
use ndarray::Array2;
use rand::distributions::Uniform;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::ModelError;

/// Draw a `(rows, cols)` matrix with orthonormal columns (if `rows >= cols`)
/// or orthonormal rows (otherwise).
///
/// A standard-normal matrix of the requested shape is decomposed by SVD and
/// whichever factor already has that shape is returned: `U` for tall or
/// square matrices, `Vᵀ` for wide ones.
///
/// # Errors
///
/// [`ModelError::EmptyShape`] for a zero dimension and
/// [`ModelError::Decomposition`] if the SVD does not yield the factor.
pub fn orthogonal<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    rng: &mut R,
) -> Result<Array2<f32>, ModelError> {
    if rows == 0 || cols == 0 {
        return Err(ModelError::EmptyShape { rows, cols });
    }

    let a = DMatrix::<f64>::from_fn(rows, cols, |_, _| rng.sample(StandardNormal));
    let svd = a.svd(true, true);
    let factor = match (svd.u, svd.v_t) {
        (Some(u), _) if u.shape() == (rows, cols) => u,
        (_, Some(v_t)) if v_t.shape() == (rows, cols) => v_t,
        _ => return Err(ModelError::Decomposition { rows, cols }),
    };

    Ok(Array2::from_shape_fn((rows, cols), |(r, c)| factor[(r, c)] as f32))
}

/// Glorot/Xavier uniform initialisation: `U(-l, l)` with
/// `l = sqrt(6 / (rows + cols))`.
pub fn glorot_uniform<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    let limit = (6.0 / (rows + cols).max(1) as f32).sqrt();
    let dist = Uniform::new_inclusive(-limit, limit);
    Array2::from_shape_fn((rows, cols), |_| rng.sample(dist))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn assert_identity(m: &Array2<f32>) {
        for ((r, c), &v) in m.indexed_iter() {
            let expected = if r == c { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(v, expected, epsilon = 1e-4);
        }
    }

    #[test]
    fn tall_matrix_has_orthonormal_columns() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let q = orthogonal(40, 12, &mut rng).unwrap();
        assert_eq!(q.dim(), (40, 12));
        assert_identity(&q.t().dot(&q));
    }

    #[test]
    fn wide_matrix_has_orthonormal_rows() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let q = orthogonal(8, 32, &mut rng).unwrap();
        assert_eq!(q.dim(), (8, 32));
        assert_identity(&q.dot(&q.t()));
    }

    #[test]
    fn same_seed_same_matrix() {
        let a = orthogonal(6, 6, &mut ChaCha8Rng::seed_from_u64(7)).unwrap();
        let b = orthogonal(6, 6, &mut ChaCha8Rng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_shape_is_rejected() {
        let err = orthogonal(0, 4, &mut ChaCha8Rng::seed_from_u64(0)).unwrap_err();
        assert!(matches!(err, ModelError::EmptyShape { rows: 0, cols: 4 }));
    }

    #[test]
    fn glorot_respects_limit() {
        let w = glorot_uniform(10, 30, &mut ChaCha8Rng::seed_from_u64(3));
        let limit = (6.0f32 / 40.0).sqrt();
        assert!(w.iter().all(|v| v.abs() <= limit));
    }
}
