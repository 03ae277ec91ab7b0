//! Dense symmetric positive-definite solver over a Gram matrix.
//!
//! The serving core treats "solve a system given YᵀY" as an opaque
//! capability; this is its one concrete implementation, a Cholesky
//! factorization held in f64 for numerical headroom. Feature counts are
//! small (tens), so an unblocked factorization is plenty.

use anyhow::{bail, Result};

/// Pivots this close to zero mean the Gram matrix is singular for practical
/// purposes (e.g. an empty or rank-deficient item matrix).
const MIN_PIVOT: f64 = 1.0e-12;

/// Cholesky factor `L` of an SPD matrix `A = L Lᵀ`, ready to solve
/// `A x = b` by two triangular substitutions.
pub struct Solver {
    n: usize,
    /// Row-major `n x n`; only the lower triangle is meaningful.
    lower: Vec<f64>,
}

impl Solver {
    /// Factor a row-major `n x n` symmetric matrix.
    ///
    /// Fails when the matrix is not positive definite, which callers should
    /// treat as "solver unavailable" rather than fatal.
    pub fn cholesky(matrix: &[f64], n: usize) -> Result<Self> {
        if n == 0 || matrix.len() != n * n {
            bail!("expected a {n}x{n} matrix, got {} entries", matrix.len());
        }
        let mut lower = vec![0.0f64; n * n];
        for i in 0..n {
            for j in 0..=i {
                let mut sum = matrix[i * n + j];
                for k in 0..j {
                    sum -= lower[i * n + k] * lower[j * n + k];
                }
                if i == j {
                    if sum <= MIN_PIVOT {
                        bail!("matrix is not positive definite (pivot {sum} at row {i})");
                    }
                    lower[i * n + i] = sum.sqrt();
                } else {
                    lower[i * n + j] = sum / lower[j * n + j];
                }
            }
        }
        Ok(Self { n, lower })
    }

    pub fn dimension(&self) -> usize {
        self.n
    }

    /// Solve `A x = b` for the factored matrix `A`.
    pub fn solve(&self, b: &[f64]) -> Result<Vec<f64>> {
        if b.len() != self.n {
            bail!("right-hand side has length {}, expected {}", b.len(), self.n);
        }
        let n = self.n;
        // Forward substitution: L y = b.
        let mut x = b.to_vec();
        for i in 0..n {
            for k in 0..i {
                x[i] -= self.lower[i * n + k] * x[k];
            }
            x[i] /= self.lower[i * n + i];
        }
        // Back substitution: Lᵀ x = y.
        for i in (0..n).rev() {
            for k in (i + 1)..n {
                x[i] -= self.lower[k * n + i] * x[k];
            }
            x[i] /= self.lower[i * n + i];
        }
        Ok(x)
    }

    /// [`solve`](Self::solve) for f32 callers holding feature vectors.
    pub fn solve_f_to_f(&self, b: &[f32]) -> Result<Vec<f32>> {
        let b64: Vec<f64> = b.iter().map(|&v| v as f64).collect();
        Ok(self.solve(&b64)?.into_iter().map(|v| v as f32).collect())
    }
}
