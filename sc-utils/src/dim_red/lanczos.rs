#![allow(non_snake_case)]

use super::{check_dims, MatOp, Pca, SvdResult};
use anyhow::{format_err, Error};
use log::{debug, warn};
use ndarray::prelude::*;
use ndarray_linalg::SVD;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_distr::Normal;
use rand_pcg::Pcg64Mcg;
use std::cmp::{max, min};

fn norm(x: &ArrayView1<f64>) -> f64 {
    x.dot(x).sqrt()
}

/// Orthogonalize `y` against the (orthonormal) columns of `x`.
fn orthog(y: &ArrayView1<f64>, x: &ArrayView2<f64>) -> Array1<f64> {
    let dot_y = x.t().dot(y);
    y - &x.dot(&dot_y)
}

/// Reciprocal of `x`, or zero when `x` is numerically zero.
fn invcheck(x: f64) -> f64 {
    if x > 2.0 * f64::EPSILON {
        1.0 / x
    } else {
        0.0
    }
}

/// Implicitly restarted Lanczos bidiagonalization
#[derive(Clone, Debug)]
pub struct Lanczos {
    /// convergence tolerance on the Ritz residuals, relative to the largest singular value
    pub tol: f64,
    /// maximum number of restarts
    pub max_iter: usize,
    /// seed of the random start vector
    pub seed: u64,
}

impl Default for Lanczos {
    fn default() -> Self {
        Lanczos {
            tol: 1e-5,
            max_iter: 100,
            seed: 0,
        }
    }
}

impl Lanczos {
    /// Working subspace dimension for `k` components of an `m × n` matrix, or
    /// `None` if the subspace would span the whole matrix.
    pub fn subspace_dim(k: usize, m: usize, n: usize) -> Option<usize> {
        let m_b = min(k + 20, min(3 * k, n));
        if k == 0 || m_b >= min(m, n) || m_b < k + 3 {
            None
        } else {
            Some(m_b)
        }
    }
}

impl Pca for Lanczos {
    fn run_pca<T: MatOp>(&self, matrix: &T, k: usize) -> Result<SvdResult, Error> {
        lanczos(matrix, k, self.tol, self.max_iter, self.seed)
    }
}

/// Truncated SVD of `A` retaining `nu` singular triplets, aiming for tolerance
/// `tol` and restarting at most `maxit` times.
pub fn lanczos<T: MatOp>(A: &T, nu: usize, tol: f64, maxit: usize, seed: u64) -> Result<SvdResult, Error> {
    let (m, n) = A.shape();
    check_dims(m, n, nu)?;
    let m_b = Lanczos::subspace_dim(nu, m, n)
        .ok_or_else(|| format_err!("{} components of a {}x{} matrix need an exact SVD", nu, m, n))?;

    let mut mprod = 0;
    let mut it = 0;
    let mut j = 0;
    let mut k = nu;
    let mut smax = f64::MIN;

    let mut V: Array2<f64> = Array2::zeros((n, m_b));
    let mut W: Array2<f64> = Array2::zeros((m, m_b));
    let mut F: Array1<f64> = Array1::zeros(n);
    let mut B: Array2<f64> = Array2::zeros((m_b, m_b));

    {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let rnorm = Normal::new(0.0f64, 1.0f64).map_err(|e| format_err!("{e}"))?;
        let mut start = Array1::random_using(n, rnorm, &mut rng);
        start *= 1.0 / norm(&start.view());
        V.column_mut(0).assign(&start);
    }

    let (u, sigma, vt) = loop {
        if it > 0 {
            j = k;
        }

        W.column_mut(j).assign(&A.dot(&V.column(j)));
        mprod += 1;

        if it > 0 {
            let nc = orthog(&W.column(j), &W.slice(s![.., 0..j]));
            W.column_mut(j).assign(&nc);
        }

        let mut s = norm(&W.column(j));
        let sinv = invcheck(s);
        W.column_mut(j).mapv_inplace(|x| x * sinv);

        let mut fnorm = 0.0;
        while j < m_b {
            F = A.tdot(&W.column(j));
            mprod += 1;

            F -= &(&V.column(j) * s);
            F = orthog(&F.view(), &V.slice(s![.., 0..j + 1]));
            fnorm = norm(&F.view());
            F *= invcheck(fnorm);

            B[(j, j)] = s;
            if j < m_b - 1 {
                V.column_mut(j + 1).assign(&F);
                B[(j, j + 1)] = fnorm;

                let mut w = A.dot(&V.column(j + 1));
                mprod += 1;
                w -= &(&W.column(j) * fnorm);
                w = orthog(&w.view(), &W.slice(s![.., 0..j + 1]));
                s = norm(&w.view());
                W.column_mut(j + 1).assign(&(&w * invcheck(s)));
            }
            j += 1;
        }

        let (u, sigma, vt) = B.svd(true, true)?;
        let u = u.ok_or_else(|| format_err!("SVD of the bidiagonal matrix returned no U"))?;
        let vt = vt.ok_or_else(|| format_err!("SVD of the bidiagonal matrix returned no V"))?;

        let resid = fnorm * &u.slice(s![m_b - 1, ..]);
        smax = smax.max(sigma[0]);
        let num_converged = (0..nu).filter(|&i| resid[i].abs() < tol * smax).count();

        it += 1;
        if num_converged >= nu {
            debug!("Lanczos converged after {} restarts, {} matrix products", it, mprod);
            break (u, sigma, vt);
        }
        if it >= maxit {
            warn!(
                "Lanczos stopped after {} restarts with {} of {} components converged",
                it, num_converged, nu
            );
            break (u, sigma, vt);
        }

        k = max(num_converged + nu, k).min(m_b - 3);

        // restart from the leading Ritz vectors
        let v_update = V.dot(&vt.t().slice(s![.., 0..k]));
        V.slice_mut(s![.., 0..k]).assign(&v_update);
        V.column_mut(k).assign(&F);

        B = Array2::zeros((m_b, m_b));
        for l in 0..k {
            B[(l, l)] = sigma[l];
        }
        B.slice_mut(s![0..k, k]).assign(&resid.slice(s![0..k]));

        let w_update = W.dot(&u.slice(s![.., 0..k]));
        W.slice_mut(s![.., 0..k]).assign(&w_update);
    };

    let U = W.dot(&u.slice(s![.., 0..nu]));
    let V = V.dot(&vt.t().slice(s![.., 0..nu]));
    Ok((U, sigma.slice(s![0..nu]).to_owned(), V))
}

#[cfg(test)]
mod test {
    use super::super::test::poisson_counts;
    use super::super::{CenteredMatrix, FullSvd};
    use super::*;

    #[test]
    fn test_matches_full_svd() {
        let m = poisson_counts(120, 60, 5);
        let c = CenteredMatrix::new(&m);
        let (u, s, v) = Lanczos::default().run_pca(&c, 8).unwrap();
        let (u_ref, s_ref, v_ref) = FullSvd.run_pca(&c, 8).unwrap();

        for i in 0..8 {
            assert!((s[i] - s_ref[i]).abs() < 1e-4 * s_ref[0], "{} vs {}", s[i], s_ref[i]);
        }
        // the leading component is well separated; its vectors agree up to sign
        let cos_u = u.column(0).dot(&u_ref.column(0)).abs();
        let cos_v = v.column(0).dot(&v_ref.column(0)).abs();
        assert!(cos_u > 1.0 - 1e-6, "cos {}", cos_u);
        assert!(cos_v > 1.0 - 1e-6, "cos {}", cos_v);
    }

    #[test]
    fn test_orthonormal_factors() {
        let m = poisson_counts(80, 40, 6);
        let (u, _, v) = Lanczos::default().run_pca(&m, 5).unwrap();
        assert!(u.t().dot(&u).abs_diff_eq(&Array2::eye(5), 1e-6));
        assert!(v.t().dot(&v).abs_diff_eq(&Array2::eye(5), 1e-6));
    }

    #[test]
    fn test_subspace_dim() {
        assert_eq!(Lanczos::subspace_dim(50, 1000, 2000), Some(70));
        assert_eq!(Lanczos::subspace_dim(5, 100, 40), Some(15));
        assert_eq!(Lanczos::subspace_dim(1, 100, 40), None);
        assert_eq!(Lanczos::subspace_dim(10, 100, 25), None);
    }
}
