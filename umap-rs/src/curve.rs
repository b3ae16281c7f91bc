//! Fit of the low-dimensional membership curve `1 / (1 + a·x^(2b))` to the
//! offset exponential defined by `spread` and `min_dist`.

use log::debug;
use ndarray::{array, Array1, Array2};
use ndarray_linalg::Solve;

const MAX_ITERATIONS: usize = 100;
const LAMBDA_UP: f64 = 11.0;
const LAMBDA_DOWN: f64 = 9.0;
const TOLERANCE: f64 = 1e-12;

/// `1 / (1 + a·x^(2b))`
pub fn curve(a: f64, b: f64, x: f64) -> f64 {
    1.0 / (1.0 + a * x.powf(2.0 * b))
}

fn chi2(p: &Array1<f64>, x: &Array1<f64>, y: &Array1<f64>) -> f64 {
    x.iter()
        .zip(y)
        .map(|(&x, &y)| (y - curve(p[0], p[1], x)).powi(2))
        .sum()
}

/// Residuals and the `n × 2` jacobian of the model at `p`.
fn linearize(p: &Array1<f64>, x: &Array1<f64>, y: &Array1<f64>) -> (Array1<f64>, Array2<f64>) {
    let (a, b) = (p[0], p[1]);
    let mut residuals = Array1::zeros(x.len());
    let mut jacobian = Array2::zeros((x.len(), 2));
    for (i, &xi) in x.iter().enumerate() {
        let f = curve(a, b, xi);
        residuals[i] = y[i] - f;
        if xi > 0.0 {
            let x2b = xi.powf(2.0 * b);
            jacobian[(i, 0)] = -x2b * f * f;
            jacobian[(i, 1)] = -2.0 * a * x2b * xi.ln() * f * f;
        }
    }
    (residuals, jacobian)
}

/// Least-squares `(a, b)` for the given `spread` and `min_dist`, by
/// Levenberg-Marquardt from `(1, 1)` over `x` in `[0, 3·spread)`.
pub fn find_ab_params(spread: f64, min_dist: f64) -> (f64, f64) {
    let x = Array1::range(0.0, 3.0 * spread, spread / 100.0);
    let y = x.mapv(|x| {
        if x < min_dist {
            1.0
        } else {
            (-(x - min_dist) / spread).exp()
        }
    });

    let mut p = array![1.0, 1.0];
    let mut current = chi2(&p, &x, &y);
    let mut lambda = 1e-3;

    for iteration in 0..MAX_ITERATIONS {
        let (residuals, jacobian) = linearize(&p, &x, &y);
        let jtj = jacobian.t().dot(&jacobian);
        let rhs = jacobian.t().dot(&residuals);

        let mut lhs = jtj.clone();
        for i in 0..2 {
            lhs[(i, i)] += lambda * jtj[(i, i)].max(f64::EPSILON);
        }
        let delta = match lhs.solve(&rhs) {
            Ok(delta) => delta,
            Err(err) => {
                debug!("stopping a/b fit at iteration {}: {}", iteration, err);
                break;
            }
        };

        let candidate = &p + &delta;
        let next = chi2(&candidate, &x, &y);
        if next.is_finite() && next <= current {
            let improvement = current - next;
            p = candidate;
            current = next;
            lambda = (lambda / LAMBDA_DOWN).max(1e-12);
            if improvement <= TOLERANCE * current.max(TOLERANCE) {
                break;
            }
        } else {
            lambda = (lambda * LAMBDA_UP).min(1e12);
        }
    }
    debug!("a/b fit: a = {:.6}, b = {:.6}, chi2 = {:.3e}", p[0], p[1], current);
    (p[0], p[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_min_dist() {
        let (a, b) = find_ab_params(1.0, 0.1);
        assert!((a - 1.5769).abs() < 1e-2, "a = {a}");
        assert!((b - 0.8951).abs() < 1e-2, "b = {b}");
    }

    #[test]
    fn test_wider_min_dist() {
        let (a, b) = find_ab_params(1.0, 0.5);
        assert!((a - 0.583).abs() < 2e-2, "a = {a}");
        assert!((b - 1.334).abs() < 2e-2, "b = {b}");
    }

    #[test]
    fn test_curve() {
        assert_eq!(curve(1.5, 0.9, 0.0), 1.0);
        assert!((curve(1.0, 1.0, 1.0) - 0.5).abs() < 1e-15);
    }
}
