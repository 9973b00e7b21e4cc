//! Numeric solvers used by the M-step, built on argmin executors.
//!
//! Both solvers are non-fatal: an iteration cap or a solver error ends the
//! search with the best point found so far and `converged = false`.
use argmin::core::{CostFunction, Error as ArgminError, Executor, Jacobian, Operator, State, TerminationReason};
use argmin::solver::brent::BrentOpt;
use argmin::solver::gaussnewton::GaussNewton;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

/// Result of a bounded 1-D maximization.
#[derive(Debug, Clone, Copy)]
pub struct BrentResult {
    pub x: f64,
    pub fx: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// `-f`, so that argmin's minimizer applies; NaN counts as the worst value
struct NegatedObjective<'a, F> {
    f: &'a F,
}

impl<'a, F> CostFunction for NegatedObjective<'a, F>
where
    F: Fn(f64) -> f64,
{
    type Param = f64;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, ArgminError> {
        let y = (self.f)(*x);
        Ok(match y.is_nan() {
            true => f64::INFINITY,
            false => -y,
        })
    }
}

/// Maximize `f` on `[lo, hi]` with Brent's method.
///
/// The search stops once the bracket is narrower than `tol` (plus a relative
/// term) or after `max_iter` iterations. Hitting the cap is not an error:
/// the best point seen is returned with `converged = false`.
pub fn brent_maximize<F>(f: F, lo: f64, hi: f64, tol: f64, max_iter: usize) -> BrentResult
where
    F: Fn(f64) -> f64,
{
    let (a, b) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    if a == b {
        return BrentResult {
            x: a,
            fx: f(a),
            iterations: 0,
            converged: true,
        };
    }
    let solver = BrentOpt::new(a, b).set_tolerance(f64::EPSILON.sqrt(), tol);
    let res = Executor::new(NegatedObjective { f: &f }, solver)
        .configure(|state| state.max_iters(max_iter as u64))
        .run();
    match res {
        Ok(r) => {
            let converged = matches!(r.state.get_termination_reason(), Some(TerminationReason::SolverConverged));
            let x = r.state.best_param.unwrap_or(0.5 * (a + b));
            if !converged {
                debug!("brent: stopped after {} iterations at x={x}", r.state.get_iter());
            }
            BrentResult {
                x,
                fx: f(x),
                iterations: r.state.get_iter() as usize,
                converged,
            }
        }
        Err(e) => {
            warn!("brent: solver error {e}, using the interval midpoint");
            let x = 0.5 * (a + b);
            BrentResult {
                x,
                fx: f(x),
                iterations: 0,
                converged: false,
            }
        }
    }
}

/// Result of a multi-dimensional root search.
#[derive(Debug, Clone)]
pub struct RootResult {
    pub x: DVector<f64>,
    pub residual: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Square system `f(x) = 0` as a residual operator with a forward
/// difference Jacobian.
struct RootProblem<'a, F> {
    f: &'a F,
}

impl<'a, F> Operator for RootProblem<'a, F>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    type Param = DVector<f64>;
    type Output = DVector<f64>;

    fn apply(&self, x: &Self::Param) -> Result<Self::Output, ArgminError> {
        Ok((self.f)(x))
    }
}

impl<'a, F> Jacobian for RootProblem<'a, F>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    type Param = DVector<f64>;
    type Jacobian = DMatrix<f64>;

    fn jacobian(&self, x: &Self::Param) -> Result<Self::Jacobian, ArgminError> {
        let n = x.len();
        let fx = (self.f)(x);
        let mut jac = DMatrix::<f64>::zeros(fx.len(), n);
        for j in 0..n {
            let h = 1e-7 * x[j].abs().max(1.0);
            let mut xh = x.clone();
            xh[j] += h;
            let fh = (self.f)(&xh);
            for i in 0..fx.len() {
                jac[(i, j)] = (fh[i] - fx[i]) / h;
            }
        }
        Ok(jac)
    }
}

/// step sizes tried in turn when the full Newton step does not reach the root
const DAMPING: [f64; 3] = [1.0, 0.5, 0.25];

/// Solve `f(x) = 0` by Gauss-Newton iterations; for a square system this is
/// Newton's method on the residuals.
///
/// Full steps are tried first, then damped ones. A singular Jacobian, a
/// solver error or the iteration cap keeps the iterate with the smallest
/// residual (`converged = false`).
pub fn multiroot_solve<F>(f: F, x0: DVector<f64>, tol: f64, max_iter: usize) -> RootResult
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let residual = f(&x0).norm();
    let mut best = RootResult {
        x: x0.clone(),
        residual,
        iterations: 0,
        converged: residual <= tol || x0.is_empty(),
    };
    if best.converged {
        return best;
    }

    for gamma in DAMPING {
        let solver = match GaussNewton::new().with_gamma(gamma).and_then(|s| s.with_tolerance(tol)) {
            Ok(s) => s,
            Err(e) => {
                warn!("multiroot: cannot set up solver: {e}");
                break;
            }
        };
        let start = x0.clone();
        let res = Executor::new(RootProblem { f: &f }, solver)
            .configure(|state| state.param(start).max_iters(max_iter as u64))
            .run();
        let (x, iterations) = match res {
            Ok(r) => {
                let iter = r.state.get_iter() as usize;
                match r.state.param {
                    Some(x) => (x, iter),
                    None => continue,
                }
            }
            Err(e) => {
                debug!("multiroot: step size {gamma}: {e}");
                continue;
            }
        };
        let residual = f(&x).norm();
        if !x.iter().all(|v| v.is_finite()) || !(residual < best.residual) {
            continue;
        }
        best = RootResult {
            x,
            residual,
            iterations,
            converged: residual <= tol,
        };
        if best.converged {
            return best;
        }
    }

    debug!("multiroot: no root within tolerance, residual={}", best.residual);
    best
}

#[test]
fn test_brent_quadratic() {
    let res = brent_maximize(|x| -(x - 1.7) * (x - 1.7), 0.0, 5.0, 1e-10, 200);
    assert!(res.converged);
    assert!((res.x - 1.7).abs() < 1e-6, "{res:?}");
    assert!(res.fx.abs() < 1e-10);
}

#[test]
fn test_brent_boundary_maximum() {
    // increasing function: maximum at the upper bound
    let res = brent_maximize(|x| x.ln(), 0.5, 3.0, 1e-10, 200);
    assert!((res.x - 3.0).abs() < 1e-4, "{res:?}");
}

#[test]
fn test_brent_iteration_cap_returns_best() {
    let res = brent_maximize(|x| -(x - 2.0).powi(2), 0.0, 10.0, 1e-14, 3);
    assert!(!res.converged);
    assert_eq!(res.iterations, 3);
    assert!(res.x >= 0.0 && res.x <= 10.0);
}

#[test]
fn test_multiroot_linear_and_nonlinear() {
    // linear system: one Newton step
    let res = multiroot_solve(
        |x| DVector::from_vec(vec![2.0 * x[0] + x[1] - 3.0, x[0] - x[1]]),
        DVector::from_vec(vec![0.0, 0.0]),
        1e-10,
        50,
    );
    assert!(res.converged);
    assert!((res.x[0] - 1.0).abs() < 1e-6 && (res.x[1] - 1.0).abs() < 1e-6);

    // gradient of a concave log-likelihood: logistic intercept
    // d/db sum(y - sigmoid(b)) = 0  =>  sigmoid(b) = mean(y) = 0.25
    let ys = [0.0, 0.0, 0.0, 1.0];
    let res = multiroot_solve(
        |b| {
            let p = 1.0 / (1.0 + (-b[0]).exp());
            DVector::from_vec(vec![ys.iter().map(|y| y - p).sum::<f64>()])
        },
        DVector::from_vec(vec![0.0]),
        1e-12,
        100,
    );
    assert!((res.x[0] - (0.25f64 / 0.75).ln()).abs() < 1e-6, "{res:?}");
}

#[test]
fn test_multiroot_singular_is_not_fatal() {
    let res = multiroot_solve(
        |_x| DVector::from_vec(vec![1.0, 1.0]),
        DVector::from_vec(vec![0.5, 0.5]),
        1e-10,
        10,
    );
    assert!(!res.converged);
    assert_eq!(res.x[0], 0.5);
}
