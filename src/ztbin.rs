//! Zero-truncated binomial emissions for read-start (truncation) counts.
//!
//! The density of `k` read starts out of `n` reads is the binomial density
//! conditioned on `k >= 1`:
//!
//! `P(k | n, p) = C(n, k) p^k (1-p)^(n-k) / (1 - (1-p)^n)`
//!
//! The normalizer is `P(K >= 1) = 1 - P(K = 0) = 1 - (1-p)^n`, the
//! truncated-binomial form of Rider (1955).
use crate::{
    args::FitOptions,
    emission::Weighted,
    matrix::Real,
    model::State,
    solver::multiroot_solve,
};
use log::{debug, error, warn};
use nalgebra::DVector;
use statrs::function::factorial::ln_binomial;

pub const P_MIN: f64 = 1e-6;
pub const P_MAX: f64 = 1.0 - 1e-6;

/// `ln P(k | n, p)` of the zero-truncated binomial; `-inf` for `k = 0`.
///
/// `n` is raised to `k` when `n < k`. A NaN density is reported and mapped
/// to zero probability.
pub fn log_ztbin(k: u32, n: u32, p: f64) -> f64 {
    if k == 0 {
        return f64::NEG_INFINITY;
    }
    let n2 = n.max(k);
    // ln(1 - p)
    let ln_q = (-p).ln_1p();
    let tail = match n2 > k {
        true => (n2 - k) as f64 * ln_q,
        false => 0.0,
    };
    let log_pmf = ln_binomial(n2 as u64, k as u64) + k as f64 * p.ln() + tail;
    // ln(1 - (1-p)^n)
    let log_norm = (-(n2 as f64 * ln_q).exp_m1()).ln();
    let res = log_pmf - log_norm;
    if res.is_nan() {
        error!("zero-truncated binomial density is NaN: k={k}, n={n2}, p={p}");
        return f64::NEG_INFINITY;
    }
    res
}

/// Sites entering the binomial M-step: `k > 0`, `n >= 2`, `n >= ntp` and
/// `k/n <= max_kn_ratio`. Returns `(k, max(n, k))`.
pub fn learnable_counts(k: u32, n: u32, opts: &FitOptions) -> Option<(u32, u32)> {
    if k == 0 {
        return None;
    }
    let n = n.max(k);
    if n < 2 || n < opts.n_threshold_for_p {
        return None;
    }
    if k as f64 / n as f64 > opts.max_kn_ratio {
        return None;
    }
    Some((k, n))
}

/// Expected read-start count of the zero-truncated binomial,
/// `n p / (1 - (1-p)^n)`.
pub fn expected_count(n: u32, p: f64) -> f64 {
    let n = n.max(1) as f64;
    n * p / -(n * (-p).ln_1p()).exp_m1()
}

const N_THRESHOLD_CAP: u32 = 100_000;

/// Smallest coverage at which a site with probability `p` is expected to
/// show at least `min_count` read starts. Capped at `N_THRESHOLD_CAP`.
pub fn n_threshold_for_count(p: f64, min_count: f64) -> u32 {
    let p = p.clamp(P_MIN, P_MAX);
    (1..N_THRESHOLD_CAP)
        .find(|n| expected_count(*n, p) >= min_count)
        .unwrap_or(N_THRESHOLD_CAP)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ztbin {
    pub p: f64,
}

impl Ztbin {
    pub fn new(p: f64) -> Self {
        Self { p }
    }

    pub fn log_density(&self, k: u32, n: u32) -> f64 {
        log_ztbin(k, n, self.p)
    }

    pub fn density(&self, k: u32, n: u32) -> f64 {
        self.log_density(k, n).exp()
    }

    /// Posterior-weighted average of the moment estimator `(k-1)/(n-1)`.
    ///
    /// Returns false (and keeps `p`) if no site carries weight.
    pub fn update_p<T: Real>(
        &mut self,
        data: &[Weighted<'_, T>],
        states: &[State],
        opts: &FitOptions,
    ) -> bool {
        let mut sum1 = 0.0;
        let mut sum2 = 0.0;
        for w in data {
            let track = w.track;
            for t in 0..track.len() {
                let Some((k, n)) = learnable_counts(track.trunc_counts[t], track.n_estimates[t], opts)
                else {
                    continue;
                };
                let g = w.weight(states, t);
                if g > 0.0 {
                    sum1 += g * ((k - 1) as f64 / (n - 1) as f64);
                    sum2 += g;
                }
            }
        }
        if sum2 > 0.0 && sum1.is_finite() {
            self.p = (sum1 / sum2).clamp(P_MIN, P_MAX);
            debug!("updateP: sum1={sum1} sum2={sum2} p={}", self.p);
            true
        } else {
            warn!("no informative sites to update binomial p, keeping p={}", self.p);
            false
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Zero-truncated binomial whose probability follows a logistic regression
/// on per-site covariates (e.g. motif scores).
#[derive(Debug, Clone, PartialEq)]
pub struct ZtbinReg {
    pub b0: f64,
    pub coefs: Vec<f64>,
}

impl ZtbinReg {
    pub fn new(p: f64, ncov: usize) -> Self {
        Self {
            b0: (p / (1.0 - p)).ln(),
            coefs: vec![0.0; ncov],
        }
    }

    fn linear(b0: f64, coefs: &[f64], covs: &[f64]) -> f64 {
        coefs
            .iter()
            .zip(covs.iter())
            .filter(|(_, c)| !c.is_nan())
            .fold(b0, |acc, (b, c)| acc + b * c)
    }

    /// `p` at zero covariates
    pub fn baseline_p(&self) -> f64 {
        sigmoid(self.b0)
    }

    pub fn p_at(&self, covs: &[f64]) -> f64 {
        sigmoid(Self::linear(self.b0, &self.coefs, covs)).clamp(P_MIN, P_MAX)
    }

    pub fn log_density(&self, k: u32, n: u32, covs: &[f64]) -> f64 {
        log_ztbin(k, n, self.p_at(covs))
    }

    /// Solve the weighted score equations for `(b0, coefs)`.
    ///
    /// Non-convergence keeps the last iterate.
    pub fn update<T: Real>(
        &mut self,
        data: &[Weighted<'_, T>],
        states: &[State],
        opts: &FitOptions,
    ) -> bool {
        // (weight, k, n, data index, position)
        let mut sites = vec![];
        let mut total = 0.0;
        for (i, w) in data.iter().enumerate() {
            let track = w.track;
            for t in 0..track.len() {
                let Some((k, n)) = learnable_counts(track.trunc_counts[t], track.n_estimates[t], opts)
                else {
                    continue;
                };
                let g = w.weight(states, t);
                if g > 0.0 {
                    sites.push((g, k, n, i, t));
                    total += g;
                }
            }
        }
        if sites.is_empty() {
            warn!("no informative sites to update binomial regression, keeping b0={}", self.b0);
            return false;
        }

        let ncov = self.coefs.len();
        let score = |beta: &DVector<f64>| {
            let mut grad = DVector::<f64>::zeros(ncov + 1);
            for &(g, k, n, i, t) in sites.iter() {
                let covs = data[i].track.covariates(t);
                let eta = Self::linear(beta[0], &beta.as_slice()[1..], covs);
                let p = sigmoid(eta).clamp(P_MIN, P_MAX);
                let (k, n) = (k as f64, n as f64);
                // (1-p)^n / (1 - (1-p)^n)
                let ln_qn = n * (-p).ln_1p();
                let ratio = ln_qn.exp() / -ln_qn.exp_m1();
                let d_eta = k * (1.0 - p) - (n - k) * p - n * p * ratio;
                grad[0] += g * d_eta;
                for (j, c) in covs.iter().take(ncov).enumerate() {
                    if !c.is_nan() {
                        grad[j + 1] += g * d_eta * c;
                    }
                }
            }
            grad
        };

        let mut x0 = DVector::<f64>::zeros(ncov + 1);
        x0[0] = self.b0;
        for (j, b) in self.coefs.iter().enumerate() {
            x0[j + 1] = *b;
        }
        let res = multiroot_solve(score, x0, 1e-8 * total.max(1.0), opts.max_iter_multiroot);
        if !res.converged {
            warn!(
                "binomial regression: multiroot solver did not converge (residual {:.3e}), using last iterate",
                res.residual
            );
        }
        if res.x.iter().all(|x| x.is_finite()) {
            self.b0 = res.x[0];
            self.coefs = res.x.as_slice()[1..].to_vec();
        }
        true
    }
}

#[cfg(test)]
fn track(counts: &[(u32, u32)]) -> crate::data::Track {
    crate::data::Track::from_parts(
        "chr1",
        crate::data::Strand::Forward,
        0,
        counts.iter().map(|x| x.0).collect(),
        counts.iter().map(|x| x.1).collect(),
        vec![1.0; counts.len()],
    )
}

#[cfg(test)]
/// posterior matrix with all weight on one state
fn posterior(len: usize, state: State) -> crate::matrix::Matrix<f64> {
    let mut m = crate::matrix::Matrix::from_shape(3, len, 0.0);
    for t in 0..len {
        m.set_at(state as usize, t, 1.0);
    }
    m
}

#[test]
fn test_ztbin_density_is_zero_truncated_distribution() {
    for p in [0.001, 0.01, 0.15, 0.5, 0.93] {
        for n in [1u32, 2, 7, 20, 150] {
            let bin = Ztbin::new(p);
            assert_eq!(bin.density(0, n), 0.0);
            let total: f64 = (1..=n).map(|k| bin.density(k, n)).sum();
            approx::assert_relative_eq!(total, 1.0, epsilon = 1e-9);
            for k in 1..=n {
                let d = bin.density(k, n);
                assert!((0.0..=1.0 + 1e-12).contains(&d), "p={p} n={n} k={k} d={d}");
            }
        }
    }
}

#[test]
fn test_ztbin_density_normalizer_matches_binomial() {
    // untruncated binomial pmf divided by P(K >= 1)
    let (k, n, p) = (3u32, 10u32, 0.2f64);
    let pmf = 120.0 * p.powi(3) * (1.0 - p).powi(7);
    let expect = pmf / (1.0 - (1.0 - p).powi(10));
    approx::assert_relative_eq!(Ztbin::new(p).density(k, n), expect, epsilon = 1e-12);
}

#[test]
fn test_ztbin_density_with_n_below_k() {
    let bin = Ztbin::new(0.3);
    assert_eq!(bin.log_density(5, 2), bin.log_density(5, 5));
}

#[test]
fn test_ztbin_density_nan_maps_to_zero() {
    // p = 0 makes the normalizer 0/0
    assert_eq!(Ztbin::new(0.0).density(1, 20), 0.0);
    // p = 1 with k = n is a point mass
    approx::assert_relative_eq!(Ztbin::new(1.0).density(4, 4), 1.0, epsilon = 1e-12);
}

#[test]
fn test_ztbin_update_p_single_site_is_moment_estimator() {
    let opts = FitOptions {
        n_threshold_for_p: 0,
        ..Default::default()
    };
    let tr = track(&[(3, 11)]);
    let post = posterior(1, State::Crosslink);
    let data = [Weighted::new(&tr, &post)];
    let mut bin = Ztbin::new(0.5);
    assert!(bin.update_p(&data, &[State::Crosslink], &opts));
    approx::assert_relative_eq!(bin.p, 0.2, epsilon = 1e-15);
}

#[test]
fn test_ztbin_update_p_respects_gates() {
    let opts = FitOptions {
        n_threshold_for_p: 10,
        max_kn_ratio: 0.5,
        ..Default::default()
    };
    // (k=0) truncated; (n=5) below ntp; (9/10) above max ratio
    let tr = track(&[(0, 30), (2, 5), (9, 10), (3, 21), (5, 41)]);
    let post = posterior(5, State::Background);
    let data = [Weighted::new(&tr, &post)];
    let mut bin = Ztbin::new(0.5);
    bin.update_p(&data, &[State::Background, State::Enriched], &opts);
    approx::assert_relative_eq!(bin.p, (0.1 + 0.1) / 2.0, epsilon = 1e-12);
    assert!(bin.p > 0.0 && bin.p < 1.0);

    // no weight on the requested state: p unchanged
    let mut bin = Ztbin::new(0.5);
    assert!(!bin.update_p(&data, &[State::Crosslink], &opts));
    assert_eq!(bin.p, 0.5);
}

#[test]
fn test_ztbin_update_p_is_clamped_inside_unit_interval() {
    let opts = FitOptions::default();
    let tr = track(&[(1, 20); 10]);
    let post = posterior(10, State::Background);
    let mut bin = Ztbin::new(0.01);
    bin.update_p(&[Weighted::new(&tr, &post)], &[State::Background], &opts);
    assert_eq!(bin.p, P_MIN);
}

#[test]
fn test_ztbin_regression_without_covariates_is_mle() {
    let opts = FitOptions {
        n_threshold_for_p: 0,
        ..Default::default()
    };
    let tr = track(&[(1, 20), (2, 20), (3, 20), (1, 10), (4, 30)]);
    let post = posterior(5, State::Crosslink);
    let data = [Weighted::new(&tr, &post)];
    let mut reg = ZtbinReg::new(0.15, 0);
    assert!(reg.update(&data, &[State::Crosslink], &opts));
    let p_hat = reg.p_at(&[]);

    // the fitted p maximizes the log-likelihood
    let ll = |p: f64| -> f64 {
        (0..tr.len())
            .map(|t| log_ztbin(tr.trunc_counts[t], tr.n_estimates[t], p))
            .sum()
    };
    assert!(ll(p_hat) >= ll(p_hat * 1.01));
    assert!(ll(p_hat) >= ll(p_hat * 0.99));
}

#[test]
fn test_ztbin_regression_uses_covariates() {
    let opts = FitOptions {
        n_threshold_for_p: 0,
        ..Default::default()
    };
    // high counts where the covariate is 1, low where it is 0
    let counts: Vec<(u32, u32)> = (0..40)
        .map(|t| if t % 2 == 0 { (8, 20) } else { (2, 20) })
        .collect();
    let mut tr = track(&counts);
    let scores: Vec<f64> = (0..40).map(|t| if t % 2 == 0 { 1.0 } else { 0.0 }).collect();
    tr.set_motif_scores(crate::matrix::Matrix::from_shape_vec(40, 1, scores));
    let post = posterior(40, State::Crosslink);
    let mut reg = ZtbinReg::new(0.15, 1);
    reg.update(&[Weighted::new(&tr, &post)], &[State::Crosslink], &opts);
    assert!(reg.coefs[0] > 0.0, "{reg:?}");
    assert!(reg.p_at(&[1.0]) > reg.p_at(&[0.0]));
}

#[test]
fn test_ztbin_n_threshold_for_two_read_starts() {
    approx::assert_relative_eq!(expected_count(1, 0.3), 1.0, epsilon = 1e-12);
    approx::assert_relative_eq!(expected_count(4, 0.5), 2.0 / 0.9375, epsilon = 1e-12);
    // 0.85^11 leaves 1.98 expected starts, 0.85^12 gives 2.10
    assert_eq!(n_threshold_for_count(0.15, 2.0), 12);
    assert_eq!(n_threshold_for_count(0.5, 2.0), 4);
    assert_eq!(n_threshold_for_count(0.5, 1.0), 1);
    assert!(n_threshold_for_count(0.01, 2.0) > n_threshold_for_count(0.15, 2.0));
    assert_eq!(n_threshold_for_count(0.0, 2.0), N_THRESHOLD_CAP);
}
