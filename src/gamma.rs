//! Gamma emissions for the smoothed read-start signal (KDE).
//!
//! Both variants may be left-truncated at `tp` (the minimum signal value
//! that can be observed at a site with one read start); `tp = 0` disables
//! truncation.
use crate::{
    args::FitOptions,
    emission::Weighted,
    matrix::Real,
    model::State,
    solver::{brent_maximize, multiroot_solve},
};
use log::{debug, error, warn};
use nalgebra::DVector;
use statrs::function::gamma::{gamma_ur, ln_gamma};

/// Signal values are floored at this value before evaluating a density.
pub const MIN_SIGNAL: f64 = 1e-6;

/// `ln Q(k, z)`, the log of the regularized upper incomplete gamma function.
///
/// Far in the tail `Q` underflows; there the continued fraction of
/// `Γ(k, z) e^z z^-k` is evaluated (modified Lentz) and combined in log space.
pub fn ln_gamma_ur(k: f64, z: f64) -> f64 {
    if z <= 0.0 {
        return 0.0;
    }
    if z < k + 1.0 {
        return gamma_ur(k, z).ln();
    }
    const TINY: f64 = 1e-300;
    let mut b = z + 1.0 - k;
    let mut c = 1.0 / TINY;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..500 {
        let an = -(i as f64) * (i as f64 - k);
        b += 2.0;
        d = an * d + b;
        if d.abs() < TINY {
            d = TINY;
        }
        c = b + an / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < 1e-15 {
            break;
        }
    }
    -z + k * z.ln() - ln_gamma(k) + h.ln()
}

/// `ln P(X >= tp)` of a gamma(k, rate) variable.
fn ln_survival(k: f64, rate: f64, tp: f64) -> f64 {
    if tp <= 0.0 {
        return 0.0;
    }
    let z = rate * tp;
    if !(k > 0.0 && z > 0.0 && k.is_finite() && z.is_finite()) {
        return f64::NAN;
    }
    ln_gamma_ur(k, z)
}

/// Left-truncated gamma log-density. Non-finite values (invalid parameters,
/// an empty tail) are reported and mapped to `-inf`.
pub fn log_gamma_density(x: f64, k: f64, rate: f64, tp: f64) -> f64 {
    let x = x.max(tp).max(MIN_SIGNAL);
    let res = k * rate.ln() - ln_gamma(k) + (k - 1.0) * x.ln() - rate * x - ln_survival(k, rate, tp);
    if !res.is_finite() {
        error!("gamma density is not finite ({res}): x={x}, k={k}, rate={rate}, tp={tp}");
        return f64::NEG_INFINITY;
    }
    res
}

/// (weight, signal, input signal) of every site with weight on `states`
fn collect_sites<T: Real>(
    data: &[Weighted<'_, T>],
    states: &[State],
    tp: f64,
) -> Vec<(f64, f64, f64)> {
    let mut sites = vec![];
    for w in data {
        let track = w.track;
        for t in 0..track.len() {
            let x = track.kdes[t];
            if !(x >= tp && x >= MIN_SIGNAL) {
                continue;
            }
            let g = w.weight(states, t);
            if g > 0.0 {
                sites.push((g, x, track.input_kde(t)));
            }
        }
    }
    sites
}

/// Posterior-weighted mean signal of `states`; `None` without weight.
pub fn weighted_mean_signal<T: Real>(data: &[Weighted<'_, T>], states: &[State], tp: f64) -> Option<f64> {
    let (sw, swx) = collect_sites(data, states, tp)
        .iter()
        .fold((0.0, 0.0), |acc, (w, x, _)| (acc.0 + w, acc.1 + w * x));
    match sw > 0.0 {
        true => Some(swx / sw),
        false => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gamma {
    /// shape
    pub k: f64,
    pub rate: f64,
    /// truncation point
    pub tp: f64,
}

impl Gamma {
    pub fn new(k: f64, rate: f64, tp: f64) -> Self {
        Self { k, rate, tp }
    }

    pub fn mean(&self) -> f64 {
        self.k / self.rate
    }

    pub fn log_density(&self, x: f64) -> f64 {
        log_gamma_density(x, self.k, self.rate, self.tp)
    }

    /// Fit the shape within `[k_min, k_max]` by Brent search on the weighted
    /// log-likelihood; the rate follows the shape as `k * sum(w) / sum(w x)`.
    pub fn update<T: Real>(
        &mut self,
        data: &[Weighted<'_, T>],
        states: &[State],
        k_min: f64,
        k_max: f64,
        opts: &FitOptions,
    ) -> bool {
        let sites = collect_sites(data, states, self.tp);
        let (sw, swx) = sites
            .iter()
            .fold((0.0, 0.0), |acc, (w, x, _)| (acc.0 + w, acc.1 + w * x));
        if sites.is_empty() || swx <= 0.0 {
            warn!("no informative sites to update gamma, keeping k={} rate={}", self.k, self.rate);
            return false;
        }
        let tp = self.tp;
        let ll = |k: f64| {
            let rate = k * sw / swx;
            sites
                .iter()
                .map(|(w, x, _)| w * log_gamma_density(*x, k, rate, tp))
                .sum::<f64>()
        };
        let res = brent_maximize(ll, k_min, k_max, 1e-8, opts.max_iter_brent);
        if !res.converged {
            warn!("gamma: Brent search did not converge, using k={}", res.x);
        }
        self.k = res.x;
        self.rate = res.x * sw / swx;
        debug!("gamma update: k={} rate={} ll={}", self.k, self.rate, res.fx);
        true
    }
}

/// Gamma whose mean depends on the input (control) signal through a log
/// link: `ln(mean) = b0 + b1 * input`, `rate = k / mean`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaReg {
    pub k: f64,
    pub b0: f64,
    pub b1: f64,
    pub tp: f64,
}

impl GammaReg {
    pub fn new(k: f64, mean: f64, tp: f64) -> Self {
        Self {
            k,
            b0: mean.max(MIN_SIGNAL).ln(),
            b1: 0.0,
            tp,
        }
    }

    pub fn mean_at(&self, input: f64) -> f64 {
        (self.b0 + self.b1 * input).exp()
    }

    pub fn log_density(&self, x: f64, input: f64) -> f64 {
        let rate = self.k / self.mean_at(input);
        log_gamma_density(x, self.k, rate, self.tp)
    }

    fn weighted_ll(sites: &[(f64, f64, f64)], k: f64, b0: f64, b1: f64, tp: f64) -> f64 {
        sites
            .iter()
            .map(|(w, x, u)| w * log_gamma_density(*x, k, k / (b0 + b1 * u).exp(), tp))
            .sum()
    }

    /// One coordinate step: `(b0, b1)` by multiroot on the score equations
    /// with the shape fixed, then the shape by Brent search within
    /// `[k_min, k_max]`. With `min_covariate_to_fit` set, the shape step
    /// only sees sites whose input signal reaches it.
    pub fn update<T: Real>(
        &mut self,
        data: &[Weighted<'_, T>],
        states: &[State],
        k_min: f64,
        k_max: f64,
        opts: &FitOptions,
    ) -> bool {
        let sites = collect_sites(data, states, self.tp);
        if sites.is_empty() {
            warn!("no informative sites to update gamma regression, keeping k={}", self.k);
            return false;
        }
        let (k, tp) = (self.k, self.tp);
        let total: f64 = sites.iter().map(|s| s.0).sum();

        // d ll / d eta with eta = ln(mean)
        let score = |beta: &DVector<f64>| {
            let mut grad = DVector::<f64>::zeros(2);
            for (w, x, u) in sites.iter() {
                let mean = (beta[0] + beta[1] * u).exp();
                let mut d = k * (x.max(tp).max(MIN_SIGNAL) / mean - 1.0);
                if tp > 0.0 {
                    let z = k * tp / mean;
                    d -= (k * z.ln() - z - ln_gamma(k) - ln_survival(k, k / mean, tp)).exp();
                }
                if d.is_finite() {
                    grad[0] += w * d;
                    grad[1] += w * d * u;
                }
            }
            grad
        };
        let x0 = DVector::from_vec(vec![self.b0, self.b1]);
        let res = multiroot_solve(score, x0, 1e-8 * total.max(1.0), opts.max_iter_multiroot);
        if !res.converged {
            warn!(
                "gamma regression: multiroot solver did not converge (residual {:.3e}), using last iterate",
                res.residual
            );
        }
        if res.x.iter().all(|x| x.is_finite()) {
            self.b0 = res.x[0];
            self.b1 = res.x[1];
        }

        // the shape is fitted on sites with enough input signal only
        let shape_sites: Vec<(f64, f64, f64)> = match opts.min_covariate_to_fit {
            Some(min) => sites.iter().copied().filter(|s| s.2 >= min).collect(),
            None => sites,
        };
        if shape_sites.is_empty() {
            warn!("gamma regression: no sites with input signal above the fit threshold, keeping k={}", self.k);
            return true;
        }
        let (b0, b1) = (self.b0, self.b1);
        let res = brent_maximize(
            |k| Self::weighted_ll(&shape_sites, k, b0, b1, tp),
            k_min,
            k_max,
            1e-8,
            opts.max_iter_brent,
        );
        if !res.converged {
            warn!("gamma regression: Brent search did not converge, using k={}", res.x);
        }
        self.k = res.x;
        debug!("gamma regression update: k={} b0={} b1={}", self.k, self.b0, self.b1);
        true
    }
}

#[cfg(test)]
fn gamma_pdf_track(k: f64, rate: f64, step: f64, upper: f64) -> (crate::data::Track, crate::matrix::Matrix<f64>) {
    // grid approximation of the distribution: weights are pdf * step
    let xs: Vec<f64> = (1..).map(|i| i as f64 * step).take_while(|x| *x < upper).collect();
    let n = xs.len();
    let track = crate::data::Track::from_parts(
        "chr1",
        crate::data::Strand::Forward,
        0,
        vec![1; n],
        vec![10; n],
        xs.clone(),
    );
    let mut post = crate::matrix::Matrix::from_shape(3, n, 0.0);
    for (t, x) in xs.iter().enumerate() {
        post.set_at(State::Background as usize, t, log_gamma_density(*x, k, rate, 0.0).exp() * step);
    }
    (track, post)
}

#[test]
fn test_gamma_density_normalized() {
    for (k, rate, tp) in [(1.0, 1.0, 0.0), (2.5, 0.7, 0.0), (3.0, 2.0, 0.5), (0.8, 1.5, 0.2)] {
        let g = Gamma::new(k, rate, tp);
        let step = 1e-4;
        let mut x = tp.max(step) + 0.5 * step;
        let mut total = 0.0;
        while x < 60.0 {
            total += g.log_density(x).exp() * step;
            x += step;
        }
        // singular at 0 for k < 1, so the grid misses a little mass
        let tol = if k < 1.0 && tp == 0.0 { 1e-2 } else { 1e-3 };
        assert!((total - 1.0).abs() < tol, "k={k} rate={rate} tp={tp} total={total}");
    }
}

#[test]
fn test_gamma_density_below_truncation() {
    let g = Gamma::new(2.0, 1.0, 0.5);
    // values below the truncation point are evaluated at the truncation point
    assert_eq!(g.log_density(0.1), g.log_density(0.5));
    assert!(g.log_density(0.0).is_finite());
    // invalid shape maps to zero density
    assert_eq!(log_gamma_density(1.0, -1.0, 1.0, 0.3), f64::NEG_INFINITY);
}

#[test]
fn test_gamma_update_recovers_shape() {
    let opts = FitOptions::default();
    let (track, post) = gamma_pdf_track(3.0, 1.5, 2e-3, 40.0);
    let data = [Weighted::new(&track, &post)];
    let mut g = Gamma::new(1.0, 1.0, 0.0);
    assert!(g.update(&data, &[State::Background], 0.5, 10.0, &opts));
    assert!((g.k - 3.0).abs() < 0.05, "{g:?}");
    assert!((g.rate - 1.5).abs() < 0.05, "{g:?}");

    // bounds are respected
    let mut g = Gamma::new(1.0, 1.0, 0.0);
    g.update(&data, &[State::Background], 0.5, 1.0, &opts);
    assert!(g.k <= 1.0 + 1e-6);

    // no weight: unchanged
    let mut g = Gamma::new(1.0, 1.0, 0.0);
    assert!(!g.update(&data, &[State::Crosslink], 0.5, 10.0, &opts));
    assert_eq!(g.k, 1.0);
}

#[test]
fn test_gamma_reg_follows_input_signal() {
    let opts = FitOptions::default();
    // two groups: input 0 with mean 1, input 1 with mean e
    let (mut track, post) = gamma_pdf_track(2.0, 2.0, 2e-3, 30.0);
    let (track2, post2) = gamma_pdf_track(2.0, 2.0 / std::f64::consts::E, 2e-3, 30.0);
    let n1 = track.len();
    track.set_input_kdes(vec![0.0; n1]);
    let mut track2 = track2;
    track2.set_input_kdes(vec![1.0; track2.len()]);
    let data = [Weighted::new(&track, &post), Weighted::new(&track2, &post2)];
    let mut g = GammaReg::new(1.0, 1.0, 0.0);
    for _ in 0..5 {
        g.update(&data, &[State::Background], 0.5, 10.0, &opts);
    }
    assert!((g.b0 - 0.0).abs() < 0.05, "{g:?}");
    assert!((g.b1 - 1.0).abs() < 0.05, "{g:?}");
    assert!((g.k - 2.0).abs() < 0.1, "{g:?}");
}

#[test]
fn test_gamma_density_far_tail_truncation() {
    // exponential: P(X >= 800) = e^-800, density at 900 is e^-900 / e^-800
    let lp = log_gamma_density(900.0, 1.0, 1.0, 800.0);
    assert!((lp - -100.0).abs() < 1e-9, "{lp}");
    // continued fraction agrees with the direct value where both work
    for (k, z) in [(0.7, 3.0), (2.0, 5.0), (4.5, 12.0)] {
        assert!((ln_gamma_ur(k, z) - gamma_ur(k, z).ln()).abs() < 1e-10, "k={k} z={z}");
    }
    // small mean through the regression link keeps the density finite
    let g = GammaReg { k: 2.0, b0: 0.0, b1: -5.0, tp: 1.0 };
    let lp = g.log_density(1.5, 2.0);
    assert!(lp.is_finite() && lp < 0.0, "{lp}");
    assert!(log_gamma_density(1.0, f64::INFINITY, 1.0, 0.5) == f64::NEG_INFINITY);
}

#[test]
fn test_gamma_reg_shape_from_sites_with_input() {
    // shape 2 where input is high, shape 8 where input is low, same mean
    let (mut track, post) = gamma_pdf_track(2.0, 2.0, 2e-3, 30.0);
    let (mut track2, post2) = gamma_pdf_track(8.0, 8.0, 2e-3, 30.0);
    track.set_input_kdes(vec![1.0; track.len()]);
    track2.set_input_kdes(vec![0.0; track2.len()]);
    let data = [Weighted::new(&track, &post), Weighted::new(&track2, &post2)];
    let opts = FitOptions {
        min_covariate_to_fit: Some(0.5),
        ..Default::default()
    };
    let mut g = GammaReg::new(1.0, 1.0, 0.0);
    for _ in 0..5 {
        g.update(&data, &[State::Background], 0.5, 10.0, &opts);
    }
    assert!((g.k - 2.0).abs() < 0.1, "{g:?}");

    let mut all = GammaReg::new(1.0, 1.0, 0.0);
    for _ in 0..5 {
        all.update(&data, &[State::Background], 0.5, 10.0, &FitOptions::default());
    }
    assert!(all.k > 2.5, "{all:?}");
}

#[test]
fn test_weighted_mean_signal() {
    let (track, post) = gamma_pdf_track(2.0, 2.0, 1e-2, 20.0);
    let data = [Weighted::new(&track, &post)];
    let m = weighted_mean_signal(&data, &[State::Background], 0.0).unwrap();
    assert!((m - 1.0).abs() < 0.01, "{m}");
    assert_eq!(weighted_mean_signal(&data, &[State::Enriched], 0.0), None);
}
