use crate::{
    args::FitOptions,
    data::Track,
    gamma::{Gamma, GammaReg},
    matrix::{Matrix, Real},
    model::State,
    ztbin::{Ztbin, ZtbinReg},
};
use log::info;

/// A track together with the state posteriors of the current E-step.
#[derive(Clone, Copy)]
pub struct Weighted<'a, T: Real> {
    pub track: &'a Track,
    /// nstates x npositions
    pub posterior: &'a Matrix<T>,
}

impl<'a, T: Real> Weighted<'a, T> {
    pub fn new(track: &'a Track, posterior: &'a Matrix<T>) -> Self {
        Self { track, posterior }
    }

    /// summed posterior of `states` at position `t`
    #[inline]
    pub fn weight(&self, states: &[State], t: usize) -> f64 {
        states
            .iter()
            .map(|s| self.posterior.get_at(*s as usize, t))
            .sum()
    }
}

/// Read-start count emission: plain zero-truncated binomial, or the logistic
/// regression variant when motif covariates are supplied.
#[derive(Debug, Clone, PartialEq)]
pub enum BinomialEmission {
    Plain(Ztbin),
    Regression(ZtbinReg),
}

impl BinomialEmission {
    pub fn new(p: f64, ncov: usize) -> Self {
        match ncov {
            0 => Self::Plain(Ztbin::new(p)),
            n => Self::Regression(ZtbinReg::new(p, n)),
        }
    }

    pub fn log_density(&self, track: &Track, t: usize) -> f64 {
        let (k, n) = (track.trunc_counts[t], track.n_estimates[t]);
        match self {
            Self::Plain(bin) => bin.log_density(k, n),
            Self::Regression(reg) => reg.log_density(k, n, track.covariates(t)),
        }
    }

    pub fn update<T: Real>(&mut self, data: &[Weighted<'_, T>], states: &[State], opts: &FitOptions) -> bool {
        match self {
            Self::Plain(bin) => bin.update_p(data, states, opts),
            Self::Regression(reg) => reg.update(data, states, opts),
        }
    }

    /// `p`, or the intercept on the logit scale for the regression variant
    pub fn characteristic(&self) -> f64 {
        match self {
            Self::Plain(bin) => bin.p,
            Self::Regression(reg) => reg.b0,
        }
    }

    /// `p`, at zero covariates for the regression variant
    pub fn baseline_p(&self) -> f64 {
        match self {
            Self::Plain(bin) => bin.p,
            Self::Regression(reg) => reg.baseline_p(),
        }
    }

    /// largest absolute parameter change between two fits
    pub fn max_change(&self, other: &Self) -> f64 {
        match (self, other) {
            (Self::Plain(a), Self::Plain(b)) => (a.p - b.p).abs(),
            (Self::Regression(a), Self::Regression(b)) => a
                .coefs
                .iter()
                .zip(b.coefs.iter())
                .fold((a.b0 - b.b0).abs(), |m, (x, y)| m.max((x - y).abs())),
            _ => f64::INFINITY,
        }
    }

    /// (key, value) pairs for the parameter file
    pub fn params(&self, prefix: &str) -> Vec<(String, f64)> {
        match self {
            Self::Plain(bin) => vec![(format!("{prefix}.p"), bin.p)],
            Self::Regression(reg) => {
                let mut v = vec![(format!("{prefix}.b0"), reg.b0)];
                for (i, c) in reg.coefs.iter().enumerate() {
                    v.push((format!("{prefix}.coef.{i}"), *c));
                }
                v
            }
        }
    }

    /// Set a parameter by the part of its key after the prefix. Returns false
    /// if the key does not belong to this variant.
    pub fn set_param(&mut self, name: &str, value: f64) -> bool {
        match (self, name) {
            (Self::Plain(bin), "p") => bin.p = value,
            (Self::Regression(reg), "b0") => reg.b0 = value,
            (Self::Regression(reg), name) => {
                let Some(idx) = name.strip_prefix("coef.").and_then(|i| i.parse::<usize>().ok()) else {
                    return false;
                };
                match reg.coefs.get_mut(idx) {
                    Some(c) => *c = value,
                    None => return false,
                }
            }
            _ => return false,
        }
        true
    }
}

/// Signal emission: gamma, or the log-link gamma regression on the input
/// signal when an input (control) track is supplied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GammaEmission {
    Plain(Gamma),
    Regression(GammaReg),
}

impl GammaEmission {
    pub fn new(k: f64, mean: f64, tp: f64, has_input: bool) -> Self {
        match has_input {
            false => Self::Plain(Gamma::new(k, k / mean, tp)),
            true => Self::Regression(GammaReg::new(k, mean, tp)),
        }
    }

    pub fn log_density(&self, track: &Track, t: usize) -> f64 {
        let x = track.kdes[t];
        match self {
            Self::Plain(g) => g.log_density(x),
            Self::Regression(g) => g.log_density(x, track.input_kde(t)),
        }
    }

    pub fn update<T: Real>(
        &mut self,
        data: &[Weighted<'_, T>],
        states: &[State],
        k_min: f64,
        k_max: f64,
        opts: &FitOptions,
    ) -> bool {
        match self {
            Self::Plain(g) => g.update(data, states, k_min, k_max, opts),
            Self::Regression(g) => g.update(data, states, k_min, k_max, opts),
        }
    }

    pub fn shape(&self) -> f64 {
        match self {
            Self::Plain(g) => g.k,
            Self::Regression(g) => g.k,
        }
    }

    pub fn max_change(&self, other: &Self) -> f64 {
        match (self, other) {
            (Self::Plain(a), Self::Plain(b)) => (a.k - b.k).abs(),
            (Self::Regression(a), Self::Regression(b)) => (a.k - b.k)
                .abs()
                .max((a.b0 - b.b0).abs())
                .max((a.b1 - b.b1).abs()),
            _ => f64::INFINITY,
        }
    }

    pub fn params(&self, prefix: &str) -> Vec<(String, f64)> {
        match self {
            Self::Plain(g) => vec![(format!("{prefix}.k"), g.k), (format!("{prefix}.rate"), g.rate)],
            Self::Regression(g) => vec![
                (format!("{prefix}.k"), g.k),
                (format!("{prefix}.b0"), g.b0),
                (format!("{prefix}.b1"), g.b1),
            ],
        }
    }

    pub fn set_param(&mut self, name: &str, value: f64) -> bool {
        match (self, name) {
            (Self::Plain(g), "k") => g.k = value,
            (Self::Plain(g), "rate") => g.rate = value,
            (Self::Regression(g), "k") => g.k = value,
            (Self::Regression(g), "b0") => g.b0 = value,
            (Self::Regression(g), "b1") => g.b1 = value,
            _ => return false,
        }
        true
    }
}

/// Keep the 'crosslink' binomial above the 'non-crosslink' one; swaps the
/// two and returns true if they crossed.
pub fn check_order_binomial(bin1: &mut BinomialEmission, bin2: &mut BinomialEmission) -> bool {
    if bin1.characteristic() > bin2.characteristic() {
        info!(
            "binomial parameters crossed ({} > {}), swapping",
            bin1.characteristic(),
            bin2.characteristic()
        );
        std::mem::swap(bin1, bin2);
        return true;
    }
    false
}

/// Keep the 'non-enriched' gamma shape at or below the 'enriched' one unless
/// disabled by `no_g1_k_le_g2_k`.
pub fn check_order_gamma(gamma1: &mut GammaEmission, gamma2: &mut GammaEmission, opts: &FitOptions) -> bool {
    if opts.no_g1_k_le_g2_k {
        return false;
    }
    if gamma1.shape() > gamma2.shape() {
        info!("gamma shapes crossed ({} > {}), swapping", gamma1.shape(), gamma2.shape());
        std::mem::swap(gamma1, gamma2);
        return true;
    }
    false
}

#[test]
fn test_binomial_params_keys() {
    let mut bin = BinomialEmission::new(0.2, 0);
    assert_eq!(bin.params("bin2"), vec![("bin2.p".to_owned(), 0.2)]);
    assert!(bin.set_param("p", 0.3));
    assert!(!bin.set_param("b0", 0.3));
    assert_eq!(bin.characteristic(), 0.3);

    let mut reg = BinomialEmission::new(0.5, 2);
    let keys: Vec<String> = reg.params("bin1").into_iter().map(|x| x.0).collect();
    assert_eq!(keys, ["bin1.b0", "bin1.coef.0", "bin1.coef.1"]);
    assert!(reg.set_param("coef.1", -0.5));
    assert!(!reg.set_param("coef.2", -0.5));
    assert!(!reg.set_param("coef.x", -0.5));
    assert_eq!(reg.params("bin1")[2].1, -0.5);
    assert_eq!(bin.max_change(&reg), f64::INFINITY);
}

#[test]
fn test_order_checks() {
    let opts = FitOptions::default();
    let mut bin1 = BinomialEmission::new(0.3, 0);
    let mut bin2 = BinomialEmission::new(0.1, 0);
    assert!(check_order_binomial(&mut bin1, &mut bin2));
    assert!(bin1.characteristic() <= bin2.characteristic());
    assert!(!check_order_binomial(&mut bin1, &mut bin2));

    let mut g1 = GammaEmission::new(4.0, 1.0, 0.0, false);
    let mut g2 = GammaEmission::new(2.0, 3.0, 0.0, false);
    assert!(check_order_gamma(&mut g1, &mut g2, &opts));
    assert_eq!(g1.shape(), 2.0);
    assert_eq!(g2.shape(), 4.0);

    let opts = FitOptions {
        no_g1_k_le_g2_k: true,
        ..Default::default()
    };
    let mut g1 = GammaEmission::new(4.0, 1.0, 0.0, true);
    let mut g2 = GammaEmission::new(2.0, 3.0, 0.0, true);
    assert!(!check_order_gamma(&mut g1, &mut g2, &opts));
    assert_eq!(g1.shape(), 4.0);
}
