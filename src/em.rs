use crate::{
    args::FitOptions,
    data::Track,
    emission::Weighted,
    gamma::weighted_mean_signal,
    hmm::{HmmRunner, RunningStats, TrackState},
    lse::LogSumExpTable,
    matrix::{Matrix, Real},
    model::{ModelParamState, State, NSTATES},
    ztbin::n_threshold_for_count,
};
use log::{debug, info, warn};

const BIN1_STATES: [State; 2] = [State::Background, State::Enriched];
const BIN2_STATES: [State; 1] = [State::Crosslink];
const GAMMA1_STATES: [State; 1] = [State::Background];
const GAMMA2_STATES: [State; 2] = [State::Enriched, State::Crosslink];

/// expected read starts at a crosslink site that set `ntp` with `--antp`
const AUTO_NTP_MIN_COUNT: f64 = 2.0;

/// Options with `ntp` and `ntp2` replaced by the coverage at which a
/// crosslink site is expected to show two read starts. Returns a copy of
/// `opts` unchanged unless `auto_n_threshold` is set.
pub fn resolve_n_thresholds(opts: &FitOptions, ms: &ModelParamState) -> FitOptions {
    let mut opts = opts.clone();
    if !opts.auto_n_threshold {
        return opts;
    }
    let p2 = ms.reps[0].bin2.baseline_p();
    let ntp = n_threshold_for_count(p2, AUTO_NTP_MIN_COUNT);
    info!("ntp and ntp2 set to {ntp} from crosslink p={p2:.4}");
    opts.n_threshold_for_p = ntp;
    opts.n_threshold_for_trans_p = ntp;
    opts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    Initialized,
    Iterating,
    Converged,
    MaxIterReached,
}

#[derive(Debug, Clone)]
pub struct FitReport {
    pub status: FitStatus,
    pub iterations: usize,
    /// total log-likelihood of each E-step
    pub log_likelihoods: Vec<f64>,
}

/// Baum-Welch learning over the tracks of all replicates.
pub struct BaumWelch<'a> {
    opts: &'a FitOptions,
    runner: HmmRunner<'a>,
    has_input: bool,
}

impl<'a> BaumWelch<'a> {
    pub fn new(opts: &'a FitOptions, lookup: &'a LogSumExpTable, has_input: bool) -> Self {
        Self {
            opts,
            runner: HmmRunner::new(opts, lookup),
            has_input,
        }
    }

    fn gamma_bounds(&self, ms: &ModelParamState, irep: usize) -> ((f64, f64), (f64, f64)) {
        let opts = self.opts;
        let g2 = (opts.g2_k_min, opts.g2_k_max);
        let mut g1_max = opts.g1_k_max(self.has_input);
        if !opts.no_g1_k_le_g2_k {
            g1_max = g1_max.min(ms.reps[irep].gamma2.shape());
        }
        ((opts.g1_k_min, g1_max.max(opts.g1_k_min)), g2)
    }

    /// The enriched gamma is only refit when the enriched and crosslink
    /// positions carry a higher mean signal than the background ones.
    fn signal_is_separable<T: Real>(&self, data: &[Weighted<'_, T>], irep: usize) -> bool {
        let tp = self.opts.min_kde;
        let g1 = weighted_mean_signal(data, &GAMMA1_STATES, tp);
        let g2 = weighted_mean_signal(data, &GAMMA2_STATES, tp);
        let separable = match (g1, g2) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(m1), Some(m2)) => m2 > m1 + 1e-9 * m1.abs(),
        };
        if !separable {
            info!("rep{irep}: no signal above background (means {g1:?} vs {g2:?}), gamma2 kept");
        }
        separable
    }

    /// Fit both gamma components per replicate from a hard split of the
    /// positions at the prior enrichment threshold (default: mean signal).
    pub fn initialize(&self, reps: &[Vec<&Track>], ms: &mut ModelParamState) {
        for (irep, tracks) in reps.iter().enumerate() {
            let npos: usize = tracks.iter().map(|t| t.len()).sum();
            if npos == 0 {
                continue;
            }
            let threshold = self.opts.prior_enrichment_kde.unwrap_or_else(|| {
                tracks.iter().map(|t| t.mean_kde() * t.len() as f64).sum::<f64>() / npos as f64
            });
            let split: Vec<Matrix<f64>> = tracks
                .iter()
                .map(|t| {
                    let mut m = Matrix::from_shape(NSTATES, t.len(), 0.0);
                    for (i, x) in t.kdes.iter().enumerate() {
                        let s = match *x > threshold {
                            true => State::Enriched,
                            false => State::Background,
                        };
                        m.set_at(s as usize, i, 1.0);
                    }
                    m
                })
                .collect();
            let data: Vec<Weighted<'_, f64>> = tracks
                .iter()
                .zip(split.iter())
                .map(|(t, m)| Weighted::new(t, m))
                .collect();

            if self.signal_is_separable(&data, irep) {
                let (_, (g2_min, g2_max)) = self.gamma_bounds(ms, irep);
                let rep = &mut ms.reps[irep];
                rep.gamma2.update(&data, &GAMMA2_STATES, g2_min, g2_max, self.opts);
            }
            let ((g1_min, g1_max), _) = self.gamma_bounds(ms, irep);
            let rep = &mut ms.reps[irep];
            rep.gamma1.update(&data, &GAMMA1_STATES, g1_min, g1_max, self.opts);
            rep.check_order(self.opts);
            info!(
                "rep{irep}: initial gamma fit at signal threshold {threshold:.4}: g1.k={:.4} g2.k={:.4}",
                rep.gamma1.shape(),
                rep.gamma2.shape()
            );
        }
        ms.sync_shared();
        ms.last = ms.reps.clone();
    }

    /// Run Baum-Welch until the parameters converge or `max_iter_bw`
    /// iterations are done. Reaching the cap is not an error; the
    /// parameters of the last iteration are kept.
    pub fn learn<T: Real>(&self, reps: &[Vec<&Track>], ms: &mut ModelParamState) -> FitReport {
        let mut report = FitReport {
            status: FitStatus::Initialized,
            iterations: 0,
            log_likelihoods: vec![],
        };
        if self.opts.max_iter_bw == 0 {
            info!("max_iter_bw is 0, learning skipped");
            return report;
        }
        let mut states: Vec<Vec<TrackState<T>>> = reps
            .iter()
            .map(|tracks| tracks.iter().map(|_| TrackState::new()).collect())
            .collect();

        report.status = FitStatus::Iterating;
        for iiter in 0..self.opts.max_iter_bw {
            ms.iiter = iiter;
            // E-step
            let stats: Vec<RunningStats> = reps
                .iter()
                .zip(states.iter_mut())
                .enumerate()
                .map(|(irep, (tracks, st))| self.runner.run_e_step(tracks, &ms.reps[irep], st))
                .collect();
            let ll: f64 = stats.iter().map(|s| s.log_likelihood).sum();
            let nfailed: usize = stats.iter().map(|s| s.nfailed).sum();
            if nfailed > 0 {
                warn!("iteration {iiter}: {nfailed} tracks without a valid state path");
            }
            report.log_likelihoods.push(ll);
            report.iterations = iiter + 1;
            info!("iteration {iiter}: log-likelihood {ll:.6}");

            // M-step
            ms.last = ms.reps.clone();
            self.update_model(reps, &states, &stats, ms);
            for (key, value) in ms.reps[0].params() {
                debug!("iteration {iiter}: {key}={value}");
            }

            if ms.has_converged(self.opts) {
                ms.finish_fit = true;
                report.status = FitStatus::Converged;
                info!("converged after {} iterations", iiter + 1);
                break;
            }
        }
        if report.status != FitStatus::Converged {
            report.status = FitStatus::MaxIterReached;
            warn!(
                "Baum-Welch did not converge within {} iterations, using the last parameters",
                self.opts.max_iter_bw
            );
        }
        report
    }

    /// M-step: binomials and transitions from the pooled replicates, gammas
    /// per replicate, then the ordering constraints.
    pub fn update_model<T: Real>(
        &self,
        reps: &[Vec<&Track>],
        states: &[Vec<TrackState<T>>],
        stats: &[RunningStats],
        ms: &mut ModelParamState,
    ) {
        let opts = self.opts;
        let per_rep: Vec<Vec<Weighted<'_, T>>> = reps
            .iter()
            .zip(states.iter())
            .map(|(tracks, sts)| {
                tracks
                    .iter()
                    .zip(sts.iter())
                    .map(|(t, st)| Weighted::new(t, &st.posterior))
                    .collect()
            })
            .collect();
        let pooled: Vec<Weighted<'_, T>> = per_rep.iter().flatten().copied().collect();

        let shared = &mut ms.reps[0];
        shared.bin1.update(&pooled, &BIN1_STATES, opts);
        shared.bin2.update(&pooled, &BIN2_STATES, opts);

        // Rabiner's Eq 40a and 40b
        let total = stats.iter().fold(RunningStats::new(), |acc, s| acc.merge(*s));
        shared.trans.update(&total.xi, opts.min_trans_prob_cs);
        let ninit: f64 = total.init.iter().sum();
        if ninit > 0.0 {
            for s in 0..NSTATES {
                shared.init[s] = total.init[s] / ninit;
            }
        }

        for (irep, data) in per_rep.iter().enumerate() {
            if self.signal_is_separable(data, irep) {
                let (_, (g2_min, g2_max)) = self.gamma_bounds(ms, irep);
                ms.reps[irep]
                    .gamma2
                    .update(data, &GAMMA2_STATES, g2_min, g2_max, opts);
            }
            let ((g1_min, g1_max), _) = self.gamma_bounds(ms, irep);
            ms.reps[irep]
                .gamma1
                .update(data, &GAMMA1_STATES, g1_min, g1_max, opts);
        }
        for rep in ms.reps.iter_mut() {
            rep.check_order(opts);
        }
        ms.sync_shared();
    }
}

#[cfg(test)]
fn toy_tracks() -> Vec<Track> {
    use crate::data::Strand;
    // background k=1 with a few crosslink spikes inside enriched regions
    let mut tracks = vec![];
    for (itrack, len) in [120usize, 90].into_iter().enumerate() {
        let mut k = vec![];
        let mut n = vec![];
        let mut kde = vec![];
        for t in 0..len {
            let enriched = (t / 15) % 3 == 1;
            let spike = enriched && t % 15 == 7;
            let (kt, nt) = match (spike, enriched) {
                (true, _) => (9 + (t % 4) as u32, 14),
                (false, true) => (1 + (t % 3) as u32, 25),
                (false, false) => ((t % 2) as u32, 3),
            };
            k.push(kt);
            n.push(nt.max(kt));
            let base = if enriched { 1.5 } else { 0.2 };
            kde.push(base + 0.05 * ((t * 7 + itrack) % 5) as f64);
        }
        tracks.push(Track::from_parts("chr1", Strand::Forward, (itrack * 1000) as u32, k, n, kde));
    }
    tracks
}

#[test]
fn test_learn_separates_crosslinks() {
    let opts = FitOptions {
        max_iter_bw: 30,
        ..Default::default()
    };
    let lookup = LogSumExpTable::new(100001, -200.0);
    let tracks = toy_tracks();
    let reps = vec![tracks.iter().collect::<Vec<_>>()];
    let mut ms = ModelParamState::new(&opts, 1, false, 0);
    let bw = BaumWelch::new(&opts, &lookup, false);
    bw.initialize(&reps, &mut ms);
    let report = bw.learn::<f64>(&reps, &mut ms);

    assert!(report.iterations >= 1);
    assert_ne!(report.status, FitStatus::Iterating);
    let params = &ms.reps[0];
    assert!(params.bin1.characteristic() < params.bin2.characteristic());
    assert!(params.gamma1.shape() <= params.gamma2.shape());
    for row in params.trans.a.iter() {
        assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
    assert!(params.trans.a[1][2] >= opts.min_trans_prob_cs);
    assert!((params.init.iter().sum::<f64>() - 1.0).abs() < 1e-9);
}

#[test]
fn test_learn_iteration_cap() {
    let opts = FitOptions {
        max_iter_bw: 2,
        bin_p_conv: 0.0,
        gamma_k_conv: 0.0,
        ..Default::default()
    };
    let lookup = LogSumExpTable::new(10001, -100.0);
    let tracks = toy_tracks();
    let reps = vec![tracks.iter().collect::<Vec<_>>()];
    let mut ms = ModelParamState::new(&opts, 1, false, 0);
    let bw = BaumWelch::new(&opts, &lookup, false);
    let report = bw.learn::<f32>(&reps, &mut ms);
    assert_eq!(report.status, FitStatus::MaxIterReached);
    assert_eq!(report.iterations, 2);
    assert_eq!(report.log_likelihoods.len(), 2);
    assert!(!ms.is_fit_finished());

    let opts = FitOptions {
        max_iter_bw: 0,
        ..Default::default()
    };
    let bw = BaumWelch::new(&opts, &lookup, false);
    let before = ms.reps.clone();
    let report = bw.learn::<f64>(&reps, &mut ms);
    assert_eq!(report.status, FitStatus::Initialized);
    assert_eq!(ms.reps, before);
}

#[test]
fn test_initialize_keeps_gamma2_on_flat_signal() {
    use crate::data::Strand;
    let opts = FitOptions::default();
    let lookup = LogSumExpTable::new(10001, -100.0);
    let track = Track::from_parts("chr1", Strand::Forward, 0, vec![1; 50], vec![20; 50], vec![0.3; 50]);
    let reps = vec![vec![&track]];
    let mut ms = ModelParamState::new(&opts, 1, false, 0);
    let before = ms.reps[0].gamma2;
    let bw = BaumWelch::new(&opts, &lookup, false);
    bw.initialize(&reps, &mut ms);
    assert_eq!(ms.reps[0].gamma2, before);

    // with signal above the background the enriched component is fit
    let tracks = toy_tracks();
    let reps = vec![tracks.iter().collect::<Vec<_>>()];
    let mut ms = ModelParamState::new(&opts, 1, false, 0);
    bw.initialize(&reps, &mut ms);
    assert_ne!(ms.reps[0].gamma2, before);
}

#[test]
fn test_resolve_n_thresholds() {
    let opts = FitOptions {
        n_threshold_for_p: 7,
        n_threshold_for_trans_p: 3,
        ..Default::default()
    };
    let mut ms = ModelParamState::new(&opts, 1, false, 0);
    ms.reps[0].bin2 = crate::emission::BinomialEmission::new(0.15, 0);
    let same = resolve_n_thresholds(&opts, &ms);
    assert_eq!((same.n_threshold_for_p, same.n_threshold_for_trans_p), (7, 3));

    let opts = FitOptions {
        auto_n_threshold: true,
        ..opts
    };
    let auto = resolve_n_thresholds(&opts, &ms);
    assert_eq!((auto.n_threshold_for_p, auto.n_threshold_for_trans_p), (12, 12));

    // regression variant uses p at zero covariates
    ms.reps[0].bin2 = crate::emission::BinomialEmission::new(0.5, 2);
    assert_eq!(resolve_n_thresholds(&opts, &ms).n_threshold_for_p, 4);
}
