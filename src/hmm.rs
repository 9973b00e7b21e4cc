use crate::{
    args::{Decoding, FitOptions, ScoreType},
    data::{OutputBuffer, SiteRecord, Track},
    lse::{safe_exp, safe_ln, LogSumExpTable},
    matrix::{Matrix, Real},
    model::{ModelParams, State, NSTATES},
};
use log::warn;
use rayon::prelude::*;

/// Emission and posterior tables of one track. Kept between the E-step and
/// the M-step of an iteration; storage width is `T`.
#[derive(Debug, Clone, Default)]
pub struct TrackState<T: Real> {
    /// log emission probabilities: nstates x npositions
    pub log_emission: Matrix<T>,
    /// state posteriors: nstates x npositions
    pub posterior: Matrix<T>,
    pub log_likelihood: f64,
}

impl<T: Real> TrackState<T> {
    pub fn new() -> Self {
        Self {
            log_emission: Matrix::from_shape(NSTATES, 0, T::default()),
            posterior: Matrix::from_shape(NSTATES, 0, T::default()),
            log_likelihood: 0.0,
        }
    }
}

/// Per-thread scratch space for one track.
pub struct TrackVariables {
    /// Rabiner's alpha in log scale: nstates x npositions
    pub alpha: Matrix<f64>,
    /// Rabiner's beta in log scale: nstates x npositions
    pub beta: Matrix<f64>,
    /// Rabiner's delta in log scale
    pub delta: Matrix<f64>,
    pub psi: Vec<[u8; NSTATES]>,
}

impl Default for TrackVariables {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackVariables {
    pub fn new() -> Self {
        Self {
            alpha: Matrix::from_shape(NSTATES, 0, 0.0),
            beta: Matrix::from_shape(NSTATES, 0, 0.0),
            delta: Matrix::from_shape(NSTATES, 0, 0.0),
            psi: vec![],
        }
    }

    pub fn resize_and_clear(&mut self, n: usize) {
        self.alpha.resize_and_clear(NSTATES, n, f64::NEG_INFINITY);
        self.beta.resize_and_clear(NSTATES, n, f64::NEG_INFINITY);
    }
}

/// Expected sufficient statistics summed over tracks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningStats {
    /// expected transition counts (Rabiner's xi summed over positions)
    pub xi: [[f64; NSTATES]; NSTATES],
    /// posteriors at the first position of each track
    pub init: [f64; NSTATES],
    pub log_likelihood: f64,
    pub ntracks: usize,
    /// tracks without a valid state path under the current parameters
    pub nfailed: usize,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningStats {
    pub fn new() -> Self {
        Self {
            xi: [[0.0; NSTATES]; NSTATES],
            init: [0.0; NSTATES],
            log_likelihood: 0.0,
            ntracks: 0,
            nfailed: 0,
        }
    }

    pub fn merge(mut self, other: Self) -> Self {
        for i in 0..NSTATES {
            for j in 0..NSTATES {
                self.xi[i][j] += other.xi[i][j];
            }
            self.init[i] += other.init[i];
        }
        self.log_likelihood += other.log_likelihood;
        self.ntracks += other.ntracks;
        self.nfailed += other.nfailed;
        self
    }
}

/// Decoded state and score at one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiteCall {
    pub state: State,
    pub score: f64,
    pub posterior: [f64; NSTATES],
}

/// Score of a called state from the posteriors at its position.
pub fn site_score(post: &[f64; NSTATES], state: State, score_type: ScoreType) -> f64 {
    let ln = |x: f64| x.max(f64::MIN_POSITIVE).ln();
    let (bg, en, xl) = (post[0], post[1], post[2]);
    match score_type {
        ScoreType::LogRatioBestSecond => {
            let s = state as usize;
            let second = (0..NSTATES)
                .filter(|x| *x != s)
                .map(|x| post[x])
                .fold(0.0, f64::max);
            ln(post[s]) - ln(second)
        }
        ScoreType::LogRatioCrosslinkEnriched => ln(xl) - ln(en),
        ScoreType::CrosslinkPosterior => xl,
        ScoreType::LogOddsCrosslink => ln(xl) - ln(bg + en),
    }
}

pub struct HmmRunner<'a> {
    opts: &'a FitOptions,
    lookup: &'a LogSumExpTable,
}

impl<'a> HmmRunner<'a> {
    pub fn new(opts: &'a FitOptions, lookup: &'a LogSumExpTable) -> Self {
        Self { opts, lookup }
    }

    /// Forward-backward over one track. Fills the emission and posterior
    /// tables of `st` and adds the expected counts to `rs`.
    ///
    /// Returns the log-likelihood of the track, `-inf` if no state path can
    /// produce the observations (posteriors are then zero).
    pub fn forward_backward<T: Real>(
        &self,
        track: &Track,
        params: &ModelParams,
        st: &mut TrackState<T>,
        cv: &mut TrackVariables,
        rs: &mut RunningStats,
    ) -> f64 {
        let n = track.len();
        params.fill_log_emissions(track, self.opts.pseudo_emission, &mut st.log_emission);
        st.posterior.resize_and_clear(NSTATES, n, T::default());
        st.log_likelihood = f64::NEG_INFINITY;
        if n == 0 {
            st.log_likelihood = 0.0;
            return 0.0;
        }
        cv.resize_and_clear(n);
        let lse = self.lookup;
        let log_a = params.trans.log();
        let e = &st.log_emission;

        // Rabiner's Eq 19 (log scale)
        for s in 0..NSTATES {
            cv.alpha[s][0] = safe_ln(params.init[s]) + e.get_at(s, 0);
        }
        // Rabiner's Eq 20
        for t in 1..n {
            for s in 0..NSTATES {
                let acc = lse.log_sum_exp_iter((0..NSTATES).map(|j| cv.alpha[j][t - 1] + log_a[j][s]));
                cv.alpha[s][t] = acc + e.get_at(s, t);
            }
        }
        // Rabiner's Eq 21
        let ll = lse.log_sum_exp_iter((0..NSTATES).map(|s| cv.alpha[s][n - 1]));
        if !ll.is_finite() {
            warn!(
                "no valid state path for track {}:{}{} (length {n})",
                track.chrom,
                track.start,
                track.strand.as_char()
            );
            rs.nfailed += 1;
            return f64::NEG_INFINITY;
        }

        // Rabiner's Eq 24 and 25
        for s in 0..NSTATES {
            cv.beta[s][n - 1] = 0.0;
        }
        for t in (0..n - 1).rev() {
            for s in 0..NSTATES {
                let acc = lse.log_sum_exp_iter(
                    (0..NSTATES).map(|j| log_a[s][j] + e.get_at(j, t + 1) + cv.beta[j][t + 1]),
                );
                cv.beta[s][t] = acc;
            }
        }

        // Rabiner's Eq 27, renormalized against lookup-table rounding
        for t in 0..n {
            let mut post = [0.0; NSTATES];
            for s in 0..NSTATES {
                post[s] = safe_exp(cv.alpha[s][t] + cv.beta[s][t] - ll);
            }
            let total: f64 = post.iter().sum();
            for s in 0..NSTATES {
                let p = match total > 0.0 {
                    true => post[s] / total,
                    false => 0.0,
                };
                st.posterior.set_at(s, t, p);
            }
        }

        // Rabiner's Eq 37, summed over t
        let ntp2 = self.opts.n_threshold_for_trans_p;
        for t in 0..n - 1 {
            let mut xi = [[0.0; NSTATES]; NSTATES];
            let mut total = 0.0;
            for i in 0..NSTATES {
                for j in 0..NSTATES {
                    let v = safe_exp(
                        cv.alpha[i][t] + log_a[i][j] + e.get_at(j, t + 1) + cv.beta[j][t + 1] - ll,
                    );
                    xi[i][j] = v;
                    total += v;
                }
            }
            if total <= 0.0 {
                continue;
            }
            for i in 0..NSTATES {
                // low coverage sites say little about leaving an enriched region
                if i == State::Enriched as usize && track.n_estimates[t] < ntp2 {
                    continue;
                }
                for j in 0..NSTATES {
                    rs.xi[i][j] += xi[i][j] / total;
                }
            }
        }
        for s in 0..NSTATES {
            rs.init[s] += st.posterior.get_at(s, 0);
        }
        rs.log_likelihood += ll;
        rs.ntracks += 1;
        st.log_likelihood = ll;
        ll
    }

    /// E-step over all tracks of one replicate, one task per track.
    ///
    /// Runs on the current rayon pool; parameters are read only.
    pub fn run_e_step<T: Real>(
        &self,
        tracks: &[&Track],
        params: &ModelParams,
        states: &mut [TrackState<T>],
    ) -> RunningStats {
        states
            .par_iter_mut()
            .zip(tracks.par_iter())
            .map_init(TrackVariables::new, |cv, (st, track)| {
                let mut rs = RunningStats::new();
                self.forward_backward(track, params, st, cv, &mut rs);
                rs
            })
            .reduce(RunningStats::new, RunningStats::merge)
    }

    /// Most likely state path given the emission table of `st`.
    pub fn viterbi<T: Real>(&self, params: &ModelParams, st: &TrackState<T>, cv: &mut TrackVariables) -> Vec<State> {
        let e = &st.log_emission;
        let n = e.get_ncols();
        if n == 0 {
            return vec![];
        }
        let log_a = params.trans.log();
        cv.delta.resize_and_clear(NSTATES, n, f64::NEG_INFINITY);
        cv.psi.clear();
        cv.psi.resize(n, [0; NSTATES]);

        // Rabiner's Eq 32a (log scale)
        for s in 0..NSTATES {
            cv.delta[s][0] = safe_ln(params.init[s]) + e.get_at(s, 0);
        }
        // Rabiner's Eq 33a and 33b
        for t in 1..n {
            for s in 0..NSTATES {
                let mut max_val = f64::NEG_INFINITY;
                let mut arg = 0u8;
                for j in 0..NSTATES {
                    let score = cv.delta[j][t - 1] + log_a[j][s];
                    if score > max_val {
                        max_val = score;
                        arg = j as u8;
                    }
                }
                cv.delta[s][t] = max_val + e.get_at(s, t);
                cv.psi[t][s] = arg;
            }
        }
        // Rabiner's Eq 34b
        let mut best = 0;
        for s in 1..NSTATES {
            if cv.delta[s][n - 1] > cv.delta[best][n - 1] {
                best = s;
            }
        }
        // Rabiner's Eq 35
        let mut traj = vec![State::Background; n];
        traj[n - 1] = State::from_index(best);
        for t in (0..n - 1).rev() {
            best = cv.psi[t + 1][best] as usize;
            traj[t] = State::from_index(best);
        }
        traj
    }

    /// Final state and score per position, from the posteriors of `st`.
    pub fn decode<T: Real>(&self, params: &ModelParams, st: &TrackState<T>, cv: &mut TrackVariables) -> Vec<SiteCall> {
        let n = st.posterior.get_ncols();
        let path = match self.opts.decoding {
            Decoding::Viterbi => Some(self.viterbi(params, st, cv)),
            Decoding::Posterior => None,
        };
        (0..n)
            .map(|t| {
                let mut post = [0.0; NSTATES];
                for (s, p) in st.posterior.get_col_iter(t).enumerate() {
                    post[s] = p;
                }
                let state = match path.as_ref() {
                    Some(path) => path[t],
                    None => {
                        let mut best = 0;
                        for s in 1..NSTATES {
                            if post[s] > post[best] {
                                best = s;
                            }
                        }
                        State::from_index(best)
                    }
                };
                SiteCall {
                    state,
                    score: site_score(&post, state, self.opts.score_type),
                    posterior: post,
                }
            })
            .collect()
    }

    /// Run the learned model on one track and write the calls.
    ///
    /// Returns the number of crosslink sites.
    pub fn apply_to_track<'b, T: Real>(
        &self,
        track: &'b Track,
        params: &ModelParams,
        st: &mut TrackState<T>,
        cv: &mut TrackVariables,
        out: &mut OutputBuffer<'b>,
    ) -> Result<usize, crate::data::Error> {
        let mut rs = RunningStats::new();
        self.forward_backward(track, params, st, cv, &mut rs);
        let mut ncalls = 0;
        for (t, call) in self.decode(params, st, cv).into_iter().enumerate() {
            if call.state == State::Crosslink {
                ncalls += 1;
            }
            out.add_site(SiteRecord {
                chrom: &track.chrom,
                pos: track.position(t),
                strand: track.strand,
                k: track.trunc_counts[t],
                n: track.n_estimates[t],
                posterior: call.posterior,
                state: call.state,
                score: call.score,
            })?;
        }
        Ok(ncalls)
    }
}

#[cfg(test)]
fn small_track() -> Track {
    use crate::data::Strand;
    Track::from_parts(
        "chr1",
        Strand::Forward,
        100,
        vec![1, 0, 6, 1],
        vec![20, 15, 9, 12],
        vec![0.2, 0.5, 2.5, 0.9],
    )
}

/// log P(path, observations) for every path, by enumeration
#[cfg(test)]
fn enumerate_paths(params: &ModelParams, e: &Matrix<f64>) -> Vec<(Vec<usize>, f64)> {
    let n = e.get_ncols();
    let log_a = params.trans.log();
    let mut res = vec![];
    for code in 0..NSTATES.pow(n as u32) {
        let path: Vec<usize> = (0..n).map(|t| (code / NSTATES.pow(t as u32)) % NSTATES).collect();
        let mut lp = params.init[path[0]].ln() + e.get_at(path[0], 0);
        for t in 1..n {
            lp += log_a[path[t - 1]][path[t]] + e.get_at(path[t], t);
        }
        res.push((path, lp));
    }
    res
}

#[test]
fn test_forward_backward_matches_enumeration() {
    let opts = FitOptions::default();
    let lookup = LogSumExpTable::new(200001, -100.0);
    let runner = HmmRunner::new(&opts, &lookup);
    let params = ModelParams::new(&opts, false, 0);
    let track = small_track();

    let mut st = TrackState::<f64>::new();
    let mut cv = TrackVariables::new();
    let mut rs = RunningStats::new();
    let ll = runner.forward_backward(&track, &params, &mut st, &mut cv, &mut rs);

    let paths = enumerate_paths(&params, &st.log_emission);
    let total: f64 = paths.iter().map(|(_, lp)| lp.exp()).sum();
    assert!((ll - total.ln()).abs() < 1e-6, "ll={ll} expected={}", total.ln());
    assert_eq!(rs.ntracks, 1);

    for t in 0..track.len() {
        for s in 0..NSTATES {
            let marginal: f64 = paths
                .iter()
                .filter(|(p, _)| p[t] == s)
                .map(|(_, lp)| lp.exp())
                .sum::<f64>()
                / total;
            assert!((st.posterior.get_at(s, t) - marginal).abs() < 1e-6);
        }
        // posteriors sum to one
        assert!((st.posterior.get_col_iter(t).sum::<f64>() - 1.0).abs() < 1e-9);
    }
    // k = 0 cannot be a crosslink site
    assert_eq!(st.posterior.get_at(State::Crosslink as usize, 1), 0.0);

    // expected transitions add up to (n - 1)
    let nxi: f64 = rs.xi.iter().flatten().sum();
    assert!((nxi - 3.0).abs() < 1e-9);
    assert!((rs.init.iter().sum::<f64>() - 1.0).abs() < 1e-9);
}

#[test]
fn test_forward_backward_low_precision_storage() {
    let opts = FitOptions::default();
    let lookup = LogSumExpTable::new(1001, -20.0);
    let runner = HmmRunner::new(&opts, &lookup);
    let params = ModelParams::new(&opts, false, 0);
    let track = small_track();

    let mut st32 = TrackState::<f32>::new();
    let mut st64 = TrackState::<f64>::new();
    let mut cv = TrackVariables::new();
    let mut rs = RunningStats::new();
    let ll32 = runner.forward_backward(&track, &params, &mut st32, &mut cv, &mut rs);
    let ll64 = runner.forward_backward(&track, &params, &mut st64, &mut cv, &mut rs);
    assert!((ll32 - ll64).abs() < 1e-3);
    for t in 0..track.len() {
        assert!((st32.posterior.get_col_iter(t).sum::<f64>() - 1.0).abs() < 1e-5);
        for s in 0..NSTATES {
            assert!((st32.posterior.get_at(s, t) - st64.posterior.get_at(s, t)).abs() < 1e-4);
        }
    }
    assert_eq!(rs.ntracks, 2);
}

#[test]
fn test_viterbi_matches_enumeration() {
    let opts = FitOptions {
        decoding: Decoding::Viterbi,
        ..Default::default()
    };
    let lookup = LogSumExpTable::new(1001, -20.0);
    let runner = HmmRunner::new(&opts, &lookup);
    let params = ModelParams::new(&opts, false, 0);
    let track = small_track();

    let mut st = TrackState::<f64>::new();
    let mut cv = TrackVariables::new();
    runner.forward_backward(&track, &params, &mut st, &mut cv, &mut RunningStats::new());
    let path = runner.viterbi(&params, &st, &mut cv);

    let best = enumerate_paths(&params, &st.log_emission)
        .into_iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|x| x.0)
        .unwrap();
    let path_idx: Vec<usize> = path.iter().map(|s| *s as usize).collect();
    assert_eq!(path_idx, best);

    let calls = runner.decode(&params, &st, &mut cv);
    assert_eq!(calls.iter().map(|c| c.state).collect::<Vec<_>>(), path);
}

#[test]
fn test_e_step_parallel_matches_serial() {
    let opts = FitOptions::default();
    let lookup = LogSumExpTable::new(10001, -50.0);
    let runner = HmmRunner::new(&opts, &lookup);
    let params = ModelParams::new(&opts, false, 0);
    let t1 = small_track();
    let mut t2 = small_track();
    t2.trunc_counts = vec![2, 3, 1, 1];
    let tracks = vec![&t1, &t2];

    let mut states = vec![TrackState::<f64>::new(), TrackState::<f64>::new()];
    let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
    let rs = pool.install(|| runner.run_e_step(&tracks, &params, &mut states));

    let mut serial = RunningStats::new();
    let mut cv = TrackVariables::new();
    for track in tracks.iter() {
        runner.forward_backward(track, &params, &mut TrackState::<f64>::new(), &mut cv, &mut serial);
    }
    assert_eq!(rs.ntracks, 2);
    assert!((rs.log_likelihood - serial.log_likelihood).abs() < 1e-9);
    assert!((states[1].log_likelihood + states[0].log_likelihood - serial.log_likelihood).abs() < 1e-9);
}

#[test]
fn test_site_scores() {
    let post = [0.05, 0.15, 0.8];
    let s0 = site_score(&post, State::Crosslink, ScoreType::LogRatioBestSecond);
    assert!((s0 - (0.8f64 / 0.15).ln()).abs() < 1e-12);
    let s1 = site_score(&post, State::Crosslink, ScoreType::LogRatioCrosslinkEnriched);
    assert!((s1 - s0).abs() < 1e-12);
    assert_eq!(site_score(&post, State::Enriched, ScoreType::CrosslinkPosterior), 0.8);
    let s3 = site_score(&post, State::Crosslink, ScoreType::LogOddsCrosslink);
    assert!((s3 - (0.8f64 / 0.2).ln()).abs() < 1e-12);
    // zero posteriors stay finite
    assert!(site_score(&[1.0, 0.0, 0.0], State::Background, ScoreType::LogRatioBestSecond).is_finite());
}
