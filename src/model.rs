use crate::{
    args::FitOptions,
    data::Track,
    emission::{check_order_binomial, check_order_gamma, BinomialEmission, GammaEmission},
    matrix::{Matrix, Real},
};
use log::{info, warn};
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

pub const NSTATES: usize = 3;

/// Hidden states, ordered by enrichment level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    /// not enriched, not crosslinked
    Background = 0,
    /// enriched, not crosslinked
    Enriched = 1,
    Crosslink = 2,
}

impl State {
    pub const ALL: [State; NSTATES] = [State::Background, State::Enriched, State::Crosslink];

    pub fn from_index(i: usize) -> Self {
        match i {
            0 => State::Background,
            1 => State::Enriched,
            _ => State::Crosslink,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Background => "background",
            State::Enriched => "enriched",
            State::Crosslink => "crosslink",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("io error, source {source:?}, file: {file:?}")]
    Io { source: std::io::Error, file: String },
    #[error("line {line}: no value for key {key}")]
    MissingValue { line: usize, key: String },
    #[error("line {line}: cannot parse value {value:?} of key {key}")]
    InvalidValue { line: usize, key: String, value: String },
}

/// State-to-state transition probabilities, `a[from][to]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionMatrix {
    pub a: [[f64; NSTATES]; NSTATES],
}

impl Default for TransitionMatrix {
    fn default() -> Self {
        Self {
            a: [[0.95, 0.04, 0.01], [0.1, 0.8, 0.1], [0.1, 0.4, 0.5]],
        }
    }
}

impl TransitionMatrix {
    pub fn log(&self) -> [[f64; NSTATES]; NSTATES] {
        let mut l = [[0.0; NSTATES]; NSTATES];
        for i in 0..NSTATES {
            for j in 0..NSTATES {
                l[i][j] = self.a[i][j].ln();
            }
        }
        l
    }

    /// Re-estimate from expected transition counts. Rows without counts are
    /// kept; the 'enriched' -> 'crosslink' entry is floored at `min_cs`.
    pub fn update(&mut self, xi: &[[f64; NSTATES]; NSTATES], min_cs: f64) {
        for (i, row) in xi.iter().enumerate() {
            let total: f64 = row.iter().sum();
            if total > 0.0 && total.is_finite() {
                for j in 0..NSTATES {
                    self.a[i][j] = row[j] / total;
                }
            } else {
                warn!("no expected transitions out of state {}, keeping row", State::from_index(i).name());
            }
        }
        self.apply_floor(State::Enriched, State::Crosslink, min_cs);
    }

    /// Raise `a[from][to]` to `min` and scale the rest of the row down.
    fn apply_floor(&mut self, from: State, to: State, min: f64) {
        let (i, j) = (from as usize, to as usize);
        if self.a[i][j] >= min {
            return;
        }
        let rest: f64 = (0..NSTATES).filter(|x| *x != j).map(|x| self.a[i][x]).sum();
        for x in 0..NSTATES {
            if x == j {
                self.a[i][x] = min;
            } else if rest > 0.0 {
                self.a[i][x] *= (1.0 - min) / rest;
            } else {
                self.a[i][x] = (1.0 - min) / (NSTATES - 1) as f64;
            }
        }
    }
}

/// Emission and transition parameters of one replicate.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    /// read-start counts in the 'background' and 'enriched' states
    pub bin1: BinomialEmission,
    /// read-start counts in the 'crosslink' state
    pub bin2: BinomialEmission,
    /// signal in the 'background' state
    pub gamma1: GammaEmission,
    /// signal in the 'enriched' and 'crosslink' states
    pub gamma2: GammaEmission,
    pub trans: TransitionMatrix,
    /// initial state distribution
    pub init: [f64; NSTATES],
}

impl ModelParams {
    pub fn new(opts: &FitOptions, has_input: bool, n_motifs: usize) -> Self {
        let tp = opts.min_kde;
        let k1 = opts.g1_k_min.max(0.5 * (opts.g1_k_min + opts.g1_k_max(has_input)).min(1.0));
        let k2 = opts.g2_k_min.max(2.0).min(opts.g2_k_max);
        Self {
            bin1: BinomialEmission::new(opts.init_p1, n_motifs),
            bin2: BinomialEmission::new(opts.init_p2, n_motifs),
            gamma1: GammaEmission::new(k1, 1.0, tp, has_input),
            gamma2: GammaEmission::new(k2, 5.0, tp, has_input),
            trans: TransitionMatrix::default(),
            init: [1.0 / NSTATES as f64; NSTATES],
        }
    }

    /// Per-state log emission probabilities (nstates x npositions).
    ///
    /// A position without read starts cannot be a crosslink site; its
    /// binomial factor is 1 for the other states. With `pseudo_emission` the
    /// crosslink binomial factor of a site with read starts is at least
    /// `1/n`.
    pub fn fill_log_emissions<T: Real>(&self, track: &Track, pseudo_emission: bool, out: &mut Matrix<T>) {
        out.resize_and_clear(NSTATES, track.len(), T::default());
        for t in 0..track.len() {
            let (b1, b2) = match track.trunc_counts[t] {
                0 => (0.0, f64::NEG_INFINITY),
                k => {
                    let mut b2 = self.bin2.log_density(track, t);
                    if pseudo_emission {
                        b2 = b2.max(-(track.n_estimates[t].max(k) as f64).ln());
                    }
                    (self.bin1.log_density(track, t), b2)
                }
            };
            let g1 = self.gamma1.log_density(track, t);
            let g2 = self.gamma2.log_density(track, t);
            out.set_at(State::Background as usize, t, g1 + b1);
            out.set_at(State::Enriched as usize, t, g2 + b1);
            out.set_at(State::Crosslink as usize, t, g2 + b2);
        }
    }

    pub fn check_order(&mut self, opts: &FitOptions) {
        check_order_binomial(&mut self.bin1, &mut self.bin2);
        check_order_gamma(&mut self.gamma1, &mut self.gamma2, opts);
    }

    pub fn has_converged(&self, last: &Self, opts: &FitOptions) -> bool {
        self.bin1.max_change(&last.bin1) <= opts.bin_p_conv
            && self.bin2.max_change(&last.bin2) <= opts.bin_p_conv
            && self.gamma1.max_change(&last.gamma1) <= opts.gamma_k_conv
            && self.gamma2.max_change(&last.gamma2) <= opts.gamma_k_conv
    }

    pub fn params(&self) -> Vec<(String, f64)> {
        let mut v = self.bin1.params("bin1");
        v.extend(self.bin2.params("bin2"));
        v.extend(self.gamma1.params("gamma1"));
        v.extend(self.gamma2.params("gamma2"));
        for i in 0..NSTATES {
            for j in 0..NSTATES {
                v.push((format!("trans.{i}.{j}"), self.trans.a[i][j]));
            }
        }
        for i in 0..NSTATES {
            v.push((format!("init.{i}"), self.init[i]));
        }
        v
    }

    /// Returns false for keys that do not belong to this model.
    pub fn set_param(&mut self, key: &str, value: f64) -> bool {
        let Some((prefix, name)) = key.split_once('.') else {
            return false;
        };
        let index = |s: &str| s.parse::<usize>().ok().filter(|i| *i < NSTATES);
        match prefix {
            "bin1" => self.bin1.set_param(name, value),
            "bin2" => self.bin2.set_param(name, value),
            "gamma1" => self.gamma1.set_param(name, value),
            "gamma2" => self.gamma2.set_param(name, value),
            "trans" => match name.split_once('.') {
                Some((i, j)) => match (index(i), index(j)) {
                    (Some(i), Some(j)) => {
                        self.trans.a[i][j] = value;
                        true
                    }
                    _ => false,
                },
                None => false,
            },
            "init" => match index(name) {
                Some(i) => {
                    self.init[i] = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn is_shared_key(key: &str) -> bool {
        !key.starts_with("gamma")
    }

    pub fn write_params(&self, path: &str) -> Result<(), ParamsError> {
        write_param_file(path, &self.params())
    }

    /// Replace parameters by the values in `path`; keys not present in the
    /// file keep their current values. Returns the number of values set.
    pub fn load_params(&mut self, path: &str) -> Result<usize, ParamsError> {
        let mut nset = 0;
        for (key, value) in read_param_file(path)? {
            match self.set_param(&key, value) {
                true => nset += 1,
                false => warn!("unknown parameter {key} in {path}, ignored"),
            }
        }
        Ok(nset)
    }
}

/// Tab-separated `key\tvalue` lines. Values are written with the shortest
/// representation that parses back to the same `f64`.
pub fn write_param_file(path: &str, params: &[(String, f64)]) -> Result<(), ParamsError> {
    let io_err = |e| ParamsError::Io {
        source: e,
        file: path.to_owned(),
    };
    let mut w = BufWriter::new(File::create(path).map_err(io_err)?);
    for (key, value) in params {
        writeln!(w, "{key}\t{value}").map_err(io_err)?;
    }
    w.flush().map_err(io_err)
}

pub fn read_param_file<P: AsRef<Path>>(path: P) -> Result<Vec<(String, f64)>, ParamsError> {
    let p = path.as_ref();
    let io_err = |e| ParamsError::Io {
        source: e,
        file: p.to_string_lossy().into_owned(),
    };
    let reader = BufReader::new(File::open(p).map_err(io_err)?);
    let mut res = vec![];
    for (iline, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let key = fields.next().unwrap_or_default().trim().to_owned();
        let value = fields.next().map(str::trim).ok_or_else(|| ParamsError::MissingValue {
            line: iline + 1,
            key: key.clone(),
        })?;
        let value = value.parse::<f64>().map_err(|_| ParamsError::InvalidValue {
            line: iline + 1,
            key: key.clone(),
            value: value.to_owned(),
        })?;
        res.push((key, value));
    }
    Ok(res)
}

/// Parameters of all replicates over the Baum-Welch iterations.
///
/// Binomial, transition and initial-state parameters are shared: every
/// replicate holds the same values. Gamma parameters are per replicate as
/// the signal scale depends on the sequencing depth.
#[derive(Debug, Clone)]
pub struct ModelParamState {
    pub reps: Vec<ModelParams>,
    pub last: Vec<ModelParams>,
    pub iiter: usize,
    pub finish_fit: bool,
}

impl ModelParamState {
    pub fn new(opts: &FitOptions, nreps: usize, has_input: bool, n_motifs: usize) -> Self {
        let reps = vec![ModelParams::new(opts, has_input, n_motifs); nreps.max(1)];
        Self {
            last: reps.clone(),
            reps,
            iiter: 0,
            finish_fit: false,
        }
    }

    pub fn is_fit_finished(&self) -> bool {
        self.finish_fit
    }

    pub fn nreps(&self) -> usize {
        self.reps.len()
    }

    /// copy the shared parameters of replicate 0 to all other replicates
    pub fn sync_shared(&mut self) {
        let (first, rest) = self.reps.split_at_mut(1);
        for rep in rest.iter_mut() {
            rep.bin1 = first[0].bin1.clone();
            rep.bin2 = first[0].bin2.clone();
            rep.trans = first[0].trans;
            rep.init = first[0].init;
        }
    }

    pub fn has_converged(&self, opts: &FitOptions) -> bool {
        self.reps
            .iter()
            .zip(self.last.iter())
            .all(|(cur, last)| cur.has_converged(last, opts))
    }

    /// Shared parameters and the gamma parameters of replicate 0 without a
    /// prefix, gamma parameters of replicate `i > 0` as `rep<i>.<key>`.
    pub fn params(&self) -> Vec<(String, f64)> {
        let mut v = vec![];
        for (irep, rep) in self.reps.iter().enumerate() {
            for (key, value) in rep.params() {
                match irep {
                    0 => v.push((key, value)),
                    _ if !ModelParams::is_shared_key(&key) => v.push((format!("rep{irep}.{key}"), value)),
                    _ => {}
                }
            }
        }
        v
    }

    pub fn write_params(&self, path: &str) -> Result<(), ParamsError> {
        write_param_file(path, &self.params())?;
        info!("learned parameters written to {path}");
        Ok(())
    }

    /// Keys without a replicate prefix apply to all replicates.
    pub fn load_params(&mut self, path: &str) -> Result<usize, ParamsError> {
        let mut nset = 0;
        for (key, value) in read_param_file(path)? {
            let target = key
                .strip_prefix("rep")
                .and_then(|s| s.split_once('.'))
                .and_then(|(i, k)| i.parse::<usize>().ok().map(|i| (i, k)));
            let ok = match target {
                Some((irep, k)) => match self.reps.get_mut(irep) {
                    Some(rep) => rep.set_param(k, value),
                    None => false,
                },
                None => self
                    .reps
                    .iter_mut()
                    .fold(true, |ok, rep| rep.set_param(&key, value) && ok),
            };
            match ok {
                true => nset += 1,
                false => warn!("unknown parameter {key} in {path}, ignored"),
            }
        }
        self.last = self.reps.clone();
        info!("{nset} parameters loaded from {path}");
        Ok(nset)
    }
}

#[test]
fn test_transition_update() {
    let mut trans = TransitionMatrix::default();
    let xi = [[90.0, 9.0, 1.0], [5.0, 95.0, 0.0], [0.0, 0.0, 0.0]];
    trans.update(&xi, 1e-3);
    for row in trans.a.iter() {
        assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }
    assert_eq!(trans.a[0], [0.9, 0.09, 0.01]);
    // floor on enriched -> crosslink
    assert_eq!(trans.a[1][2], 1e-3);
    // empty row kept
    assert_eq!(trans.a[2], TransitionMatrix::default().a[2]);
}

#[test]
fn test_params_round_trip() {
    let opts = FitOptions::default();
    let mut params = ModelParams::new(&opts, false, 0);
    params.bin1.set_param("p", 0.012345678901234567);
    params.bin2.set_param("p", 1.0 / 3.0);
    params.gamma2.set_param("rate", std::f64::consts::PI);
    params.trans.a[1] = [0.2, 0.7, 0.1];
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.par");
    let path = path.to_str().unwrap();
    params.write_params(path).unwrap();

    let content = std::fs::read_to_string(path).unwrap();
    assert!(content.starts_with("bin1.p\t0.01234567890123"));
    assert_eq!(content.lines().count(), params.params().len());

    let mut back = ModelParams::new(&opts, false, 0);
    let nset = back.load_params(path).unwrap();
    assert_eq!(nset, params.params().len());
    assert_eq!(back, params);
}

#[test]
fn test_params_missing_key_keeps_default() {
    let opts = FitOptions::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bin.par");
    std::fs::write(&path, "bin2.p\t0.25\n\n").unwrap();
    let mut params = ModelParams::new(&opts, false, 0);
    assert_eq!(params.load_params(path.to_str().unwrap()).unwrap(), 1);
    assert_eq!(params.bin1.characteristic(), opts.init_p1);
    assert_eq!(params.bin2.characteristic(), 0.25);
}

#[test]
fn test_params_bad_file() {
    let opts = FitOptions::default();
    let mut params = ModelParams::new(&opts, false, 0);
    assert!(matches!(
        params.load_params("no/such/dir/model.par"),
        Err(ParamsError::Io { .. })
    ));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.par");
    std::fs::write(&path, "bin1.p\n").unwrap();
    assert!(matches!(
        params.load_params(path.to_str().unwrap()),
        Err(ParamsError::MissingValue { line: 1, .. })
    ));
    std::fs::write(&path, "bin1.p\tabc\n").unwrap();
    assert!(matches!(
        params.load_params(path.to_str().unwrap()),
        Err(ParamsError::InvalidValue { .. })
    ));
}

#[test]
fn test_replicate_params_round_trip() {
    let opts = FitOptions::default();
    let mut ms = ModelParamState::new(&opts, 2, true, 1);
    ms.reps[1].gamma1.set_param("b1", 0.75);
    ms.reps[0].bin2.set_param("coef.0", 2.5);
    ms.sync_shared();
    assert_eq!(ms.reps[1].bin2, ms.reps[0].bin2);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reps.par");
    let path = path.to_str().unwrap();
    ms.write_params(path).unwrap();
    let content = std::fs::read_to_string(path).unwrap();
    assert!(content.contains("rep1.gamma1.b1\t0.75\n"));
    assert!(!content.contains("rep1.bin"));

    let mut back = ModelParamState::new(&opts, 2, true, 1);
    back.load_params(path).unwrap();
    assert_eq!(back.reps, ms.reps);
}

#[test]
fn test_log_emissions_pseudo_floor() {
    use crate::data::Strand;
    let opts = FitOptions::default();
    let mut params = ModelParams::new(&opts, false, 0);
    params.bin2 = BinomialEmission::new(0.9, 0);
    let track = Track::from_parts("chr1", Strand::Forward, 0, vec![0, 1, 9], vec![50, 50, 10], vec![1.0; 3]);
    let (xl, en) = (State::Crosslink as usize, State::Enriched as usize);

    let mut plain = Matrix::from_shape(0, 0, 0.0f64);
    params.fill_log_emissions(&track, false, &mut plain);
    let mut floored = Matrix::from_shape(0, 0, 0.0f64);
    params.fill_log_emissions(&track, true, &mut floored);

    assert_eq!(plain.get_at(xl, 0), f64::NEG_INFINITY);
    assert_eq!(floored.get_at(xl, 0), f64::NEG_INFINITY);
    // one read start out of 50 is far less likely than 1/50 at p = 0.9
    assert!(plain.get_at(xl, 1) < -100.0);
    let b2 = floored.get_at(xl, 1) - floored.get_at(en, 1) + params.bin1.log_density(&track, 1);
    approx::assert_relative_eq!(b2, -(50f64).ln(), epsilon = 1e-9);
    // likely sites are left alone
    assert_eq!(plain.get_at(xl, 2), floored.get_at(xl, 2));
    for t in 0..3 {
        assert_eq!(plain.get_at(en, t), floored.get_at(en, t));
    }
}
