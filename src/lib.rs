//! Crosslink site calling from read-start profiles.
//!
//! Observations (read-start counts, coverage and a smoothed signal) are
//! modelled per contiguous track by a three-state HMM whose emissions are a
//! zero-truncated binomial and a left-truncated gamma, both with optional
//! covariate regressions. Parameters are learned by Baum-Welch across
//! tracks and replicates and then applied to call crosslink sites.

// data flow
// - args: cli + fit options (toml)
// - data: observation table -> tracks per replicate
// - em: BaumWelch
//     - hmm::HmmRunner (E-step, per track, parallel)
//     - emission / ztbin / gamma (M-step)
//     - model::ModelParamState (shared vs per-replicate params)
// - hmm: decode + write calls

pub mod args;
pub mod data;
pub mod em;
pub mod emission;
pub mod gamma;
pub mod hmm;
pub mod lse;
pub mod matrix;
pub mod model;
pub mod solver;
pub mod ztbin;
