use clap::{Args, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error, source: {source:?}, path: {path:?}")]
    Io {
        source: std::io::Error,
        path: std::path::PathBuf,
    },
    #[error("toml parsing error: {0:?}")]
    TomlParsingError(#[from] toml::de::Error),
    #[error("invalid option {name}: {reason}")]
    InvalidOption { name: &'static str, reason: String },
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about, name = "xlsite-rs", color=clap::ColorChoice::Always, styles=get_styles())]
pub struct Arguments {
    /// Observation table of one replicate; repeat the option for more
    /// replicates. Format: tab-delimited with a header line. Required columns
    /// are `chrom`, `pos` (0-based), `strand` (+/-), `k` (read-start count),
    /// `n` (coverage estimate) and `kde` (smoothed read-start signal).
    /// Optional columns: `input_kde` (control signal, enables the
    /// gamma-regression emissions) and any number of `motif*` columns
    /// (enables the binomial-regression emissions). Rows must be sorted by
    /// chromosome, strand and position; each run of consecutive positions is
    /// one HMM chain.
    #[arg(short = 'i', long, required = true, help_heading = "input data")]
    pub input: Vec<String>,

    /// Optional: file with parameters written by a previous run (`--par`).
    /// Loaded values replace the initial values; keys not present keep their
    /// defaults. Combine with `--max-iter-bw 0` to skip learning.
    #[arg(long, help_heading = "input data")]
    pub load_par: Option<String>,

    /// Optional: TOML file holding the fit options. When given it replaces
    /// all fit options given on the command line.
    #[arg(long, help_heading = "input data")]
    pub fit_config: Option<String>,

    /// Output prefix. Crosslink sites are written to `<prefix>.sites.bed`
    /// (one file per replicate, `<prefix>.rep<i>.sites.bed`, when more than
    /// one replicate is given).
    #[arg(short = 'o', long, required = true, help_heading = "output data")]
    pub output: String,

    /// Optional: file to write the learned parameters to.
    #[arg(short = 'p', long, help_heading = "output data")]
    pub par: Option<String>,

    /// Also write every position with at least one read start, together
    /// with its state posteriors, to `<prefix>.all.tsv`.
    #[arg(long, default_value_t = false, help_heading = "output option")]
    pub output_all: bool,

    /// Also write positions called 'enriched' that have at least one read
    /// start to `<prefix>.enriched.bed`.
    #[arg(long = "oe", default_value_t = false, help_heading = "output option")]
    pub output_enriched: bool,

    /// Chromosomes used to learn the HMM parameters, e.g. 'chr1;chr2'.
    /// Default: all chromosomes.
    #[arg(long, help_heading = "chromosome selection")]
    pub learn_chroms: Option<String>,

    /// Chromosomes the learned HMM is applied to. Default: all chromosomes.
    #[arg(long, help_heading = "chromosome selection")]
    pub apply_chroms: Option<String>,

    // ---- fit options
    #[command(flatten)]
    pub fit: FitOptions,

    // ---- parallelization
    /// number of threads used for learning
    #[arg(long, default_value_t = 1, help_heading = "parallelization option")]
    pub num_threads: usize,

    /// number of threads used for applying the learned parameters. Default:
    /// min(num_threads, number of tracks used for learning)
    #[arg(long, help_heading = "parallelization option")]
    pub num_threads_apply: Option<usize>,

    // ---- logging
    /// Only report warnings and errors
    #[arg(short = 'q', long, default_value_t = false, group = "verbosity")]
    pub quiet: bool,

    /// Report per-iteration details
    #[arg(short = 'v', long, default_value_t = false, group = "verbosity")]
    pub verbose: bool,
}

/// Options consumed by the inference core.
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// Only sites with n >= this threshold are used to learn the binomial
    /// probability parameters
    #[arg(long = "ntp", default_value_t = 10, help_heading = "fit option")]
    pub n_threshold_for_p: u32,

    /// Only sites with n >= this threshold contribute expected transitions
    /// out of the 'enriched' state
    #[arg(long = "ntp2", default_value_t = 0, help_heading = "fit option")]
    pub n_threshold_for_trans_p: u32,

    /// Max k/n ratio for a site to be used in learning the binomial
    /// parameters (high ratios are likely mapping artifacts)
    #[arg(long = "mkn", default_value_t = 1.0, help_heading = "fit option")]
    pub max_kn_ratio: f64,

    /// Choose `ntp` and `ntp2` from the coverage at which a crosslink site
    /// is expected to show at least two read starts (replaces both values)
    #[arg(long = "antp", default_value_t = false, help_heading = "fit option")]
    pub auto_n_threshold: bool,

    /// Convergence tolerance for the binomial parameters
    #[arg(long, default_value_t = 1e-4, help_heading = "fit option")]
    pub bin_p_conv: f64,

    /// Convergence tolerance for the gamma parameters
    #[arg(long, default_value_t = 1e-3, help_heading = "fit option")]
    pub gamma_k_conv: f64,

    /// Maximum number of iterations of the Brent search
    #[arg(long, default_value_t = 100, help_heading = "fit option")]
    pub max_iter_brent: usize,

    /// Maximum number of Baum-Welch iterations
    #[arg(long, default_value_t = 50, help_heading = "fit option")]
    pub max_iter_bw: usize,

    /// Maximum number of iterations of the multiroot solver used for
    /// regression coefficients
    #[arg(long, default_value_t = 100, help_heading = "fit option")]
    pub max_iter_multiroot: usize,

    /// Minimum shape of the 'non-enriched' gamma distribution
    #[arg(long, default_value_t = 0.5, help_heading = "fit option")]
    pub g1_k_min: f64,

    /// Maximum shape of the 'non-enriched' gamma distribution. Default: 1.0,
    /// or 10.0 when an input signal covariate is used
    #[arg(long, help_heading = "fit option")]
    pub g1_k_max: Option<f64>,

    /// Minimum shape of the 'enriched' gamma distribution
    #[arg(long, default_value_t = 1.0, help_heading = "fit option")]
    pub g2_k_min: f64,

    /// Maximum shape of the 'enriched' gamma distribution
    #[arg(long, default_value_t = 10.0, help_heading = "fit option")]
    pub g2_k_max: f64,

    /// Do not constrain the 'non-enriched' gamma shape to be <= the
    /// 'enriched' gamma shape
    #[arg(long, default_value_t = false, help_heading = "fit option")]
    pub no_g1_k_le_g2_k: bool,

    /// Minimum transition probability from 'enriched' to 'crosslink'
    #[arg(long = "mtp", default_value_t = 1e-4, help_heading = "fit option")]
    pub min_trans_prob_cs: f64,

    /// Initial binomial probability of the 'non-crosslink' states
    #[arg(long = "b1p", default_value_t = 0.01, help_heading = "fit option")]
    pub init_p1: f64,

    /// Initial binomial probability of the 'crosslink' state
    #[arg(long = "b2p", default_value_t = 0.15, help_heading = "fit option")]
    pub init_p2: f64,

    /// Fit the gamma-regression shape only on positions whose input signal
    /// is at least this value
    #[arg(long = "mrtf", help_heading = "fit option")]
    pub min_covariate_to_fit: Option<f64>,

    /// Floor the 'crosslink' read-start emission at the n-dependent pseudo
    /// probability 1/n
    #[arg(long = "upe", default_value_t = false, help_heading = "fit option")]
    pub pseudo_emission: bool,

    /// Left truncation point of the gamma densities (minimum signal value).
    /// 0 disables truncation
    #[arg(long, default_value_t = 0.0, help_heading = "fit option")]
    pub min_kde: f64,

    /// Signal value separating 'non-enriched' from 'enriched' sites for the
    /// initial gamma fit. Default: mean signal
    #[arg(long, help_heading = "fit option")]
    pub prior_enrichment_kde: Option<f64>,

    /// Tracks containing a read-start count above this value are not used
    /// for learning
    #[arg(long = "mtc", default_value_t = 500, help_heading = "fit option")]
    pub max_trunc_count: u32,

    /// Size of the log-sum-exp lookup table
    #[arg(long = "ts", default_value_t = 600000, help_heading = "numeric option")]
    pub lookup_table_size: usize,

    /// Minimum value of the log-sum-exp lookup table
    #[arg(long = "tmv", default_value_t = -2000.0, allow_hyphen_values = true, help_heading = "numeric option")]
    pub lookup_table_min_value: f64,

    /// Store emission and posterior tables as f64 instead of f32
    #[arg(long, default_value_t = false, help_heading = "numeric option")]
    pub high_precision: bool,

    /// Scoring scheme for called sites
    #[arg(long = "st", value_enum, default_value = "log-ratio-best-second", help_heading = "output option")]
    pub score_type: ScoreType,

    /// How the final state of each position is chosen
    #[arg(long, value_enum, default_value = "posterior", help_heading = "output option")]
    pub decoding: Decoding,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            n_threshold_for_p: 10,
            n_threshold_for_trans_p: 0,
            max_kn_ratio: 1.0,
            auto_n_threshold: false,
            bin_p_conv: 1e-4,
            gamma_k_conv: 1e-3,
            max_iter_brent: 100,
            max_iter_bw: 50,
            max_iter_multiroot: 100,
            g1_k_min: 0.5,
            g1_k_max: None,
            g2_k_min: 1.0,
            g2_k_max: 10.0,
            no_g1_k_le_g2_k: false,
            min_trans_prob_cs: 1e-4,
            init_p1: 0.01,
            init_p2: 0.15,
            min_covariate_to_fit: None,
            pseudo_emission: false,
            min_kde: 0.0,
            prior_enrichment_kde: None,
            max_trunc_count: 500,
            lookup_table_size: 600000,
            lookup_table_min_value: -2000.0,
            high_precision: false,
            score_type: ScoreType::LogRatioBestSecond,
            decoding: Decoding::Posterior,
        }
    }
}

impl FitOptions {
    pub fn from_toml_file<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let mut s = String::new();
        let p: &Path = path.as_ref();
        std::fs::File::open(p)
            .map_err(|e| ConfigError::Io {
                source: e,
                path: p.to_owned(),
            })?
            .read_to_string(&mut s)
            .map_err(|e| ConfigError::Io {
                source: e,
                path: p.to_owned(),
            })?;
        let opts: Self = toml::from_str(&s)?;
        Ok(opts)
    }

    /// Validate the options against the input columns; the shape bounds of
    /// the 'non-enriched' gamma depend on whether an input signal is present.
    pub fn check(&self, has_input_signal: bool) -> Result<(), ConfigError> {
        let invalid = |name: &'static str, reason: &str| -> Result<(), ConfigError> {
            Err(ConfigError::InvalidOption {
                name,
                reason: reason.to_owned(),
            })
        };
        if !(self.init_p1 > 0.0 && self.init_p1 < 1.0) {
            invalid("init_p1", "must be within (0, 1)")
        } else if !(self.init_p2 > 0.0 && self.init_p2 < 1.0) {
            invalid("init_p2", "must be within (0, 1)")
        } else if self.g1_k_min <= 0.0 || self.g1_k_min > self.g1_k_max(has_input_signal) {
            invalid("g1_k_min", "must be positive and <= g1_k_max")
        } else if self.g2_k_min <= 0.0 || self.g2_k_min > self.g2_k_max {
            invalid("g2_k_min", "must be positive and <= g2_k_max")
        } else if !(0.0..1.0).contains(&self.min_trans_prob_cs) {
            invalid("min_trans_prob_cs", "must be within [0, 1)")
        } else if self.lookup_table_min_value >= 0.0 {
            invalid("lookup_table_min_value", "must be negative")
        } else if self.lookup_table_size < 2 {
            invalid("lookup_table_size", "must be at least 2")
        } else {
            Ok(())
        }
    }

    /// upper bound of the 'non-enriched' gamma shape
    pub fn g1_k_max(&self, has_input_signal: bool) -> f64 {
        match (self.g1_k_max, has_input_signal) {
            (Some(k), _) => k,
            (None, true) => 10.0,
            (None, false) => 1.0,
        }
    }
}

#[derive(Default, Debug, ValueEnum, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoreType {
    /// log posterior ratio of the most likely and second most likely state
    #[default]
    #[value(alias = "0")]
    LogRatioBestSecond,
    /// log posterior ratio of 'crosslink' and 'enriched'
    #[value(alias = "1")]
    LogRatioCrosslinkEnriched,
    /// posterior probability of 'crosslink'
    #[value(alias = "2")]
    CrosslinkPosterior,
    /// log odds of 'crosslink' against all other states
    #[value(alias = "3")]
    LogOddsCrosslink,
}

#[derive(Default, Debug, ValueEnum, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decoding {
    /// state with the largest posterior probability
    #[default]
    Posterior,
    /// most likely state path
    Viterbi,
}

impl Arguments {
    pub fn new_for_test() -> Self {
        Self {
            input: vec![],
            load_par: None,
            fit_config: None,
            output: String::from("tmp_xlsite"),
            par: None,
            output_all: false,
            output_enriched: false,
            learn_chroms: None,
            apply_chroms: None,
            fit: FitOptions::default(),
            num_threads: 1,
            num_threads_apply: None,
            quiet: false,
            verbose: false,
        }
    }

    pub fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "warn",
            (_, true) => "debug",
            _ => "info",
        }
    }
}

pub fn get_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .usage(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
        )
        .header(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
        )
        .literal(
            anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))),
        )
        .invalid(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))),
        )
        .error(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))),
        )
        .valid(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))),
        )
        .placeholder(
            anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::White))),
        )
}

#[test]
fn test_fit_options_toml() {
    let opts = FitOptions::default();
    let s = toml::to_string(&opts).unwrap();
    let back: FitOptions = toml::from_str(&s).unwrap();
    assert_eq!(back.n_threshold_for_p, 10);
    assert_eq!(back.score_type, ScoreType::LogRatioBestSecond);

    // missing keys fall back to defaults
    let partial: FitOptions = toml::from_str("max_iter_bw = 3\nscore_type = \"crosslink-posterior\"\n").unwrap();
    assert_eq!(partial.max_iter_bw, 3);
    assert_eq!(partial.score_type, ScoreType::CrosslinkPosterior);
    assert_eq!(partial.lookup_table_size, 600000);
}

#[test]
fn test_fit_options_check() {
    let mut opts = FitOptions::default();
    assert!(opts.check(false).is_ok());
    assert_eq!(opts.g1_k_max(false), 1.0);
    assert_eq!(opts.g1_k_max(true), 10.0);
    opts.init_p2 = 1.5;
    assert!(matches!(
        opts.check(false),
        Err(ConfigError::InvalidOption { name: "init_p2", .. })
    ));

    // the default upper bound of g1.k is 1 without an input signal
    let opts = FitOptions {
        g1_k_min: 2.0,
        ..Default::default()
    };
    assert!(opts.check(true).is_ok());
    assert!(matches!(
        opts.check(false),
        Err(ConfigError::InvalidOption { name: "g1_k_min", .. })
    ));
    let opts = FitOptions {
        g1_k_min: 2.0,
        g1_k_max: Some(3.0),
        ..Default::default()
    };
    assert!(opts.check(false).is_ok());
}

#[test]
fn test_cli_parse() {
    let cli = Arguments::parse_from([
        "xlsite-rs", "-i", "rep1.tsv", "-i", "rep2.tsv", "-o", "out", "--st", "2", "--tmv", "-100",
    ]);
    assert_eq!(cli.input.len(), 2);
    assert_eq!(cli.fit.score_type, ScoreType::CrosslinkPosterior);
    assert_eq!(cli.fit.lookup_table_min_value, -100.0);
    assert_eq!(cli.log_level(), "info");
    assert!(!cli.fit.auto_n_threshold && !cli.output_enriched);

    let cli = Arguments::parse_from([
        "xlsite-rs", "-i", "rep1.tsv", "-o", "out", "--antp", "--mrtf", "0.5", "--oe", "--upe",
    ]);
    assert!(cli.fit.auto_n_threshold);
    assert_eq!(cli.fit.min_covariate_to_fit, Some(0.5));
    assert!(cli.output_enriched);
    assert!(cli.fit.pseudo_emission);
}
