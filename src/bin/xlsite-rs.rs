use anyhow::Result;
use clap::Parser;
use log::{debug, info};
use rayon::prelude::*;
use xlsite_rs::args::{Arguments, FitOptions};
use xlsite_rs::data::{InputData, OutputBuffer, OutputFiles};
use xlsite_rs::em::{resolve_n_thresholds, BaumWelch};
use xlsite_rs::hmm::{HmmRunner, TrackState, TrackVariables};
use xlsite_rs::lse::LogSumExpTable;
use xlsite_rs::matrix::Real;
use xlsite_rs::model::ModelParamState;

fn main() -> Result<()> {
    let mut cli = Arguments::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level())).init();

    if let Some(path) = cli.fit_config.as_ref() {
        cli.fit = FitOptions::from_toml_file(path)?;
        info!("fit options loaded from {path}");
    }

    let start = std::time::Instant::now();
    let input = InputData::from_args(&cli)?;
    // the shape bound of gamma1 depends on whether an input track was read
    input.args.fit.check(input.has_input)?;
    debug!("{:#?}", &input.args);

    // storage width is chosen once here
    match cli.fit.high_precision {
        true => run::<f64>(&input)?,
        false => run::<f32>(&input)?,
    }
    info!("done in {} s", start.elapsed().as_secs());
    Ok(())
}

fn run<T: Real>(input: &InputData) -> Result<()> {
    let args = &input.args;
    let lookup = LogSumExpTable::new(args.fit.lookup_table_size, args.fit.lookup_table_min_value);
    debug!("log-sum-exp table: {} points down to {}", lookup.size(), lookup.min_value());

    // ---- learning
    let learn = input.learning_tracks();
    let nlearn: usize = learn.iter().map(Vec::len).sum();
    info!("learning on {nlearn} tracks from {} replicates", input.nreps());
    let mut ms = ModelParamState::new(&args.fit, input.nreps(), input.has_input, input.n_motifs);
    BaumWelch::new(&args.fit, &lookup, input.has_input).initialize(&learn, &mut ms);
    if let Some(path) = args.load_par.as_ref() {
        ms.load_params(path)?;
    }
    let opts = &resolve_n_thresholds(&args.fit, &ms);
    let bw = BaumWelch::new(opts, &lookup, input.has_input);

    // use local theadpool instead of global threadpool
    // so that the number of threads used in this instance
    // is not affecting other instances of the same program run
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.num_threads)
        .build()?;
    let report = pool.install(|| bw.learn::<T>(&learn, &mut ms));
    info!(
        "learning finished: {:?} after {} iterations",
        report.status, report.iterations
    );
    for (key, value) in ms.params() {
        info!("{key}\t{value}");
    }
    if let Some(path) = args.par.as_ref() {
        ms.write_params(path)?;
    }

    // ---- applying
    let num_threads_apply = args
        .num_threads_apply
        .unwrap_or_else(|| args.num_threads.min(nlearn.max(1)));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads_apply)
        .build()?;
    let runner = HmmRunner::new(opts, &lookup);
    for (irep, tracks) in input.apply_tracks().iter().enumerate() {
        let outfiles = OutputFiles::new_from_args(args, irep, input.nreps())?;
        let params = &ms.reps[irep];
        let ncalls = pool.install(|| -> Result<usize> {
            tracks
                .par_iter()
                .map_init(
                    || (TrackState::<T>::new(), TrackVariables::new()),
                    |(st, cv), track| -> Result<usize> {
                        let mut out = OutputBuffer::new(&outfiles, 64);
                        let n = runner.apply_to_track(track, params, st, cv, &mut out)?;
                        out.flush()?;
                        Ok(n)
                    },
                )
                .try_reduce(|| 0, |a, b| Ok(a + b))
        })?;
        outfiles.flush()?;
        info!("rep{irep}: {ncalls} crosslink sites on {} tracks", tracks.len());
    }
    Ok(())
}
