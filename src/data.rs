use itertools::Itertools;
use log::{info, warn};
use smallvec::SmallVec;
use std::{
    collections::HashSet,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use crate::{
    args::Arguments,
    matrix::{Matrix, MatrixBuilder},
    model::{State, NSTATES},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error, source {source:?}, file: {file:?}")]
    Io {
        source: std::io::Error,
        file: Option<String>,
    },
    #[error("csv error in {file}: {source:?}")]
    Csv { source: csv::Error, file: String },
    #[error("{file}, line {line}: {source}")]
    ParseLine {
        source: ParseLineError,
        file: String,
        line: u64,
    },
    #[error("{file}, line {line}: rows are not sorted by position within {chrom} ({strand})")]
    Unsorted {
        file: String,
        line: u64,
        chrom: String,
        strand: char,
    },
    #[error("replicate files differ in their optional columns: {0}")]
    InconsistentColumns(String),
    #[error("no observations in {0}")]
    EmptyInput(String),
    #[error("lockerror: {0}")]
    LockError(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum ParseLineError {
    #[error("Cannot read column {0}")]
    ReadColumnError(&'static str),
    #[error("Cannot parse column {0}: {1:?}")]
    ParseColumnError(&'static str, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    pub fn as_char(&self) -> char {
        match self {
            Strand::Forward => '+',
            Strand::Reverse => '-',
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "+" => Some(Strand::Forward),
            "-" => Some(Strand::Reverse),
            _ => None,
        }
    }
}

/// Observations of one contiguous interval on one strand; one HMM chain.
///
/// Position `t` of the track is genomic position `start + t`.
#[derive(Debug, Clone)]
pub struct Track {
    pub chrom: String,
    pub strand: Strand,
    pub start: u32,
    /// read-start counts (k)
    pub trunc_counts: Vec<u32>,
    /// coverage estimates (n)
    pub n_estimates: Vec<u32>,
    /// smoothed read-start signal
    pub kdes: Vec<f64>,
    /// smoothed signal of the input (control) experiment
    pub input_kdes: Option<Vec<f64>>,
    /// npositions x nmotifs
    pub motif_scores: Option<Matrix<f64>>,
}

impl Track {
    pub fn from_parts(
        chrom: &str,
        strand: Strand,
        start: u32,
        trunc_counts: Vec<u32>,
        n_estimates: Vec<u32>,
        kdes: Vec<f64>,
    ) -> Self {
        assert_eq!(trunc_counts.len(), n_estimates.len());
        assert_eq!(trunc_counts.len(), kdes.len());
        Self {
            chrom: chrom.to_owned(),
            strand,
            start,
            trunc_counts,
            n_estimates,
            kdes,
            input_kdes: None,
            motif_scores: None,
        }
    }

    pub fn set_input_kdes(&mut self, input_kdes: Vec<f64>) {
        assert_eq!(input_kdes.len(), self.len());
        self.input_kdes = Some(input_kdes);
    }

    pub fn set_motif_scores(&mut self, scores: Matrix<f64>) {
        assert_eq!(scores.get_nrows(), self.len());
        self.motif_scores = Some(scores);
    }

    pub fn len(&self) -> usize {
        self.trunc_counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trunc_counts.is_empty()
    }

    pub fn position(&self, t: usize) -> u32 {
        self.start + t as u32
    }

    /// motif scores at `t`; empty without motif columns
    #[inline]
    pub fn covariates(&self, t: usize) -> &[f64] {
        match self.motif_scores.as_ref() {
            Some(m) => &m[t],
            None => &[],
        }
    }

    #[inline]
    pub fn input_kde(&self, t: usize) -> f64 {
        match self.input_kdes.as_ref() {
            Some(v) => v[t],
            None => 0.0,
        }
    }

    pub fn max_trunc_count(&self) -> u32 {
        self.trunc_counts.iter().copied().max().unwrap_or(0)
    }

    pub fn mean_kde(&self) -> f64 {
        match self.is_empty() {
            true => 0.0,
            false => self.kdes.iter().sum::<f64>() / self.len() as f64,
        }
    }
}

/// Column indices of an observation table.
struct Columns {
    chrom: usize,
    pos: usize,
    strand: usize,
    k: usize,
    n: usize,
    kde: usize,
    input_kde: Option<usize>,
    motifs: Vec<usize>,
}

impl Columns {
    fn from_header(header: &csv::StringRecord) -> Result<Self, ParseLineError> {
        let find = |name: &'static str| {
            header
                .iter()
                .position(|h| h == name)
                .ok_or(ParseLineError::ReadColumnError(name))
        };
        Ok(Self {
            chrom: find("chrom")?,
            pos: find("pos")?,
            strand: find("strand")?,
            k: find("k")?,
            n: find("n")?,
            kde: find("kde")?,
            input_kde: find("input_kde").ok(),
            motifs: header
                .iter()
                .positions(|h| h.starts_with("motif"))
                .collect(),
        })
    }
}

fn parse_field<F: std::str::FromStr>(
    record: &csv::StringRecord,
    idx: usize,
    name: &'static str,
) -> Result<F, ParseLineError> {
    let s = record.get(idx).ok_or(ParseLineError::ReadColumnError(name))?;
    s.trim()
        .parse::<F>()
        .map_err(|_| ParseLineError::ParseColumnError(name, s.to_owned()))
}

/// Accumulates consecutive rows into a track.
struct TrackBuilder {
    track: Track,
    input: Vec<f64>,
    motifs: MatrixBuilder<f64>,
}

impl TrackBuilder {
    fn new(chrom: &str, strand: Strand, start: u32, nmotifs: usize) -> Self {
        Self {
            track: Track::from_parts(chrom, strand, start, vec![], vec![], vec![]),
            input: vec![],
            motifs: MatrixBuilder::new(nmotifs),
        }
    }

    fn next_pos(&self) -> u32 {
        self.track.start + self.track.len() as u32
    }

    fn finish(mut self, cols: &Columns) -> Track {
        if cols.input_kde.is_some() {
            self.track.input_kdes = Some(self.input);
        }
        if !cols.motifs.is_empty() {
            let nrows = self.track.len();
            self.track.motif_scores = Some(self.motifs.finish(nrows));
        }
        self.track
    }
}

/// Read a tab-separated observation table and split it into tracks.
///
/// Returns the tracks, whether an input signal column is present and the
/// number of motif columns.
pub fn read_observation_table(path: impl AsRef<Path>) -> Result<(Vec<Track>, bool, usize), Error> {
    let file = path.as_ref().to_string_lossy().into_owned();
    let csv_err = |e| Error::Csv {
        source: e,
        file: file.clone(),
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(b'\t')
        .from_path(&path)
        .map_err(csv_err)?;
    let header = reader.headers().map_err(csv_err)?.clone();
    let cols = Columns::from_header(&header).map_err(|e| Error::ParseLine {
        source: e,
        file: file.clone(),
        line: 1,
    })?;

    let mut tracks = vec![];
    let mut cur: Option<TrackBuilder> = None;
    let mut record = csv::StringRecord::new();
    while reader.read_record(&mut record).map_err(csv_err)? {
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let parse_err = |e| Error::ParseLine {
            source: e,
            file: file.clone(),
            line,
        };
        let chrom = record
            .get(cols.chrom)
            .ok_or(ParseLineError::ReadColumnError("chrom"))
            .map_err(parse_err)?;
        let pos: u32 = parse_field(&record, cols.pos, "pos").map_err(parse_err)?;
        let strand_s: String = parse_field(&record, cols.strand, "strand").map_err(parse_err)?;
        let strand = Strand::parse(&strand_s)
            .ok_or_else(|| parse_err(ParseLineError::ParseColumnError("strand", strand_s.clone())))?;
        let k: u32 = parse_field(&record, cols.k, "k").map_err(parse_err)?;
        let n: u32 = parse_field(&record, cols.n, "n").map_err(parse_err)?;
        let kde: f64 = parse_field(&record, cols.kde, "kde").map_err(parse_err)?;

        // start a new track at a chromosome/strand change or a gap
        let same_interval = match cur.as_ref() {
            Some(b) if b.track.chrom == chrom && b.track.strand == strand => {
                if pos < b.next_pos() {
                    return Err(Error::Unsorted {
                        file: file.clone(),
                        line,
                        chrom: chrom.to_owned(),
                        strand: strand.as_char(),
                    });
                }
                pos == b.next_pos()
            }
            _ => false,
        };
        if !same_interval {
            if let Some(b) = cur.take() {
                tracks.push(b.finish(&cols));
            }
            cur = Some(TrackBuilder::new(chrom, strand, pos, cols.motifs.len()));
        }
        let Some(b) = cur.as_mut() else {
            continue;
        };
        b.track.trunc_counts.push(k);
        b.track.n_estimates.push(n);
        b.track.kdes.push(kde);
        if let Some(idx) = cols.input_kde {
            b.input
                .push(parse_field(&record, idx, "input_kde").map_err(parse_err)?);
        }
        for idx in cols.motifs.iter() {
            // empty motif score: no motif at this position
            let v = match record.get(*idx).map(str::trim) {
                Some("") | Some("NA") | None => None,
                Some(_) => Some(parse_field::<f64>(&record, *idx, "motif").map_err(parse_err)?),
            };
            b.motifs.push(v);
        }
    }
    if let Some(b) = cur.take() {
        tracks.push(b.finish(&cols));
    }
    if tracks.is_empty() {
        return Err(Error::EmptyInput(file));
    }
    Ok((tracks, cols.input_kde.is_some(), cols.motifs.len()))
}

/// semicolon separated chromosome names
pub fn parse_chrom_list(s: Option<&str>) -> Option<HashSet<String>> {
    s.map(|s| {
        s.split(';')
            .map(|c| c.trim().to_owned())
            .filter(|c| !c.is_empty())
            .collect()
    })
}

pub struct InputData {
    /// arguments
    pub args: Arguments,
    /// tracks of each replicate
    pub reps: Vec<Vec<Track>>,
    /// an input (control) signal column is present
    pub has_input: bool,
    /// number of motif score columns
    pub n_motifs: usize,
}

impl InputData {
    pub fn from_args(args: &Arguments) -> Result<Self, Error> {
        let mut reps = vec![];
        let mut layout = None;
        for path in args.input.iter() {
            let (tracks, has_input, n_motifs) = read_observation_table(path)?;
            info!(
                "read {} tracks ({} positions) from {path}",
                tracks.len(),
                tracks.iter().map(|t| t.len()).sum::<usize>()
            );
            match layout {
                None => layout = Some((has_input, n_motifs)),
                Some(l) if l != (has_input, n_motifs) => {
                    return Err(Error::InconsistentColumns(format!(
                        "{path}: input_kde={has_input}, motifs={n_motifs}"
                    )))
                }
                _ => {}
            }
            reps.push(tracks);
        }
        let (has_input, n_motifs) = layout.unwrap_or((false, 0));
        Ok(Self::from_tracks(args, reps, has_input, n_motifs))
    }

    pub fn from_tracks(args: &Arguments, reps: Vec<Vec<Track>>, has_input: bool, n_motifs: usize) -> Self {
        Self {
            args: args.clone(),
            reps,
            has_input,
            n_motifs,
        }
    }

    pub fn nreps(&self) -> usize {
        self.reps.len()
    }

    /// Tracks used to learn the parameters, per replicate.
    ///
    /// Tracks with a read-start count above `max_trunc_count` are skipped.
    pub fn learning_tracks(&self) -> Vec<Vec<&Track>> {
        let chroms = parse_chrom_list(self.args.learn_chroms.as_deref());
        let max_k = self.args.fit.max_trunc_count;
        self.reps
            .iter()
            .map(|tracks| {
                tracks
                    .iter()
                    .filter(|t| chroms.as_ref().map_or(true, |c| c.contains(&t.chrom)))
                    .filter(|t| {
                        let keep = t.max_trunc_count() <= max_k;
                        if !keep {
                            warn!(
                                "track {}:{}{} has a read-start count above {max_k}, not used for learning",
                                t.chrom,
                                t.start,
                                t.strand.as_char()
                            );
                        }
                        keep
                    })
                    .collect()
            })
            .collect()
    }

    /// Tracks the learned parameters are applied to, per replicate.
    pub fn apply_tracks(&self) -> Vec<Vec<&Track>> {
        let chroms = parse_chrom_list(self.args.apply_chroms.as_deref());
        self.reps
            .iter()
            .map(|tracks| {
                tracks
                    .iter()
                    .filter(|t| chroms.as_ref().map_or(true, |c| c.contains(&t.chrom)))
                    .collect()
            })
            .collect()
    }
}

type SharedWriter = Arc<Mutex<BufWriter<File>>>;

fn create_writer(path: &str) -> Result<SharedWriter, Error> {
    let f = File::create(path).map_err(|e| Error::Io {
        source: e,
        file: Some(path.to_owned()),
    })?;
    Ok(Arc::new(Mutex::new(BufWriter::new(f))))
}

/// Output files of one replicate.
pub struct OutputFiles {
    pub sites_file: SharedWriter,
    pub all_file: Option<SharedWriter>,
    /// sites decoded 'enriched' that have read starts
    pub enriched_file: Option<SharedWriter>,
}

impl OutputFiles {
    pub fn new_from_args(args: &Arguments, irep: usize, nreps: usize) -> Result<Self, Error> {
        let prefix = match nreps {
            1 => args.output.clone(),
            _ => format!("{}.rep{irep}", args.output),
        };
        let sites_fn = format!("{prefix}.sites.bed");
        let sites_file = create_writer(&sites_fn)?;
        let all_file = match args.output_all {
            true => {
                let all_fn = format!("{prefix}.all.tsv");
                let w = create_writer(&all_fn)?;
                {
                    let mut f = w.lock().map_err(|_| Error::LockError("all header"))?;
                    writeln!(
                        f,
                        "chrom\tpos\tstrand\tk\tn\tpost_background\tpost_enriched\tpost_crosslink\tstate\tscore"
                    )
                    .map_err(|e| Error::Io {
                        source: e,
                        file: Some(all_fn.clone()),
                    })?;
                }
                Some(w)
            }
            false => None,
        };
        let enriched_file = match args.output_enriched {
            true => Some(create_writer(&format!("{prefix}.enriched.bed"))?),
            false => None,
        };
        Ok(Self {
            sites_file,
            all_file,
            enriched_file,
        })
    }

    pub fn flush(&self) -> Result<(), Error> {
        for w in std::iter::once(&self.sites_file)
            .chain(self.all_file.iter())
            .chain(self.enriched_file.iter())
        {
            w.lock()
                .map_err(|_| Error::LockError("flush"))?
                .flush()
                .map_err(|e| Error::Io { source: e, file: None })?;
        }
        Ok(())
    }
}

/// Decoded result at one position.
#[derive(Debug, Clone, Copy)]
pub struct SiteRecord<'a> {
    pub chrom: &'a str,
    pub pos: u32,
    pub strand: Strand,
    pub k: u32,
    pub n: u32,
    pub posterior: [f64; NSTATES],
    pub state: State,
    pub score: f64,
}

fn write_bed(file: &mut BufWriter<File>, recs: &[SiteRecord<'_>]) -> Result<(), Error> {
    for s in recs {
        writeln!(
            file,
            "{}\t{}\t{}\t{}\t{:.6}\t{}",
            s.chrom,
            s.pos,
            s.pos + 1,
            s.state.name(),
            s.score,
            s.strand.as_char()
        )
        .map_err(|e| Error::Io { source: e, file: None })?;
    }
    Ok(())
}

/// Per-thread record buffers, written to the shared files once `capacity`
/// records are pending.
pub struct OutputBuffer<'a> {
    sites_file: SharedWriter,
    all_file: Option<SharedWriter>,
    enriched_file: Option<SharedWriter>,
    capacity: usize,
    sites: SmallVec<[SiteRecord<'a>; 64]>,
    all: SmallVec<[SiteRecord<'a>; 64]>,
    enriched: SmallVec<[SiteRecord<'a>; 64]>,
}

impl<'a> OutputBuffer<'a> {
    pub fn new(out: &OutputFiles, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            sites_file: Arc::clone(&out.sites_file),
            all_file: out.all_file.as_ref().map(Arc::clone),
            enriched_file: out.enriched_file.as_ref().map(Arc::clone),
            capacity,
            sites: SmallVec::with_capacity(capacity),
            all: SmallVec::with_capacity(capacity),
            enriched: SmallVec::with_capacity(capacity),
        }
    }

    /// Crosslink calls go to the sites file; every position with a read
    /// start goes to the all-sites table when enabled, and enriched
    /// positions with a read start to the enriched file when enabled.
    pub fn add_site(&mut self, rec: SiteRecord<'a>) -> Result<(), Error> {
        if rec.state == State::Crosslink {
            if self.sites.len() >= self.capacity {
                self.flush_sites()?;
            }
            self.sites.push(rec);
        }
        if self.enriched_file.is_some() && rec.state == State::Enriched && rec.k > 0 {
            if self.enriched.len() >= self.capacity {
                self.flush_enriched()?;
            }
            self.enriched.push(rec);
        }
        if self.all_file.is_some() && rec.k > 0 {
            if self.all.len() >= self.capacity {
                self.flush_all()?;
            }
            self.all.push(rec);
        }
        Ok(())
    }

    pub fn flush_sites(&mut self) -> Result<(), Error> {
        let mut file = self
            .sites_file
            .lock()
            .map_err(|_| Error::LockError("flush_sites"))?;
        write_bed(&mut file, &self.sites)?;
        self.sites.clear();
        Ok(())
    }

    pub fn flush_enriched(&mut self) -> Result<(), Error> {
        let Some(enriched_file) = self.enriched_file.as_ref() else {
            return Ok(());
        };
        let mut file = enriched_file
            .lock()
            .map_err(|_| Error::LockError("flush_enriched"))?;
        write_bed(&mut file, &self.enriched)?;
        self.enriched.clear();
        Ok(())
    }

    pub fn flush_all(&mut self) -> Result<(), Error> {
        let Some(all_file) = self.all_file.as_ref() else {
            return Ok(());
        };
        let mut file = all_file.lock().map_err(|_| Error::LockError("flush_all"))?;
        for s in self.all.iter() {
            writeln!(
                file,
                "{}\t{}\t{}\t{}\t{}\t{:.6e}\t{:.6e}\t{:.6e}\t{}\t{:.6}",
                s.chrom,
                s.pos,
                s.strand.as_char(),
                s.k,
                s.n,
                s.posterior[0],
                s.posterior[1],
                s.posterior[2],
                s.state.name(),
                s.score,
            )
            .map_err(|e| Error::Io { source: e, file: None })?;
        }
        self.all.clear();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.flush_sites()?;
        self.flush_enriched()?;
        self.flush_all()
    }
}

#[test]
fn test_read_observation_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rep1.tsv");
    std::fs::write(
        &path,
        "chrom\tpos\tstrand\tk\tn\tkde\tinput_kde\tmotif_a\n\
         chr1\t10\t+\t0\t5\t0.1\t0.5\t\n\
         chr1\t11\t+\t2\t6\t0.4\t0.5\t1.5\n\
         chr1\t15\t+\t1\t7\t0.2\t0.4\tNA\n\
         chr1\t15\t-\t3\t9\t0.9\t0.1\t2.0\n\
         chr2\t0\t-\t1\t1\t0.3\t0.0\t\n",
    )
    .unwrap();
    let (tracks, has_input, n_motifs) = read_observation_table(&path).unwrap();
    assert!(has_input);
    assert_eq!(n_motifs, 1);
    assert_eq!(tracks.len(), 4);
    assert_eq!(tracks[0].len(), 2);
    assert_eq!(tracks[0].start, 10);
    assert_eq!(tracks[0].position(1), 11);
    assert_eq!(tracks[0].trunc_counts, vec![0, 2]);
    assert!(tracks[0].covariates(0)[0].is_nan());
    assert_eq!(tracks[0].covariates(1), &[1.5]);
    assert_eq!(tracks[1].start, 15);
    assert_eq!(tracks[2].strand, Strand::Reverse);
    assert_eq!(tracks[2].input_kde(0), 0.1);
    assert_eq!(tracks[3].chrom, "chr2");
}

#[test]
fn test_read_observation_table_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.tsv");
    std::fs::write(&path, "chrom\tpos\tstrand\tk\tkde\nchr1\t1\t+\t1\t0.1\n").unwrap();
    assert!(matches!(
        read_observation_table(&path),
        Err(Error::ParseLine {
            source: ParseLineError::ReadColumnError("n"),
            ..
        })
    ));

    std::fs::write(
        &path,
        "chrom\tpos\tstrand\tk\tn\tkde\nchr1\t5\t+\t1\t3\t0.1\nchr1\t4\t+\t1\t3\t0.1\n",
    )
    .unwrap();
    assert!(matches!(read_observation_table(&path), Err(Error::Unsorted { .. })));

    std::fs::write(&path, "chrom\tpos\tstrand\tk\tn\tkde\nchr1\t5\t.\t1\t3\t0.1\n").unwrap();
    assert!(matches!(read_observation_table(&path), Err(Error::ParseLine { .. })));
}

#[test]
fn test_track_selection() {
    let mut args = Arguments::new_for_test();
    args.learn_chroms = Some("chr1; chr3".to_owned());
    args.apply_chroms = Some("chr2".to_owned());
    args.fit.max_trunc_count = 10;
    let tr = |chrom: &str, k: u32| Track::from_parts(chrom, Strand::Forward, 0, vec![k], vec![k], vec![1.0]);
    let input = InputData::from_tracks(
        &args,
        vec![vec![tr("chr1", 1), tr("chr1", 11), tr("chr2", 1), tr("chr3", 2)]],
        false,
        0,
    );
    let learn = input.learning_tracks();
    assert_eq!(learn[0].len(), 2);
    assert!(learn[0].iter().all(|t| t.chrom != "chr2"));
    let apply = input.apply_tracks();
    assert_eq!(apply[0].len(), 1);
    assert_eq!(apply[0][0].chrom, "chr2");
}

#[test]
fn test_output_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut args = Arguments::new_for_test();
    args.output = dir.path().join("out").to_str().unwrap().to_owned();
    args.output_all = true;
    let out = OutputFiles::new_from_args(&args, 1, 2).unwrap();
    {
        let mut buf = OutputBuffer::new(&out, 1);
        let rec = SiteRecord {
            chrom: "chr1",
            pos: 100,
            strand: Strand::Reverse,
            k: 5,
            n: 9,
            posterior: [0.0, 0.1, 0.9],
            state: State::Crosslink,
            score: 2.25,
        };
        buf.add_site(rec).unwrap();
        buf.add_site(SiteRecord {
            state: State::Enriched,
            pos: 101,
            ..rec
        })
        .unwrap();
        buf.flush().unwrap();
    }
    out.flush().unwrap();
    let bed = std::fs::read_to_string(format!("{}.rep1.sites.bed", args.output)).unwrap();
    assert_eq!(bed, "chr1\t100\t101\tcrosslink\t2.250000\t-\n");
    let all = std::fs::read_to_string(format!("{}.rep1.all.tsv", args.output)).unwrap();
    assert_eq!(all.lines().count(), 3);
}

#[test]
fn test_output_buffer_flushes_at_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let mut args = Arguments::new_for_test();
    args.output = dir.path().join("out").to_str().unwrap().to_owned();
    args.output_enriched = true;
    let out = OutputFiles::new_from_args(&args, 0, 1).unwrap();
    let rec = SiteRecord {
        chrom: "chr1",
        pos: 10,
        strand: Strand::Forward,
        k: 3,
        n: 8,
        posterior: [0.0, 0.2, 0.8],
        state: State::Crosslink,
        score: 1.0,
    };
    let mut buf = OutputBuffer::new(&out, 2);
    for pos in 10..13 {
        buf.add_site(SiteRecord { pos, ..rec }).unwrap();
    }
    // the third record pushed the first two out
    assert_eq!(buf.sites.len(), 1);
    out.flush().unwrap();
    let bed = std::fs::read_to_string(format!("{}.sites.bed", args.output)).unwrap();
    assert_eq!(bed.lines().count(), 2);

    for (pos, k) in [(20, 2), (21, 0), (22, 1)] {
        buf.add_site(SiteRecord {
            pos,
            k,
            state: State::Enriched,
            ..rec
        })
        .unwrap();
    }
    buf.flush().unwrap();
    out.flush().unwrap();
    let bed = std::fs::read_to_string(format!("{}.sites.bed", args.output)).unwrap();
    assert_eq!(bed.lines().count(), 3);
    let enriched = std::fs::read_to_string(format!("{}.enriched.bed", args.output)).unwrap();
    assert_eq!(
        enriched,
        "chr1\t20\t21\tenriched\t1.000000\t+\nchr1\t22\t23\tenriched\t1.000000\t+\n"
    );
}
