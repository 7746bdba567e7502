//! Bounded fan-in external merge.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log;

use crate::config::{ConfigError, OpenPolicy};
use crate::pipeline::RecordStream;

/// Merge error.
#[derive(Debug)]
pub enum MergeError {
    /// Invalid merger configuration.
    Config(ConfigError),
    /// Scratch directory creation error.
    ScratchDir(io::Error),
    /// A run file could not be opened under the fail-fast policy.
    OpenRun { path: PathBuf, source: io::Error },
    /// Output file creation or write error.
    Output(io::Error),
}

impl Error for MergeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            MergeError::Config(err) => err,
            MergeError::ScratchDir(err) => err,
            MergeError::OpenRun { source, .. } => source,
            MergeError::Output(err) => err,
        })
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            MergeError::Config(err) => write!(f, "invalid merge configuration: {}", err),
            MergeError::ScratchDir(err) => write!(f, "scratch directory not created: {}", err),
            MergeError::OpenRun { path, source } => {
                write!(f, "run file {} not opened: {}", path.display(), source)
            }
            MergeError::Output(err) => write!(f, "output write failed: {}", err),
        }
    }
}

/// Merger builder. Provides methods for [`Merger`] initialization.
#[derive(Clone)]
pub struct MergerBuilder {
    /// Maximum number of run files merged in one group.
    fan_in: usize,
    /// Directory to be used to store intermediate runs.
    scratch_dir: Option<Box<Path>>,
    /// Capacity of each run's read-ahead queues.
    lookahead: usize,
    /// Reaction to run files that cannot be opened.
    open_policy: OpenPolicy,
}

impl MergerBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        MergerBuilder::default()
    }

    /// Builds a [`Merger`] instance using provided configuration.
    pub fn build(self) -> Result<Merger, MergeError> {
        Merger::new(
            self.fan_in,
            self.scratch_dir.as_deref(),
            self.lookahead,
            self.open_policy,
        )
    }

    /// Sets the maximum number of run files merged in one group.
    pub fn with_fan_in(mut self, fan_in: usize) -> MergerBuilder {
        self.fan_in = fan_in;
        return self;
    }

    /// Sets directory to be used to store intermediate runs.
    pub fn with_scratch_dir(mut self, path: &Path) -> MergerBuilder {
        self.scratch_dir = Some(path.into());
        return self;
    }

    /// Sets the capacity of each run's read-ahead queues.
    pub fn with_lookahead(mut self, lookahead: usize) -> MergerBuilder {
        self.lookahead = lookahead;
        return self;
    }

    /// Sets the reaction to run files that cannot be opened.
    pub fn with_open_policy(mut self, policy: OpenPolicy) -> MergerBuilder {
        self.open_policy = policy;
        return self;
    }
}

impl Default for MergerBuilder {
    fn default() -> Self {
        MergerBuilder {
            fan_in: 9,
            scratch_dir: None,
            lookahead: 2,
            open_policy: OpenPolicy::default(),
        }
    }
}

/// Counters of one completed merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    /// Merge passes performed over the run files.
    pub passes: u64,
    /// Records written to the final output.
    pub records: u64,
    /// Malformed lines skipped while reading run files.
    pub lines_skipped: u64,
    /// Run files skipped because they could not be opened.
    pub files_skipped: u64,
}

/// Multi-pass k-way merger of sorted run files.
///
/// Every pass splits the current run files into groups of at most `fan_in`
/// and merges each group into a single longer run, so an arbitrary number
/// of runs never needs more than `fan_in` files open at once. Once the
/// survivors fit into one group they are merged straight into the target.
/// Each run is read through its own background decode pipeline, keeping
/// `lookahead` records ready ahead of the merge loop.
pub struct Merger {
    /// Maximum number of run files merged in one group.
    fan_in: usize,
    /// Directory holding intermediate runs, removed on drop.
    scratch_dir: tempfile::TempDir,
    /// Capacity of each run's read-ahead queues.
    lookahead: usize,
    /// Reaction to run files that cannot be opened.
    open_policy: OpenPolicy,
    /// Sequence counter for intermediate run naming.
    run_seq: AtomicU64,
}

impl Merger {
    /// Creates a new merger instance.
    ///
    /// # Arguments
    /// * `fan_in` - Maximum number of run files merged in one group, two at least.
    /// * `scratch_path` - Directory to be used to store intermediate runs. If the parameter
    ///   is [`None`] default OS temporary directory will be used.
    /// * `lookahead` - Capacity of each run's read-ahead queues, one at least.
    /// * `open_policy` - Reaction to run files that cannot be opened.
    pub fn new(
        fan_in: usize,
        scratch_path: Option<&Path>,
        lookahead: usize,
        open_policy: OpenPolicy,
    ) -> Result<Self, MergeError> {
        if fan_in < 2 {
            return Err(MergeError::Config(ConfigError::FanInTooSmall(fan_in)));
        }
        if lookahead == 0 {
            return Err(MergeError::Config(ConfigError::ZeroLookahead));
        }

        return Ok(Merger {
            fan_in,
            scratch_dir: Self::init_scratch_directory(scratch_path)?,
            lookahead,
            open_policy,
            run_seq: AtomicU64::new(0),
        });
    }

    fn init_scratch_directory(scratch_path: Option<&Path>) -> Result<tempfile::TempDir, MergeError> {
        let scratch_dir = if let Some(scratch_path) = scratch_path {
            fs::create_dir_all(scratch_path).map_err(|err| MergeError::ScratchDir(err))?;
            tempfile::tempdir_in(scratch_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(|err| MergeError::ScratchDir(err))?;

        log::info!("using {} as a scratch directory", scratch_dir.path().display());

        return Ok(scratch_dir);
    }

    /// Merges sorted `runs` into a single sorted file at `target`.
    ///
    /// Run files are consumed: each one is deleted once its group has been
    /// merged. An empty `runs` slice still produces `target`, empty.
    ///
    /// # Arguments
    /// * `runs` - Sorted run files to merge.
    /// * `target` - Path the fully merged output is written to.
    pub fn merge(&self, runs: &[PathBuf], target: &Path) -> Result<MergeReport, MergeError> {
        log::info!(
            "merging {} run files into {} (fan-in: {})",
            runs.len(),
            target.display(),
            self.fan_in
        );

        let mut report = MergeReport {
            passes: 0,
            records: 0,
            lines_skipped: 0,
            files_skipped: 0,
        };

        if runs.is_empty() {
            fs::File::create(target).map_err(|err| MergeError::Output(err))?;
            log::info!("merge complete: 0 records in 0 passes");
            return Ok(report);
        }

        let mut files = runs.to_vec();
        loop {
            // the last pass is the one whose survivors fit into a single group
            let final_pass = files.len() <= self.fan_in;
            report.passes += 1;
            log::debug!("merge pass {} over {} files", report.passes, files.len());

            let mut next_files = Vec::new();
            for group in files.chunks(self.fan_in) {
                let out_path = if final_pass {
                    target.to_path_buf()
                } else {
                    self.next_scratch_run()
                };
                let written = self.merge_group(group, &out_path, &mut report)?;
                if final_pass {
                    report.records += written;
                } else {
                    next_files.push(out_path);
                }
            }

            if final_pass {
                break;
            }
            files = next_files;
        }

        log::info!(
            "merge complete: {} records in {} passes ({} malformed lines, {} runs skipped)",
            report.records,
            report.passes,
            report.lines_skipped,
            report.files_skipped
        );
        return Ok(report);
    }

    fn merge_group(
        &self,
        group: &[PathBuf],
        out_path: &Path,
        report: &mut MergeReport,
    ) -> Result<u64, MergeError> {
        let mut streams = Vec::new();
        let mut consumed = Vec::new();
        for path in group {
            match RecordStream::open(path, self.lookahead) {
                Ok(stream) => {
                    streams.push(stream);
                    consumed.push(path);
                }
                Err(err) => match self.open_policy {
                    OpenPolicy::Skip => {
                        log::warn!("skipping unreadable run {}: {}", path.display(), err);
                        report.files_skipped += 1;
                    }
                    OpenPolicy::Fail => {
                        return Err(MergeError::OpenRun {
                            path: path.clone(),
                            source: err,
                        });
                    }
                },
            }
        }

        let file = fs::File::create(out_path).map_err(|err| MergeError::Output(err))?;
        let mut writer = io::BufWriter::new(file);
        let mut written: u64 = 0;

        // one slot per live stream, holding its next undelivered record
        let mut active = Vec::new();
        let mut drained = Vec::new();
        for mut stream in streams {
            match stream.next() {
                Some(record) => active.push((stream, record)),
                None => drained.push(stream),
            }
        }

        while !active.is_empty() {
            let mut min_at = 0;
            for i in 1..active.len() {
                // strict comparison keeps ties on the lowest slot
                if active[min_at].1.key > active[i].1.key {
                    min_at = i;
                }
            }

            let smallest = match active[min_at].0.next() {
                Some(record) => mem::replace(&mut active[min_at].1, record),
                None => {
                    let (stream, record) = active.remove(min_at);
                    drained.push(stream);
                    record
                }
            };
            writeln!(writer, "{}", smallest).map_err(|err| MergeError::Output(err))?;
            written += 1;
        }

        writer.flush().map_err(|err| MergeError::Output(err))?;

        for stream in drained {
            report.lines_skipped += stream.finish();
        }
        for path in consumed {
            if let Err(err) = fs::remove_file(path) {
                log::warn!("consumed run {} not deleted: {}", path.display(), err);
            }
        }

        return Ok(written);
    }

    fn next_scratch_run(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or(0);
        let seq = self.run_seq.fetch_add(1, Ordering::Relaxed);
        self.scratch_dir.path().join(format!("run-{}-{:04}.txt", nanos, seq))
    }
}
