use std::path;
use std::process;
use std::time;

use clap::ArgEnum;
use env_logger;
use log;
use regex;

use runsort::{discover_files, IngestStageBuilder, MemorySize, MergerBuilder, OpenPolicy};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let memory_budget: MemorySize = arg_parser.value_of_t_or_exit("memory_budget");
    let fan_in: usize = arg_parser.value_of_t_or_exit("fan_in");
    let queue_capacity: usize = arg_parser.value_of_t_or_exit("queue_capacity");
    let decode_workers: usize = arg_parser.value_of_t_or_exit("decode_workers");
    let lookahead: usize = arg_parser.value_of_t_or_exit("lookahead");
    let sample_interval_ms: u64 = arg_parser.value_of_t_or_exit("sample_interval");
    let on_open_error: OnOpenError = arg_parser.value_of_t_or_exit("on_open_error");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let source = arg_parser.value_of("source").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");
    let chunk_dir = arg_parser.value_of("chunk_dir").expect("value is required");
    let scratch_dir: Option<&str> = arg_parser.value_of("scratch_dir");
    let pattern = arg_parser.value_of("pattern").expect("value is required");

    let pattern = regex::Regex::new(pattern).expect("value is pre-validated");
    let inputs = match discover_files(path::Path::new(source), |name| pattern.is_match(name)) {
        Ok(inputs) => inputs,
        Err(err) => {
            log::error!("input directory scanning error: {}", err);
            process::exit(1);
        }
    };

    let open_policy = match on_open_error {
        OnOpenError::Skip => OpenPolicy::Skip,
        OnOpenError::Fail => OpenPolicy::Fail,
    };

    let mut stage_builder = IngestStageBuilder::new()
        .with_memory_budget(memory_budget)
        .with_chunk_dir(path::Path::new(chunk_dir))
        .with_queue_capacity(queue_capacity)
        .with_decode_workers(decode_workers)
        .with_sample_interval(time::Duration::from_millis(sample_interval_ms))
        .with_open_policy(open_policy);
    if let Some(threads) = threads {
        stage_builder = stage_builder.with_threads_number(threads);
    }

    let stage = match stage_builder.build() {
        Ok(stage) => stage,
        Err(err) => {
            log::error!("ingestion stage initialization error: {}", err);
            process::exit(1);
        }
    };

    let ingested = match stage.run(&inputs) {
        Ok(report) => report,
        Err(err) => {
            log::error!("data ingestion error: {}", err);
            process::exit(1);
        }
    };

    let mut merger_builder = MergerBuilder::new()
        .with_fan_in(fan_in)
        .with_lookahead(lookahead)
        .with_open_policy(open_policy);
    if let Some(scratch_dir) = scratch_dir {
        merger_builder = merger_builder.with_scratch_dir(path::Path::new(scratch_dir));
    }

    let merger = match merger_builder.build() {
        Ok(merger) => merger,
        Err(err) => {
            log::error!("merger initialization error: {}", err);
            process::exit(1);
        }
    };

    let merged = match merger.merge(&ingested.runs, path::Path::new(output)) {
        Ok(report) => report,
        Err(err) => {
            log::error!("run merging error: {}", err);
            process::exit(1);
        }
    };

    log::info!(
        "done: {} records sorted into {} in {} merge passes",
        merged.records,
        output,
        merged.passes
    );
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum OnOpenError {
    Skip,
    Fail,
}

impl OnOpenError {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        OnOpenError::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for OnOpenError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <OnOpenError as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("runsort")
        .about("external merge sort for keyed text records")
        .arg(
            clap::Arg::new("source")
                .short('i')
                .long("source")
                .help("directory containing the input files")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("pattern")
                .short('p')
                .long("pattern")
                .help("regular expression input file names must match")
                .takes_value(true)
                .default_value(r"\.txt$")
                .validator(|v| match regex::Regex::new(v) {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Pattern format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("memory_budget")
                .short('m')
                .long("memory-budget")
                .help("buffered record bytes that trigger a chunk flush")
                .takes_value(true)
                .default_value("100mb")
                .validator(|v| match v.parse::<MemorySize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Memory budget format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("fan_in")
                .short('f')
                .long("fan-in")
                .help("maximum number of run files merged at once")
                .takes_value(true)
                .default_value("9"),
        )
        .arg(
            clap::Arg::new("chunk_dir")
                .short('c')
                .long("chunk-dir")
                .help("directory to be used to store sorted chunk files")
                .takes_value(true)
                .default_value("./chunks"),
        )
        .arg(
            clap::Arg::new("scratch_dir")
                .short('d')
                .long("scratch-dir")
                .help("directory to be used to store intermediate merge runs")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("queue_capacity")
                .long("queue-capacity")
                .help("capacity of the ingestion pipeline queues")
                .takes_value(true)
                .default_value("1000"),
        )
        .arg(
            clap::Arg::new("decode_workers")
                .long("decode-workers")
                .help("number of concurrent record decoders")
                .takes_value(true)
                .default_value("2"),
        )
        .arg(
            clap::Arg::new("lookahead")
                .long("lookahead")
                .help("records buffered ahead of the merge per run file")
                .takes_value(true)
                .default_value("2"),
        )
        .arg(
            clap::Arg::new("sample_interval")
                .long("sample-interval-ms")
                .help("memory monitor sampling interval in milliseconds")
                .takes_value(true)
                .default_value("1000"),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel chunk sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("on_open_error")
                .long("on-open-error")
                .help("reaction to input or run files that cannot be opened")
                .takes_value(true)
                .default_value("skip")
                .possible_values(OnOpenError::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
