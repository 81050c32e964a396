use crate::MemSampler;
use clap::{value_parser, Arg, ArgAction, Command, ValueEnum};
use csv::Writer;
use rand::distributions::{Uniform, WeightedIndex};
use std::fmt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::path::Path;
use std::time::Duration;

#[derive(PartialEq, Debug, ValueEnum, Clone, Copy)]
pub enum DS {
    FineGrained,
    LockFree,
}

impl fmt::Display for DS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => write!(f, "{}", value.get_name()),
            None => write!(f, "{:?}", self),
        }
    }
}

#[derive(PartialEq, Debug)]
pub enum Op {
    Get,
    Insert,
    Remove,
}

impl Op {
    pub const OPS: [Op; 3] = [Op::Get, Op::Insert, Op::Remove];
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum GetRate {
    WriteOnly = 0,
    ReadWrite = 1,
    ReadIntensive = 2,
    ReadOnly = 3,
}

impl GetRate {
    fn from_level(level: u8) -> Self {
        match level {
            0 => GetRate::WriteOnly,
            1 => GetRate::ReadWrite,
            2 => GetRate::ReadIntensive,
            3 => GetRate::ReadOnly,
            _ => unreachable!("get rate is checked by the parser"),
        }
    }

    /// Relative weights of `Op::OPS`.
    fn op_weights(self) -> &'static [i32; 3] {
        match self {
            GetRate::WriteOnly => &[0, 1, 1],
            GetRate::ReadWrite => &[2, 1, 1],
            GetRate::ReadIntensive => &[18, 1, 1],
            GetRate::ReadOnly => &[1, 0, 0],
        }
    }
}

pub struct Config {
    pub ds: DS,
    pub threads: usize,

    pub sampling: bool,
    pub sampling_period: Duration,

    pub get_rate: GetRate,
    pub op_dist: WeightedIndex<i32>,
    pub key_dist: Uniform<u64>,
    pub prefill: usize,
    pub key_range: u64,
    pub interval: u64,
    pub duration: Duration,

    pub mem_sampler: MemSampler,
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} threads, r{}, g{}, {}s",
            self.ds, self.threads, self.key_range, self.get_rate as u8, self.interval,
        )
    }
}

pub struct BenchWriter {
    output: Option<Writer<File>>,
}

#[derive(Clone, Debug, Default)]
pub struct Perf {
    pub ops_per_sec: u64,
    pub peak_mem: usize,
    pub avg_mem: usize,
    pub peak_garb: usize,
    pub avg_garb: usize,
}

impl fmt::Display for Perf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ops/s, memory peak {} avg {}, garbage peak {} avg {}",
            self.ops_per_sec,
            readable_bytes(self.peak_mem),
            readable_bytes(self.avg_mem),
            self.peak_garb,
            self.avg_garb
        )
    }
}

/// Formats a byte count with a binary unit, keeping at most three integral digits.
fn readable_bytes(num: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = num as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.3} {}", value, UNITS[unit])
}

const HEADER: [&str; 10] = [
    "ds",
    "threads",
    "sampling_period",
    "get_rate",
    "throughput",
    "peak_mem",
    "avg_mem",
    "peak_garb",
    "avg_garb",
    "key_range",
];

impl BenchWriter {
    pub fn write_record(self, config: &Config, perf: &Perf) {
        if let Some(mut output) = self.output {
            output
                .write_record(&[
                    config.ds.to_string(),
                    config.threads.to_string(),
                    config.sampling_period.as_millis().to_string(),
                    (config.get_rate as u8).to_string(),
                    perf.ops_per_sec.to_string(),
                    perf.peak_mem.to_string(),
                    perf.avg_mem.to_string(),
                    perf.peak_garb.to_string(),
                    perf.avg_garb.to_string(),
                    config.key_range.to_string(),
                ])
                .unwrap();
            output.flush().unwrap();
        }
    }
}

fn command(name: String) -> Command {
    Command::new(name)
        .arg(
            Arg::new("data structure")
                .short('d')
                .value_parser(value_parser!(DS))
                .required(true)
                .ignore_case(true)
                .help("Data structure"),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .value_parser(value_parser!(usize))
                .required(true)
                .help("Numbers of threads to run."),
        )
        .arg(
            Arg::new("get rate")
                .short('g')
                .help(
                    "The proportion of `find`(read) operations. \
                     0: 0%, 1: 50%, 2: 90%, 3: 100%",
                )
                .value_parser(value_parser!(u8).range(0..4))
                .default_value("0"),
        )
        .arg(
            Arg::new("range")
                .short('r')
                .value_parser(value_parser!(u64).range(1..))
                .help("Key range: [0..RANGE]")
                .default_value("100000"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .value_parser(value_parser!(u64).range(1..))
                .help("Time interval in seconds to run the benchmark")
                .default_value("10"),
        )
        .arg(
            Arg::new("sampling period")
                .short('s')
                .value_parser(value_parser!(u64))
                .help(
                    "The period to query jemalloc stats.allocated (ms). 0 for no sampling. \
                     Only supported on linux.",
                )
                .default_value("1"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .help("Output CSV filename. Appends the data if the file already exists."),
        )
        .arg(
            Arg::new("dry run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Check whether the arguments are parsable, without running a benchmark"),
        )
}

fn open_output(output_name: &str) -> Writer<File> {
    let output_path = Path::new(output_name);
    if let Some(dir) = output_path.parent() {
        create_dir_all(dir).unwrap();
    }
    match OpenOptions::new().read(true).append(true).open(output_path) {
        Ok(f) => csv::Writer::from_writer(f),
        Err(_) => {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(output_path)
                .unwrap();
            let mut output = csv::Writer::from_writer(f);
            // NOTE: keep in sync with `BenchWriter::write_record`
            output.write_record(HEADER).unwrap();
            output.flush().unwrap();
            output
        }
    }
}

pub fn setup(name: String) -> (Config, BenchWriter) {
    setup_from(name, std::env::args_os())
}

pub fn setup_from<I, S>(name: String, args: I) -> (Config, BenchWriter)
where
    I: IntoIterator<Item = S>,
    S: Into<std::ffi::OsString> + Clone,
{
    let m = command(name).get_matches_from(args);

    let ds = m.get_one::<DS>("data structure").copied().unwrap();
    let threads = m.get_one::<usize>("threads").copied().unwrap();
    let get_rate = GetRate::from_level(m.get_one::<u8>("get rate").copied().unwrap());
    let key_range = m.get_one::<u64>("range").copied().unwrap();
    let prefill = (key_range / 2) as usize;
    let key_dist = Uniform::from(0..key_range);
    let interval = m.get_one::<u64>("interval").copied().unwrap();
    let sampling_period = m.get_one::<u64>("sampling period").copied().unwrap();
    let sampling = sampling_period > 0 && cfg!(target_os = "linux");
    let duration = Duration::from_secs(interval);
    let op_dist = WeightedIndex::new(get_rate.op_weights()).unwrap();

    let output = m.get_one::<String>("output").map(|name| open_output(name));
    let config = Config {
        ds,
        threads,

        sampling,
        sampling_period: Duration::from_millis(sampling_period),

        get_rate,
        op_dist,
        key_dist,
        prefill,
        key_range,
        interval,
        duration,

        mem_sampler: MemSampler::new(),
    };

    if m.get_flag("dry run") {
        std::process::exit(0);
    }

    (config, BenchWriter { output })
}

#[cfg(test)]
mod tests {
    use super::{command, readable_bytes, setup_from, GetRate, DS};

    #[test]
    fn command_is_well_formed() {
        command("bench".to_string()).debug_assert();
    }

    #[test]
    fn parses_arguments() {
        let (config, _) = setup_from(
            "bench".to_string(),
            ["bench", "-d", "lock-free", "-t", "4", "-r", "1000", "-g", "2", "-s", "0"],
        );
        assert_eq!(config.ds, DS::LockFree);
        assert_eq!(config.threads, 4);
        assert_eq!(config.key_range, 1000);
        assert_eq!(config.prefill, 500);
        assert_eq!(config.get_rate, GetRate::ReadIntensive);
        assert!(!config.sampling);
        assert_eq!(config.to_string(), "lock-free: 4 threads, r1000, g2, 10s");
    }

    #[test]
    fn bytes_are_human_readable() {
        assert_eq!(readable_bytes(512), "512.000 B");
        assert_eq!(readable_bytes(1536), "1.500 KiB");
        assert_eq!(readable_bytes(3 << 20), "3.000 MiB");
        assert_eq!(readable_bytes(5 << 40), "5120.000 GiB");
    }

    #[test]
    fn data_structure_names() {
        assert_eq!(DS::FineGrained.to_string(), "fine-grained");
        assert_eq!(DS::LockFree.to_string(), "lock-free");
    }
}
