use clap::Parser;
use std::ops::RangeInclusive;
use std::path::PathBuf;

/// Throughput subscriber self-test: runs the subscriber against a scripted
/// publisher on an in-process bus
#[derive(Parser, Debug, Default)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Use a reliable data reader (best-effort otherwise)
    #[clap(long, default_value_t = false, help_heading = "Transport Options")]
    pub reliable: bool,

    /// Process id used to qualify topics and derive the domain
    #[clap(long, help_heading = "Transport Options")]
    pub pid: Option<u32>,

    /// Qualify topic names with the local hostname
    #[clap(long, default_value_t = false, help_heading = "Transport Options")]
    pub hostname: bool,

    /// Force the domain id instead of deriving it from the pid
    #[clap(long, help_heading = "Transport Options")]
    pub domain: Option<u32>,

    /// Transport XML profile to load when the participant opens
    #[clap(long, help_heading = "Transport Options")]
    pub xml: Option<PathBuf>,

    /// Use one runtime-described payload type for every size
    #[clap(long, default_value_t = false, help_heading = "Payload Options")]
    pub dynamic_types: bool,

    /// Upper bound on the payload size of the dynamic type
    #[clap(long, default_value_t = crate::defaults::MAX_PAYLOAD_SIZE, help_heading = "Payload Options")]
    pub max_payload_size: u32,

    /// Payload sizes in bytes, one iteration each
    #[clap(short = 's', long, num_args = 1.., default_values_t = crate::defaults::PAYLOAD_SIZES.to_vec(), help_heading = "Payload Options")]
    pub payload_sizes: Vec<u32>,

    /// Target number of in-flight samples per iteration
    #[clap(short = 'd', long, default_value_t = crate::defaults::DEMAND)]
    pub demand: u32,

    /// Samples the publisher sends per iteration
    #[clap(short = 'n', long, default_value_t = crate::defaults::SAMPLES)]
    pub samples: u32,

    /// Sequence numbers the publisher never delivers (e.g. "300-309")
    #[clap(long, value_parser = parse_seq_range)]
    pub drop: Vec<RangeInclusive<u32>>,

    /// Output file for results (JSON format)
    #[clap(short = 'o', long)]
    pub output_file: Option<PathBuf>,

    /// Write logs to this file instead of stdout
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

/// Parse an inclusive sequence range ("300-309" or a single "42")
fn parse_seq_range(s: &str) -> Result<RangeInclusive<u32>, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Range cannot be empty".to_string());
    }

    let (start_str, end_str) = match s.split_once('-') {
        Some((start, end)) => (start.trim(), end.trim()),
        None => (s, s),
    };

    let start: u32 = start_str
        .parse()
        .map_err(|_| format!("Invalid sequence number in range: {}", start_str))?;
    let end: u32 = end_str
        .parse()
        .map_err(|_| format!("Invalid sequence number in range: {}", end_str))?;

    if start > end {
        return Err(format!("Range start {} is after its end {}", start, end));
    }

    Ok(start..=end)
}
