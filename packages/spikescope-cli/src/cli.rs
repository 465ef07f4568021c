use clap::{Args, Parser, Subcommand, ValueEnum};
use spikescope::{AveragingTriggerType, Encoding};

#[derive(Parser)]
#[command(
    name = "spikescope",
    version,
    about = "Headless capture-to-render pipeline driver",
    long_about = "Capture from a synthetic generator, a recorded file, a serial SpikerBox or an audio\n\
                  input, feed the signal buffer and prepare frames at a fixed rate.\n\
                  Reports stream and frame statistics as JSON."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Capture for a while and report what was prepared for drawing
    Run(RunArgs),
    /// Print the default pipeline configuration
    Config(ConfigArgs),
    /// Validate a pipeline configuration file
    Validate(ValidateArgs),
}

#[derive(Clone, Copy, ValueEnum)]
pub enum EncodingArg {
    Pcm16,
    SpikerBox,
}

impl From<EncodingArg> for Encoding {
    fn from(value: EncodingArg) -> Self {
        match value {
            EncodingArg::Pcm16 => Encoding::Pcm16,
            EncodingArg::SpikerBox => Encoding::SpikerBox,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum TriggerArg {
    Threshold,
    AllEvents,
}

impl From<TriggerArg> for AveragingTriggerType {
    fn from(value: TriggerArg) -> Self {
        match value {
            TriggerArg::Threshold => AveragingTriggerType::Threshold,
            TriggerArg::AllEvents => AveragingTriggerType::AllEvents,
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// Pipeline configuration file (JSON). Defaults apply when omitted.
    #[arg(long, env = "SPIKESCOPE_CONFIG")]
    pub config: Option<String>,

    /// Replay a recorded raw capture instead of the configured source
    #[arg(long, conflicts_with_all = ["port", "audio"])]
    pub replay: Option<String>,

    /// Read from a serial device instead of the configured source
    #[arg(long, conflicts_with = "audio")]
    pub port: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = 230_400)]
    pub baud: u32,

    /// Capture from the default audio input
    #[arg(long, default_value_t = false)]
    pub audio: bool,

    /// Byte encoding of --replay / --port input
    #[arg(long, value_enum)]
    pub encoding: Option<EncodingArg>,

    /// Sample rate in Hz (overrides the configuration)
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Channel count (overrides the configuration)
    #[arg(long)]
    pub channels: Option<usize>,

    /// Enable signal averaging with the given trigger
    #[arg(long, value_enum)]
    pub averaging: Option<TriggerArg>,

    /// Capture duration in seconds
    #[arg(long, default_value_t = 2.0)]
    pub seconds: f64,

    /// Frame preparation rate
    #[arg(long, default_value_t = 30)]
    pub fps: u32,

    /// Simulated surface width in pixels
    #[arg(long, default_value_t = 800)]
    pub width: u32,

    /// Simulated surface height in pixels
    #[arg(long, default_value_t = 600)]
    pub height: u32,

    /// Request auto-scale on the first frame
    #[arg(long, default_value_t = false)]
    pub auto_scale: bool,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,

    /// Suppress progress messages on stderr
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Configuration file path
    #[arg(long)]
    pub config: String,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
