//! CLI argument definitions and shared statics.

use clap::{ArgAction, ArgGroup, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "evolver", version, about = "Evolver calibration CLI")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/evolver.toml")]
    pub config: PathBuf,

    /// Print results and errors as single-line JSON; console logs (JSON lines)
    /// only with --log-level or RUST_LOG
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); overrides [logging].level
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Calibration status of one piece of hardware (or all when omitted)
    Status { hardware: Option<String> },
    /// Actions of the active procedure with their payload schemas
    Actions { hardware: String },
    /// State of the active procedure
    State { hardware: String },
    /// Start a calibration procedure
    Start {
        hardware: String,
        /// Vials to calibrate; defaults to the configured selection
        #[arg(long, value_delimiter = ',', value_name = "CH,..")]
        vials: Option<Vec<usize>>,
        /// Continue the procedure saved in procedure_file instead of starting fresh
        #[arg(long, action = ArgAction::SetTrue)]
        resume: bool,
    },
    /// Run one procedure action
    Dispatch {
        hardware: String,
        action: String,
        /// Action payload as a JSON object
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,
    },
    /// Revert the last dispatched action
    Undo { hardware: String },
    /// Persist the active procedure to procedure_file
    Save { hardware: String },
    /// Fit transformers from the procedure's measurements and write calibration_file
    Apply { hardware: String },
    /// Convert a value through the fitted transformers
    #[command(group(ArgGroup::new("direction").required(true).args(["raw", "value"])))]
    Convert {
        hardware: String,
        #[arg(long)]
        channel: usize,
        /// Device reading to convert into a physical value
        #[arg(long, allow_negative_numbers = true)]
        raw: Option<f64>,
        /// Physical value to convert into a device command
        #[arg(long, allow_negative_numbers = true)]
        value: Option<f64>,
    },
    /// Calibrate from bench measurements (CSV: channel,reference,raw)
    ImportCsv {
        hardware: String,
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Build every configured calibrator and read its hardware once
    SelfCheck,
}

impl Commands {
    /// True for commands that change the saved procedure.
    pub fn mutates_procedure(&self) -> bool {
        matches!(
            self,
            Self::Start { .. } | Self::Dispatch { .. } | Self::Undo { .. } | Self::Apply { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn convert_needs_exactly_one_direction() {
        let base = ["evolver", "convert", "od", "--channel", "0"];
        assert!(Cli::try_parse_from(base).is_err());
        assert!(Cli::try_parse_from(base.iter().chain(&["--raw", "1", "--value", "2"])).is_err());
        let cli = Cli::try_parse_from(base.iter().chain(&["--value", "-1.5"])).unwrap();
        assert!(matches!(cli.cmd, Commands::Convert { value: Some(v), raw: None, .. } if v == -1.5));
    }

    #[test]
    fn vials_are_comma_separated() {
        let cli = Cli::try_parse_from(["evolver", "start", "temp", "--vials", "0,3,5"]).unwrap();
        let Commands::Start { vials, resume, .. } = cli.cmd else {
            panic!("expected start");
        };
        assert_eq!(vials, Some(vec![0, 3, 5]));
        assert!(!resume);
    }
}
