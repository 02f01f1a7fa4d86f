use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "epicast",
    about = "Prepare encoder/decoder forecast windows from daily per-location reports"
)]
pub struct Args {
    /// Path to the YAML configuration file
    #[clap(short, long, default_value = "config.yml", env = "EPICAST_CONFIG")]
    pub config: PathBuf,
    /// Data source overriding the configured one (URL or local snapshot path)
    #[clap(short, long)]
    pub source: Option<String>,
    /// Write the flattened windows to this CSV file
    #[clap(short, long)]
    pub output: Option<PathBuf>,
    /// Print the selectable locations and their indices
    #[clap(short, long)]
    pub list_locations: bool,
    /// Print the missing-value report of the raw table
    #[clap(short, long)]
    pub report: bool,
    /// Directory for log files
    #[clap(long, default_value = "logs")]
    pub log_dir: String,
}
