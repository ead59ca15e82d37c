use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub const DEFAULT_CONFIG_PATH: &str = "config/oracle.yaml";

#[derive(Parser, Debug)]
#[command(name = "premium-oracle")]
#[command(about = "BTC price oracle: multi-source consensus, historical volatility and option premiums")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the polling pipeline and the read API
    Start {
        /// Path to the configuration file
        #[arg(short, long, env = "ORACLE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Override the HTTP port
        #[arg(long)]
        http: Option<u16>,

        /// Run the pipeline without the HTTP API
        #[arg(long, conflicts_with = "http")]
        no_http: bool,
    },

    /// Validate configuration without starting the oracle
    Validate {
        /// Path to the configuration file
        #[arg(short, long, env = "ORACLE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Write a configuration file with all defaults
    Init {
        /// Output path for the new configuration file
        #[arg(short, long, default_value = "oracle.yaml")]
        output: PathBuf,
    },

    /// Fetch once and print a premium quote
    Quote {
        /// Path to the configuration file
        #[arg(short, long, env = "ORACLE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        #[arg(short = 't', long, value_enum, default_value = "put")]
        option_type: OptionKind,

        /// Strike price in quote currency
        #[arg(short, long)]
        strike: f64,

        /// Days until expiry, fractions allowed
        #[arg(short, long, default_value_t = 30.0, value_parser = parse_days)]
        days: f64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionKind {
    Call,
    Put,
}

impl OptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKind::Call => "call",
            OptionKind::Put => "put",
        }
    }
}

fn parse_days(s: &str) -> Result<f64, String> {
    let days: f64 = s.parse().map_err(|_| format!("not a number: {}", s))?;
    if days.is_finite() && days > 0.0 {
        Ok(days)
    } else {
        Err(format!("days must be positive, got {}", s))
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
