//! CLI argument parsing using `clap`.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `tibet-worker`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tibet-worker",
    version,
    about = "Run a tibet job engine worker against a shared document store.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Tibet.toml` in the current working directory. A missing
    /// default file means "all defaults"; a missing explicit file is an error.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TIBET_LOG` or `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Change feed start: `now` or a sequence token. Overrides `[feed].since`.
    #[arg(long, value_name = "SEQ")]
    pub since: Option<String>,

    /// Fixed worker identity. Overrides `[worker].pid`.
    #[arg(long, value_name = "PID")]
    pub pid: Option<String>,

    /// HTTP bind address. Overrides `[http].bind`.
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<SocketAddr>,

    /// Do not start the job submission endpoint.
    #[arg(long)]
    pub no_http: bool,

    /// Load + validate config and plugins, print them, and exit.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_parse() {
        let args = CliArgs::try_parse_from([
            "tibet-worker",
            "--config",
            "conf/Tibet.toml",
            "--since",
            "42",
            "--pid",
            "worker-a",
            "--bind",
            "0.0.0.0:9000",
            "--no-http",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("conf/Tibet.toml")));
        assert_eq!(args.since.as_deref(), Some("42"));
        assert_eq!(args.bind.unwrap().port(), 9000);
        assert!(args.no_http);
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }

    #[test]
    fn bad_bind_is_rejected() {
        assert!(CliArgs::try_parse_from(["tibet-worker", "--bind", "nowhere"]).is_err());
    }
}
