//! Command-line interface for the world server binary.

use clap::{value_parser, Arg, ArgAction, Command};
use std::path::PathBuf;

/// Options given on the command line. Anything set here overrides the
/// configuration file.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the game listener address
    pub bind_address: Option<String>,
    /// Optional override for the number of I/O partitions
    pub partitions: Option<usize>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    pub fn parse() -> Self {
        Self::from_matches(command().get_matches())
    }

    fn from_matches(matches: clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("meridian.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            partitions: matches.get_one::<usize>("partitions").copied(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

fn command() -> Command {
    Command::new("Meridian World Server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Partitioned dispatch server for the Meridian game world")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("meridian.toml"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Game client bind address (e.g., 0.0.0.0:7000)"),
        )
        .arg(
            Arg::new("partitions")
                .short('p')
                .long("partitions")
                .value_name("COUNT")
                .value_parser(value_parser!(usize))
                .help("Number of I/O partitions"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::from_matches(command().get_matches_from(["meridian"]));
        assert_eq!(args.config_path, PathBuf::from("meridian.toml"));
        assert!(args.bind_address.is_none());
        assert!(args.partitions.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn test_overrides() {
        let args = CliArgs::from_matches(command().get_matches_from([
            "meridian",
            "--config",
            "world.toml",
            "--bind",
            "0.0.0.0:7000",
            "-p",
            "8",
            "--log-level",
            "debug",
            "--json-logs",
        ]));
        assert_eq!(args.config_path, PathBuf::from("world.toml"));
        assert_eq!(args.bind_address.as_deref(), Some("0.0.0.0:7000"));
        assert_eq!(args.partitions, Some(8));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
    }

    #[test]
    fn test_rejects_non_numeric_partitions() {
        let result = command().try_get_matches_from(["meridian", "--partitions", "many"]);
        assert!(result.is_err());
    }
}
