//! CLI argument parsing for the replay binary

use crate::config::{AuditOptions, ConfigError};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Where audit records go
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per line (default)
    Json,
    /// Log records through the tracing subscriber
    Log,
}

#[derive(Parser, Debug)]
#[command(name = "flowaudit")]
#[command(version)]
#[command(about = "Replay translation engine events through the control-flow audit layer", long_about = None)]
pub struct Cli {
    /// Audit options file (TOML)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Monitor control flow and flag watched syscalls under suspicion
    #[arg(long)]
    pub monitor: bool,

    /// Record hashes of cross-module edges
    #[arg(long)]
    pub xhash: bool,

    /// Track socket handles and handle-based waits
    #[arg(long)]
    pub netmon: bool,

    /// Emit a statistics record on every heartbeat
    #[arg(long = "meta-on-clock")]
    pub meta_on_clock: bool,

    /// Module list (JSON array of {name, start, end, kind})
    #[arg(long = "modules", value_name = "FILE")]
    pub modules: Option<PathBuf>,

    /// Write records to FILE instead of stdout
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Record output format
    #[arg(long = "format", value_enum, default_value = "json")]
    pub format: OutputFormat,

    /// Print a summary to stderr when the replay ends
    #[arg(short = 'c', long = "summary")]
    pub summary: bool,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Event script (JSON array or JSON lines)
    #[arg(value_name = "SCRIPT")]
    pub script: PathBuf,
}

impl Cli {
    /// Options from `--config` (or defaults) with the flags layered on top
    pub fn audit_options(&self) -> Result<AuditOptions, ConfigError> {
        let mut options = match &self.config {
            Some(path) => AuditOptions::from_file(path)?,
            None => AuditOptions::default(),
        };
        options.monitor |= self.monitor;
        options.record_xhash |= self.xhash;
        options.network_monitor |= self.netmon;
        options.meta_on_clock |= self.meta_on_clock;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_requires_script() {
        assert!(Cli::try_parse_from(["flowaudit"]).is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["flowaudit", "events.jsonl"]);
        assert_eq!(cli.script, PathBuf::from("events.jsonl"));
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(!cli.monitor);
        assert!(!cli.summary);
        assert!(cli.output.is_none());
    }

    #[test]
    fn test_cli_flags_map_to_options() {
        let cli = Cli::parse_from([
            "flowaudit",
            "--monitor",
            "--xhash",
            "--netmon",
            "--meta-on-clock",
            "events.jsonl",
        ]);
        let options = cli.audit_options().unwrap();
        assert!(options.monitor);
        assert!(options.record_xhash);
        assert!(options.network_monitor);
        assert!(options.meta_on_clock);
    }

    #[test]
    fn test_cli_flags_layer_over_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "record_xhash = true\nwatched_syscalls = [59]").unwrap();

        let path = file.path().to_string_lossy().to_string();
        let cli = Cli::parse_from(["flowaudit", "--config", &path, "--monitor", "events.jsonl"]);
        let options = cli.audit_options().unwrap();
        assert!(options.monitor);
        assert!(options.record_xhash);
        assert_eq!(options.watched_syscalls, vec![59]);
    }

    #[test]
    fn test_cli_format_log() {
        let cli = Cli::parse_from(["flowaudit", "--format", "log", "-c", "events.jsonl"]);
        assert_eq!(cli.format, OutputFormat::Log);
        assert!(cli.summary);
    }
}
