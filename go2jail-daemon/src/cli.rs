//! CLI argument definitions for go2jail.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// go2jail is a daemon used to ban hosts attempting to attack your server.
#[derive(Parser, Debug)]
#[command(name = "go2jail")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon with the given configuration.
    Run(RunArgs),
    /// Find out what would be banned based on a single discipline.
    ///
    /// It's usually a good idea to test a discipline before it is enabled.
    /// The discipline runs against its watches in test mode and its jails
    /// are replaced by a built-in echo jail.
    Test(TestArgs),
    /// Load and validate the configuration, then exit.
    TestConfig(TestConfigArgs),
    /// Try match/ignore patterns against the lines of a file.
    Regex(RegexArgs),
    /// Check SMTP connectivity by sending a probe mail through mail jails.
    TestMail(TestMailArgs),
}

/// Configuration discovery options shared by most commands.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Config file directory. YAML files are loaded in lexicographic order.
    #[arg(long, default_value = "./")]
    pub config_dir: PathBuf,

    /// Reject unknown fields in configuration documents.
    #[arg(long)]
    pub strict_config: bool,
}

/// Logging options shared by most commands.
#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log format (json, pretty).
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Log destination: stderr, stdout (or -), or a file path.
    #[arg(long, default_value = "stderr")]
    pub log_file: String,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub log: LogArgs,

    /// HTTP stats listen address (e.g. 127.0.0.1:8080).
    #[arg(long)]
    pub http_stats_listen_addr: Option<String>,
}

#[derive(Args, Debug)]
pub struct TestArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub log: LogArgs,

    /// Id of the discipline to test.
    pub discipline_id: String,
}

#[derive(Args, Debug)]
pub struct TestConfigArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Args, Debug)]
pub struct RegexArgs {
    /// Match pattern; may be given multiple times.
    #[arg(long = "match", required = true)]
    pub matches: Vec<String>,

    /// Ignore pattern; may be given multiple times.
    #[arg(long = "ignore")]
    pub ignores: Vec<String>,

    /// File whose lines are tested.
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct TestMailArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub log: LogArgs,

    /// Ids of the mail jails to probe.
    #[arg(required = true)]
    pub jail_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_command() {
        let cli = Cli::parse_from([
            "go2jail",
            "run",
            "--config-dir",
            "/etc/go2jail",
            "--http-stats-listen-addr",
            "127.0.0.1:9090",
        ]);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.config.config_dir, PathBuf::from("/etc/go2jail"));
                assert_eq!(
                    args.http_stats_listen_addr.as_deref(),
                    Some("127.0.0.1:9090")
                );
                assert!(!args.config.strict_config);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_test_command_with_discipline_id() {
        let cli = Cli::parse_from(["go2jail", "test", "ssh-bruteforce"]);
        match cli.command {
            Command::Test(args) => assert_eq!(args.discipline_id, "ssh-bruteforce"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn regex_requires_match_pattern() {
        assert!(Cli::try_parse_from(["go2jail", "regex", "some.log"]).is_err());

        let cli = Cli::parse_from([
            "go2jail", "regex", "--match", "%(ip)", "--ignore", "^10\\.", "some.log",
        ]);
        match cli.command {
            Command::Regex(args) => {
                assert_eq!(args.matches, vec!["%(ip)"]);
                assert_eq!(args.ignores, vec!["^10\\."]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_mail_requires_jail_ids() {
        assert!(Cli::try_parse_from(["go2jail", "test-mail"]).is_err());
    }
}
