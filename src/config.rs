use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::ignore::Presets;
use crate::util::path as upath;

#[derive(Parser, Debug)]
#[command(
    name = "treesyncd",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("BUILD_DATE"), ")"),
    about = "Mirror a local directory tree to one or more destinations on filesystem change"
)]
pub struct Cli {
    /// Source directory to watch
    #[arg(long, value_name = "PATH")]
    pub from: PathBuf,

    /// Destination, local path or host:path; repeatable.
    /// With no destinations the agent only reports what it would sync.
    #[arg(long = "to", value_name = "DEST")]
    pub to: Vec<String>,

    /// Verbose internal tracing (forces off --quiet)
    #[arg(long)]
    pub debug: bool,

    /// Detach from the controlling terminal; implies --syslog
    #[arg(long)]
    pub daemon: bool,

    /// Route log output to syslog
    #[arg(long)]
    pub syslog: bool,

    /// Write a PID file (absolute path; requires --daemon)
    #[arg(long, value_name = "PATH")]
    pub pidfile: Option<PathBuf>,

    /// Print the would-be transfer commands without executing them
    #[arg(long)]
    pub dry: bool,

    /// Propagate deletions to the destinations
    #[arg(long)]
    pub delete: bool,

    /// Suppress informational output
    #[arg(long)]
    pub quiet: bool,

    /// Additional ignore pattern (regex, segment-anchored `^`); repeatable
    #[arg(long = "ignore", value_name = "REGEX")]
    pub ignore: Vec<String>,

    /// Ignore temp files (*.tmp, editor swap files, #autosave# names)
    #[arg(long)]
    pub ignore_temp: bool,

    /// Ignore path segments beginning with a dot
    #[arg(long)]
    pub ignore_dotfiles: bool,

    /// Ignore backup files (*.bak, *.old, *.orig, trailing ~)
    #[arg(long)]
    pub ignore_backups: bool,

    /// Ignore log files and log/ directories
    #[arg(long)]
    pub ignore_logs: bool,

    /// Exclude pattern forwarded verbatim to the transfer tool; repeatable
    #[arg(long = "rsync-exclude", value_name = "PATTERN")]
    pub rsync_exclude: Vec<String>,

    /// Seconds of quiet before a batch of events is processed
    #[arg(long, value_name = "SECONDS", default_value_t = 1.0, allow_negative_numbers = true)]
    pub interval: f64,

    /// Changed-sibling count above which a directory is synced recursively
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub full_sync_threshold: usize,
}

/// A sync destination: a local directory or a remote `host:path` target.
/// Stored without trailing separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination(String);

impl Destination {
    pub fn new(raw: &str) -> Self {
        Self(upath::strip_trailing_sep(raw).to_string())
    }

    /// Whether this destination names a remote host (`host:path`).
    pub fn is_remote(&self) -> bool {
        match self.0.split_once(':') {
            Some((host, _)) => !host.contains('/'),
            None => false,
        }
    }

    /// Map a source-relative suffix onto this destination prefix.
    pub fn join_suffix(&self, rel: &str) -> String {
        if rel.is_empty() {
            self.0.clone()
        } else {
            format!("{}/{rel}", self.0)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validated runtime configuration, built once from the command line.
/// There is no configuration file and no persistent state.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: PathBuf,
    pub destinations: Vec<Destination>,
    pub debug: bool,
    pub quiet: bool,
    pub dry: bool,
    pub delete: bool,
    pub daemon: bool,
    pub syslog: bool,
    pub pidfile: Option<PathBuf>,
    pub interval: Duration,
    pub threshold: usize,
    pub ignore_patterns: Vec<String>,
    pub presets: Presets,
    pub rsync_excludes: Vec<String>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let raw = cli.from.to_string_lossy();
        let source = PathBuf::from(upath::strip_trailing_sep(&raw));

        let meta = std::fs::metadata(&source)
            .with_context(|| format!("cannot access source {}", source.display()))?;
        if !meta.is_dir() {
            bail!("source {} is not a directory", source.display());
        }

        if !cli.interval.is_finite() || cli.interval < 0.0 {
            bail!("--interval must be a non-negative number of seconds");
        }

        // A detached process has no working directory to resolve relative
        // paths against, so pin everything down up front.
        let source = if cli.daemon {
            source
                .canonicalize()
                .with_context(|| format!("cannot canonicalize source {}", source.display()))?
        } else {
            source
        };

        let destinations: Vec<Destination> =
            cli.to.iter().map(|raw| Destination::new(raw)).collect();

        if cli.daemon {
            for dest in &destinations {
                if !dest.is_remote() && !Path::new(dest.as_str()).is_absolute() {
                    bail!(
                        "destination {} must be absolute (or host:path) with --daemon",
                        dest.as_str()
                    );
                }
            }
            if let Some(pidfile) = &cli.pidfile
                && !pidfile.is_absolute()
            {
                bail!("--pidfile must be an absolute path");
            }
        } else if cli.pidfile.is_some() {
            bail!("--pidfile requires --daemon");
        }

        Ok(Self {
            source,
            destinations,
            debug: cli.debug,
            quiet: cli.quiet && !cli.debug,
            dry: cli.dry,
            delete: cli.delete,
            daemon: cli.daemon,
            syslog: cli.syslog || cli.daemon,
            pidfile: cli.pidfile,
            interval: Duration::from_secs_f64(cli.interval),
            threshold: cli.full_sync_threshold,
            ignore_patterns: cli.ignore,
            presets: Presets {
                temp: cli.ignore_temp,
                dotfiles: cli.ignore_dotfiles,
                backups: cli.ignore_backups,
                logs: cli.ignore_logs,
            },
            rsync_excludes: cli.rsync_exclude,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["treesyncd"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_source_trailing_separator_stripped() {
        let tmp = tempfile::tempdir().unwrap();
        let src = format!("{}/", tmp.path().display());
        let cfg = Config::from_cli(parse(&["--from", &src, "--to", "/d"])).unwrap();
        assert_eq!(cfg.source, tmp.path());
    }

    #[test]
    fn test_missing_source_rejected() {
        let err = Config::from_cli(parse(&["--from", "/no/such/dir/anywhere"])).unwrap_err();
        assert!(format!("{err:#}").contains("cannot access source"));
    }

    #[test]
    fn test_file_source_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let err =
            Config::from_cli(parse(&["--from", &file.to_string_lossy()])).unwrap_err();
        assert!(format!("{err}").contains("not a directory"));
    }

    #[test]
    fn test_pidfile_requires_daemon() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Config::from_cli(parse(&[
            "--from",
            &tmp.path().to_string_lossy(),
            "--pidfile",
            "/run/treesyncd.pid",
        ]))
        .unwrap_err();
        assert!(format!("{err}").contains("requires --daemon"));
    }

    #[test]
    fn test_daemon_rejects_relative_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Config::from_cli(parse(&[
            "--from",
            &tmp.path().to_string_lossy(),
            "--to",
            "relative/dest",
            "--daemon",
        ]))
        .unwrap_err();
        assert!(format!("{err}").contains("must be absolute"));
    }

    #[test]
    fn test_daemon_accepts_remote_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::from_cli(parse(&[
            "--from",
            &tmp.path().to_string_lossy(),
            "--to",
            "backup:/srv/mirror",
            "--daemon",
        ]))
        .unwrap();
        assert!(cfg.destinations[0].is_remote());
        assert!(cfg.syslog, "daemon implies syslog");
    }

    #[test]
    fn test_debug_forces_quiet_off() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::from_cli(parse(&[
            "--from",
            &tmp.path().to_string_lossy(),
            "--debug",
            "--quiet",
        ]))
        .unwrap();
        assert!(cfg.debug);
        assert!(!cfg.quiet);
    }

    #[test]
    fn test_negative_interval_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Config::from_cli(parse(&[
            "--from",
            &tmp.path().to_string_lossy(),
            "--interval",
            "-1",
        ]))
        .unwrap_err();
        assert!(format!("{err}").contains("--interval"));
    }

    #[test]
    fn test_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::from_cli(parse(&["--from", &tmp.path().to_string_lossy()])).unwrap();
        assert_eq!(cfg.interval, Duration::from_secs(1));
        assert_eq!(cfg.threshold, 10);
        assert!(cfg.destinations.is_empty());
        assert!(!cfg.delete);
    }

    #[test]
    fn test_destination_suffix_mapping() {
        let dest = Destination::new("/d/");
        assert_eq!(dest.as_str(), "/d");
        assert_eq!(dest.join_suffix(""), "/d");
        assert_eq!(dest.join_suffix("a/b"), "/d/a/b");

        let remote = Destination::new("host:/srv/mirror");
        assert!(remote.is_remote());
        assert_eq!(remote.join_suffix("x"), "host:/srv/mirror/x");

        let local = Destination::new("/plain/dir");
        assert!(!local.is_remote());
    }
}
