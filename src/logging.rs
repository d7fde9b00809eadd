use std::io;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use syslog::{Facility, Formatter3164, LoggerBackend};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::Config;

/// Install the global tracing subscriber.
///
/// Verbosity comes from `--debug`/`--quiet` unless `RUST_LOG` overrides it.
/// Under `--syslog` (implied by `--daemon`) every formatted line is handed
/// to syslog with a severity derived from the tracing level. ERROR is
/// reserved for fatal conditions and goes out as `crit`; anything the agent
/// survives logs at WARN or below.
pub fn init(cfg: &Config) -> Result<()> {
    let default_filter = if cfg.debug {
        "treesyncd=debug"
    } else if cfg.quiet {
        "treesyncd=warn"
    } else {
        "treesyncd=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if cfg.syslog {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: "treesyncd".into(),
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter).map_err(|e| anyhow!("cannot open syslog: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(SyslogMakeWriter {
                logger: Arc::new(Mutex::new(logger)),
            })
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}

type SharedLogger = Arc<Mutex<syslog::Logger<LoggerBackend, Formatter3164>>>;

struct SyslogMakeWriter {
    logger: SharedLogger,
}

/// One formatted log line on its way to syslog. The subscriber writes the
/// line and drops the writer; the drop flushes.
struct SyslogLine {
    logger: SharedLogger,
    level: Level,
    buf: Vec<u8>,
}

impl io::Write for SyslogLine {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let msg = String::from_utf8_lossy(&self.buf);
        let msg = msg.trim_end();
        if msg.is_empty() {
            return Ok(());
        }
        let mut logger = self
            .logger
            .lock()
            .map_err(|_| io::Error::other("syslog logger poisoned"))?;
        let sent = match self.level {
            Level::ERROR => logger.crit(msg),
            Level::WARN => logger.warning(msg),
            Level::INFO => logger.info(msg),
            _ => logger.debug(msg),
        };
        sent.map_err(|e| io::Error::other(e.to_string()))?;
        self.buf.clear();
        Ok(())
    }
}

impl Drop for SyslogLine {
    fn drop(&mut self) {
        let _ = io::Write::flush(self);
    }
}

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogLine;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogLine {
            logger: Arc::clone(&self.logger),
            level: Level::INFO,
            buf: Vec::new(),
        }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        SyslogLine {
            logger: Arc::clone(&self.logger),
            level: *meta.level(),
            buf: Vec::new(),
        }
    }
}
