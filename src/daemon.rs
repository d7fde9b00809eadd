use anyhow::{Result, anyhow};
use daemonize::Daemonize;

use crate::config::Config;

/// Detach from the controlling terminal, optionally writing a pidfile.
///
/// Must run before the async runtime exists: the runtime's worker state
/// does not survive the fork.
pub fn detach(cfg: &Config) -> Result<()> {
    let mut daemon = Daemonize::new().working_directory("/");
    if let Some(pidfile) = &cfg.pidfile {
        daemon = daemon.pid_file(pidfile);
    }
    daemon
        .start()
        .map_err(|e| anyhow!("cannot daemonize: {e}"))?;
    Ok(())
}
