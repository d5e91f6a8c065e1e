//! Environment preparation around the acquisition worker.
//!
//! While the worker owns the hardware, services that compete for it are
//! suspended. The compensating restore must run exactly once no matter how
//! the supervisor goes away: explicit shutdown, drop, or process signal.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::AcquisitionConfig;
use crate::error::{LinienError, Result};

/// Side effects performed before the worker starts and after it stops.
pub trait EnvironmentHooks: Send + Sync {
    fn suspend(&self) -> Result<()>;

    fn restore(&self) -> Result<()>;
}

/// Hooks that do nothing, for development machines and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl EnvironmentHooks for NoopHooks {
    fn suspend(&self) -> Result<()> {
        Ok(())
    }

    fn restore(&self) -> Result<()> {
        Ok(())
    }
}

/// Stops systemd units on suspend and starts them again on restore.
#[derive(Debug, Clone)]
pub struct SystemdServices {
    units: Vec<String>,
}

impl SystemdServices {
    pub fn new<I, S>(units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            units: units.into_iter().map(Into::into).collect(),
        }
    }

    /// The board's web and SCPI services.
    pub fn board_services() -> Self {
        Self::new(AcquisitionConfig::SUSPENDED_SERVICES.iter().copied())
    }

    pub fn units(&self) -> &[String] {
        &self.units
    }

    fn systemctl(&self, hook: &str, action: &str, unit: &str) -> Result<()> {
        debug!("systemctl {} {}", action, unit);
        let status = Command::new("systemctl")
            .arg(action)
            .arg(unit)
            .status()
            .map_err(|e| LinienError::Hook {
                hook: hook.to_string(),
                message: format!("failed to run systemctl: {}", e),
            })?;

        if !status.success() {
            return Err(LinienError::Hook {
                hook: hook.to_string(),
                message: format!("systemctl {} {} exited with {}", action, unit, status),
            });
        }
        Ok(())
    }
}

impl EnvironmentHooks for SystemdServices {
    fn suspend(&self) -> Result<()> {
        for unit in &self.units {
            self.systemctl("suspend", "stop", unit)?;
        }
        info!("Suspended {} services", self.units.len());
        Ok(())
    }

    fn restore(&self) -> Result<()> {
        // Start every unit even if an earlier one fails.
        let mut first_error = None;
        for unit in &self.units {
            if let Err(e) = self.systemctl("restore", "start", unit) {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Restored {} services", self.units.len());
                Ok(())
            }
        }
    }
}

/// Runs the restore hook at most once across all of its clones.
#[derive(Clone)]
pub struct RestoreGuard {
    hooks: Arc<dyn EnvironmentHooks>,
    done: Arc<AtomicBool>,
}

impl std::fmt::Debug for RestoreGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreGuard")
            .field("done", &self.done.load(Ordering::SeqCst))
            .finish()
    }
}

impl RestoreGuard {
    /// Guard for an environment that has been suspended.
    pub fn armed(hooks: Arc<dyn EnvironmentHooks>) -> Self {
        Self {
            hooks,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Guard with nothing to restore.
    pub fn disarmed() -> Self {
        Self {
            hooks: Arc::new(NoopHooks),
            done: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Run the restore hook unless some clone already did.
    ///
    /// Returns true if this call ran it. Failures are logged, not returned,
    /// since the callers are exit paths.
    pub fn restore(&self) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.hooks.restore() {
            warn!("Restoring environment failed: {}", e);
        }
        true
    }

    pub fn is_restored(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}
