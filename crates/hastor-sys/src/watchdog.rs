//! Hardware watchdog and immediate reboot.

use crate::error::{CallError, CallResult, Errno};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use tracing::{error, info, warn};

// _IOWR('W', 6, int)
const WDIOC_SETTIMEOUT: libc::c_ulong = 0xC004_5706;

/// Hardware watchdog contract.
#[async_trait]
pub trait Watchdog: Send + Sync {
    /// Start the watchdog so the machine resets after `seconds` unless
    /// disarmed.
    async fn arm(&self, seconds: u32) -> CallResult<()>;

    /// Stop the watchdog.
    async fn disarm(&self) -> CallResult<()>;
}

/// Immediate reboot contract.
pub trait Rebooter: Send + Sync {
    /// Reboot now without syncing or unmounting.
    fn reboot(&self) -> CallResult<()>;
}

/// [`Watchdog`] backed by the Linux `/dev/watchdog` device.
#[derive(Debug)]
pub struct DevWatchdog {
    device: PathBuf,
    handle: Mutex<Option<File>>,
}

impl DevWatchdog {
    /// Use `device`, normally `/dev/watchdog`.
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            handle: Mutex::new(None),
        }
    }
}

impl Default for DevWatchdog {
    fn default() -> Self {
        Self::new("/dev/watchdog")
    }
}

#[async_trait]
impl Watchdog for DevWatchdog {
    async fn arm(&self, seconds: u32) -> CallResult<()> {
        let mut handle = self.handle.lock();
        if handle.is_none() {
            // Opening the device starts the timer.
            *handle = Some(std::fs::OpenOptions::new().write(true).open(&self.device)?);
        }
        if let Some(file) = handle.as_ref() {
            let mut timeout: libc::c_int = seconds as libc::c_int;
            // SAFETY: the fd is open for the lifetime of `file` and the
            // argument points to a valid c_int.
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), WDIOC_SETTIMEOUT as _, &mut timeout) };
            if rc != 0 {
                return Err(CallError::new(
                    Errno::EFAULT,
                    format!(
                        "failed to set watchdog timeout: {}",
                        std::io::Error::last_os_error()
                    ),
                ));
            }
        }
        info!(seconds, "watchdog armed");
        Ok(())
    }

    async fn disarm(&self) -> CallResult<()> {
        let Some(mut file) = self.handle.lock().take() else {
            return Ok(());
        };
        // Magic close: the driver stops the timer when 'V' precedes close.
        file.write_all(b"V")?;
        drop(file);
        info!("watchdog disarmed");
        Ok(())
    }
}

/// [`Rebooter`] that triggers the kernel magic SysRq reboot.
#[derive(Debug, Clone)]
pub struct SysrqRebooter {
    sysrq_enable: PathBuf,
    sysrq_trigger: PathBuf,
}

impl SysrqRebooter {
    /// Use explicit procfs paths.
    pub fn new(sysrq_enable: impl Into<PathBuf>, sysrq_trigger: impl Into<PathBuf>) -> Self {
        Self {
            sysrq_enable: sysrq_enable.into(),
            sysrq_trigger: sysrq_trigger.into(),
        }
    }
}

impl Default for SysrqRebooter {
    fn default() -> Self {
        Self::new("/proc/sys/kernel/sysrq", "/proc/sysrq-trigger")
    }
}

impl Rebooter for SysrqRebooter {
    fn reboot(&self) -> CallResult<()> {
        error!("rebooting via sysrq");
        if let Err(e) = std::fs::write(&self.sysrq_enable, b"1") {
            warn!(error = %e, "failed to enable sysrq");
        }
        std::fs::write(&self.sysrq_trigger, b"b")?;
        Ok(())
    }
}
