//! NMI watchdog suspend/restore around PMU programming (spec.md §4.4:
//! "when `/proc/sys/kernel/nmi_watchdog` is 1, disable it during
//! programming and restore on teardown").

const NMI_WATCHDOG_PATH: &str = "/proc/sys/kernel/nmi_watchdog";

/// Disables the kernel NMI watchdog if it was active, restoring it when
/// dropped. `None` if the watchdog was already off or the sysctl isn't
/// present (containers / guests commonly lack it).
pub struct NmiWatchdogGuard {
    was_active: bool,
}

impl NmiWatchdogGuard {
    pub fn disable_if_active() -> Option<Self> {
        let current = std::fs::read_to_string(NMI_WATCHDOG_PATH).ok()?;
        if current.trim() != "1" {
            return None;
        }
        if std::fs::write(NMI_WATCHDOG_PATH, b"0").is_err() {
            log::warn!("failed to disable nmi_watchdog before programming PMU");
            return None;
        }
        Some(NmiWatchdogGuard { was_active: true })
    }
}

impl Drop for NmiWatchdogGuard {
    fn drop(&mut self) {
        if self.was_active && std::fs::write(NMI_WATCHDOG_PATH, b"1").is_err() {
            log::warn!("failed to restore nmi_watchdog after PMU cleanup");
        }
    }
}
