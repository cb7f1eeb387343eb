use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;

use crate::error::{RalError, Result};

/// A PCI configuration-space address, `segment:bus:device.function`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub segment: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn new(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        PciAddress {
            segment,
            bus,
            device,
            function,
        }
    }

    fn sysfs_path(&self) -> String {
        format!(
            "/sys/bus/pci/devices/{:04x}:{:02x}:{:02x}.{}/config",
            self.segment, self.bus, self.device, self.function
        )
    }
}

/// A handle to one PCI function's configuration space, opened against the
/// kernel's `sysfs` `config` file for that device (32- and 64-bit width
/// accesses via positioned `pread`/`pwrite`, matching the RAL contract).
pub struct PciHandle {
    address: PciAddress,
    file: File,
}

impl PciHandle {
    /// Opens the configuration-space file for `address`. Fails with
    /// [`RalError::NotPresent`] when the device does not exist, which
    /// discovery code treats as "box not present" rather than a fatal
    /// error.
    pub fn open(address: PciAddress) -> Result<Self> {
        let path = address.sysfs_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| classify_open_error(address, source))?;
        Ok(PciHandle { address, file })
    }

    pub fn address(&self) -> PciAddress {
        self.address
    }

    pub fn read32(&self, offset: u16) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write32(&self, offset: u16, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    pub fn read64(&self, offset: u16) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_at(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write64(&self, offset: u16, value: u64) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// A read of `0xFFFF_FFFF` (or the 64-bit equivalent) from a vendor ID
    /// or event register is the conventional "nothing here" signal used by
    /// uncore discovery.
    pub fn looks_vacant(value: u32) -> bool {
        value == u32::MAX
    }

    fn read_at(&self, offset: u16, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, offset as u64)
            .map_err(|source| self.classify_io_error(source))
    }

    fn write_at(&self, offset: u16, buf: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buf, offset as u64)
            .map_err(|source| self.classify_io_error(source))
    }

    fn classify_io_error(&self, source: io::Error) -> RalError {
        match source.raw_os_error() {
            Some(libc::ENODEV) | Some(libc::ENXIO) => RalError::NotPresent(
                self.address.segment,
                self.address.bus,
                self.address.device,
                self.address.function,
            ),
            _ => RalError::AccessDenied {
                core_id: u32::MAX,
                source,
            },
        }
    }
}

fn classify_open_error(address: PciAddress, source: io::Error) -> RalError {
    match source.raw_os_error() {
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => RalError::NotPresent(
            address.segment,
            address.bus,
            address.device,
            address.function,
        ),
        _ => RalError::AccessDenied {
            core_id: u32::MAX,
            source,
        },
    }
}

/// Enumerates the PCI segment groups present on this machine, as reported
/// by the kernel's exported view of the ACPI MCFG table. Segment 0 is
/// always probed even if the sysfs tree is unavailable, since
/// single-segment systems are the overwhelming common case.
pub fn discover_segment_groups() -> Vec<u16> {
    let mcfg_dir = std::path::Path::new("/sys/firmware/acpi/tables");
    let mut segments = Vec::new();
    if mcfg_dir.join("MCFG").exists() {
        if let Ok(entries) = std::fs::read_dir("/sys/bus/pci/devices") {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(seg_str) = name.split(':').next() {
                    if let Ok(seg) = u16::from_str_radix(seg_str, 16) {
                        if !segments.contains(&seg) {
                            segments.push(seg);
                        }
                    }
                }
            }
        }
    }
    if segments.is_empty() {
        segments.push(0);
    }
    segments.sort_unstable();
    segments
}

/// Lists every PCI function's address under `segment`, in the order
/// `sysfs` returns them (undefined, but stable within one boot) — the
/// starting point for a full-bus capability walk rather than a single
/// known device.
pub fn enumerate_devices(segment: u16) -> Vec<PciAddress> {
    let mut addresses = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/bus/pci/devices") else {
        return addresses;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(address) = parse_bdf(&name) {
            if address.segment == segment {
                addresses.push(address);
            }
        }
    }
    addresses
}

fn parse_bdf(name: &str) -> Option<PciAddress> {
    let (segment, rest) = name.split_once(':')?;
    let (bus, rest) = rest.split_once(':')?;
    let (device, function) = rest.split_once('.')?;
    Some(PciAddress::new(
        u16::from_str_radix(segment, 16).ok()?,
        u8::from_str_radix(bus, 16).ok()?,
        u8::from_str_radix(device, 16).ok()?,
        u8::from_str_radix(function, 10).ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vacancy_signal_is_all_ones() {
        assert!(PciHandle::looks_vacant(0xFFFF_FFFF));
        assert!(!PciHandle::looks_vacant(0x8086_1234));
    }

    #[test]
    fn sysfs_path_formats_bdf() {
        let addr = PciAddress::new(0, 0x7f, 0x0a, 3);
        assert_eq!(
            addr.sysfs_path(),
            "/sys/bus/pci/devices/0000:7f:0a.3/config"
        );
    }

    #[test]
    fn parse_bdf_round_trips_sysfs_directory_names() {
        assert_eq!(parse_bdf("0000:7f:0a.3"), Some(PciAddress::new(0, 0x7f, 0x0a, 3)));
        assert_eq!(parse_bdf("0001:ff:1f.7"), Some(PciAddress::new(1, 0xff, 0x1f, 7)));
        assert_eq!(parse_bdf("not-a-bdf"), None);
    }
}
