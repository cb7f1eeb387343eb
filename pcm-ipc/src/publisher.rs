//! Creates and writes the shared-memory segment (spec.md §4.9, §6).

use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{fence, Ordering};

use memmap2::{MmapMut, MmapOptions};
use pcm_engine::Snapshot;

use crate::error::{IpcError, Result};
use crate::layout::*;

/// Owns the backing file and mapping for the lifetime of the publishing
/// process. SPEC_FULL.md §2: on Linux the segment is a `/dev/shm` file so
/// the `-s <path>` flag can hand its path to an external reader.
pub struct SharedMemoryPublisher {
    path: std::path::PathBuf,
    map: MmapMut,
    poll_ms: u32,
}

impl SharedMemoryPublisher {
    pub fn create(path: impl Into<std::path::PathBuf>, poll_ms: u32) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| IpcError::Create {
                path: path.display().to_string(),
                source,
            })?;
        file.set_len(SEGMENT_SIZE as u64)
            .map_err(|source| IpcError::Create {
                path: path.display().to_string(),
                source,
            })?;

        let map = unsafe { MmapOptions::new().len(SEGMENT_SIZE).map_mut(&file) }
            .map_err(|source| IpcError::Map { source })?;

        let mut publisher = SharedMemoryPublisher { path, map, poll_ms };
        publisher.write_version();
        Ok(publisher)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// `-g <group>` (SPEC_FULL.md §2): restricts the segment to a Unix
    /// group at mode 0660 after creation.
    pub fn set_group_owner(&self, group_name: &str) -> std::io::Result<()> {
        let group_name_c = CString::new(group_name)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "group name contains NUL"))?;
        let group = unsafe { libc::getgrnam(group_name_c.as_ptr()) };
        if group.is_null() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown group '{group_name}'"),
            ));
        }
        let gid = unsafe { (*group).gr_gid };
        let path = CString::new(self.path.as_os_str().to_string_lossy().as_bytes())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let rc = unsafe { libc::chown(path.as_ptr(), u32::MAX, gid) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let rc = unsafe { libc::chmod(path.as_ptr(), 0o660) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn state_ptr(&self) -> *mut SharedPcmState {
        self.map.as_ptr() as *mut SharedPcmState
    }

    fn write_version(&mut self) {
        unsafe {
            std::ptr::addr_of_mut!((*self.state_ptr()).version).write_volatile(*VERSION);
        }
    }

    /// Writes fields in the documented order (spec.md §4.7 step 4):
    /// begin, version, pollMs, pcm.*, timestamp, cyclesToGetPCMState;
    /// `last_update_tsc_end` last, after a release fence so every prior
    /// write is visible before a reader can observe it.
    pub fn publish(&mut self, snapshot: &Snapshot, rdtsc_begin: u64, rdtsc_end: u64) {
        let ptr = self.state_ptr();
        unsafe {
            std::ptr::addr_of_mut!((*ptr).last_update_tsc_begin).write_volatile(rdtsc_begin);
            std::ptr::addr_of_mut!((*ptr).version).write_volatile(*VERSION);
            std::ptr::addr_of_mut!((*ptr).poll_ms).write_volatile(self.poll_ms);

            write_pcm_tree(std::ptr::addr_of_mut!((*ptr).pcm), snapshot);

            std::ptr::addr_of_mut!((*ptr).timestamp).write_volatile(snapshot.timestamp_ns);
            std::ptr::addr_of_mut!((*ptr).cycles_to_get_pcm_state)
                .write_volatile(rdtsc_end.saturating_sub(rdtsc_begin));

            fence(Ordering::Release);
            std::ptr::addr_of_mut!((*ptr).last_update_tsc_end).write_volatile(rdtsc_end);
        }
    }
}

unsafe fn write_pcm_tree(pcm: *mut SharedPcmCounters, snapshot: &Snapshot) {
    let system = &snapshot.system;
    let n_sockets = snapshot.sockets.len();

    let sys_ptr = std::ptr::addr_of_mut!((*pcm).system);
    (*sys_ptr).n_cores = snapshot.threads.len() as u32;
    (*sys_ptr).n_online_cores = snapshot.threads.iter().filter(|t| **t != Default::default()).count() as u32;
    (*sys_ptr).n_sockets = n_sockets as u32;
    (*sys_ptr).n_online_sockets = n_sockets as u32;
    (*sys_ptr).n_links_per_socket = system.xpi_links.iter().map(|l| l.len()).max().unwrap_or(0) as u32;

    let core_ptr = std::ptr::addr_of_mut!((*pcm).core);
    for (thread_idx, thread) in snapshot.threads.iter().enumerate() {
        let Some(slot) = (*core_ptr).cores.get_mut(thread_idx) else {
            break;
        };
        slot.core_id = thread_idx as u32;
        slot.valid = 1;
        slot.instructions_retired = thread.instructions_retired;
        slot.cycles_unhalted = thread.cycles_unhalted;
        slot.cycles_unhalted_ref = thread.cycles_unhalted_ref;
        slot.invariant_tsc = thread.invariant_tsc;
        slot.thermal_headroom = thread.thermal_headroom as u32;
        slot.smi_count = thread.smi_count as u32;
    }

    let mem_ptr = std::ptr::addr_of_mut!((*pcm).memory);
    for (socket_idx, uncore) in snapshot.sockets.iter().enumerate() {
        let Some(slot) = (*mem_ptr).sockets.get_mut(socket_idx) else {
            break;
        };
        slot.dram_reads_bytes = uncore.dram_reads_bytes;
        slot.dram_writes_bytes = uncore.dram_writes_bytes;
        slot.pmem_reads_bytes = uncore.pmem_reads_bytes;
        slot.pmem_writes_bytes = uncore.pmem_writes_bytes;
        for (i, bytes) in uncore.per_channel_bytes.iter().enumerate().take(MEMORY_MAX_IMC_CHANNELS) {
            slot.per_channel_bytes[i] = *bytes;
        }
    }
    (*mem_ptr).system.dram_reads_bytes_total = system.uncore.dram_reads_bytes;
    (*mem_ptr).system.dram_writes_bytes_total = system.uncore.dram_writes_bytes;
    (*mem_ptr).pmm_avail = (system.uncore.pmem_reads_bytes > 0 || system.uncore.pmem_writes_bytes > 0) as u8;

    let qpi_ptr = std::ptr::addr_of_mut!((*pcm).qpi);
    let mut incoming_total = 0u64;
    let mut outgoing_total = 0u64;
    for (socket_idx, links) in system.xpi_links.iter().enumerate() {
        if let Some(in_slot) = (*qpi_ptr).incoming.get_mut(socket_idx) {
            for (i, link) in links.iter().enumerate().take(QPI_MAX_LINKS_PER_SOCKET) {
                in_slot.links[i] = link.incoming_packets;
                incoming_total += link.incoming_packets;
            }
        }
    }
    for (socket_idx, links) in system.xpi_links.iter().enumerate() {
        if let Some(out_slot) = (*qpi_ptr).outgoing.get_mut(socket_idx) {
            for (i, link) in links.iter().enumerate().take(QPI_MAX_LINKS_PER_SOCKET) {
                out_slot.links[i] = link.outgoing_flits;
                outgoing_total += link.outgoing_flits;
            }
        }
    }
    (*qpi_ptr).incoming_total = incoming_total;
    (*qpi_ptr).outgoing_total = outgoing_total;
    (*qpi_ptr).in_avail = (incoming_total > 0) as u8;
    (*qpi_ptr).out_avail = (outgoing_total > 0) as u8;
}

// SAFETY: all access goes through volatile writes via raw pointers, same
// discipline as `pcm_ral::MmioRange`; the OS guarantees the mapping stays
// valid for the file's lifetime.
unsafe impl Send for SharedMemoryPublisher {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_size_is_nonzero_and_stable() {
        assert!(SEGMENT_SIZE > 0);
    }
}
