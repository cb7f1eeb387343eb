use pcm_ral::MsrHandle;

/// One per logical processor. Immutable after construction (spec.md §3).
#[derive(Clone, Debug)]
pub struct TopologyEntry {
    pub os_id: u32,
    /// `-1` (represented as `None`) for an offlined processor.
    pub apic_id: Option<u32>,
    pub socket_id: u32,
    pub core_id: u32,
    pub tile_id: u32,
    pub thread_id: u32,
    pub online: bool,
}

/// Which flavor of uncore this socket exposes. Server parts carry the
/// full mesh (IMC/CHA/M2M/M3UPI/UPI/PCU/Ubox/IIO); client parts expose a
/// reduced set (spec.md §2, SPEC_FULL.md §2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UncoreVariant {
    Server,
    Client,
}

/// A hyperthread node. `msr` is populated lazily (spec.md §3: "created
/// lazily when a PMU is first touched").
pub struct HyperThread {
    pub entry: TopologyEntry,
    pub msr: Option<MsrHandle>,
}

/// A physical core: a vector of hyperthread-arena indices, dense within a
/// socket.
pub struct Core {
    pub core_id: u32,
    pub threads: Vec<u32>,
}

/// A socket: core-arena indices plus the index of its reference core (the
/// lowest online core id in the socket, used for socket-global MSRs).
pub struct Socket {
    pub socket_id: u32,
    pub cores: Vec<u32>,
    pub reference_core_index: u32,
    pub uncore_variant: UncoreVariant,
}

/// The frozen topology tree. Owns all `HyperThread` and `Core` objects in
/// flat arenas; sockets and cores hold indices rather than pointers,
/// breaking the socket-reference-core cycle (spec.md §9 design note).
pub struct SystemRoot {
    pub hyperthreads: Vec<HyperThread>,
    pub cores: Vec<Core>,
    pub sockets: Vec<Socket>,
}

impl SystemRoot {
    pub fn online_thread_count(&self) -> usize {
        self.hyperthreads.iter().filter(|t| t.entry.online).count()
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub fn online_core_count(&self) -> usize {
        self.cores
            .iter()
            .filter(|c| c.threads.iter().any(|&t| self.hyperthreads[t as usize].entry.online))
            .count()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn online_socket_count(&self) -> usize {
        self.sockets
            .iter()
            .filter(|s| {
                s.cores.iter().any(|&c| {
                    self.cores[c as usize]
                        .threads
                        .iter()
                        .any(|&t| self.hyperthreads[t as usize].entry.online)
                })
            })
            .count()
    }

    pub fn reference_core_thread(&self, socket_index: usize) -> Option<u32> {
        let socket = self.sockets.get(socket_index)?;
        let core = self.cores.get(socket.reference_core_index as usize)?;
        core.threads.first().copied()
    }
}
