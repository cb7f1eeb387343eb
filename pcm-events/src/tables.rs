//! Per-microarchitecture event-description tables. Keyed by CPUID
//! `(family, model)`, matching how the original event lists are indexed.

use crate::descriptor::{EventCounter, EventDescription, EventSelect};
use crate::error::{EventsError, Result};

/// The four general-purpose-counter roles programmed by `DefaultEvents`
/// mode (spec.md §4.4: "L3/L2 cache miss/hit, offcore-response,
/// memory-load-retired events").
pub struct CoreEventTable {
    pub family: u8,
    pub models: &'static [u8],
    pub l2_miss: EventDescription,
    pub l2_hit: EventDescription,
    pub l3_miss: EventDescription,
    pub l3_hit: EventDescription,
}

const fn programmable(bank: u8) -> EventCounter {
    EventCounter::Programmable(bank)
}

/// Skylake-SP / Cascade Lake / Ice Lake server core event codes.
static SKYLAKE_SERVER: CoreEventTable = CoreEventTable {
    family: 0x06,
    models: &[0x55], // Skylake-SP / Cascade Lake-SP / Cooper Lake
    l2_miss: EventDescription::simple(
        "L2_RQSTS.MISS",
        "L2 cache request misses",
        EventSelect::new(0x24, 0x3f),
        programmable(0x0f),
    ),
    l2_hit: EventDescription::simple(
        "L2_RQSTS.REFERENCES",
        "L2 cache requests",
        EventSelect::new(0x24, 0xff),
        programmable(0x0f),
    ),
    l3_miss: EventDescription::simple(
        "LONGEST_LAT_CACHE.MISS",
        "L3 (LLC) misses",
        EventSelect::new(0x2e, 0x41),
        programmable(0x0f),
    ),
    l3_hit: EventDescription::simple(
        "LONGEST_LAT_CACHE.REFERENCE",
        "L3 (LLC) references",
        EventSelect::new(0x2e, 0x4f),
        programmable(0x0f),
    ),
};

/// Broadwell / Haswell-class fallback, close enough for most client parts
/// the discovery code doesn't specifically recognize.
static GENERIC_CORE: CoreEventTable = CoreEventTable {
    family: 0x06,
    models: &[],
    l2_miss: EventDescription::simple(
        "L2_RQSTS.MISS",
        "L2 cache request misses",
        EventSelect::new(0x24, 0x3f),
        programmable(0x0f),
    ),
    l2_hit: EventDescription::simple(
        "L2_RQSTS.REFERENCES",
        "L2 cache requests",
        EventSelect::new(0x24, 0xff),
        programmable(0x0f),
    ),
    l3_miss: EventDescription::simple(
        "LONGEST_LAT_CACHE.MISS",
        "L3 (LLC) misses",
        EventSelect::new(0x2e, 0x41),
        programmable(0x0f),
    ),
    l3_hit: EventDescription::simple(
        "LONGEST_LAT_CACHE.REFERENCE",
        "L3 (LLC) references",
        EventSelect::new(0x2e, 0x4f),
        programmable(0x0f),
    ),
};

static CORE_TABLES: &[&CoreEventTable] = &[&SKYLAKE_SERVER];

/// Looks up the core event table for a `(family, model)` pair, falling
/// back to the generic table for any recognized Intel family rather than
/// failing outright (§4.4 doesn't require exact microarchitecture
/// detection for `DefaultEvents` to work).
pub fn core_table_for(family: u8, model: u8) -> Result<&'static CoreEventTable> {
    if let Some(table) = CORE_TABLES
        .iter()
        .find(|t| t.family == family && t.models.contains(&model))
    {
        return Ok(table);
    }
    if family == 0x06 {
        return Ok(&GENERIC_CORE);
    }
    Err(EventsError::UnknownMicroarchitecture { family, model })
}

/// Default four-counter layouts per uncore box role (spec.md §4.4 table).
/// `(counter0, counter1, counter2, counter3)`; a `None` slot is left to
/// the caller (e.g. "(user)" CHA counters 2/3).
pub struct UncoreRoleEvents {
    pub role: &'static str,
    pub counters: [Option<EventSelect>; 4],
}

pub static IMC_READ_WRITE: UncoreRoleEvents = UncoreRoleEvents {
    role: "imc",
    counters: [
        Some(EventSelect::new(0x04, 0x03)), // CAS_COUNT.RD
        Some(EventSelect::new(0x04, 0x0c)), // CAS_COUNT.WR
        Some(EventSelect::new(0xe3, 0x01)), // PMM_RD_REQS (if present)
        Some(EventSelect::new(0xe7, 0x01)), // PMM_WR_REQS (if present)
    ],
};

pub static M2M_DEFAULT: UncoreRoleEvents = UncoreRoleEvents {
    role: "m2m",
    counters: [
        Some(EventSelect::new(0x37, 0x01)), // TAG_HIT.DRD
        Some(EventSelect::new(0x01, 0x00)), // CLOCKTICKS
        Some(EventSelect::new(0x33, 0x01)), // IMC_READS.TO_PMM
        Some(EventSelect::new(0x34, 0x01)), // IMC_WRITES.TO_PMM
    ],
};

pub static XPI_LINK_DEFAULT: UncoreRoleEvents = UncoreRoleEvents {
    role: "xpi",
    counters: [
        Some(EventSelect::new(0x02, 0x00)), // TxL0_POWER_CYCLES
        Some(EventSelect::new(0x03, 0x0f)), // RxL_FLITS.ALL_DATA
        Some(EventSelect::new(0x02, 0x0f)), // TxL_FLITS.ALL
        Some(EventSelect::new(0x01, 0x00)), // CLOCKTICKS
    ],
};

pub static PCU_POWER_PROFILE_0: UncoreRoleEvents = UncoreRoleEvents {
    role: "pcu",
    counters: [
        Some(EventSelect::new(0x00, 0x00)), // CLOCKTICKS
        Some(EventSelect::new(0x0b, 0x00)), // FREQ_BAND0
        Some(EventSelect::new(0x0c, 0x00)), // FREQ_BAND1
        Some(EventSelect::new(0x0d, 0x00)), // FREQ_BAND2
    ],
};

pub static CHA_LLC_MISS_LATENCY: UncoreRoleEvents = UncoreRoleEvents {
    role: "cha",
    counters: [
        Some(EventSelect::new(0x36, 0x21)), // TOR_OCCUPANCY (IRQ ∩ MISS)
        Some(EventSelect::new(0x35, 0x21)), // TOR_INSERTS (IRQ ∩ MISS)
        None,
        None,
    ],
};

pub fn uncore_role_defaults(role: &str) -> Result<&'static UncoreRoleEvents> {
    match role {
        "imc" => Ok(&IMC_READ_WRITE),
        "m2m" => Ok(&M2M_DEFAULT),
        "xpi" => Ok(&XPI_LINK_DEFAULT),
        "pcu" => Ok(&PCU_POWER_PROFILE_0),
        "cha" => Ok(&CHA_LLC_MISS_LATENCY),
        other => Err(EventsError::NoDefaultForRole(Box::leak(
            other.to_string().into_boxed_str(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skylake_server_model_resolves_exact_table() {
        let table = core_table_for(0x06, 0x55).unwrap();
        assert_eq!(table.l3_miss.select.event_code, 0x2e);
    }

    #[test]
    fn unknown_intel_model_falls_back_to_generic() {
        let table = core_table_for(0x06, 0xff).unwrap();
        assert_eq!(table.l2_miss.select.event_code, 0x24);
    }

    #[test]
    fn non_intel_family_is_unsupported() {
        assert!(core_table_for(0x17, 0x01).is_err());
    }

    #[test]
    fn uncore_roles_cover_the_spec_table() {
        for role in ["imc", "m2m", "xpi", "pcu", "cha"] {
            assert!(uncore_role_defaults(role).is_ok());
        }
        assert!(uncore_role_defaults("nope").is_err());
    }
}
