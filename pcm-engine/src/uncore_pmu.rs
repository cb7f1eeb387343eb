//! Generic uncore-box programming (spec.md §3 `UncorePmu`, §4.4 "Uncore
//! PMUs"): the same freeze/program/unfreeze shape as the core PMU, but
//! driven through `RegisterHandle` so MSR, PCI-config and MMIO boxes
//! share one code path (spec.md §9 "Polymorphism over PMU variants").

use std::sync::Arc;
use std::time::Duration;

use pcm_events::{CounterWidthExtender, EventSelect, UncoreRoleEvents};
use pcm_ral::RegisterHandle;

use crate::error::{EngineError, Result};

/// Illustrative control-register bit layout shared by every uncore box
/// family (exact bits are per-box in real silicon; spec.md §4.4 notes the
/// codes here are illustrative).
const FRZ_EN: u64 = 1 << 16;
const FRZ: u64 = 1 << 8;
const RST_COUNTERS: u64 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UncoreBoxKind {
    Imc,
    Cha,
    M2m,
    M3upi,
    Xpi,
    Pcu,
    Ubox,
    Iio,
}

impl UncoreBoxKind {
    pub fn role_name(self) -> &'static str {
        match self {
            UncoreBoxKind::Imc => "imc",
            UncoreBoxKind::Cha => "cha",
            UncoreBoxKind::M2m => "m2m",
            UncoreBoxKind::M3upi => "xpi",
            UncoreBoxKind::Xpi => "xpi",
            UncoreBoxKind::Pcu => "pcu",
            UncoreBoxKind::Ubox => "ubox",
            UncoreBoxKind::Iio => "iio",
        }
    }
}

/// One uncore box descriptor. `N <= 4` counters; every non-null control
/// has a matching value register at the same index (spec.md §3 invariant).
pub struct UncorePmu {
    pub kind: UncoreBoxKind,
    pub unit_control: Option<RegisterHandle>,
    pub counter_control: Vec<RegisterHandle>,
    pub counter_value: Vec<Arc<RegisterHandle>>,
    pub fixed_control: Option<RegisterHandle>,
    pub fixed_value: Option<RegisterHandle>,
    pub filter: [Option<RegisterHandle>; 2],
    programmed_count: usize,
    /// Set for boxes whose counters are narrower than 64 bits (spec.md
    /// §4.3); `None` per slot means "read the register directly".
    extenders: Vec<Option<CounterWidthExtender>>,
}

impl UncorePmu {
    pub fn new(
        kind: UncoreBoxKind,
        unit_control: Option<RegisterHandle>,
        counter_control: Vec<RegisterHandle>,
        counter_value: Vec<Arc<RegisterHandle>>,
    ) -> Self {
        assert!(counter_control.len() <= 4, "at most 4 counters per box");
        assert_eq!(counter_control.len(), counter_value.len());
        UncorePmu {
            kind,
            unit_control,
            counter_control,
            counter_value,
            fixed_control: None,
            fixed_value: None,
            filter: [None, None],
            programmed_count: 0,
            extenders: Vec::new(),
        }
    }

    /// Wraps every counter-value register in a [`CounterWidthExtender`] so
    /// `sample` returns monotonic 64-bit values for a box whose hardware
    /// counters are narrower (CHA/cbo `TOR_*` counters are 48-bit,
    /// `watchdog_delay` 5555ms in the reference implementation).
    pub fn enable_width_extension(&mut self, width: u32, watchdog_delay: Duration) {
        self.extenders = self
            .counter_value
            .iter()
            .map(|handle| {
                let handle = Arc::clone(handle);
                CounterWidthExtender::spawn(width, watchdog_delay, move || {
                    handle.read64(0).unwrap_or(0)
                })
            })
            .map(Some)
            .collect();
    }

    fn write_unit_control(&self, value: u64) -> Result<()> {
        if let Some(handle) = &self.unit_control {
            handle.write64(0, value)?;
        }
        Ok(())
    }

    /// Programs this box with its role's default event selection, falling
    /// back to the caller-supplied overrides where the default table
    /// leaves a slot unassigned (CHA counters 2/3, spec.md §4.4 table).
    pub fn program_defaults(&mut self, defaults: &UncoreRoleEvents, overrides: &[EventSelect]) -> Result<()> {
        let mut selected: Vec<EventSelect> = Vec::new();
        let mut override_iter = overrides.iter();
        for slot in defaults.counters.iter() {
            match slot {
                Some(select) => selected.push(*select),
                None => {
                    if let Some(o) = override_iter.next() {
                        selected.push(*o);
                    }
                }
            }
        }
        self.program(&selected)?;
        if matches!(self.kind, UncoreBoxKind::Cha) {
            self.enable_width_extension(48, Duration::from_millis(5555));
        }
        Ok(())
    }

    /// Freeze -> reset -> configure -> unfreeze (spec.md §4.4 steps 1-6).
    pub fn program(&mut self, events: &[EventSelect]) -> Result<()> {
        if events.len() > self.counter_control.len() {
            return Err(EngineError::ResourceExhausted {
                requested: events.len(),
                available: self.counter_control.len(),
            });
        }

        self.write_unit_control(FRZ_EN)?;
        self.write_unit_control(FRZ_EN | FRZ)?;

        for (i, event) in events.iter().enumerate() {
            self.counter_control[i].write64(0, event.encode())?;
        }
        for i in events.len()..self.counter_control.len() {
            self.counter_control[i].write64(0, 0)?;
        }

        self.write_unit_control(FRZ_EN | FRZ | RST_COUNTERS)?;
        self.write_unit_control(FRZ_EN)?;

        self.programmed_count = events.len();
        Ok(())
    }

    /// Reads every programmed counter value, treating an all-ones read as
    /// a vacancy/transient-io signal rather than a real count (spec.md §4.1).
    pub fn sample(&self) -> Result<Vec<u64>> {
        let mut values = Vec::with_capacity(self.programmed_count);
        for (i, handle) in self.counter_value.iter().take(self.programmed_count).enumerate() {
            let value = match self.extenders.get(i).and_then(|e| e.as_ref()) {
                Some(extender) => extender.extended(),
                None => {
                    let raw = handle.read64(0)?;
                    if raw == u64::MAX {
                        0
                    } else {
                        raw
                    }
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Freezes the box and zeroes every control register it owns.
    pub fn cleanup(&mut self) -> Result<()> {
        self.write_unit_control(FRZ_EN | FRZ)?;
        for handle in &self.counter_control {
            handle.write64(0, 0)?;
        }
        if let Some(fixed_control) = &self.fixed_control {
            fixed_control.write64(0, 0)?;
        }
        self.write_unit_control(0)?;
        self.programmed_count = 0;
        self.extenders.clear();
        Ok(())
    }
}
