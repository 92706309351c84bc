//! Diagnostic snapshot of the controller and its modules.

use alloc::vec::Vec;
use core::fmt;

use hvlink_loader::{ModuleId, RelaTable, Registry};

use crate::VmmStatus;

/// One registered module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSummary {
    pub id: ModuleId,
    pub region_start: u64,
    pub region_end: u64,
    pub virt_base: u64,
    pub segments: usize,
    pub symbols: usize,
    pub relocations: usize,
    /// `local_init` has run and `local_fini` has not.
    pub initialized: bool,
}

/// Controller state at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmmDump {
    pub status: VmmStatus,
    pub relocated: bool,
    pub capacity: usize,
    pub modules: Vec<ModuleSummary>,
}

impl VmmDump {
    pub(crate) fn capture(status: VmmStatus, registry: &Registry<'_>, initialized: usize) -> Self {
        let modules = registry
            .iter()
            .map(|(id, image)| ModuleSummary {
                id,
                region_start: image.region().start(),
                region_end: image.region().end(),
                virt_base: image.virt_base(),
                segments: image.file().segments().len(),
                symbols: image.symbols().len(),
                relocations: image.rela_count(RelaTable::Dynamic) + image.rela_count(RelaTable::Plt),
                initialized: id.0 < initialized,
            })
            .collect();

        Self {
            status,
            relocated: registry.is_relocated(),
            capacity: registry.capacity(),
            modules,
        }
    }
}

impl fmt::Display for VmmDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "vmm: {} ({})", self.status, self.status.code())?;
        writeln!(
            f,
            "modules: {}/{}{}",
            self.modules.len(),
            self.capacity,
            if self.relocated { ", relocated" } else { "" }
        )?;

        for m in &self.modules {
            writeln!(
                f,
                "  {} [{:#x}, {:#x}) base {:#x} segs {} syms {} relas {}{}",
                m.id,
                m.region_start,
                m.region_end,
                m.virt_base,
                m.segments,
                m.symbols,
                m.relocations,
                if m.initialized { " init" } else { "" }
            )?;
        }

        Ok(())
    }
}
