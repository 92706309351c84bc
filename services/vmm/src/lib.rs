//! # hvlink VMM: Runtime Lifecycle Controller
//!
//! Drives the hypervisor runtime through its lifecycle. Modules are added
//! one by one, linked together on load, and entered through a small set of
//! well-known symbols exported by the runtime.
//!
//! ## States
//!
//! ```text
//!              add_module
//!              ┌───────┐
//!              ▼       │
//!   ┌─────────────────────┐  load_vmm   ┌──────────┐  start_vmm  ┌──────────┐
//!   │      unloaded       │────────────►│  loaded  │────────────►│ running  │
//!   └─────────────────────┘◄────────────└──────────┘◄────────────└──────────┘
//!                            unload_vmm       │         stop_vmm
//!                                             │ teardown failure
//!                                             ▼
//!                                       ┌───────────┐
//!                                       │ corrupted │
//!                                       └───────────┘
//! ```
//!
//! In `corrupted`, module memory may still be in use by code that could not
//! be torn down. It is not released and every request is refused until the
//! host calls [`VmmManager::reset`].
//!
//! ## Entry Points
//!
//! | Symbol       | Scope      | Called by                     |
//! |--------------|------------|-------------------------------|
//! | `local_init` | per module | `start_vmm`, registration order |
//! | `local_fini` | per module | `unload_vmm`, reverse order   |
//! | `start_vmm`  | global     | `start_vmm`                   |
//! | `stop_vmm`   | global     | `stop_vmm`                    |
//! | `add_mdl`    | global     | `load_vmm`, when exported     |
//!
//! Every routine returns 0 on success.

#![no_std]

extern crate alloc;

pub mod command;
pub mod dump;

use core::fmt;
use core::mem::size_of;

use hvlink_loader::{
    ElfError, Machine, MemoryDescriptor, ModuleId, Platform, Registry, SectionInfo,
    ENTRY_SUCCESS, MAX_NUM_MODULES,
};
use log::{debug, error, info, warn};

pub use command::{Command, Response, VmmService};
pub use dump::{ModuleSummary, VmmDump};

// =============================================================================
// STATUS
// =============================================================================

/// Lifecycle state of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmStatus {
    /// No module has been linked. Modules may be added.
    Unloaded,
    /// Modules are linked and their memory handed over, nothing is running.
    Loaded,
    /// `start_vmm` has returned successfully.
    Running,
    /// A teardown step failed. Terminal.
    Corrupted,
}

impl VmmStatus {
    /// Numeric code reported by the management interface.
    pub const fn code(self) -> i64 {
        match self {
            VmmStatus::Unloaded => 10,
            VmmStatus::Loaded => 11,
            VmmStatus::Running => 12,
            VmmStatus::Corrupted => 100,
        }
    }

    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            10 => Some(VmmStatus::Unloaded),
            11 => Some(VmmStatus::Loaded),
            12 => Some(VmmStatus::Running),
            100 => Some(VmmStatus::Corrupted),
            _ => None,
        }
    }
}

impl fmt::Display for VmmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmmStatus::Unloaded => write!(f, "unloaded"),
            VmmStatus::Loaded => write!(f, "loaded"),
            VmmStatus::Running => write!(f, "running"),
            VmmStatus::Corrupted => write!(f, "corrupted"),
        }
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Names of the routines the controller calls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySymbols {
    pub local_init: &'static str,
    pub local_fini: &'static str,
    pub start_vmm: &'static str,
    pub stop_vmm: &'static str,
    pub add_mdl: &'static str,
}

impl Default for EntrySymbols {
    fn default() -> Self {
        Self {
            local_init: "local_init",
            local_fini: "local_fini",
            start_vmm: "start_vmm",
            stop_vmm: "stop_vmm",
            add_mdl: "add_mdl",
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmmConfig {
    /// Maximum modules accepted, at most [`MAX_NUM_MODULES`].
    pub max_modules: usize,
    /// Machine every module must be built for.
    pub machine: Machine,
    /// Granularity of the memory descriptor list. Must be a power of two.
    pub page_size: usize,
    pub symbols: EntrySymbols,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            max_modules: MAX_NUM_MODULES,
            machine: Machine::native(),
            page_size: 0x1000,
            symbols: EntrySymbols::default(),
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Owns the module registry and walks it through the lifecycle.
///
/// File buffers passed to [`VmmManager::add_module`] are borrowed for `'a`;
/// their loaded copies live in memory obtained from `P`.
pub struct VmmManager<'a, P: Platform> {
    platform: P,
    registry: Registry<'a>,
    status: VmmStatus,
    config: VmmConfig,
    /// Leading modules whose `local_init` has run and whose `local_fini` has not.
    initialized: usize,
}

impl<'a, P: Platform> VmmManager<'a, P> {
    pub fn new(platform: P, config: VmmConfig) -> Result<Self, VmmError> {
        if config.max_modules > MAX_NUM_MODULES {
            return Err(VmmError::MaxModulesReached);
        }
        if !config.page_size.is_power_of_two() {
            return Err(ElfError::InvalidArg.into());
        }

        Ok(Self {
            platform,
            registry: Registry::with_capacity(config.max_modules),
            status: VmmStatus::Unloaded,
            config,
            initialized: 0,
        })
    }

    pub fn status(&self) -> VmmStatus {
        self.status
    }

    pub fn config(&self) -> &VmmConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry<'a> {
        &self.registry
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn module_count(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of the controller for diagnostics.
    pub fn dump(&self) -> VmmDump {
        VmmDump::capture(self.status, &self.registry, self.initialized)
    }

    /// Parses `bytes` and stages it for the next [`VmmManager::load_vmm`].
    pub fn add_module(&mut self, bytes: &'a [u8]) -> Result<ModuleId, VmmError> {
        if bytes.is_empty() {
            error!("add_module: empty module");
            return Err(ElfError::InvalidArg.into());
        }

        match self.status {
            VmmStatus::Corrupted => {
                error!("add_module: vmm is corrupted");
                return Err(VmmError::VmmCorrupted);
            }
            VmmStatus::Loaded | VmmStatus::Running => {
                error!("add_module: vmm is {}, unload it first", self.status);
                return Err(VmmError::VmmInvalidState);
            }
            VmmStatus::Unloaded => {}
        }

        let id = self
            .registry
            .load(&mut self.platform, bytes, self.config.machine)
            .map_err(|err| {
                error!("add_module: {}", err);
                VmmError::from(err)
            })?;

        debug!("add_module: module {} staged ({} bytes)", id, bytes.len());
        Ok(id)
    }

    /// Links every staged module and hands module memory to the runtime.
    ///
    /// On failure modules stay staged, so the caller may add what was
    /// missing and try again.
    pub fn load_vmm(&mut self) -> Result<(), VmmError> {
        match self.status {
            VmmStatus::Corrupted => {
                error!("load_vmm: vmm is corrupted");
                return Err(VmmError::VmmCorrupted);
            }
            VmmStatus::Loaded => return Ok(()),
            VmmStatus::Running => {
                error!("load_vmm: vmm is running");
                return Err(VmmError::VmmInvalidState);
            }
            VmmStatus::Unloaded => {}
        }

        if self.registry.is_empty() {
            error!("load_vmm: no modules added");
            return Err(VmmError::NoModulesAdded);
        }

        self.registry.relocate_all().map_err(|err| {
            error!("load_vmm: relocation failed: {}", err);
            VmmError::from(err)
        })?;

        self.add_memory_descriptors()?;

        self.status = VmmStatus::Loaded;
        info!("vmm loaded ({} modules)", self.registry.len());
        Ok(())
    }

    /// Runs each module's `local_init`, then enters the runtime.
    pub fn start_vmm(&mut self) -> Result<(), VmmError> {
        match self.status {
            VmmStatus::Corrupted => {
                error!("start_vmm: vmm is corrupted");
                return Err(VmmError::VmmCorrupted);
            }
            VmmStatus::Running => return Ok(()),
            VmmStatus::Unloaded => {
                error!("start_vmm: vmm is not loaded");
                return Err(VmmError::VmmInvalidState);
            }
            VmmStatus::Loaded => {}
        }

        let local_init = self.config.symbols.local_init;
        while self.initialized < self.registry.len() {
            self.call_module_routine(ModuleId(self.initialized), local_init)?;
            self.initialized += 1;
        }

        let start_vmm = self.config.symbols.start_vmm;
        self.execute(start_vmm)?;

        self.status = VmmStatus::Running;
        info!("vmm started");
        Ok(())
    }

    pub fn stop_vmm(&mut self) -> Result<(), VmmError> {
        match self.status {
            VmmStatus::Corrupted => {
                error!("stop_vmm: vmm is corrupted");
                return Err(VmmError::VmmCorrupted);
            }
            VmmStatus::Loaded => return Ok(()),
            VmmStatus::Unloaded => {
                error!("stop_vmm: vmm is not loaded");
                return Err(VmmError::VmmInvalidState);
            }
            VmmStatus::Running => {}
        }

        let stop_vmm = self.config.symbols.stop_vmm;
        self.execute(stop_vmm)?;

        self.status = VmmStatus::Loaded;
        info!("vmm stopped");
        Ok(())
    }

    /// Runs each initialized module's `local_fini` in reverse order and
    /// releases all module memory.
    ///
    /// A failing `local_fini` leaves the runtime half torn down and marks the
    /// controller corrupted.
    pub fn unload_vmm(&mut self) -> Result<(), VmmError> {
        match self.status {
            VmmStatus::Corrupted => {
                error!("unload_vmm: vmm is corrupted");
                return Err(VmmError::VmmCorrupted);
            }
            VmmStatus::Loaded => {}
            VmmStatus::Unloaded | VmmStatus::Running => {
                error!("unload_vmm: vmm is {}", self.status);
                return Err(VmmError::VmmInvalidState);
            }
        }

        let local_fini = self.config.symbols.local_fini;
        while self.initialized > 0 {
            let id = ModuleId(self.initialized - 1);
            if let Err(err) = self.call_module_routine(id, local_fini) {
                error!("unload_vmm: module {} teardown failed, vmm corrupted", id);
                self.status = VmmStatus::Corrupted;
                return Err(err);
            }
            self.initialized -= 1;
        }

        self.release_modules();
        self.status = VmmStatus::Unloaded;
        info!("vmm unloaded");
        Ok(())
    }

    /// Brings the runtime down from whatever state it is in and frees every
    /// module.
    pub fn fini(&mut self) -> Result<(), VmmError> {
        if self.status == VmmStatus::Running {
            if let Err(err) = self.stop_vmm() {
                warn!("fini: stop_vmm failed: {}", err);
            }
        }

        if self.status == VmmStatus::Loaded {
            if let Err(err) = self.unload_vmm() {
                warn!("fini: unload_vmm failed: {}", err);
            }
        }

        if self.status == VmmStatus::Running {
            error!("fini: vmm could not be stopped, marking corrupted");
            self.status = VmmStatus::Corrupted;
        }

        if self.status == VmmStatus::Corrupted {
            error!("fini: vmm is corrupted, module memory is not released");
            return Err(VmmError::VmmCorrupted);
        }

        if !self.registry.is_empty() {
            debug!("fini: releasing {} staged modules", self.registry.len());
            self.release_modules();
        }

        Ok(())
    }

    /// Drops every module without calling into it.
    ///
    /// This is the only way out of [`VmmStatus::Corrupted`]. The caller
    /// asserts that no module code is still executing, so the memory is
    /// released. Refused while running.
    pub fn reset(&mut self) -> Result<(), VmmError> {
        match self.status {
            VmmStatus::Running => return Err(VmmError::VmmInvalidState),
            VmmStatus::Corrupted => {
                warn!(
                    "reset: clearing corrupted state, releasing {} modules",
                    self.registry.len()
                );
            }
            VmmStatus::Loaded | VmmStatus::Unloaded => {}
        }

        self.release_modules();
        self.status = VmmStatus::Unloaded;
        Ok(())
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn release_modules(&mut self) {
        self.registry.release_all(&mut self.platform);
        self.initialized = 0;
    }

    /// Calls a global routine with no arguments.
    fn execute(&mut self, name: &str) -> Result<(), VmmError> {
        let entry = self.registry.resolve_symbol(name).map_err(|err| {
            error!("unable to locate {}: {}", name, err);
            VmmError::from(err)
        })?;

        self.invoke(name, entry, 0, 0)
    }

    /// Calls a per-module routine with the module's section info, if the
    /// module exports it.
    fn call_module_routine(&mut self, id: ModuleId, name: &str) -> Result<(), VmmError> {
        let entry = match self.registry.resolve_in(id, name) {
            Ok(entry) => entry,
            Err(ElfError::NoSuchSymbol) => {
                debug!("module {} has no {}", id, name);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let info: SectionInfo = self.registry.section_info(id)?;
        self.invoke(name, entry, &info as *const SectionInfo as u64, 0)
    }

    fn invoke(&mut self, name: &str, entry: u64, arg0: u64, arg1: u64) -> Result<(), VmmError> {
        debug!("calling {} at {:#x}", name, entry);

        // SAFETY: `entry` was resolved from a relocated module image.
        let ret = unsafe { self.platform.call(entry, arg0, arg1) };
        if ret != ENTRY_SUCCESS {
            error!("{} failed: {:#x}", name, ret);
            return Err(VmmError::EntryFailed);
        }

        Ok(())
    }

    /// Hands the page list of every module to the runtime's `add_mdl`.
    fn add_memory_descriptors(&mut self) -> Result<(), VmmError> {
        let name = self.config.symbols.add_mdl;
        let entry = match self.registry.resolve_symbol(name) {
            Ok(entry) => entry,
            Err(ElfError::NoSuchSymbol) => {
                debug!("runtime does not export {}", name);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut list = alloc::vec::Vec::new();
        for (_, image) in self.registry.iter() {
            list.extend(image.memory_descriptors(&self.platform, self.config.page_size));
        }
        if list.is_empty() {
            return Ok(());
        }

        let len = list.len() * size_of::<MemoryDescriptor>();
        let buffer = self.platform.alloc_rw(len).ok_or_else(|| {
            error!("{}: unable to allocate {} bytes", name, len);
            VmmError::from(ElfError::OutOfMemory)
        })?;

        // SAFETY: `buffer` holds `len` bytes and does not overlap `list`.
        unsafe {
            core::ptr::copy_nonoverlapping(list.as_ptr() as *const u8, buffer.as_ptr(), len);
        }

        let result = self.invoke(name, entry, buffer.as_ptr() as u64, list.len() as u64);

        // SAFETY: allocated above with the same length; `add_mdl` has returned.
        unsafe { self.platform.free(buffer, len) };

        result
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Lifecycle errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// Loader failure.
    Elf(ElfError),
    /// Configured capacity exceeds [`MAX_NUM_MODULES`].
    MaxModulesReached,
    /// `load_vmm` with nothing staged.
    NoModulesAdded,
    /// Operation not allowed in the current state.
    VmmInvalidState,
    /// The controller is corrupted.
    VmmCorrupted,
    /// A module routine returned non-zero.
    EntryFailed,
}

impl VmmError {
    pub const fn code(self) -> i64 {
        match self {
            VmmError::Elf(err) => err.code(),
            VmmError::MaxModulesReached => -10,
            VmmError::NoModulesAdded => -11,
            VmmError::VmmInvalidState => -12,
            VmmError::VmmCorrupted => -13,
            VmmError::EntryFailed => -14,
        }
    }

    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            -10 => Some(VmmError::MaxModulesReached),
            -11 => Some(VmmError::NoModulesAdded),
            -12 => Some(VmmError::VmmInvalidState),
            -13 => Some(VmmError::VmmCorrupted),
            -14 => Some(VmmError::EntryFailed),
            _ => match ElfError::from_code(code) {
                Some(err) => Some(VmmError::Elf(err)),
                None => None,
            },
        }
    }
}

impl From<ElfError> for VmmError {
    fn from(err: ElfError) -> Self {
        VmmError::Elf(err)
    }
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmmError::Elf(err) => write!(f, "{}", err),
            VmmError::MaxModulesReached => write!(f, "Maximum number of modules reached"),
            VmmError::NoModulesAdded => write!(f, "No modules added"),
            VmmError::VmmInvalidState => write!(f, "Invalid VMM state"),
            VmmError::VmmCorrupted => write!(f, "VMM is corrupted"),
            VmmError::EntryFailed => write!(f, "Module routine failed"),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use hvlink_loader::reloc::r_x86_64::R_X86_64_GLOB_DAT;
    use hvlink_loader::testing::{MockPlatform, ModuleBuilder, TestModule};

    fn config() -> VmmConfig {
        VmmConfig {
            machine: Machine::X86_64,
            ..VmmConfig::default()
        }
    }

    fn manager<'a>() -> VmmManager<'a, MockPlatform> {
        VmmManager::new(MockPlatform::new(), config()).unwrap()
    }

    fn runtime_with(start: i64, stop: i64, fini: i64) -> TestModule {
        ModuleBuilder::new()
            .function("local_init", 0)
            .function("local_fini", fini)
            .function("start_vmm", start)
            .function("stop_vmm", stop)
            .build()
    }

    fn runtime() -> TestModule {
        runtime_with(0, 0, 0)
    }

    fn entry(vmm: &VmmManager<'_, MockPlatform>, name: &str) -> u64 {
        vmm.registry().resolve_symbol(name).unwrap()
    }

    #[test]
    fn test_end_to_end_lifecycle() {
        let module = runtime();
        let mut vmm = manager();
        assert_eq!(vmm.status(), VmmStatus::Unloaded);

        vmm.add_module(&module.bytes).unwrap();
        assert_eq!(vmm.status(), VmmStatus::Unloaded);

        vmm.load_vmm().unwrap();
        assert_eq!(vmm.status(), VmmStatus::Loaded);

        let local_init = entry(&vmm, "local_init");
        let local_fini = entry(&vmm, "local_fini");
        let start = entry(&vmm, "start_vmm");
        let stop = entry(&vmm, "stop_vmm");

        vmm.start_vmm().unwrap();
        assert_eq!(vmm.status(), VmmStatus::Running);
        assert_eq!(vmm.platform().called(), [local_init, start]);
        assert_ne!(vmm.platform().calls[0].arg0, 0);

        vmm.stop_vmm().unwrap();
        assert_eq!(vmm.status(), VmmStatus::Loaded);

        vmm.unload_vmm().unwrap();
        assert_eq!(vmm.status(), VmmStatus::Unloaded);
        assert_eq!(vmm.platform().called(), [local_init, start, stop, local_fini]);
        assert_eq!(vmm.module_count(), 0);
        assert_eq!(vmm.platform().live_allocations, 0);

        assert_eq!(vmm.fini(), Ok(()));
        assert_eq!(vmm.status(), VmmStatus::Unloaded);
    }

    #[test]
    fn test_state_machine_legality() {
        let module = runtime();
        let other = runtime();
        let mut vmm = manager();

        assert_eq!(vmm.start_vmm(), Err(VmmError::VmmInvalidState));
        assert_eq!(vmm.stop_vmm(), Err(VmmError::VmmInvalidState));
        assert_eq!(vmm.unload_vmm(), Err(VmmError::VmmInvalidState));
        assert_eq!(vmm.load_vmm(), Err(VmmError::NoModulesAdded));
        assert_eq!(vmm.status(), VmmStatus::Unloaded);

        vmm.add_module(&module.bytes).unwrap();
        vmm.load_vmm().unwrap();

        assert_eq!(vmm.add_module(&other.bytes), Err(VmmError::VmmInvalidState));
        assert_eq!(vmm.load_vmm(), Ok(()));
        assert_eq!(vmm.stop_vmm(), Ok(()));
        assert_eq!(vmm.status(), VmmStatus::Loaded);

        vmm.start_vmm().unwrap();
        assert_eq!(vmm.start_vmm(), Ok(()));
        assert_eq!(vmm.platform().calls.len(), 2);

        assert_eq!(vmm.add_module(&other.bytes), Err(VmmError::VmmInvalidState));
        assert_eq!(vmm.load_vmm(), Err(VmmError::VmmInvalidState));
        assert_eq!(vmm.unload_vmm(), Err(VmmError::VmmInvalidState));
        assert_eq!(vmm.status(), VmmStatus::Running);

        assert_eq!(vmm.fini(), Ok(()));
        assert_eq!(vmm.platform().live_allocations, 0);
    }

    #[test]
    fn test_add_module_errors() {
        let module = runtime();
        let mut bad = runtime().bytes;
        bad[0] = b'X';
        let mut vmm = manager();

        assert_eq!(vmm.add_module(&[]), Err(VmmError::Elf(ElfError::InvalidArg)));
        assert_eq!(
            vmm.add_module(&bad),
            Err(VmmError::Elf(ElfError::InvalidSignature))
        );

        vmm.add_module(&module.bytes).unwrap();
        assert_eq!(
            vmm.add_module(&module.bytes),
            Err(VmmError::Elf(ElfError::InvalidArg))
        );
        assert_eq!(vmm.module_count(), 1);
        assert_eq!(vmm.platform().live_allocations, 1);

        vmm.fini().unwrap();
        assert_eq!(vmm.platform().live_allocations, 0);
    }

    #[test]
    fn test_capacity_invariant() {
        let modules: Vec<TestModule> = (0..3).map(|_| runtime()).collect();
        let config = VmmConfig {
            max_modules: 2,
            ..config()
        };
        let mut vmm = VmmManager::new(MockPlatform::new(), config).unwrap();

        vmm.add_module(&modules[0].bytes).unwrap();
        vmm.add_module(&modules[1].bytes).unwrap();
        assert_eq!(
            vmm.add_module(&modules[2].bytes),
            Err(VmmError::Elf(ElfError::LoaderFull))
        );
        assert_eq!(vmm.module_count(), 2);
        assert_eq!(vmm.platform().live_allocations, 2);

        vmm.fini().unwrap();
    }

    #[test]
    fn test_invalid_config() {
        let too_many = VmmConfig {
            max_modules: MAX_NUM_MODULES + 1,
            ..config()
        };
        assert_eq!(
            VmmManager::new(MockPlatform::new(), too_many).err(),
            Some(VmmError::MaxModulesReached)
        );

        let bad_page = VmmConfig {
            page_size: 3000,
            ..config()
        };
        assert_eq!(
            VmmManager::new(MockPlatform::new(), bad_page).err(),
            Some(VmmError::Elf(ElfError::InvalidArg))
        );
    }

    #[test]
    fn test_load_failure_keeps_modules_staged() {
        let user = ModuleBuilder::new()
            .function("start_vmm", 0)
            .import("late_symbol")
            .rela(R_X86_64_GLOB_DAT, Some("late_symbol"), 0)
            .build();
        let provider = ModuleBuilder::new().function("late_symbol", 0).build();
        let mut vmm = manager();

        vmm.add_module(&user.bytes).unwrap();
        assert_eq!(vmm.load_vmm(), Err(VmmError::Elf(ElfError::NoSuchSymbol)));
        assert_eq!(vmm.status(), VmmStatus::Unloaded);
        assert_eq!(vmm.module_count(), 1);

        vmm.add_module(&provider.bytes).unwrap();
        vmm.load_vmm().unwrap();
        assert_eq!(vmm.status(), VmmStatus::Loaded);

        let late = entry(&vmm, "late_symbol");
        let slot = vmm
            .registry()
            .image(ModuleId(0))
            .unwrap()
            .read_u64(user.targets[0])
            .unwrap();
        assert_eq!(slot, late);

        vmm.fini().unwrap();
    }

    #[test]
    fn test_start_failure_stays_loaded() {
        let module = runtime_with(-1, 0, 0);
        let mut vmm = manager();

        vmm.add_module(&module.bytes).unwrap();
        vmm.load_vmm().unwrap();

        assert_eq!(vmm.start_vmm(), Err(VmmError::EntryFailed));
        assert_eq!(vmm.status(), VmmStatus::Loaded);

        // local_init already ran, so unloading must still tear the module down.
        let local_fini = entry(&vmm, "local_fini");
        vmm.unload_vmm().unwrap();
        assert_eq!(vmm.platform().called().last(), Some(&local_fini));
        assert_eq!(vmm.status(), VmmStatus::Unloaded);
    }

    #[test]
    fn test_missing_start_symbol() {
        let module = ModuleBuilder::new().function("stop_vmm", 0).build();
        let mut vmm = manager();

        vmm.add_module(&module.bytes).unwrap();
        vmm.load_vmm().unwrap();

        assert_eq!(vmm.start_vmm(), Err(VmmError::Elf(ElfError::NoSuchSymbol)));
        assert_eq!(vmm.status(), VmmStatus::Loaded);
        assert!(vmm.platform().calls.is_empty());

        vmm.fini().unwrap();
    }

    #[test]
    fn test_stop_failure_corrupts_on_fini() {
        let module = runtime_with(0, 1, 0);
        let other = runtime();
        let mut vmm = manager();

        vmm.add_module(&module.bytes).unwrap();
        vmm.load_vmm().unwrap();
        vmm.start_vmm().unwrap();

        assert_eq!(vmm.stop_vmm(), Err(VmmError::EntryFailed));
        assert_eq!(vmm.status(), VmmStatus::Running);

        assert_eq!(vmm.fini(), Err(VmmError::VmmCorrupted));
        assert_eq!(vmm.status(), VmmStatus::Corrupted);
        assert_eq!(vmm.fini(), Err(VmmError::VmmCorrupted));

        assert_eq!(vmm.add_module(&other.bytes), Err(VmmError::VmmCorrupted));
        assert_eq!(vmm.load_vmm(), Err(VmmError::VmmCorrupted));
        assert_eq!(vmm.start_vmm(), Err(VmmError::VmmCorrupted));
        assert_eq!(vmm.stop_vmm(), Err(VmmError::VmmCorrupted));
        assert_eq!(vmm.unload_vmm(), Err(VmmError::VmmCorrupted));

        // Memory that may still be executing is never handed back.
        assert_eq!(vmm.platform().live_allocations, 1);
    }

    #[test]
    fn test_unload_failure_corrupts() {
        let module = runtime_with(0, 0, -5);
        let mut vmm = manager();

        vmm.add_module(&module.bytes).unwrap();
        vmm.load_vmm().unwrap();
        vmm.start_vmm().unwrap();
        vmm.stop_vmm().unwrap();

        assert_eq!(vmm.unload_vmm(), Err(VmmError::EntryFailed));
        assert_eq!(vmm.status(), VmmStatus::Corrupted);
        assert_eq!(vmm.load_vmm(), Err(VmmError::VmmCorrupted));
        assert_eq!(vmm.fini(), Err(VmmError::VmmCorrupted));
    }

    #[test]
    fn test_reset_recovers_from_corrupted() {
        let module = runtime_with(0, 0, -5);
        let other = runtime();
        let mut vmm = manager();

        vmm.add_module(&module.bytes).unwrap();
        vmm.load_vmm().unwrap();
        vmm.start_vmm().unwrap();
        vmm.stop_vmm().unwrap();
        assert_eq!(vmm.unload_vmm(), Err(VmmError::EntryFailed));
        assert_eq!(vmm.status(), VmmStatus::Corrupted);
        assert_eq!(vmm.add_module(&other.bytes), Err(VmmError::VmmCorrupted));

        let calls = vmm.platform().calls.len();
        assert_eq!(vmm.reset(), Ok(()));
        assert_eq!(vmm.status(), VmmStatus::Unloaded);
        assert_eq!(vmm.module_count(), 0);
        assert_eq!(vmm.platform().calls.len(), calls);
        assert_eq!(vmm.platform().live_allocations, 0);

        vmm.add_module(&other.bytes).unwrap();
        vmm.load_vmm().unwrap();
        vmm.start_vmm().unwrap();
        assert_eq!(vmm.status(), VmmStatus::Running);
        assert!(vmm.dump().modules[0].initialized);

        vmm.fini().unwrap();
        assert_eq!(vmm.platform().live_allocations, 0);
    }

    #[test]
    fn test_local_routines_follow_registration_order() {
        let first = runtime();
        let second = ModuleBuilder::new()
            .function("local_init", 0)
            .function("local_fini", 0)
            .build();
        let third = ModuleBuilder::new().function("helper", 0).build();
        let mut vmm = manager();

        vmm.add_module(&first.bytes).unwrap();
        vmm.add_module(&second.bytes).unwrap();
        vmm.add_module(&third.bytes).unwrap();
        vmm.load_vmm().unwrap();

        let init = |vmm: &VmmManager<'_, MockPlatform>, i| {
            vmm.registry().resolve_in(ModuleId(i), "local_init").unwrap()
        };
        let fini = |vmm: &VmmManager<'_, MockPlatform>, i| {
            vmm.registry().resolve_in(ModuleId(i), "local_fini").unwrap()
        };
        let (init0, init1) = (init(&vmm, 0), init(&vmm, 1));
        let (fini0, fini1) = (fini(&vmm, 0), fini(&vmm, 1));
        let start = entry(&vmm, "start_vmm");
        let stop = entry(&vmm, "stop_vmm");

        vmm.start_vmm().unwrap();
        vmm.stop_vmm().unwrap();
        vmm.unload_vmm().unwrap();

        assert_eq!(
            vmm.platform().called(),
            [init0, init1, start, stop, fini1, fini0]
        );
    }

    #[test]
    fn test_add_mdl_receives_every_page() {
        let module = ModuleBuilder::new()
            .function("add_mdl", 0)
            .function("start_vmm", 0)
            .bss(0x3000)
            .build();
        let mut vmm = manager();

        vmm.add_module(&module.bytes).unwrap();
        vmm.load_vmm().unwrap();

        let image = vmm.registry().image(ModuleId(0)).unwrap();
        let pages = image.memory_descriptors(vmm.platform(), 0x1000).len();
        let add_mdl = entry(&vmm, "add_mdl");

        let calls = &vmm.platform().calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].entry, add_mdl);
        assert_eq!(calls[0].arg1, pages as u64);
        assert!(pages >= 4);

        // Only the module region is still allocated.
        assert_eq!(vmm.platform().live_allocations, 1);

        vmm.fini().unwrap();
    }

    #[test]
    fn test_add_mdl_failure_aborts_load() {
        let module = ModuleBuilder::new().function("add_mdl", 2).build();
        let mut vmm = manager();

        vmm.add_module(&module.bytes).unwrap();
        assert_eq!(vmm.load_vmm(), Err(VmmError::EntryFailed));
        assert_eq!(vmm.status(), VmmStatus::Unloaded);
        assert_eq!(vmm.platform().live_allocations, 1);

        vmm.fini().unwrap();
        assert_eq!(vmm.platform().live_allocations, 0);
    }

    #[test]
    fn test_fini_from_running() {
        let module = runtime();
        let mut vmm = manager();

        vmm.add_module(&module.bytes).unwrap();
        vmm.load_vmm().unwrap();
        vmm.start_vmm().unwrap();

        assert_eq!(vmm.fini(), Ok(()));
        assert_eq!(vmm.status(), VmmStatus::Unloaded);
        assert_eq!(vmm.module_count(), 0);
        assert_eq!(vmm.platform().live_allocations, 0);
    }

    #[test]
    fn test_reset() {
        let module = runtime();
        let mut vmm = manager();

        vmm.add_module(&module.bytes).unwrap();
        vmm.load_vmm().unwrap();
        vmm.start_vmm().unwrap();
        assert_eq!(vmm.reset(), Err(VmmError::VmmInvalidState));

        vmm.stop_vmm().unwrap();
        let calls = vmm.platform().calls.len();
        assert_eq!(vmm.reset(), Ok(()));

        assert_eq!(vmm.status(), VmmStatus::Unloaded);
        assert_eq!(vmm.platform().calls.len(), calls);
        assert_eq!(vmm.platform().live_allocations, 0);
    }

    #[test]
    fn test_error_codes() {
        let errors = [
            VmmError::Elf(ElfError::InvalidArg),
            VmmError::Elf(ElfError::OutOfMemory),
            VmmError::MaxModulesReached,
            VmmError::NoModulesAdded,
            VmmError::VmmInvalidState,
            VmmError::VmmCorrupted,
            VmmError::EntryFailed,
        ];

        for err in errors {
            assert_eq!(VmmError::from_code(err.code()), Some(err));
        }

        assert_eq!(VmmError::VmmCorrupted.code(), -13);
        assert_eq!(VmmStatus::Corrupted.code(), 100);
        assert_eq!(VmmStatus::from_code(11), Some(VmmStatus::Loaded));
    }
}
