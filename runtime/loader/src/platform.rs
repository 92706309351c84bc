//! # Platform Boundary
//!
//! The loader never allocates executable memory or calls into a module on its
//! own. Everything that touches the host goes through [`Platform`], which the
//! driver layer implements for its kernel and tests implement with heap memory.

use core::ptr::NonNull;

use bitflags::bitflags;

/// Value returned by a module routine that completed successfully.
pub const ENTRY_SUCCESS: i64 = 0;

/// Host services required by the loader and the lifecycle controller.
pub trait Platform {
    /// Allocates `len` bytes of read-write memory.
    fn alloc_rw(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Allocates `len` bytes of read-write-execute memory.
    fn alloc_rwe(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Releases memory obtained from [`Platform::alloc_rw`] or
    /// [`Platform::alloc_rwe`].
    ///
    /// # Safety
    ///
    /// `addr` and `len` must describe a live allocation returned by this
    /// platform, and nothing may access it afterwards.
    unsafe fn free(&mut self, addr: NonNull<u8>, len: usize);

    /// Translates a virtual address to the physical address backing it.
    fn virt_to_phys(&self, virt: u64) -> u64;

    /// Calls a module routine.
    ///
    /// # Safety
    ///
    /// `entry` must be the address of a routine with the
    /// `extern "C" fn(u64, u64) -> i64` signature inside a relocated image.
    unsafe fn call(&mut self, entry: u64, arg0: u64, arg1: u64) -> i64 {
        let routine: extern "C" fn(u64, u64) -> i64 = core::mem::transmute(entry as usize);
        routine(arg0, arg1)
    }
}

bitflags! {
    /// Access type of one page handed to the runtime's memory manager.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryType: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// One page of module memory as seen by the runtime's memory manager.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDescriptor {
    /// Virtual address of the page.
    pub virt: u64,
    /// Physical address backing the page.
    pub phys: u64,
    /// Raw [`MemoryType`] bits.
    pub mem_type: u64,
}

impl MemoryDescriptor {
    pub fn new(virt: u64, phys: u64, mem_type: MemoryType) -> Self {
        Self {
            virt,
            phys,
            mem_type: mem_type.bits(),
        }
    }

    pub fn memory_type(&self) -> MemoryType {
        MemoryType::from_bits_truncate(self.mem_type)
    }
}
