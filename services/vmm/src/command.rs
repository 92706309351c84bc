//! # Management Interface
//!
//! Serializes lifecycle requests from the host driver. Each command holds the
//! controller lock for its whole duration, so two requests never interleave.

use hvlink_loader::{ModuleId, Platform};
use log::trace;
use spin::Mutex;

use crate::{VmmDump, VmmError, VmmManager, VmmStatus};

/// A lifecycle request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// Stage a module file.
    Add(&'a [u8]),
    Load,
    Start,
    Stop,
    Unload,
    Dump,
    Status,
}

impl Command<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Add(_) => "add",
            Command::Load => "load",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Unload => "unload",
            Command::Dump => "dump",
            Command::Status => "status",
        }
    }
}

/// Successful result of a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Done,
    Added(ModuleId),
    Status(VmmStatus),
    Dump(VmmDump),
}

/// Thread-safe front end for a [`VmmManager`].
pub struct VmmService<'a, P: Platform> {
    manager: Mutex<VmmManager<'a, P>>,
}

impl<'a, P: Platform> VmmService<'a, P> {
    pub fn new(manager: VmmManager<'a, P>) -> Self {
        Self {
            manager: Mutex::new(manager),
        }
    }

    pub fn dispatch(&self, command: Command<'a>) -> Result<Response, VmmError> {
        let mut vmm = self.manager.lock();
        trace!("{} requested in state {}", command.name(), vmm.status());

        match command {
            Command::Add(bytes) => vmm.add_module(bytes).map(Response::Added),
            Command::Load => vmm.load_vmm().map(|_| Response::Done),
            Command::Start => vmm.start_vmm().map(|_| Response::Done),
            Command::Stop => vmm.stop_vmm().map(|_| Response::Done),
            Command::Unload => vmm.unload_vmm().map(|_| Response::Done),
            Command::Dump => Ok(Response::Dump(vmm.dump())),
            Command::Status => Ok(Response::Status(vmm.status())),
        }
    }

    /// Like [`VmmService::dispatch`], reduced to the numeric code the driver
    /// returns to its caller: the status code for [`Command::Status`], 0 for
    /// any other success, or the error code.
    pub fn dispatch_code(&self, command: Command<'a>) -> i64 {
        match self.dispatch(command) {
            Ok(Response::Status(status)) => status.code(),
            Ok(_) => 0,
            Err(err) => err.code(),
        }
    }

    /// Tears the runtime down; see [`VmmManager::fini`].
    pub fn fini(&self) -> Result<(), VmmError> {
        self.manager.lock().fini()
    }

    /// Runs `f` with exclusive access to the controller.
    pub fn with<R>(&self, f: impl FnOnce(&mut VmmManager<'a, P>) -> R) -> R {
        f(&mut self.manager.lock())
    }

    pub fn into_inner(self) -> VmmManager<'a, P> {
        self.manager.into_inner()
    }
}
