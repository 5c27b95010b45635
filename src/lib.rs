pub mod assembler;
pub mod disk;
pub mod firmware;
pub mod host;
pub mod isa;
pub mod memory;
pub mod processor;

use host::{Clock, Keyboard, ProgramStore};
use tracing::error;

pub use firmware::Bios;
pub use processor::{Cpu, Fault, State};

/// The machine as the driver sees it: one CPU and the firmware around it.
/// Everything runs at step granularity so the driver owns the pacing.
pub struct Emulator {
    pub cpu: Cpu,
    pub bios: Bios,
}

impl Emulator {
    pub fn new(memory_size: usize, stack_size: usize, bios: Bios) -> Emulator {
        Emulator { cpu: Cpu::new(memory_size, stack_size), bios }
    }

    /// One logical tick: feed the line editor, then, if a guest is running,
    /// advance it one instruction and service whatever interrupt that
    /// instruction raised. An interrupt is always dispatched before the
    /// next step.
    pub fn tick(
        &mut self,
        keyboard: &mut dyn Keyboard,
        clock: &mut dyn Clock,
        store: &dyn ProgramStore,
    ) {
        self.bios.poll_input(keyboard);
        if self.bios.menu_active() || self.bios.program_name().is_none() || !self.cpu.running() {
            return;
        }
        if let Err(fault) = self.cpu.step() {
            error!(%fault, "guest faulted");
        }
        self.bios.handle_interrupt(&mut self.cpu, keyboard, clock, store);
    }
}
