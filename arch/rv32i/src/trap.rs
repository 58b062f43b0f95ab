// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Machine-mode trap dispatch.
//!
//! Every synchronous exception and interrupt taken in machine mode ends up in
//! [`FaultDispatcher::handle_trap`]. Causes with a registered handler (by
//! default the load and store access faults raised by PMP violations) are
//! handled by skipping the faulting instruction: `mepc` is advanced by the
//! instruction's length so `mret` resumes after it. Any other cause is fatal.
//!
//! The dispatcher runs with interrupts disabled (the hart clears `MIE` on trap
//! entry). It does not allocate or block, and it reads only the faulting
//! instruction's first parcel, from memory that just executed.

use core::cell::Cell;
use core::fmt;

use isokernel::config;
use isokernel::debug;
use isokernel::hil::led::Led;
use isokernel::platform::chip::InterruptControl;
use isokernel::ErrorCode;

use crate::csr::{mcause, LocalRegisterCopy, CSR};

/// Number of exception codes with a handler slot. Codes 0 to 15 cover every
/// standard exception.
const HANDLER_SLOTS: usize = 16;

/// Synchronous exception causes, as reported in `mcause`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Exception {
    InstructionMisaligned,
    InstructionFault,
    IllegalInstruction,
    Breakpoint,
    LoadMisaligned,
    LoadFault,
    StoreMisaligned,
    StoreFault,
    UserEnvCall,
    SupervisorEnvCall,
    MachineEnvCall,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
    Unknown(usize),
}

impl Exception {
    pub fn from_code(code: usize) -> Exception {
        match code {
            0 => Exception::InstructionMisaligned,
            1 => Exception::InstructionFault,
            2 => Exception::IllegalInstruction,
            3 => Exception::Breakpoint,
            4 => Exception::LoadMisaligned,
            5 => Exception::LoadFault,
            6 => Exception::StoreMisaligned,
            7 => Exception::StoreFault,
            8 => Exception::UserEnvCall,
            9 => Exception::SupervisorEnvCall,
            11 => Exception::MachineEnvCall,
            12 => Exception::InstructionPageFault,
            13 => Exception::LoadPageFault,
            15 => Exception::StorePageFault,
            _ => Exception::Unknown(code),
        }
    }

    pub const fn code(&self) -> usize {
        match self {
            Exception::InstructionMisaligned => 0,
            Exception::InstructionFault => 1,
            Exception::IllegalInstruction => 2,
            Exception::Breakpoint => 3,
            Exception::LoadMisaligned => 4,
            Exception::LoadFault => 5,
            Exception::StoreMisaligned => 6,
            Exception::StoreFault => 7,
            Exception::UserEnvCall => 8,
            Exception::SupervisorEnvCall => 9,
            Exception::MachineEnvCall => 11,
            Exception::InstructionPageFault => 12,
            Exception::LoadPageFault => 13,
            Exception::StorePageFault => 15,
            Exception::Unknown(code) => *code,
        }
    }

    /// Whether execution can continue after the instruction at `mepc`.
    ///
    /// Instruction fetch faults report the address that could not be fetched
    /// in `mepc`: there is no instruction there whose length could be skipped.
    pub fn can_resume(&self) -> bool {
        !matches!(
            self,
            Exception::InstructionMisaligned
                | Exception::InstructionFault
                | Exception::InstructionPageFault
                | Exception::Unknown(_)
        )
    }
}

/// A decoded `mcause` value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trap {
    Interrupt(usize),
    Exception(Exception),
}

impl From<LocalRegisterCopy<usize, mcause::Register>> for Trap {
    fn from(cause: LocalRegisterCopy<usize, mcause::Register>) -> Trap {
        let reason = cause.read(mcause::reason);
        if cause.is_set(mcause::is_interrupt) {
            Trap::Interrupt(reason)
        } else {
            Trap::Exception(Exception::from_code(reason))
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::Interrupt(code) => write!(f, "interrupt {}", code),
            Trap::Exception(e) => write!(f, "exception {:?} (mcause {})", e, e.code()),
        }
    }
}

/// Length in bytes of the instruction whose first 16-bit parcel is `parcel`.
///
/// Follows the base ISA's variable-length encoding: compressed (16-bit),
/// 32-bit, 48-bit and 64-bit instructions. Longer or reserved encodings
/// return `None`.
pub fn instruction_length(parcel: u16) -> Option<usize> {
    if parcel & 0b11 != 0b11 {
        Some(2)
    } else if parcel & 0b1_1100 != 0b1_1100 {
        Some(4)
    } else if parcel & 0b11_1111 == 0b01_1111 {
        Some(6)
    } else if parcel & 0b111_1111 == 0b011_1111 {
        Some(8)
    } else {
        None
    }
}

/// What the dispatcher knows about one handled fault. Lives on the trap
/// stack for the duration of the handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FaultRecord {
    pub cause: Exception,
    pub faulting_pc: usize,
    pub instruction_length: usize,
    /// `mtval`: the faulting data address for access faults.
    pub trap_value: usize,
}

/// Hart state visible to the trap handler.
pub trait TrapContext {
    fn mcause(&self) -> LocalRegisterCopy<usize, mcause::Register>;
    fn mepc(&self) -> usize;
    fn set_mepc(&self, pc: usize);
    fn mtval(&self) -> usize;

    /// The first 16 bits of the instruction at `pc`.
    fn instruction_parcel(&self, pc: usize) -> u16;
}

/// The trap CSRs and memory of the current hart.
pub struct MachineTrapContext(());

impl MachineTrapContext {
    /// # Safety
    ///
    /// Must only be used from the machine-mode trap handler, while `mepc`
    /// still points at the trapping instruction.
    pub unsafe fn new() -> Self {
        MachineTrapContext(())
    }
}

impl TrapContext for MachineTrapContext {
    fn mcause(&self) -> LocalRegisterCopy<usize, mcause::Register> {
        CSR.mcause()
    }

    fn mepc(&self) -> usize {
        CSR.mepc()
    }

    fn set_mepc(&self, pc: usize) {
        CSR.set_mepc(pc)
    }

    fn mtval(&self) -> usize {
        CSR.mtval()
    }

    #[cfg(all(target_arch = "riscv32", target_os = "none"))]
    fn instruction_parcel(&self, pc: usize) -> u16 {
        // Instructions are at least 2-byte aligned, and the instruction at
        // `mepc` was just issued, so its first parcel is readable.
        unsafe { core::ptr::read_volatile(pc as *const u16) }
    }

    // Host builds, where there is no trapping hart to read from.
    #[cfg(not(all(target_arch = "riscv32", target_os = "none")))]
    fn instruction_parcel(&self, _pc: usize) -> u16 {
        unimplemented!()
    }
}

/// Dispatcher state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    /// Waiting for a trap.
    Armed,
    /// Running a handler.
    Handling,
    /// An unhandled trap was taken. Terminal.
    Fatal,
}

/// Why a trap could not be handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FatalCause {
    /// No handler is registered for the cause.
    Unhandled(Trap),
    /// The instruction at `pc` has a reserved or unsupported length encoding.
    UndecodableInstruction { pc: usize },
    /// A trap was taken while the dispatcher was handling a trap or after it
    /// went fatal.
    Reentered(Trap),
}

impl fmt::Display for FatalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalCause::Unhandled(trap) => write!(f, "unhandled {}", trap),
            FatalCause::UndecodableInstruction { pc } => {
                write!(f, "undecodable instruction at {:#010X}", pc)
            }
            FatalCause::Reentered(trap) => write!(f, "{} taken inside the trap handler", trap),
        }
    }
}

/// Outcome of dispatching one trap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// `mepc` now points after the faulting instruction; `mret` may resume.
    Resume,
    /// The trap can not be handled.
    Fatal(FatalCause),
}

/// Cause-specific action run after the faulting instruction has been
/// skipped. Runs in trap context: must not block or fault.
pub type FaultHook = fn(&FaultRecord);

fn log_access_fault(record: &FaultRecord) {
    if config::CONFIG.trace_faults {
        log::warn!(
            "{:?} at pc {:#010X}, address {:#010X}, skipped {} bytes",
            record.cause,
            record.faulting_pc,
            record.trap_value,
            record.instruction_length
        );
    }
}

/// Board routine signalling the fatal state, e.g. blinking the board's LEDs
/// through [`debug::fatal`]. Called with interrupts masked.
pub type FatalHandler = fn(&FatalCause) -> !;

const NO_HOOK: Cell<Option<FaultHook>> = Cell::new(None);
const ZERO: Cell<u32> = Cell::new(0);

pub struct FaultDispatcher {
    state: Cell<DispatcherState>,
    handlers: [Cell<Option<FaultHook>>; HANDLER_SLOTS],
    counts: [Cell<u32>; HANDLER_SLOTS],
    fatal_handler: Cell<Option<FatalHandler>>,
}

// The isolation core runs on a single hart. The cells are only written from
// the machine-mode trap handler, which runs with interrupts masked, and at
// boot before the trap vector is installed.
unsafe impl Sync for FaultDispatcher {}

impl FaultDispatcher {
    /// A dispatcher with no registered causes: every trap is fatal.
    pub const fn new() -> FaultDispatcher {
        FaultDispatcher {
            state: Cell::new(DispatcherState::Armed),
            handlers: [NO_HOOK; HANDLER_SLOTS],
            counts: [ZERO; HANDLER_SLOTS],
            fatal_handler: Cell::new(None),
        }
    }

    /// A dispatcher that skips load and store access faults.
    pub const fn with_access_fault_handlers() -> FaultDispatcher {
        let mut handlers = [NO_HOOK; HANDLER_SLOTS];
        handlers[Exception::LoadFault.code()] = Cell::new(Some(log_access_fault as FaultHook));
        handlers[Exception::StoreFault.code()] = Cell::new(Some(log_access_fault as FaultHook));
        FaultDispatcher {
            state: Cell::new(DispatcherState::Armed),
            handlers,
            counts: [ZERO; HANDLER_SLOTS],
            fatal_handler: Cell::new(None),
        }
    }

    /// Handle `cause` by skipping the faulting instruction and calling `hook`.
    ///
    /// Returns `Err(ErrorCode::NOSUPPORT)` for causes after which execution
    /// can not resume at the next instruction.
    pub fn register(&self, cause: Exception, hook: FaultHook) -> Result<(), ErrorCode> {
        if !cause.can_resume() || cause.code() >= HANDLER_SLOTS {
            return Err(ErrorCode::NOSUPPORT);
        }
        self.handlers[cause.code()].set(Some(hook));
        Ok(())
    }

    /// Route fatal traps taken through `_start_trap_rust_from_kernel` to `handler`.
    /// Without one, the fatal loop runs without an indicator.
    pub fn set_fatal_handler(&self, handler: FatalHandler) {
        self.fatal_handler.set(Some(handler));
    }

    pub fn state(&self) -> DispatcherState {
        self.state.get()
    }

    /// Number of handled faults with the given cause.
    pub fn fault_count(&self, cause: Exception) -> u32 {
        self.counts
            .get(cause.code())
            .map_or(0, |count| count.get())
    }

    /// Dispatch the trap described by `ctx`.
    ///
    /// On [`Disposition::Resume`] `mepc` has been advanced past the faulting
    /// instruction. On [`Disposition::Fatal`] `mepc` is untouched and the
    /// dispatcher stays fatal.
    pub fn dispatch<T: TrapContext + ?Sized>(&self, ctx: &T) -> Disposition {
        let trap = Trap::from(ctx.mcause());
        if self.state.get() != DispatcherState::Armed {
            return self.go_fatal(FatalCause::Reentered(trap));
        }

        let (cause, hook) = match trap {
            Trap::Exception(e) => match self.handlers.get(e.code()).and_then(Cell::get) {
                Some(hook) => (e, hook),
                None => return self.go_fatal(FatalCause::Unhandled(trap)),
            },
            Trap::Interrupt(_) => return self.go_fatal(FatalCause::Unhandled(trap)),
        };

        self.state.set(DispatcherState::Handling);

        let pc = ctx.mepc();
        let Some(length) = instruction_length(ctx.instruction_parcel(pc)) else {
            return self.go_fatal(FatalCause::UndecodableInstruction { pc });
        };
        let record = FaultRecord {
            cause,
            faulting_pc: pc,
            instruction_length: length,
            trap_value: ctx.mtval(),
        };

        let count = &self.counts[cause.code()];
        count.set(count.get().saturating_add(1));
        hook(&record);

        ctx.set_mepc(pc.wrapping_add(length));
        self.state.set(DispatcherState::Armed);
        Disposition::Resume
    }

    fn go_fatal(&self, cause: FatalCause) -> Disposition {
        self.state.set(DispatcherState::Fatal);
        Disposition::Fatal(cause)
    }

    /// The fault entry point: dispatch the trap and, if it can not be
    /// handled, halt in the fatal diagnostic loop.
    pub fn handle_trap<T: TrapContext + ?Sized, C: InterruptControl + ?Sized>(
        &self,
        ctx: &T,
        chip: &C,
        leds: &mut [&mut dyn Led],
    ) {
        if let Disposition::Fatal(cause) = self.dispatch(ctx) {
            debug::fatal(chip, leds, format_args!("{}", cause));
        }
    }

    /// Like [`FaultDispatcher::handle_trap`], but fatal traps go to the
    /// handler installed with [`FaultDispatcher::set_fatal_handler`].
    pub fn handle_machine_trap<T: TrapContext + ?Sized, C: InterruptControl + ?Sized>(
        &self,
        ctx: &T,
        chip: &C,
    ) {
        if let Disposition::Fatal(cause) = self.dispatch(ctx) {
            match self.fatal_handler.get() {
                Some(handler) => {
                    chip.disable_interrupts();
                    handler(&cause)
                }
                None => debug::fatal(chip, &mut [], format_args!("{}", cause)),
            }
        }
    }
}

impl Default for FaultDispatcher {
    fn default() -> Self {
        Self::with_access_fault_handlers()
    }
}

/// The dispatcher behind `_start_trap_rust_from_kernel`. Boards register additional
/// causes and their fatal handler on it before enabling traps.
pub static TRAP_DISPATCHER: FaultDispatcher = FaultDispatcher::with_access_fault_handlers();

/// Rust half of the machine-mode trap vector.
///
/// The board's assembly vector saves the caller-saved registers, calls this
/// function and returns with `mret`.
#[cfg(all(target_arch = "riscv32", target_os = "none"))]
#[export_name = "_start_trap_rust_from_kernel"]
pub extern "C" fn start_trap_rust() {
    // This is the trap handler, and `mepc` has not been changed yet.
    let ctx = unsafe { MachineTrapContext::new() };
    TRAP_DISPATCHER.handle_machine_trap(&ctx, &crate::support::MachineInterrupts);
}
