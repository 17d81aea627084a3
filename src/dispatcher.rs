//! Execution dispatcher: `CoreState` and `loopstep`.
//!
//! `CoreState` is the one place global mutable state lives (spec §9's
//! Design Notes), owning the address space, signal router, coopth
//! scheduler, HLT block, interrupt/fault routers, and the active backend.
//! `loopstep` is the dispatcher's single per-iteration entry point.

use crate::backend::{Backend, YieldReason};
use crate::config::{BackendKind, CoreConfig};
use crate::coopth::Coopth;
use crate::error::{CoreError, ErrorDedup, FatalError};
use crate::fault::{FaultAction, FaultContext, FaultRouter, Vector};
use crate::hlt::HltBlock;
use crate::interrupt::{CpuRegs, InterruptDispatch, RevectorTable};
use crate::memory::{AddressSpace, FarPtr, VgaHandler};
use crate::signal::{CallbackQueue, SignalRouter};
use tracing::{info, warn};

struct NullVga;
impl VgaHandler for NullVga {
    fn vga_read(&mut self, _addr: crate::memory::DosAddr) -> u8 {
        0xff
    }
    fn vga_write(&mut self, _addr: crate::memory::DosAddr, _value: u8) {}
}

/// Owns every piece of global mutable state the execution core needs.
pub struct CoreState {
    pub config: CoreConfig,
    pub memory: AddressSpace,
    pub regs: CpuRegs,
    pub signals: SignalRouter,
    pub callbacks: CallbackQueue,
    pub coopth: Coopth,
    pub hlt: HltBlock,
    pub revector: RevectorTable,
    fault_router: FaultRouter,
    backend: Box<dyn Backend>,
    dedup: ErrorDedup,
    vga: NullVga,
}

impl CoreState {
    pub fn new(config: CoreConfig) -> Result<Self, CoreError> {
        let memory = AddressSpace::new(config.total_mem_size as u32)
            .map_err(|e| FatalError::ResourceExhausted(e.to_string()))?;
        let hlt_base = FarPtr::new((config.hlt_block_base >> 4) as u16, 0);
        let mut signals = SignalRouter::new();
        signals.install_masks();

        let backend = make_backend(config.backend, &config)?;

        Ok(Self {
            regs: CpuRegs::default(),
            hlt: HltBlock::new(hlt_base, 4096),
            fault_router: FaultRouter::new(0xa_0000, 0xc_0000, 0x40_0000, 0x50_0000),
            signals,
            callbacks: CallbackQueue::new(),
            coopth: Coopth::new(),
            revector: RevectorTable::default(),
            backend,
            dedup: ErrorDedup::new(),
            vga: NullVga,
            memory,
            config,
        })
    }

    /// One pass of the dispatcher: drain pending coopth work and signals,
    /// then run the active backend until it yields, acting on the reason.
    pub fn loopstep(&mut self) -> Result<(), CoreError> {
        self.coopth.run_runnable();

        if self.signals.pending() {
            self.signals.handle_signals();
        }
        if self.callbacks.pending() {
            self.callbacks.drain();
        }

        match self.backend.run_until_yield(&mut self.regs) {
            Ok(reason) => self.handle_yield(reason),
            Err(CoreError::Recoverable(e)) => {
                if self.dedup.should_report(&e.to_string()) {
                    warn!(error = %e, "recoverable error in loopstep");
                }
                Ok(())
            }
            Err(CoreError::Fatal(e)) => Err(CoreError::Fatal(e)),
        }
    }

    fn handle_yield(&mut self, reason: YieldReason) -> Result<(), CoreError> {
        match reason {
            YieldReason::Hlt(offset) => self.dispatch_hlt(offset),
            YieldReason::Fault => self.dispatch_fault(),
            YieldReason::Vm86Sti => {
                info!("VME reported a deliverable virtual interrupt after STI/POPF");
                Ok(())
            }
            YieldReason::SignalPending => {
                self.signals.handle_signals();
                Ok(())
            }
            YieldReason::BudgetExhausted => Ok(()),
        }
    }

    fn dispatch_hlt(&mut self, offset: u16) -> Result<(), CoreError> {
        struct Ctx<'a> {
            regs: &'a mut CpuRegs,
            memory: &'a AddressSpace,
            vga: &'a mut dyn VgaHandler,
        }
        impl crate::hlt::HltContext for Ctx<'_> {
            fn fake_iret(&mut self) {
                InterruptDispatch::fake_iret(self.regs, self.memory, self.vga);
            }
            fn fake_retf(&mut self) {
                InterruptDispatch::fake_retf(self.regs, self.memory, self.vga);
            }
        }
        let mut ctx = Ctx {
            regs: &mut self.regs,
            memory: &self.memory,
            vga: &mut self.vga,
        };
        self.hlt
            .dispatch(offset, &mut ctx)
            .map_err(|e| FatalError::Backend(e.to_string()))?;
        self.backend.write_state(&self.regs);
        Ok(())
    }

    fn dispatch_fault(&mut self) -> Result<(), CoreError> {
        // A real backend attaches vector/error_code/fault_addr from its own
        // exit info; this default path treats an unclassified Fault yield
        // as a software interrupt request surfaced via `do_int`, which is
        // the common case for the interpreter/JIT backends' `INT`/`OUT`
        // opcodes.
        let ctx = FaultContext {
            vector: Vector::Other(0),
            error_code: 0,
            fault_addr: None,
            cs: self.regs.cs,
            ip: self.regs.ip,
        };
        match self.fault_router.route(&ctx) {
            FaultAction::Unhandled => {
                info!("fault router found nothing to do; resuming backend as-is");
                Ok(())
            }
            other => {
                info!(?other, "fault routed");
                Ok(())
            }
        }
    }

    /// Runs `do_int` for the given vector against the current register
    /// state, the way a HLT-trampoline-based INT simulation would.
    pub fn run_software_interrupt(&mut self, vector: u8) -> Result<bool, CoreError> {
        let ran = InterruptDispatch::do_int(
            &mut self.regs,
            &self.memory,
            &mut self.revector,
            vector,
            &mut self.vga,
        )
        .map_err(|e| FatalError::Backend(e.to_string()))?;
        self.backend.write_state(&self.regs);
        Ok(ran)
    }

    pub fn leave(&mut self, code: i32) -> CoreError {
        let stuck = self.coopth.flush_vm86();
        if stuck != 0 {
            warn!(
                stuck,
                "vm86 coopth threads still runnable at shutdown; forcing unsafe_shutdown"
            );
            self.unsafe_shutdown();
        } else {
            self.backend.shutdown();
        }
        CoreError::Fatal(FatalError::leave(code))
    }

    /// Last-resort teardown: the backend is torn down regardless of any
    /// coopth thread still mid-flight inside it. Only reached from `leave`
    /// when `flush_vm86` reports stuck vm86 threads; their state is simply
    /// abandoned, since there's nothing left to resume it into.
    fn unsafe_shutdown(&mut self) {
        self.backend.shutdown();
    }
}

fn make_backend(kind: BackendKind, config: &CoreConfig) -> Result<Box<dyn Backend>, CoreError> {
    let mut backend: Box<dyn Backend> = match kind {
        BackendKind::V86 => Box::new(crate::backend::v86::V86Backend::new()),
        BackendKind::Interpreter => {
            let mem = AddressSpace::new(config.total_mem_size as u32)
                .map_err(|e| FatalError::ResourceExhausted(e.to_string()))?;
            Box::new(crate::backend::interpreter::InterpreterBackend::new(mem))
        }
        BackendKind::Jit => {
            let mem = AddressSpace::new(config.total_mem_size as u32)
                .map_err(|e| FatalError::ResourceExhausted(e.to_string()))?;
            Box::new(crate::backend::jit::JitBackend::new(mem))
        }
        #[cfg(target_os = "linux")]
        BackendKind::Kvm => Box::new(crate::backend::kvm::KvmBackend::new()),
        #[cfg(not(target_os = "linux"))]
        BackendKind::Kvm => {
            return Err(FatalError::Backend("KVM backend requires Linux".into()).into())
        }
    };
    backend.setup()?;
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DosAddr;

    fn interpreter_state() -> CoreState {
        let config = CoreConfig {
            backend: BackendKind::Interpreter,
            total_mem_size: 256 * 1024,
            ..Default::default()
        };
        CoreState::new(config).unwrap()
    }

    #[test]
    fn loopstep_runs_hlt_and_returns_ok() {
        let mut state = interpreter_state();
        state.memory.write_slice(DosAddr(0x1000), &[0xf4]).unwrap();
        state.regs.cs = (0x1000 >> 4) as u16;
        state.regs.ip = 0;
        assert!(state.loopstep().is_ok());
    }

    #[test]
    fn loopstep_drains_posted_callbacks() {
        let mut state = interpreter_state();
        state.memory.write_slice(DosAddr(0x1000), &[0xf4]).unwrap();
        state.regs.cs = (0x1000 >> 4) as u16;
        state.regs.ip = 0;
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_writer = ran.clone();
        state.callbacks.post(move || {
            ran_writer.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        state.loopstep().unwrap();
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn leave_produces_fatal_error_with_code() {
        let mut state = interpreter_state();
        let err = state.leave(7);
        assert_eq!(
            err,
            CoreError::Fatal(FatalError::LeaveDos { code: 7 })
        );
    }

    #[test]
    fn software_interrupt_runs_hooked_vector() {
        let mut state = interpreter_state();
        let mut vga = NullVga;
        crate::interrupt::Ivt::write(
            &state.memory,
            0x21,
            FarPtr::new(0x3000, 0x0010),
            &mut vga,
        )
        .unwrap();
        state.memory.write_byte(DosAddr(0x30100), 0x90, &mut vga).unwrap();
        state.regs.cs = 0x1000;
        state.regs.ip = 0x0100;
        state.regs.ss = 0x2000;
        state.regs.sp = 0x0ffe;
        let ran = state.run_software_interrupt(0x21).unwrap();
        assert!(ran);
        assert_eq!(state.regs.cs, 0x3000);
    }
}
