//! Fault/exception router.
//!
//! Dispatches a trapped CPU exception (page fault, #GP, #UD, software trap)
//! to the right handler, per spec §4.6. Never recurses back into a backend
//! (spec §5's ordering rule) — callers get a [`FaultAction`] back and act on
//! it themselves.

use crate::memory::DosAddr;
use std::collections::HashSet;

/// x86 exception vector numbers the router recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector {
    DivideError,
    Debug,
    Breakpoint,
    Overflow,
    BoundRangeExceeded,
    InvalidOpcode,
    GeneralProtection,
    PageFault,
    Other(u8),
}

/// A V86-mode #GP was decoded down to one of these guest instructions, the
/// set spec §4.6 calls out as requiring emulation rather than delivery back
/// to the guest as a real exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrappedInstruction {
    In { port: u16, width: u8 },
    Out { port: u16, width: u8 },
    Ins { port: u16, width: u8 },
    Outs { port: u16, width: u8 },
    Hlt,
    Int1,
    LockPrefix,
}

/// The raw fault context handed to the router, mirroring the original's
/// `cpuctx_t`/`pm_regs` (trapno/err/cr2 plus the general registers needed
/// to decode a faulting instruction).
#[derive(Debug, Clone, Copy)]
pub struct FaultContext {
    pub vector: Vector,
    pub error_code: u32,
    /// CR2: faulting linear address, valid only for `Vector::PageFault`.
    pub fault_addr: Option<DosAddr>,
    pub cs: u16,
    pub ip: u16,
}

/// What the caller should do in response to a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// The page fault was inside the JIT translation cache's code range;
    /// invalidate cached translations covering this page and retry.
    InvalidateJitPage(DosAddr),
    /// The page fault was inside the VGA window; route it to the VGA
    /// read/write path instead of RAM.
    RouteToVga(DosAddr),
    /// The page fault was inside a DPMI LDT-backed selector's memory;
    /// deliver it to the DPMI subsystem (out of scope here, surfaced so the
    /// embedder can plug in its own handler).
    RouteToDpmiLdt(DosAddr),
    /// A V86 #GP was a trapped instruction the router could classify;
    /// the caller should emulate it and advance IP past it.
    Emulate(TrappedInstruction),
    /// #UD on a `BOUND` instruction outside its valid range: escalate to a
    /// guest-visible #BR, matching the original's BOUND-exceeded handling.
    EscalateToBoundsCheck,
    /// A software trap (INT3, INT1, OVERFLOW) with a debugger or guest
    /// handler attached: deliver as the corresponding guest interrupt.
    DeliverSoftwareTrap(u8),
    /// Nothing recognized this fault; it must become `leavedos`.
    Unhandled,
}

/// Routes faults by vector and context. Stateless: memory-region lookups are
/// parameterized so this module doesn't depend on `AddressSpace` directly
/// (it only needs region *boundaries*, not read/write access).
pub struct FaultRouter {
    vga_start: u32,
    vga_end: u32,
    ldt_start: u32,
    ldt_end: u32,
    /// Page-aligned addresses the JIT backend has cached translations for.
    /// A page fault outside VGA/LDT only becomes `InvalidateJitPage` when
    /// its page is in this set; otherwise it's an ordinary guest fault that
    /// must be delivered to the guest or escalate to `leavedos`.
    code_protected: HashSet<u32>,
}

impl FaultRouter {
    pub fn new(vga_start: u32, vga_end: u32, ldt_start: u32, ldt_end: u32) -> Self {
        Self {
            vga_start,
            vga_end,
            ldt_start,
            ldt_end,
            code_protected: HashSet::new(),
        }
    }

    fn page_of(addr: u32) -> u32 {
        addr & !0xfff
    }

    /// Called by the JIT backend when it caches a translation referencing
    /// `page`, so a later write fault there is recognized as SMC rather
    /// than an ordinary guest page fault.
    pub fn mark_code_protected(&mut self, page: DosAddr) {
        self.code_protected.insert(Self::page_of(page.0));
    }

    /// Called when the JIT backend invalidates its last translation
    /// referencing `page`.
    pub fn clear_code_protected(&mut self, page: DosAddr) {
        self.code_protected.remove(&Self::page_of(page.0));
    }

    pub fn route(&self, ctx: &FaultContext) -> FaultAction {
        match ctx.vector {
            Vector::PageFault => self.route_page_fault(ctx),
            Vector::GeneralProtection => self.route_gp(ctx),
            Vector::InvalidOpcode => FaultAction::EscalateToBoundsCheck,
            Vector::Breakpoint | Vector::Debug | Vector::Overflow => {
                FaultAction::DeliverSoftwareTrap(self.software_trap_vector(ctx.vector))
            }
            _ => FaultAction::Unhandled,
        }
    }

    fn software_trap_vector(&self, vector: Vector) -> u8 {
        match vector {
            Vector::Breakpoint => 0x03,
            Vector::Debug => 0x01,
            Vector::Overflow => 0x04,
            _ => unreachable!("only called for software trap vectors"),
        }
    }

    fn route_page_fault(&self, ctx: &FaultContext) -> FaultAction {
        let addr = match ctx.fault_addr {
            Some(a) => a,
            None => return FaultAction::Unhandled,
        };
        if addr.0 >= self.vga_start && addr.0 < self.vga_end {
            FaultAction::RouteToVga(addr)
        } else if addr.0 >= self.ldt_start && addr.0 < self.ldt_end {
            FaultAction::RouteToDpmiLdt(addr)
        } else if self.code_protected.contains(&Self::page_of(addr.0)) {
            FaultAction::InvalidateJitPage(addr)
        } else {
            FaultAction::Unhandled
        }
    }

    /// Decodes a V86-mode #GP into one of the instruction classes the
    /// monitor must emulate, per spec §4.6. Real decoding requires the
    /// faulting bytes; callers that can't fetch them pass `None` and get
    /// `Unhandled` back rather than a guess.
    fn route_gp(&self, _ctx: &FaultContext) -> FaultAction {
        // Instruction-stream decoding lives with the backend that can read
        // guest memory at CS:IP; the router only classifies once the
        // backend has identified which family the opcode belongs to. See
        // `classify_trapped_instruction`.
        FaultAction::Unhandled
    }

    /// Called by a backend once it has decoded the faulting V86 #GP
    /// instruction bytes, to get the router's classification.
    pub fn classify_trapped_instruction(&self, instr: TrappedInstruction) -> FaultAction {
        match instr {
            TrappedInstruction::LockPrefix => {
                // A LOCK prefix alone just needs to be skipped; treat it as
                // a zero-effect emulation step so the caller advances IP.
                FaultAction::Emulate(instr)
            }
            other => FaultAction::Emulate(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> FaultRouter {
        FaultRouter::new(0xa_0000, 0xc_0000, 0x40_0000, 0x50_0000)
    }

    #[test]
    fn page_fault_in_vga_window_routes_to_vga() {
        let ctx = FaultContext {
            vector: Vector::PageFault,
            error_code: 0,
            fault_addr: Some(DosAddr(0xa_1000)),
            cs: 0,
            ip: 0,
        };
        assert_eq!(router().route(&ctx), FaultAction::RouteToVga(DosAddr(0xa_1000)));
    }

    #[test]
    fn page_fault_on_code_protected_page_invalidates_jit() {
        let mut r = router();
        r.mark_code_protected(DosAddr(0x10_0000));
        let ctx = FaultContext {
            vector: Vector::PageFault,
            error_code: 0,
            fault_addr: Some(DosAddr(0x10_0000)),
            cs: 0,
            ip: 0,
        };
        assert_eq!(
            r.route(&ctx),
            FaultAction::InvalidateJitPage(DosAddr(0x10_0000))
        );
    }

    #[test]
    fn page_fault_on_ordinary_ram_is_unhandled() {
        let ctx = FaultContext {
            vector: Vector::PageFault,
            error_code: 0,
            fault_addr: Some(DosAddr(0x10_0000)),
            cs: 0,
            ip: 0,
        };
        assert_eq!(router().route(&ctx), FaultAction::Unhandled);
    }

    #[test]
    fn clearing_code_protection_reverts_to_unhandled() {
        let mut r = router();
        r.mark_code_protected(DosAddr(0x10_0000));
        r.clear_code_protected(DosAddr(0x10_0000));
        let ctx = FaultContext {
            vector: Vector::PageFault,
            error_code: 0,
            fault_addr: Some(DosAddr(0x10_0000)),
            cs: 0,
            ip: 0,
        };
        assert_eq!(r.route(&ctx), FaultAction::Unhandled);
    }

    #[test]
    fn page_fault_in_ldt_range_routes_to_dpmi() {
        let ctx = FaultContext {
            vector: Vector::PageFault,
            error_code: 0,
            fault_addr: Some(DosAddr(0x45_0000)),
            cs: 0,
            ip: 0,
        };
        assert_eq!(
            router().route(&ctx),
            FaultAction::RouteToDpmiLdt(DosAddr(0x45_0000))
        );
    }

    #[test]
    fn breakpoint_delivers_int3() {
        let ctx = FaultContext {
            vector: Vector::Breakpoint,
            error_code: 0,
            fault_addr: None,
            cs: 0,
            ip: 0,
        };
        assert_eq!(router().route(&ctx), FaultAction::DeliverSoftwareTrap(0x03));
    }

    #[test]
    fn unrecognized_vector_is_unhandled() {
        let ctx = FaultContext {
            vector: Vector::Other(0x09),
            error_code: 0,
            fault_addr: None,
            cs: 0,
            ip: 0,
        };
        assert_eq!(router().route(&ctx), FaultAction::Unhandled);
    }

    #[test]
    fn classify_hlt_is_emulate() {
        assert_eq!(
            router().classify_trapped_instruction(TrappedInstruction::Hlt),
            FaultAction::Emulate(TrappedInstruction::Hlt)
        );
    }
}
