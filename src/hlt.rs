//! HLT trampolines.
//!
//! dosemu2 reserves a small block of real-mode code space consisting of
//! nothing but `HLT` opcodes (2 bytes wide: `HLT; RETF` in the original's
//! `hlt_register_handler`), one per registered handler. Guest code is
//! redirected to `CS:offset` inside this block (via `fake_call`/IVT
//! revectoring); when the backend sees execution land on one of these HLTs
//! it looks up and invokes the Rust handler instead of actually halting.

use crate::error::CoreError;
use crate::memory::{DosAddr, FarPtr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HltError {
    #[error("HLT trampoline block exhausted (max {max} bytes)")]
    BlockExhausted { max: u16 },
    #[error("no HLT handler registered at offset {0:#x}")]
    Unregistered(u16),
}

/// `offs` is `o - start`: the handler's argument, per spec §4.4/§8 scenario
/// 2 — a handler registered with `len=2` sees `offs` 0 and 1 for the two
/// bytes in its range.
pub type HltHandler = Box<dyn FnMut(u16, &mut dyn HltContext) -> Result<(), CoreError> + Send>;

/// What a HLT handler needs from the rest of the core to act (push a fake
/// IRET, read/write registers). Kept as a trait object so `hlt.rs` doesn't
/// depend on `interrupt.rs`'s or the backend's concrete register types.
pub trait HltContext {
    fn fake_iret(&mut self);
    fn fake_retf(&mut self);
}

/// Whether a trampoline offset was reached from V86 mode or protected mode,
/// mirroring the `_vm86`/`_pm` split in `hlt_register_handler_vm86`/`_pm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HltOrigin {
    Vm86,
    Pm,
}

/// One registered `(name, length, callback)` handler occupying `[start,
/// start + len)` bytes of the block.
struct Slot {
    name: &'static str,
    start: u16,
    len: u16,
    handler: HltHandler,
    origin: HltOrigin,
}

/// Registry of HLT trampoline handlers, backed by a fixed-size block of
/// guest address space. Handlers reserve a contiguous byte range rather
/// than a fixed-width slot; dispatch finds the range containing the
/// trapped offset and passes the offset-within-range to the callback.
pub struct HltBlock {
    base: FarPtr,
    capacity: u16,
    slots: Vec<Slot>,
    next_offset: u16,
}

impl HltBlock {
    pub fn new(base: FarPtr, capacity: u16) -> Self {
        Self {
            base,
            capacity,
            slots: Vec::new(),
            next_offset: 0,
        }
    }

    fn register(
        &mut self,
        origin: HltOrigin,
        name: &'static str,
        len: u16,
        handler: HltHandler,
    ) -> Result<FarPtr, HltError> {
        let len = len.max(1);
        if self.next_offset.saturating_add(len) > self.capacity {
            return Err(HltError::BlockExhausted { max: self.capacity });
        }
        let start = self.next_offset;
        self.next_offset += len;
        self.slots.push(Slot {
            name,
            start,
            len,
            handler,
            origin,
        });
        Ok(FarPtr::new(self.base.segment, self.base.offset + start))
    }

    /// `hlt_register_handler_vm86`: reserves `len` (default 1) contiguous
    /// bytes and returns the far pointer to the start of the range.
    pub fn register_vm86(
        &mut self,
        name: &'static str,
        len: u16,
        handler: HltHandler,
    ) -> Result<FarPtr, HltError> {
        self.register(HltOrigin::Vm86, name, len, handler)
    }

    /// `hlt_register_handler_pm`: same, for protected-mode callers.
    pub fn register_pm(
        &mut self,
        name: &'static str,
        len: u16,
        handler: HltHandler,
    ) -> Result<FarPtr, HltError> {
        self.register(HltOrigin::Pm, name, len, handler)
    }

    pub fn base(&self) -> FarPtr {
        self.base
    }

    pub fn linear_range(&self) -> (DosAddr, DosAddr) {
        let start = self.base.to_linear();
        (start, start.offset(self.capacity as u32))
    }

    fn slot_for(&mut self, offset: u16) -> Option<&mut Slot> {
        self.slots
            .iter_mut()
            .find(|s| offset >= s.start && offset < s.start + s.len)
    }

    /// Dispatches a trapped HLT at the given trampoline offset: finds the
    /// handler whose reserved range contains `offset` and invokes it with
    /// `offs = offset - start`. Returns the origin the handler expects so
    /// the caller can validate it matches the mode the trap actually
    /// occurred in (a V86 handler trapped while in protected mode is a
    /// programming error upstream, not a recoverable guest fault).
    pub fn dispatch(
        &mut self,
        offset: u16,
        ctx: &mut dyn HltContext,
    ) -> Result<HltOrigin, HltError> {
        let slot = self.slot_for(offset).ok_or(HltError::Unregistered(offset))?;
        let offs = offset - slot.start;
        let origin = slot.origin;
        (slot.handler)(offs, ctx).map_err(|_| HltError::Unregistered(offset))?;
        Ok(origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct NullCtx;
    impl HltContext for NullCtx {
        fn fake_iret(&mut self) {}
        fn fake_retf(&mut self) {}
    }

    #[test]
    fn single_byte_handlers_are_allocated_contiguously() {
        let mut block = HltBlock::new(FarPtr::new(0xf000, 0), 16);
        let a = block.register_vm86("a", 1, Box::new(|_, _| Ok(()))).unwrap();
        let b = block.register_vm86("b", 1, Box::new(|_, _| Ok(()))).unwrap();
        assert_eq!(b.offset - a.offset, 1);
    }

    #[test]
    fn dispatch_invokes_registered_handler() {
        let mut block = HltBlock::new(FarPtr::new(0xf000, 0), 16);
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let ptr = block
            .register_vm86(
                "counter",
                1,
                Box::new(move |_offs, _| {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        let mut ctx = NullCtx;
        block.dispatch(ptr.offset, &mut ctx).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    /// Spec §8 scenario 2: a handler registered with `len=2` sees `offs` 0
    /// and 1 for the two HLT bytes in its reserved range.
    #[test]
    fn multi_byte_handler_receives_offset_within_its_range() {
        let mut block = HltBlock::new(FarPtr::new(0xf000, 0), 16);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_writer = seen.clone();
        let ptr = block
            .register_vm86(
                "multi",
                2,
                Box::new(move |offs, _| {
                    seen_writer.lock().unwrap().push(offs);
                    Ok(())
                }),
            )
            .unwrap();
        let mut ctx = NullCtx;
        block.dispatch(ptr.offset, &mut ctx).unwrap();
        block.dispatch(ptr.offset + 1, &mut ctx).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn unregistered_offset_errors() {
        let mut block = HltBlock::new(FarPtr::new(0xf000, 0), 16);
        let mut ctx = NullCtx;
        assert_eq!(block.dispatch(4, &mut ctx), Err(HltError::Unregistered(4)));
    }

    #[test]
    fn block_exhaustion_is_reported() {
        let mut block = HltBlock::new(FarPtr::new(0xf000, 0), 4);
        block.register_vm86("a", 1, Box::new(|_, _| Ok(()))).unwrap();
        block.register_vm86("b", 1, Box::new(|_, _| Ok(()))).unwrap();
        block.register_vm86("c", 1, Box::new(|_, _| Ok(()))).unwrap();
        block.register_vm86("d", 1, Box::new(|_, _| Ok(()))).unwrap();
        assert_eq!(
            block.register_vm86("e", 1, Box::new(|_, _| Ok(()))),
            Err(HltError::BlockExhausted { max: 4 })
        );
    }
}
