//! Signal-driven async event subsystem.
//!
//! Grounded on `original_source/src/arch/linux/async/signal.c`: a ring of
//! deferred "signal calls" drained by a dedicated coopth thread
//! (`signal_thr`), the `in_handle_signals` reentrancy counter, and the three
//! signal-class masks (`q_mask`, `nonfatal_q_mask`, `fatal_q_mask`) that
//! gate which classes of host signals may interrupt which sections of guest
//! execution.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Matches the original `MAX_SIG_DATA_SIZE`: the inline argument a deferred
/// call can carry without heap allocation.
pub const MAX_SIG_DATA_SIZE: usize = 128;

/// Matches the original ring capacity.
const RING_CAPACITY: usize = 50;

/// Which class of host signal a pending call belongs to, used to decide
/// whether it may run while the dispatcher is inside a fatal/nonfatal
/// section. See spec §5/§6's signal table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    /// SIGSEGV/SIGILL/SIGBUS/SIGFPE-style emergency faults: never masked.
    Emergency,
    /// SIGTERM/SIGHUP-style fatal requests to leave.
    Fatal,
    /// SIGALRM-style periodic ticks.
    Periodic,
    /// SIGIO-style I/O readiness.
    Io,
    /// SIGCHLD.
    Child,
    /// Internal notifier signal used to kick the dispatcher out of a
    /// blocking wait (dosemu2's `SIGTIMER`/internal eventfd equivalent).
    InternalNotifier,
}

/// A deferred call queued by [`SignalRouter::save`], drained later by
/// `handle_signals`. Carries at most `MAX_SIG_DATA_SIZE` bytes inline,
/// exactly like the original's `arg[MAX_SIG_DATA_SIZE]`.
pub struct SavedCall {
    pub class: SignalClass,
    pub name: &'static str,
    len: usize,
    data: [u8; MAX_SIG_DATA_SIZE],
    /// The deferred action itself. Boxed because function pointers alone
    /// can't capture the original signal's payload; `data`/`len` above hold
    /// that payload and are handed to the closure on drain.
    call: Box<dyn FnOnce(&[u8]) + Send>,
}

impl SavedCall {
    fn run(self) {
        (self.call)(&self.data[..self.len]);
    }
}

/// Routes host signals into deferred, coopth-drained calls.
///
/// `in_handle_signals` mirrors the original's static reentrancy counter:
/// `handle_signals` refuses to recurse into itself, and sleep/wake hooks on
/// the drain thread save/restore it across a coopth yield so a nested
/// signal arriving while the thread is asleep doesn't corrupt the count.
pub struct SignalRouter {
    ring: VecDeque<SavedCall>,
    in_handle_signals: u32,
    q_mask: Vec<SignalClass>,
    nonfatal_q_mask: Vec<SignalClass>,
    fatal_q_mask: Vec<SignalClass>,
}

impl Default for SignalRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalRouter {
    pub fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(RING_CAPACITY),
            in_handle_signals: 0,
            q_mask: Vec::new(),
            nonfatal_q_mask: Vec::new(),
            fatal_q_mask: Vec::new(),
        }
    }

    /// Computes the three signal-class masks from the fixed classification
    /// table (spec §6). Called once at startup, matching the original's
    /// one-time `sigprocmask` setup.
    pub fn install_masks(&mut self) {
        self.q_mask = vec![
            SignalClass::Periodic,
            SignalClass::Io,
            SignalClass::Child,
            SignalClass::InternalNotifier,
        ];
        self.nonfatal_q_mask = vec![SignalClass::Periodic, SignalClass::Io, SignalClass::Child];
        self.fatal_q_mask = vec![SignalClass::Fatal];
    }

    pub fn q_mask(&self) -> &[SignalClass] {
        &self.q_mask
    }

    pub fn nonfatal_q_mask(&self) -> &[SignalClass] {
        &self.nonfatal_q_mask
    }

    pub fn fatal_q_mask(&self) -> &[SignalClass] {
        &self.fatal_q_mask
    }

    /// `SIGNAL_save`: queue a deferred call. `data` must fit in
    /// `MAX_SIG_DATA_SIZE` bytes, matching the original's `assert(len <=
    /// MAX_SIG_DATA_SIZE)`.
    pub fn save(
        &mut self,
        class: SignalClass,
        name: &'static str,
        data: &[u8],
        call: impl FnOnce(&[u8]) + Send + 'static,
    ) {
        assert!(
            data.len() <= MAX_SIG_DATA_SIZE,
            "signal payload for {name} exceeds MAX_SIG_DATA_SIZE"
        );
        if self.ring.len() >= RING_CAPACITY {
            warn!(name, "signal ring full, dropping incoming call");
            return;
        }
        let mut buf = [0u8; MAX_SIG_DATA_SIZE];
        buf[..data.len()].copy_from_slice(data);
        self.ring.push_back(SavedCall {
            class,
            name,
            len: data.len(),
            data: buf,
            call: Box::new(call),
        });
    }

    pub fn pending(&self) -> bool {
        !self.ring.is_empty()
    }

    /// Hook installed on the signal-drain coopth thread before it sleeps:
    /// the reentrancy counter must be reset to 0 while the thread is
    /// suspended so a signal delivered during the sleep can re-enter
    /// `handle_signals` from the top.
    pub fn force_enter(&mut self) -> u32 {
        std::mem::replace(&mut self.in_handle_signals, 0)
    }

    /// Paired restore hook run when the drain thread wakes back up.
    pub fn force_leave(&mut self, saved: u32) {
        self.in_handle_signals = saved;
    }

    /// `handle_signals`: drains the ring until empty, refusing to recurse.
    /// Returns the number of calls drained.
    pub fn handle_signals(&mut self) -> usize {
        if self.in_handle_signals != 0 {
            debug!("handle_signals re-entered, deferring to outer call");
            return 0;
        }
        let mut drained = 0;
        while let Some(call) = self.ring.pop_front() {
            self.in_handle_signals += 1;
            debug!(name = call.name, "draining signal call");
            call.run();
            self.in_handle_signals -= 1;
            drained += 1;
        }
        drained
    }
}

/// Periodic worker-thread callback queue: `original_source`'s `cbks` array
/// guarded by `cbk_mtx`, filled by worker threads and drained once per
/// `loopstep` pass alongside the signal ring (`do_periodic_stuff`). Plain
/// `FnMut` closures rather than `SavedCall`'s fixed-size inline payload,
/// since callbacks here are posted from other threads rather than signal
/// handlers and have no async-signal-safety constraint on their argument
/// size.
#[derive(Clone, Default)]
pub struct CallbackQueue {
    inner: Arc<Mutex<VecDeque<Box<dyn FnMut() + Send>>>>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts a callback from any thread; matches the original's
    /// `add_cbk`-under-`cbk_mtx` pattern.
    pub fn post(&self, cbk: impl FnMut() + Send + 'static) {
        self.inner.lock().unwrap().push_back(Box::new(cbk));
    }

    pub fn pending(&self) -> bool {
        !self.inner.lock().unwrap().is_empty()
    }

    /// `do_periodic_stuff`'s callback half: drains and runs every queued
    /// callback, returning how many ran.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        loop {
            let next = self.inner.lock().unwrap().pop_front();
            match next {
                Some(mut cbk) => {
                    cbk();
                    drained += 1;
                }
                None => break,
            }
        }
        drained
    }
}
