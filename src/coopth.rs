//! Cooperative thread library ("coopth"), modeled as explicit state machines.
//!
//! The original dosemu2 `coopth` runs each thread on its own stack, switching
//! with `swapcontext`/inline asm. Per the Design Notes' preference for
//! explicit state machines over stackful coroutines, a coopth thread here is
//! a [`CoopthBody`] implementation: a plain `enum` of sleep points whose
//! `resume` method runs until the next yield or completion. There is never
//! more than one coopth thread actually running at a time, matching the
//! original's single-threaded scheduling guarantee.

use std::collections::VecDeque;
use tracing::trace;

/// Identifies a coopth thread, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tid(pub u32);

/// What a thread body did on its last step.
pub enum Step {
    /// The thread is waiting on something external (an event, another
    /// thread, the signal ring) and should not be polled again until
    /// [`Coopth::wake`] is called for it.
    Yielded,
    /// The thread body has run to completion.
    Done,
}

/// A coopth thread body: an explicit state machine rather than a stackful
/// coroutine. `resume` is called once per scheduling pass while the thread
/// is runnable.
pub trait CoopthBody: Send {
    fn resume(&mut self) -> Step;
}

impl CoopthBody for Box<dyn CoopthBody> {
    fn resume(&mut self) -> Step {
        (**self).resume()
    }
}

/// Hooks a thread may install, matching the original's
/// `coopth_set_sleep_handlers`/`coopth_set_permanent_post_handler`.
#[derive(Default)]
pub struct Hooks {
    /// Called just before the thread sleeps (yields control back to the
    /// scheduler without finishing). The signal router's `force_enter` is
    /// installed here for the signal-drain thread.
    pub on_sleep: Option<Box<dyn FnMut() + Send>>,
    /// Called just after the thread is woken. Pairs with `on_sleep`.
    pub on_wake: Option<Box<dyn FnMut() + Send>>,
    /// Runs after every `resume`, sleeping or not (the original's
    /// "permanent post handler", used by the signal thread to decrement
    /// `in_handle_signals`).
    pub on_post: Option<Box<dyn FnMut() + Send>>,
}

enum State {
    Idle(Box<dyn CoopthBody>),
    Running(Box<dyn CoopthBody>),
    Sleeping(Box<dyn CoopthBody>),
    Done,
}

struct Thread {
    name: &'static str,
    state: State,
    hooks: Hooks,
    detached: bool,
}

/// The coopth scheduler: owns every thread descriptor and the run queue.
///
/// Enforces the single invariant the dispatcher depends on: at most one
/// thread is ever mid-`resume` at a time (spec §5's ordering guarantee).
#[derive(Default)]
pub struct Coopth {
    threads: Vec<Thread>,
    runnable: VecDeque<Tid>,
    running: Option<Tid>,
}

impl Coopth {
    pub fn new() -> Self {
        Self::default()
    }

    /// `coopth_create`: register a new thread body, initially idle.
    pub fn create(&mut self, name: &'static str, body: impl CoopthBody + 'static) -> Tid {
        let tid = Tid(self.threads.len() as u32);
        self.threads.push(Thread {
            name,
            state: State::Idle(Box::new(body)),
            hooks: Hooks::default(),
            detached: false,
        });
        tid
    }

    /// `coopth_create_multi`: allocates `n` consecutive trampoline slots
    /// sharing one entry procedure. `make_body(offset)` builds the body for
    /// slot `offset` (`0..n`, i.e. `tid - tid_base`); each slot is an
    /// independent [`Tid`] that can be started/woken on its own. Returns
    /// `(tid_base, offset_array)` where `offset_array[k] == k` identifies
    /// slot `k`'s offset into the group, mirroring the original's
    /// `tid - tid_base` argument passed into the shared entry.
    pub fn create_multi(
        &mut self,
        name: &'static str,
        n: u32,
        make_body: impl Fn(u32) -> Box<dyn CoopthBody>,
    ) -> (Tid, Vec<u16>) {
        let tid_base = Tid(self.threads.len() as u32);
        let mut offsets = Vec::with_capacity(n as usize);
        for offset in 0..n {
            let tid = self.create(name, make_body(offset));
            debug_assert_eq!(tid.0 - tid_base.0, offset);
            offsets.push(offset as u16);
        }
        (tid_base, offsets)
    }

    /// Marks a thread detached: `flush_vm86` does not wait on it. An
    /// orthogonal concept from `create_multi` — most multi-slot threads are
    /// not detached, and single threads can be fire-and-forget too (worker
    /// threads in the original).
    pub fn set_detached(&mut self, tid: Tid, detached: bool) {
        self.threads[tid.0 as usize].detached = detached;
    }

    pub fn set_hooks(&mut self, tid: Tid, hooks: Hooks) {
        self.threads[tid.0 as usize].hooks = hooks;
    }

    /// `coopth_start`: schedule an idle thread to run on the next
    /// `run_tid`/`run_one` pass.
    pub fn start(&mut self, tid: Tid) {
        let t = &self.threads[tid.0 as usize];
        if matches!(t.state, State::Idle(_)) {
            self.runnable.push_back(tid);
        }
    }

    /// Runs one step of the given thread if it is runnable, honoring sleep
    /// and post hooks. Returns `true` if the thread made progress.
    pub fn run_tid(&mut self, tid: Tid) -> bool {
        let idx = tid.0 as usize;
        let mut body = match std::mem::replace(&mut self.threads[idx].state, State::Done) {
            State::Idle(b) | State::Sleeping(b) => b,
            other @ (State::Running(_) | State::Done) => {
                self.threads[idx].state = other;
                return false;
            }
        };

        self.running = Some(tid);
        trace!(thread = self.threads[idx].name, "coopth resume");
        let step = body.resume();
        self.running = None;

        match step {
            Step::Yielded => {
                if let Some(hook) = self.threads[idx].hooks.on_sleep.as_mut() {
                    hook();
                }
                self.threads[idx].state = State::Sleeping(body);
            }
            Step::Done => {
                self.threads[idx].state = State::Done;
            }
        }
        if let Some(hook) = self.threads[idx].hooks.on_post.as_mut() {
            hook();
        }
        true
    }

    /// `coopth_wait`/wake path: marks a sleeping thread runnable again and
    /// runs its wake hook.
    pub fn wake(&mut self, tid: Tid) {
        let idx = tid.0 as usize;
        if let Some(hook) = self.threads[idx].hooks.on_wake.as_mut() {
            hook();
        }
        self.runnable.push_back(tid);
    }

    /// Drains every runnable thread once each, matching the dispatcher's
    /// per-`loopstep` coopth scheduling pass.
    pub fn run_runnable(&mut self) {
        let batch: Vec<Tid> = self.runnable.drain(..).collect();
        for tid in batch {
            self.run_tid(tid);
        }
    }

    pub fn is_done(&self, tid: Tid) -> bool {
        matches!(self.threads[tid.0 as usize].state, State::Done)
    }

    /// `coopth_flush_vm86`: drains whatever is currently runnable, then
    /// reports how many non-detached threads with trampolines in vm86
    /// memory are still not done. A nonzero count means the caller must
    /// proceed to `unsafe_shutdown` rather than assume a clean shutdown,
    /// matching the original — this does not force threads to completion.
    pub fn flush_vm86(&mut self) -> usize {
        self.run_runnable();
        (0..self.threads.len() as u32)
            .map(Tid)
            .filter(|t| !self.threads[t.0 as usize].detached && !self.is_done(*t))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountToThree(u8);
    impl CoopthBody for CountToThree {
        fn resume(&mut self) -> Step {
            self.0 += 1;
            if self.0 < 3 {
                Step::Yielded
            } else {
                Step::Done
            }
        }
    }

    #[test]
    fn thread_runs_to_completion_across_wakes() {
        let mut coopth = Coopth::new();
        let tid = coopth.create("counter", CountToThree(0));
        coopth.start(tid);
        coopth.run_runnable();
        assert!(!coopth.is_done(tid));
        coopth.wake(tid);
        coopth.run_runnable();
        assert!(!coopth.is_done(tid));
        coopth.wake(tid);
        coopth.run_runnable();
        assert!(coopth.is_done(tid));
    }

    #[test]
    fn sleep_and_post_hooks_fire() {
        let mut coopth = Coopth::new();
        let tid = coopth.create("counter", CountToThree(0));
        let sleeps = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let posts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let s = sleeps.clone();
        let p = posts.clone();
        coopth.set_hooks(
            tid,
            Hooks {
                on_sleep: Some(Box::new(move || {
                    s.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })),
                on_wake: None,
                on_post: Some(Box::new(move || {
                    p.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })),
            },
        );
        coopth.start(tid);
        coopth.run_runnable();
        assert_eq!(sleeps.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(posts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_vm86_reports_remaining_runnable_non_detached_threads() {
        let mut coopth = Coopth::new();
        let a = coopth.create("a", CountToThree(0));
        let b = coopth.create("b", CountToThree(0));
        coopth.set_detached(b, true);
        coopth.start(a);
        coopth.start(b);
        // Neither thread finishes in one resume, so both are still
        // runnable; only `a` counts since `b` is detached.
        assert_eq!(coopth.flush_vm86(), 1);
        assert!(!coopth.is_done(a));
        assert!(!coopth.is_done(b));
    }

    #[test]
    fn create_multi_shares_one_entry_across_n_independent_slots() {
        let mut coopth = Coopth::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let (tid_base, offsets) = coopth.create_multi("multi", 3, |offset| {
            let seen = seen.clone();
            struct RecordOffset(u32, std::sync::Arc<std::sync::Mutex<Vec<u32>>>);
            impl CoopthBody for RecordOffset {
                fn resume(&mut self) -> Step {
                    self.1.lock().unwrap().push(self.0);
                    Step::Done
                }
            }
            Box::new(RecordOffset(offset, seen))
        });
        assert_eq!(offsets, vec![0, 1, 2]);
        for offset in &offsets {
            coopth.start(Tid(tid_base.0 + *offset as u32));
        }
        coopth.run_runnable();
        let mut recorded = seen.lock().unwrap().clone();
        recorded.sort();
        assert_eq!(recorded, vec![0, 1, 2]);
    }
}
