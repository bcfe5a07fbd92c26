//! Recursion depth accounting.
//!
//! [`Levels`] counts nested script evaluations and nested dispatches; each
//! entry is an RAII [`LevelGuard`] so the counters stay balanced on every
//! exit path, unwinding included.  [`StackBase`] records the native stack
//! position of the outermost evaluation on this thread so that
//! [`stack_used`] can tell how deep the current call is.
//!
//! [`EvalLock`] serializes evaluation chains: one thread at a time owns the
//! interpreter's frames and counters, re-entering freely while it does.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use super::lock;

#[derive(Debug, Default)]
pub struct Levels {
    script: AtomicUsize,
    engine: AtomicUsize,
}

impl Levels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_script(&self) -> LevelGuard<'_> {
        LevelGuard::enter(&self.script)
    }

    pub fn enter_engine(&self) -> LevelGuard<'_> {
        LevelGuard::enter(&self.engine)
    }

    /// Current script nesting depth; 0 when idle.
    pub fn script(&self) -> usize {
        self.script.load(Ordering::Acquire)
    }

    /// Current dispatch nesting depth; 0 when idle.
    pub fn engine(&self) -> usize {
        self.engine.load(Ordering::Acquire)
    }
}

#[must_use = "the level is released when the guard is dropped"]
#[derive(Debug)]
pub struct LevelGuard<'a> {
    counter: &'a AtomicUsize,
    level: usize,
}

impl<'a> LevelGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let level = counter.fetch_add(1, Ordering::AcqRel) + 1;
        LevelGuard { counter, level }
    }

    /// Depth including this entry (1 for the outermost).
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn is_outermost(&self) -> bool {
        self.level == 1
    }
}

impl Drop for LevelGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Evaluation ownership ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// Re-entrant per-interpreter lock held for an outermost evaluation chain.
#[derive(Debug, Default)]
pub struct EvalLock {
    owner: Mutex<Owner>,
    released: Condvar,
}

impl EvalLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other thread owns the interpreter, then take (or
    /// re-enter) ownership.
    pub fn acquire(&self) -> EvalLockGuard<'_> {
        let me = thread::current().id();
        let mut owner = lock(&self.owner);
        while owner.thread.is_some_and(|t| t != me) {
            owner = self.released.wait(owner).unwrap_or_else(PoisonError::into_inner);
        }
        owner.thread = Some(me);
        owner.depth += 1;
        EvalLockGuard { lock: self }
    }

    /// Whether the calling thread currently owns the interpreter.
    pub fn is_held_by_current(&self) -> bool {
        lock(&self.owner).thread == Some(thread::current().id())
    }
}

#[must_use = "ownership is released when the guard is dropped"]
#[derive(Debug)]
pub struct EvalLockGuard<'a> {
    lock: &'a EvalLock,
}

impl Drop for EvalLockGuard<'_> {
    fn drop(&mut self) {
        let mut owner = lock(&self.lock.owner);
        owner.depth = owner.depth.saturating_sub(1);
        if owner.depth == 0 {
            owner.thread = None;
            drop(owner);
            self.lock.released.notify_all();
        }
    }
}

// ── Native stack ──────────────────────────────────────────────────────────────

thread_local! {
    static STACK_BASE: Cell<usize> = const { Cell::new(0) };
}

#[inline(never)]
fn stack_position() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// Marks the stack position of the outermost evaluation on this thread.
#[must_use = "the base is cleared when the guard is dropped"]
#[derive(Debug)]
pub struct StackBase {
    owner: bool,
}

impl StackBase {
    pub fn enter() -> Self {
        let owner = STACK_BASE.with(|base| {
            if base.get() == 0 {
                base.set(stack_position());
                true
            } else {
                false
            }
        });
        StackBase { owner }
    }
}

impl Drop for StackBase {
    fn drop(&mut self) {
        if self.owner {
            STACK_BASE.with(|base| base.set(0));
        }
    }
}

/// Bytes of native stack used since the outermost [`StackBase`], or `None`
/// outside any evaluation.
pub fn stack_used() -> Option<usize> {
    let base = STACK_BASE.with(Cell::get);
    (base != 0).then(|| base.abs_diff(stack_position()))
}

/// Whether the current depth plus `reserve` stays within `limit` bytes.
/// A limit of 0 disables the check.
pub fn check_stack(limit: usize, reserve: usize) -> bool {
    if limit == 0 {
        return true;
    }
    stack_used().map_or(true, |used| used.saturating_add(reserve) <= limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_balance_counters() {
        let levels = Levels::new();
        {
            let outer = levels.enter_script();
            assert!(outer.is_outermost());
            let inner = levels.enter_script();
            assert_eq!(inner.level(), 2);
            assert_eq!(levels.script(), 2);
        }
        assert_eq!(levels.script(), 0);
        assert_eq!(levels.engine(), 0);
    }

    #[test]
    fn guard_released_on_unwind() {
        let levels = Levels::new();
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g = levels.enter_engine();
            panic!("boom");
        }));
        assert!(r.is_err());
        assert_eq!(levels.engine(), 0);
    }

    #[test]
    fn eval_lock_is_reentrant_and_exclusive() {
        use std::sync::Arc;
        use std::time::Duration;

        let shared = Arc::new(EvalLock::new());
        let outer = shared.acquire();
        let inner = shared.acquire();
        assert!(shared.is_held_by_current());

        let other = Arc::clone(&shared);
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = std::thread::spawn(move || {
            let _g = other.acquire();
            tx.send(()).unwrap();
        });
        drop(inner);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "still owned by the outer guard");
        drop(outer);
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        waiter.join().unwrap();
        assert!(!shared.is_held_by_current());
    }

    #[inline(never)]
    fn recurse(n: usize) -> usize {
        let pad = [0u8; 256];
        if n == 0 {
            return stack_used().unwrap_or(0) + std::hint::black_box(pad)[0] as usize;
        }
        recurse(n - 1) + std::hint::black_box(pad)[1] as usize
    }

    #[test]
    fn stack_usage_grows_with_depth() {
        assert_eq!(stack_used(), None);
        let _base = StackBase::enter();
        let shallow = recurse(1);
        let deep = recurse(64);
        assert!(deep > shallow);
        assert!(check_stack(0, 0));
        assert!(!check_stack(1, deep));
    }
}
