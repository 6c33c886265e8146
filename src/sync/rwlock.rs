use crate::runtime::{current_runtime, Runtime, TaskId};
use parking_lot::{Condvar, Mutex};
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the lock operations.
///
/// Both variants are synchronous: they are returned before the calling task
/// ever parks, and they leave the lock state untouched.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The calling task holds the lock in shared mode and requested
    /// exclusive access.
    ///
    /// An upgrade would have to drain the remaining readers atomically,
    /// which a second upgrading task turns into a deadlock, so the request
    /// is rejected instead of queued.
    #[error("cannot upgrade a shared hold to an exclusive hold")]
    UpgradeForbidden,
    /// The calling task holds no hold on the lock.
    #[error("the current task does not hold the lock")]
    NotHeld,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

/// The lock's decision core.
///
/// `mode_count` positive means shared with that many holds, negative means
/// exclusive with `-mode_count` holds, zero means idle. `owners` records one
/// `(task, mode)` entry per unreleased hold; `mode_count.unsigned_abs()`
/// always equals `owners.len()`. All methods expect the caller to hold the
/// state mutex.
struct LockState {
    mode_count: isize,
    pending_writers: usize,
    owners: Vec<(TaskId, Mode)>,
}

impl LockState {
    fn new() -> Self {
        Self {
            mode_count: 0,
            pending_writers: 0,
            owners: Vec::new(),
        }
    }

    fn owns(&self, task: TaskId) -> bool {
        self.owners.iter().any(|&(owner, _)| owner == task)
    }

    /// Shared grant decision. Returns whether the hold was granted; a `false`
    /// result means the task must park and retry after the next wake.
    fn try_acquire_shared(&mut self, task: TaskId) -> bool {
        if self.mode_count < 0 {
            // Exclusive mode. Only the owning task may enter, and its
            // request is satisfied as an additional exclusive hold.
            if self.owns(task) {
                self.mode_count -= 1;
                self.owners.push((task, Mode::Exclusive));
                return true;
            }
            return false;
        }

        // Writer preference: a fresh reader waits while writers are queued.
        // A task already holding a shared lock recurses regardless, as
        // making it queue behind the writer would deadlock both.
        if self.pending_writers == 0 || self.owns(task) {
            self.mode_count += 1;
            self.owners.push((task, Mode::Shared));
            return true;
        }
        false
    }

    /// Exclusive grant decision. `Ok(false)` means the task must park.
    fn try_acquire_exclusive(&mut self, task: TaskId) -> Result<bool, LockError> {
        if self.mode_count == 0 || (self.mode_count < 0 && self.owns(task)) {
            self.mode_count -= 1;
            self.owners.push((task, Mode::Exclusive));
            return Ok(true);
        }
        if self.mode_count > 0 && self.owns(task) {
            return Err(LockError::UpgradeForbidden);
        }
        Ok(false)
    }

    /// Removes one hold by `task`, in the mode implied by the sign of
    /// `mode_count`. Returns whether the lock became idle.
    fn release(&mut self, task: TaskId) -> Result<bool, LockError> {
        let mode = if self.mode_count > 0 {
            Mode::Shared
        } else {
            Mode::Exclusive
        };
        let index = self
            .owners
            .iter()
            .position(|&owner| owner == (task, mode))
            .ok_or(LockError::NotHeld)?;
        self.owners.swap_remove(index);

        if self.mode_count > 0 {
            self.mode_count -= 1;
        } else {
            self.mode_count += 1;
        }
        Ok(self.mode_count == 0)
    }
}

/// Coordination state shared by both handles.
struct RwLockCore {
    runtime: Runtime,
    state: Mutex<LockState>,
    cond: Condvar,
}

impl RwLockCore {
    fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            state: Mutex::new(LockState::new()),
            cond: Condvar::new(),
        }
    }

    fn current_task(&self) -> TaskId {
        self.runtime
            .current_task()
            .expect("lock operations must be called from a task of the owning runtime")
    }

    fn acquire_shared(&self) {
        let me = self.current_task();
        let mut state = self.state.lock();
        while !state.try_acquire_shared(me) {
            self.cond.wait(&mut state);
        }
    }

    fn acquire_exclusive(&self) -> Result<(), LockError> {
        let me = self.current_task();
        let mut state = self.state.lock();

        // The pending count keeps fresh readers out for the whole time this
        // task sits in the wait loop, and is balanced on every exit path.
        state.pending_writers += 1;
        let granted = loop {
            match state.try_acquire_exclusive(me) {
                Ok(true) => break Ok(()),
                Err(e) => break Err(e),
                Ok(false) => self.cond.wait(&mut state),
            }
        };
        state.pending_writers -= 1;
        granted
    }

    fn release(&self) -> Result<(), LockError> {
        let me = self.current_task();
        let mut state = self.state.lock();
        if state.release(me)? {
            // A release that leaves the lock held cannot flip any parked
            // predicate, so only the transition to idle wakes the waiters.
            self.cond.notify_all();
        }
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.state.lock().mode_count != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        self.state.lock().mode_count < 0
    }
}

/// The lock used for read, or shared, access.
///
/// Obtained through [`RwLock::reader_lock`].
pub struct ReaderLock {
    core: Arc<RwLockCore>,
    locked: AtomicBool,
}

impl ReaderLock {
    fn new(core: Arc<RwLockCore>) -> Self {
        Self {
            core,
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock in shared mode, parking the current task until the
    /// hold can be granted.
    ///
    /// The hold is granted immediately when the lock is idle, shared with no
    /// writer waiting, or already held by the calling task in either mode;
    /// a request by a task holding the lock exclusively is satisfied as an
    /// additional exclusive hold.
    ///
    /// # Panics
    ///
    /// **Must** be run from within a task of the owning runtime.
    pub fn acquire(&self) {
        self.core.acquire_shared();
        self.locked.store(true, Ordering::Relaxed);
    }

    /// Drops one hold by the calling task.
    ///
    /// # Errors
    ///
    /// Fails with [`LockError::NotHeld`] when the calling task holds no hold.
    ///
    /// # Panics
    ///
    /// **Must** be run from within a task of the owning runtime.
    pub fn release(&self) -> Result<(), LockError> {
        self.core.release()?;
        self.locked.store(false, Ordering::Relaxed);
        Ok(())
    }
}

impl Debug for ReaderLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let status = if self.locked.load(Ordering::Relaxed) {
            "locked"
        } else {
            "unlocked"
        };
        write!(f, "ReaderLock [{}]", status)
    }
}

/// The lock used for write, or exclusive, access.
///
/// Obtained through [`RwLock::writer_lock`].
pub struct WriterLock {
    core: Arc<RwLockCore>,
    locked: AtomicBool,
}

impl WriterLock {
    fn new(core: Arc<RwLockCore>) -> Self {
        Self {
            core,
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock in exclusive mode, parking the current task until
    /// the hold can be granted.
    ///
    /// The hold is granted immediately when the lock is idle or already held
    /// exclusively by the calling task. While the task waits, no task that
    /// does not already hold the lock can enter shared mode.
    ///
    /// # Errors
    ///
    /// Fails with [`LockError::UpgradeForbidden`] when the calling task
    /// currently holds the lock in shared mode; the lock state is unchanged.
    ///
    /// # Panics
    ///
    /// **Must** be run from within a task of the owning runtime.
    pub fn acquire(&self) -> Result<(), LockError> {
        self.core.acquire_exclusive()?;
        self.locked.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Drops one hold by the calling task.
    ///
    /// # Errors
    ///
    /// Fails with [`LockError::NotHeld`] when the calling task holds no hold.
    ///
    /// # Panics
    ///
    /// **Must** be run from within a task of the owning runtime.
    pub fn release(&self) -> Result<(), LockError> {
        self.core.release()?;
        self.locked.store(false, Ordering::Relaxed);
        Ok(())
    }
}

impl Debug for WriterLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let status = if self.locked.load(Ordering::Relaxed) {
            "locked"
        } else {
            "unlocked"
        };
        write!(f, "WriterLock [{}]", status)
    }
}

/// A reader-writer lock for tasks.
///
/// The lock maintains a pair of associated handles, one for read-only
/// operations and one for writing. The reader side may be held by many tasks
/// simultaneously while the writer side is exclusive. A task may reacquire a
/// lock it already holds, and a writer waiting for the lock keeps new
/// readers out so a stream of readers cannot starve it.
///
/// Unlike the reader-writer locks of `std` or `parking_lot`, this lock does
/// not wrap the protected data and hands out no guards; holds are released
/// explicitly through the handle. The handles key every decision on the
/// identity of the calling task, which the owning [`Runtime`] assigns.
pub struct RwLock {
    reader: ReaderLock,
    writer: WriterLock,
}

impl RwLock {
    /// Constructs a new `RwLock` bound to the ambient runtime.
    ///
    /// # Panics
    ///
    /// **Must** be run from within a task; use [`RwLock::with_runtime`] to
    /// construct a lock from the outside.
    pub fn new() -> Self {
        let runtime = current_runtime()
            .expect("RwLock::new must be called from within a task; see RwLock::with_runtime");
        Self::with_runtime(&runtime)
    }

    /// Constructs a new `RwLock` bound to the given runtime.
    pub fn with_runtime(runtime: &Runtime) -> Self {
        let core = Arc::new(RwLockCore::new(runtime.clone()));
        Self {
            reader: ReaderLock::new(core.clone()),
            writer: WriterLock::new(core),
        }
    }

    /// The lock used for read, or shared, access.
    #[inline]
    pub fn reader_lock(&self) -> &ReaderLock {
        &self.reader
    }

    /// The lock used for write, or exclusive, access.
    #[inline]
    pub fn writer_lock(&self) -> &WriterLock {
        &self.writer
    }

    /// Checks whether the lock is currently held in any way.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.reader.core.is_locked()
    }

    /// Checks whether the lock is currently held exclusively.
    #[inline]
    pub fn is_locked_exclusive(&self) -> bool {
        self.reader.core.is_locked_exclusive()
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for RwLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn task(id: u64) -> TaskId {
        TaskId::from_raw(id)
    }

    #[test]
    fn shared_round_trip_restores_idle() {
        let mut state = LockState::new();
        assert!(state.try_acquire_shared(task(0)));
        assert_eq!(state.mode_count, 1);
        assert!(state.release(task(0)).unwrap());
        assert_eq!(state.mode_count, 0);
        assert!(state.owners.is_empty());
    }

    #[test]
    fn exclusive_round_trip_restores_idle() {
        let mut state = LockState::new();
        assert_eq!(state.try_acquire_exclusive(task(0)), Ok(true));
        assert_eq!(state.mode_count, -1);
        assert!(state.release(task(0)).unwrap());
        assert_eq!(state.mode_count, 0);
        assert!(state.owners.is_empty());
    }

    #[test]
    fn shared_recursion_counts_both_holds() {
        let mut state = LockState::new();
        assert!(state.try_acquire_shared(task(0)));
        assert!(state.owns(task(0)));
        assert!(state.try_acquire_shared(task(0)));
        assert_eq!(state.mode_count, 2);
        assert!(!state.release(task(0)).unwrap());
        assert!(state.release(task(0)).unwrap());
    }

    #[test]
    fn exclusive_recursion_counts_both_holds() {
        let mut state = LockState::new();
        assert_eq!(state.try_acquire_exclusive(task(0)), Ok(true));
        assert_eq!(state.try_acquire_exclusive(task(0)), Ok(true));
        assert_eq!(state.mode_count, -2);
        assert!(!state.release(task(0)).unwrap());
        assert!(state.release(task(0)).unwrap());
    }

    #[test]
    fn readers_share_the_lock() {
        let mut state = LockState::new();
        assert!(state.try_acquire_shared(task(0)));
        assert!(state.try_acquire_shared(task(1)));
        assert!(state.try_acquire_shared(task(2)));
        assert_eq!(state.mode_count, 3);
    }

    #[test]
    fn fresh_reader_defers_to_pending_writer() {
        let mut state = LockState::new();
        assert!(state.try_acquire_shared(task(0)));
        state.pending_writers = 1;
        assert!(!state.try_acquire_shared(task(1)));
        // the reader that already holds the lock may still recurse.
        assert!(state.try_acquire_shared(task(0)));
    }

    #[test]
    fn shared_request_by_exclusive_owner_is_an_exclusive_hold() {
        let mut state = LockState::new();
        assert_eq!(state.try_acquire_exclusive(task(0)), Ok(true));
        assert!(state.try_acquire_shared(task(0)));
        assert_eq!(state.mode_count, -2);
        assert!(state.owners.iter().all(|&(_, m)| m == Mode::Exclusive));
    }

    #[test]
    fn upgrade_is_rejected_without_state_change() {
        let mut state = LockState::new();
        assert!(state.try_acquire_shared(task(0)));
        assert_eq!(
            state.try_acquire_exclusive(task(0)),
            Err(LockError::UpgradeForbidden)
        );
        assert_eq!(state.mode_count, 1);
        assert_eq!(state.owners.len(), 1);
        // the shared hold is still releasable.
        assert!(state.release(task(0)).unwrap());
    }

    #[test]
    fn contended_requests_are_deferred() {
        let mut state = LockState::new();
        assert_eq!(state.try_acquire_exclusive(task(0)), Ok(true));
        assert!(!state.try_acquire_shared(task(1)));
        assert_eq!(state.try_acquire_exclusive(task(1)), Ok(false));
        assert!(state.try_acquire_shared(task(0)));

        let mut state = LockState::new();
        assert!(state.try_acquire_shared(task(0)));
        assert_eq!(state.try_acquire_exclusive(task(1)), Ok(false));
    }

    #[test]
    fn release_without_hold_fails() {
        let mut state = LockState::new();
        assert_eq!(state.release(task(0)), Err(LockError::NotHeld));

        assert!(state.try_acquire_shared(task(0)));
        assert_eq!(state.release(task(1)), Err(LockError::NotHeld));
        assert_eq!(state.mode_count, 1);
    }

    // A deterministic rendition of the park/wake protocol: tasks whose
    // request is deferred go to `parked`, a release that reaches idle
    // replays every parked request once, like the broadcast does.
    struct Sim {
        state: LockState,
        parked: Vec<(TaskId, Mode)>,
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        AcquireShared(u64),
        AcquireExclusive(u64),
        Release(u64),
    }

    impl Sim {
        fn new() -> Self {
            Self {
                state: LockState::new(),
                parked: Vec::new(),
            }
        }

        fn is_parked(&self, task: TaskId) -> bool {
            self.parked.iter().any(|&(t, _)| t == task)
        }

        fn apply(&mut self, op: Op) {
            match op {
                Op::AcquireShared(id) => {
                    let t = task(id);
                    if !self.is_parked(t) && !self.state.try_acquire_shared(t) {
                        self.parked.push((t, Mode::Shared));
                    }
                }
                Op::AcquireExclusive(id) => {
                    let t = task(id);
                    if self.is_parked(t) {
                        return;
                    }
                    if let Ok(false) = self.state.try_acquire_exclusive(t) {
                        self.state.pending_writers += 1;
                        self.parked.push((t, Mode::Exclusive));
                    }
                }
                Op::Release(id) => {
                    let t = task(id);
                    if self.is_parked(t) {
                        return;
                    }
                    if let Ok(true) = self.state.release(t) {
                        self.broadcast();
                    }
                }
            }
        }

        fn broadcast(&mut self) {
            let waiters = std::mem::take(&mut self.parked);
            for (t, mode) in waiters {
                let granted = match mode {
                    Mode::Shared => self.state.try_acquire_shared(t),
                    Mode::Exclusive => match self.state.try_acquire_exclusive(t) {
                        Ok(granted) => {
                            if granted {
                                self.state.pending_writers -= 1;
                            }
                            granted
                        }
                        Err(_) => unreachable!("a parked task cannot hold the lock"),
                    },
                };
                if !granted {
                    self.parked.push((t, mode));
                }
            }
        }

        fn check_invariants(&self) {
            let state = &self.state;
            assert_eq!(state.mode_count.unsigned_abs(), state.owners.len());
            if state.mode_count > 0 {
                assert!(state.owners.iter().all(|&(_, m)| m == Mode::Shared));
            }
            if state.mode_count < 0 {
                assert!(state.owners.iter().all(|&(_, m)| m == Mode::Exclusive));
                let first = state.owners[0].0;
                assert!(state.owners.iter().all(|&(t, _)| t == first));
            }
            let parked_writers = self
                .parked
                .iter()
                .filter(|&&(_, m)| m == Mode::Exclusive)
                .count();
            assert_eq!(state.pending_writers, parked_writers);
            for &(t, _) in &self.parked {
                assert!(!state.owns(t));
            }
        }
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..5u64).prop_map(Op::AcquireShared),
            (0..5u64).prop_map(Op::AcquireExclusive),
            (0..5u64).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn interleavings_preserve_invariants(
            ops in prop::collection::vec(op_strategy(), 1..128)
        ) {
            let mut sim = Sim::new();
            for op in ops {
                sim.apply(op);
                sim.check_invariants();
            }
        }

        #[test]
        fn matched_pairs_leave_no_residue(
            ops in prop::collection::vec(op_strategy(), 1..64)
        ) {
            let mut sim = Sim::new();
            for op in ops {
                sim.apply(op);
            }
            // every task releases whatever it still holds.
            let mut progressed = true;
            while progressed {
                progressed = false;
                for id in 0..5 {
                    if sim.state.owns(task(id)) {
                        sim.apply(Op::Release(id));
                        progressed = true;
                    }
                }
            }
            // only parked waiters may remain accounted for.
            prop_assert_eq!(sim.state.owners.len(), 0);
            prop_assert_eq!(
                sim.state.pending_writers,
                sim.parked.iter().filter(|&&(_, m)| m == Mode::Exclusive).count()
            );
        }
    }
}
