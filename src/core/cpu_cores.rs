use std::{
    cell::Cell,
    sync::atomic::{AtomicU32, Ordering},
};

/// Number of logical cores the engine was started with. Grows when a
/// reactor is added at runtime.
static CORE_COUNT: AtomicU32 = AtomicU32::new(0);

thread_local! {
    /// The core whose reactor is currently being polled on this thread.
    static CURRENT_CORE: Cell<u32> = Cell::new(0);
}

/// The logical cores assigned to us. A core maps one-to-one onto a reactor
/// and serves as the thread identity used throughout the volume layer.
pub struct Cores;

impl Cores {
    /// the core the engine boots on, used for management work
    pub fn first() -> u32 {
        0
    }

    /// number of cores currently assigned
    pub fn count() -> u32 {
        CORE_COUNT.load(Ordering::Acquire)
    }

    /// the core whose reactor context we are running in
    pub fn current() -> u32 {
        CURRENT_CORE.with(|c| c.get())
    }

    /// iterate over all core ids
    pub fn iter() -> impl Iterator<Item = u32> {
        0 .. Self::count()
    }

    pub(crate) fn set_count(count: u32) {
        CORE_COUNT.store(count, Ordering::Release);
    }

    pub(crate) fn add_one() -> u32 {
        CORE_COUNT.fetch_add(1, Ordering::AcqRel)
    }

    /// enter the context of the given core, returning the previous one
    pub(crate) fn enter(core: u32) -> u32 {
        CURRENT_CORE.with(|c| c.replace(core))
    }

    /// restore a previously saved core context
    pub(crate) fn exit(prev: u32) {
        CURRENT_CORE.with(|c| c.set(prev));
    }
}
