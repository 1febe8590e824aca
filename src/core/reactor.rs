//! The reactors are the cooperatively scheduled execution contexts of the
//! engine. A reactor maps one-to-one onto a logical core and everything that
//! "owns" state -- an lvol store, an esnap channel table -- is owned by
//! exactly one reactor. Work is moved between reactors by sending futures,
//! never by sharing mutable state.
//!
//! Within a reactor, a future runs to completion before the next message is
//! serviced. Cross-reactor completion therefore only requires that the
//! destination reactor is polled; there is no preemption to reason about.
//!
//! The poll loop is driven externally: [`Reactor::block_on`] pumps every
//! reactor until the given future resolves, which gives a deterministic
//! schedule to the callers (and to the tests).

use std::{
    cell::Cell,
    fmt::{self, Display, Formatter},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crossbeam::channel::{unbounded, Receiver, Sender};
use futures::channel::oneshot;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::core::Cores;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReactorState {
    Init,
    Running,
    Shutdown,
}

impl Display for ReactorState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            ReactorState::Init => "Init",
            ReactorState::Running => "Running",
            ReactorState::Shutdown => "Shutdown",
        };
        write!(f, "{}", s)
    }
}

/// All reactors of this process. Reactors are never removed, so handing out
/// `&'static` references is sound; the list itself may grow when a core is
/// added at runtime.
pub struct Reactors(RwLock<Vec<&'static Reactor>>);

pub static REACTOR_LIST: OnceCell<Reactors> = OnceCell::new();

// The reactors are polled from a single OS thread; the queues they carry are
// not shared between OS threads even though the registry is a global.
unsafe impl Sync for Reactors {}
unsafe impl Send for Reactors {}

unsafe impl Sync for Reactor {}
unsafe impl Send for Reactor {}

pub struct Reactor {
    /// the logical core this reactor runs on
    lcore: u32,
    /// represents the state of the reactor
    flags: Cell<ReactorState>,
    /// sender and receiver for futures posted from other reactors
    sx: Sender<Pin<Box<dyn Future<Output = ()> + 'static>>>,
    rx: Receiver<Pin<Box<dyn Future<Output = ()> + 'static>>>,
    /// local run queue of spawned tasks
    run_sx: Sender<async_task::Runnable>,
    run_rx: Receiver<async_task::Runnable>,
}

impl Reactors {
    /// initialize the reactor subsystem with the given number of cores
    pub fn init(count: u32) {
        REACTOR_LIST.get_or_init(|| {
            Cores::set_count(count);
            Reactors(RwLock::new(
                (0 .. count)
                    .map(|c| {
                        debug!("init core: {}", c);
                        &*Box::leak(Box::new(Reactor::new(c)))
                    })
                    .collect::<Vec<_>>(),
            ))
        });
    }

    /// add one reactor to the running set, returning it. Used when the
    /// thread set grows after startup.
    pub fn add() -> &'static Reactor {
        let list = REACTOR_LIST.get().expect("reactors not initialized");
        let core = Cores::add_one();
        let r: &'static Reactor = Box::leak(Box::new(Reactor::new(core)));
        r.running();
        list.0.write().push(r);
        info!("added reactor on core {}", core);
        r
    }

    /// get a reference to the reactor associated with the given core
    pub fn get_by_core(core: u32) -> Option<&'static Reactor> {
        let list = REACTOR_LIST.get()?;
        list.0.read().get(core as usize).copied()
    }

    /// the reactor of the core we are currently executing on
    pub fn current() -> &'static Reactor {
        Self::get_by_core(Cores::current()).expect("no reactor allocated")
    }

    pub fn master() -> &'static Reactor {
        Self::get_by_core(Cores::first()).expect("no reactor allocated")
    }

    /// snapshot of all reactors
    pub fn iter() -> Vec<&'static Reactor> {
        REACTOR_LIST
            .get()
            .map(|l| l.0.read().clone())
            .unwrap_or_default()
    }

    /// Run the given closure once on every reactor, in core order, and
    /// return once the last one has executed it. This is the all-thread
    /// fan-out primitive: when it returns, no reactor can still be running
    /// code that was dispatched before it started, which is the fence the
    /// channel table relies on before freeing a displaced slot array.
    pub async fn on_each<F>(f: F)
    where
        F: Fn() + Clone + 'static,
    {
        for r in Self::iter() {
            let (s, rcv) = oneshot::channel::<()>();
            let f = f.clone();
            r.send_future(async move {
                f();
                let _ = s.send(());
            });
            let _ = rcv.await;
        }
    }

    /// poll every reactor until all queues are drained
    pub fn poll_until_idle() {
        loop {
            let reactors = Self::iter();
            reactors.iter().for_each(|r| r.poll_once());
            if reactors.iter().all(|r| r.is_idle()) {
                break;
            }
        }
    }
}

impl Reactor {
    fn new(core: u32) -> Self {
        let (sx, rx) = unbounded::<Pin<Box<dyn Future<Output = ()> + 'static>>>();
        let (run_sx, run_rx) = unbounded::<async_task::Runnable>();

        Self {
            lcore: core,
            flags: Cell::new(ReactorState::Init),
            sx,
            rx,
            run_sx,
            run_rx,
        }
    }

    /// returns core number of this reactor
    pub fn core(&self) -> u32 {
        self.lcore
    }

    fn set_state(&self, state: ReactorState) {
        self.flags.set(state);
    }

    pub fn running(&self) {
        self.set_state(ReactorState::Running)
    }

    pub fn shutdown(&self) {
        info!("shutdown requested for core {}", self.lcore);
        self.set_state(ReactorState::Shutdown);
    }

    pub fn get_state(&self) -> ReactorState {
        self.flags.get()
    }

    /// send a future to this reactor -- the equivalent of sending a thread
    /// message in the original model
    pub fn send_future<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.sx.send(Box::pin(future)).unwrap();
    }

    /// spawn a future locally on this reactor
    pub fn spawn_local<F, R>(&'static self, future: F) -> async_task::Task<R>
    where
        F: Future<Output = R> + 'static,
        R: 'static,
    {
        let sender = self.run_sx.clone();
        let schedule = move |t| sender.send(t).unwrap();

        let (runnable, task) = async_task::spawn_local(future, schedule);
        runnable.schedule();
        task
    }

    /// true when there is no work queued on this reactor
    pub fn is_idle(&self) -> bool {
        self.rx.is_empty() && self.run_rx.is_empty()
    }

    /// poll this reactor once: adopt newly received futures and run the
    /// current batch of runnable tasks within this core's context
    pub fn poll_once(&self) {
        if self.get_state() == ReactorState::Init {
            self.running();
        }

        let me: &'static Reactor = match Reactors::get_by_core(self.lcore) {
            Some(r) => r,
            None => return,
        };

        let prev = Cores::enter(self.lcore);

        self.rx.try_iter().for_each(|f| {
            me.spawn_local(f).detach();
        });

        let batch = self.run_rx.try_iter().collect::<Vec<_>>();
        batch.into_iter().for_each(|r| {
            r.run();
        });

        Cores::exit(prev);
    }

    /// Spawn the future on the master reactor and pump every reactor until
    /// it completes. The deterministic, single-threaded schedule is what the
    /// run-to-completion model promises its callers.
    pub fn block_on<F, R>(future: F) -> Option<R>
    where
        F: Future<Output = R> + 'static,
        R: 'static,
    {
        let task = Reactors::master().spawn_local(future);

        pin_utils::pin_mut!(task);
        let waker = futures::task::noop_waker();
        let cx = &mut Context::from_waker(&waker);

        loop {
            Reactors::iter().iter().for_each(|r| r.poll_once());
            if let Poll::Ready(output) = task.as_mut().poll(cx) {
                return Some(output);
            }
        }
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("lcore", &self.lcore)
            .field("state", &self.flags.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_reactor_messages() {
        Reactors::init(2);

        let result = Reactor::block_on(async {
            let (s, r) = oneshot::channel::<u32>();
            Reactors::get_by_core(1).unwrap().send_future(async move {
                s.send(Cores::current()).unwrap();
            });
            r.await.unwrap()
        })
        .unwrap();

        assert_eq!(result, 1);
    }
}
