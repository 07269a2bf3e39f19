//! Signal relay between scuttle and its child process.
//!
//! Before the child exists only SIGINT is subscribed; a signal arriving then
//! is treated as "told to quit before starting": sidecars are shut down and
//! the program exits with code 1. Once the child is running every catchable
//! signal is subscribed and passed through to it unchanged.
//!
//! All subscribed streams are polled by the single relay task, so signals are
//! handled one at a time in the order the runtime reports them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::task::Poll;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal as listen, Signal as SignalStream, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use scuttle_core::shutdown::ShutdownOrchestrator;

/// Exit code used when a signal arrives before the child starts.
pub const EXIT_QUIT_BEFORE_START: i32 = 1;

/// Signals that cannot be caught (KILL, STOP) or that the async runtime
/// refuses to register handlers for (ILL, FPE, SEGV).
pub const UNCATCHABLE_SIGNALS: &[Signal] = &[
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
];

/// Runtime noise that must never be relayed or treated as a quit request:
/// SIGCHLD drives the async runtime's child reaper, SIGURG is used for
/// preemption by some runtimes.
pub const IGNORED_SIGNALS: &[Signal] = &[Signal::SIGCHLD, Signal::SIGURG];

/// Every signal passed through to a running child: all the platform defines,
/// minus the uncatchable and ignored sets.
pub fn forwarded_signals() -> Vec<Signal> {
    Signal::iterator()
        .filter(|sig| !UNCATCHABLE_SIGNALS.contains(sig) && !is_ignored(*sig))
        .collect()
}

/// Terminates the program. `std::process::exit` in production.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

pub fn process_exit() -> ExitHook {
    Arc::new(|code| std::process::exit(code))
}

// ---------------------------------------------------------------------------
// Child slot
// ---------------------------------------------------------------------------

/// Lifecycle of the supervised child as seen by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    NotStarted,
    /// `spawn` is in progress; the pid is not known yet.
    Spawning,
    Running(Pid),
}

/// Handle on the child's state, shared between the main flow and the relay.
/// The pid is written once.
#[derive(Clone)]
pub struct ChildSlot {
    state: Arc<watch::Sender<ChildState>>,
}

impl Default for ChildSlot {
    fn default() -> Self {
        let (tx, _) = watch::channel(ChildState::NotStarted);
        Self {
            state: Arc::new(tx),
        }
    }
}

impl ChildSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark that the child is about to be spawned. Signals arriving from now
    /// on are held until the spawn settles.
    pub fn begin_spawn(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ChildState::NotStarted {
                *state = ChildState::Spawning;
                true
            } else {
                false
            }
        })
    }

    /// The spawn failed; go back to "not started".
    pub fn abandon_spawn(&self) {
        self.state.send_if_modified(|state| {
            if *state == ChildState::Spawning {
                *state = ChildState::NotStarted;
                true
            } else {
                false
            }
        });
    }

    /// Record the child's pid. Returns `false` if one was already set.
    pub fn set(&self, pid: Pid) -> bool {
        self.state.send_if_modified(|state| match *state {
            ChildState::Running(_) => false,
            _ => {
                *state = ChildState::Running(pid);
                true
            }
        })
    }

    pub fn state(&self) -> ChildState {
        *self.state.borrow()
    }

    pub fn get(&self) -> Option<Pid> {
        match self.state() {
            ChildState::Running(pid) => Some(pid),
            _ => None,
        }
    }

    /// Wait until the state is no longer [`ChildState::Spawning`].
    pub async fn settled(&self) -> ChildState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|state| *state != ChildState::Spawning).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        settled
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// What the relay does with a received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    Ignore,
    QuitBeforeStart,
    AwaitSpawn,
    Forward(Pid),
}

pub fn is_ignored(sig: Signal) -> bool {
    IGNORED_SIGNALS.contains(&sig)
}

pub fn classify(sig: Signal, child: ChildState) -> RelayAction {
    if is_ignored(sig) {
        return RelayAction::Ignore;
    }
    match child {
        ChildState::NotStarted => RelayAction::QuitBeforeStart,
        ChildState::Spawning => RelayAction::AwaitSpawn,
        ChildState::Running(pid) => RelayAction::Forward(pid),
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Receives OS signals for the lifetime of the program and acts on them.
pub struct SignalRelay {
    injector: mpsc::UnboundedSender<Signal>,
    streams: mpsc::UnboundedSender<(Signal, SignalStream)>,
    subscribed: Mutex<HashSet<Signal>>,
    task: JoinHandle<()>,
}

impl SignalRelay {
    /// Spawn the relay loop. Nothing is subscribed yet.
    pub fn start(
        child: ChildSlot,
        orchestrator: Arc<ShutdownOrchestrator>,
        exit: ExitHook,
    ) -> Self {
        let (injector, injected) = mpsc::unbounded_channel();
        Self::with_injector(injector, injected, child, orchestrator, exit)
    }

    /// Like [`SignalRelay::start`], but signals sent on `injector` by the
    /// caller are handled as if the OS had delivered them.
    pub fn with_injector(
        injector: mpsc::UnboundedSender<Signal>,
        injected: mpsc::UnboundedReceiver<Signal>,
        child: ChildSlot,
        orchestrator: Arc<ShutdownOrchestrator>,
        exit: ExitHook,
    ) -> Self {
        let (streams, new_streams) = mpsc::unbounded_channel();
        let task = tokio::spawn(relay_loop(injected, new_streams, child, orchestrator, exit));
        Self {
            injector,
            streams,
            subscribed: Mutex::new(HashSet::new()),
            task,
        }
    }

    /// Subscribe to SIGINT only. Used before the child starts.
    pub fn subscribe_interrupt(&self) -> std::io::Result<()> {
        self.subscribe(&[Signal::SIGINT])
    }

    /// Subscribe to every forwardable signal. Used once the child runs.
    pub fn subscribe_forwardable(&self) -> std::io::Result<()> {
        self.subscribe(&forwarded_signals())
    }

    /// Install OS handlers for `signals` and hand them to the relay loop.
    /// Signals already subscribed are skipped.
    pub fn subscribe(&self, signals: &[Signal]) -> std::io::Result<()> {
        let mut subscribed = self.subscribed.lock().unwrap_or_else(|e| e.into_inner());
        for &sig in signals {
            if subscribed.contains(&sig) {
                continue;
            }
            let stream = listen(SignalKind::from_raw(sig as i32))?;
            if self.streams.send((sig, stream)).is_err() {
                warn!(signal = %sig, "relay loop has stopped, not subscribing");
                break;
            }
            subscribed.insert(sig);
            debug!(signal = %sig, "subscribed to signal");
        }
        Ok(())
    }

    pub fn is_subscribed(&self, sig: Signal) -> bool {
        self.subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&sig)
    }

    /// Sender feeding the relay loop directly, bypassing the OS.
    pub fn injector(&self) -> mpsc::UnboundedSender<Signal> {
        self.injector.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

enum RelayEvent {
    Subscribed(Signal, SignalStream),
    Received(Signal),
}

async fn relay_loop(
    mut injected: mpsc::UnboundedReceiver<Signal>,
    mut new_streams: mpsc::UnboundedReceiver<(Signal, SignalStream)>,
    child: ChildSlot,
    orchestrator: Arc<ShutdownOrchestrator>,
    exit: ExitHook,
) {
    let mut streams: Vec<(Signal, SignalStream)> = Vec::new();
    loop {
        let event = tokio::select! {
            biased;
            Some((sig, stream)) = new_streams.recv() => RelayEvent::Subscribed(sig, stream),
            Some(sig) = injected.recv() => RelayEvent::Received(sig),
            sig = next_os_signal(&mut streams) => RelayEvent::Received(sig),
        };
        match event {
            RelayEvent::Subscribed(sig, stream) => streams.push((sig, stream)),
            RelayEvent::Received(sig) => {
                if !dispatch(sig, &child, &orchestrator, &exit).await {
                    return;
                }
            }
        }
    }
}

/// Next signal from any subscribed stream. Pending forever when none are.
async fn next_os_signal(streams: &mut [(Signal, SignalStream)]) -> Signal {
    std::future::poll_fn(|cx| {
        for (sig, stream) in streams.iter_mut() {
            if let Poll::Ready(Some(())) = stream.poll_recv(cx) {
                return Poll::Ready(*sig);
            }
        }
        Poll::Pending
    })
    .await
}

/// Act on one signal. Returns `false` once the program has been told to exit.
async fn dispatch(
    sig: Signal,
    child: &ChildSlot,
    orchestrator: &ShutdownOrchestrator,
    exit: &ExitHook,
) -> bool {
    loop {
        match classify(sig, child.state()) {
            RelayAction::Ignore => {
                info!(signal = %sig, "received signal, ignoring");
                return true;
            }
            RelayAction::AwaitSpawn => {
                debug!(signal = %sig, "received signal while child is starting, holding it");
                child.settled().await;
            }
            RelayAction::QuitBeforeStart => {
                info!(signal = %sig, "received signal before child started, exiting");
                orchestrator.run(EXIT_QUIT_BEFORE_START).await;
                exit(EXIT_QUIT_BEFORE_START);
                return false;
            }
            RelayAction::Forward(pid) => {
                info!(signal = %sig, pid = pid.as_raw(), "received signal, passing to child");
                if let Err(e) = signal::kill(pid, sig) {
                    warn!(signal = %sig, pid = pid.as_raw(), error = %e, "failed passing signal to child");
                }
                return true;
            }
        }
    }
}
