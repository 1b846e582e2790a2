use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use harmoniq_plugin_db::{CrashMarker, PluginFormat, PluginStore};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ScannerConfig};
use crate::events::{ScanEvent, Subscribers, Subscription, SubscriptionId};
use crate::ipc::{spawn_reader, Inbound, IpcError, IpcTransport, Message};
use crate::session::{CrashOutcome, Reaction, ScanSession, ScanState};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to spawn scanner worker {executable:?}: {source}")]
    Launch {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("scanner worker pipes were not captured")]
    Pipes,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

type WorkerTransport = IpcTransport<ChildStdout, ChildStdin>;

/// A running worker process and its channel.
#[derive(Debug)]
struct WorkerProcess {
    child: Child,
    transport: WorkerTransport,
    inbound: Receiver<Inbound>,
    last_heard: Instant,
}

impl WorkerProcess {
    fn launch(config: &ScannerConfig) -> Result<Self, ScanError> {
        let mut command = Command::new(&config.worker.executable);
        command
            .args(&config.worker.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        for (key, value) in config.worker_env()? {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ScanError::Launch {
            executable: config.worker.executable.clone(),
            source,
        })?;
        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ScanError::Pipes);
        };

        debug!(pid = child.id(), "scanner worker launched");
        let transport = IpcTransport::new(stdout, stdin);
        let inbound = spawn_reader(transport.clone(), "scanner worker");
        Ok(Self {
            child,
            transport,
            inbound,
            last_heard: Instant::now(),
        })
    }

    fn send(&self, message: &Message) -> Result<(), IpcError> {
        self.transport.send(message)
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(err) => {
                warn!(%err, "failed to poll scanner worker");
                None
            }
        }
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.exit_status().is_some() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn terminate(&mut self) {
        if self.exit_status().is_none() {
            if let Err(err) = self.child.kill() {
                warn!(%err, "failed to kill scanner worker");
            }
        }
        if let Err(err) = self.child.wait() {
            warn!(%err, "failed to reap scanner worker");
        }
    }

    /// Sends `quit` and gives the worker `grace` to exit before killing it.
    fn quit(mut self, grace: Duration) {
        if let Err(err) = self.send(&Message::Quit) {
            debug!(%err, "scanner worker did not take the quit message");
        }
        if !self.wait_for_exit(grace) {
            warn!(?grace, "scanner worker ignored quit, killing it");
        }
        self.terminate();
    }
}

enum Control {
    Quit,
}

/// One scan request: its session and the thread supervising it.
#[derive(Debug)]
struct Run {
    session: Arc<Mutex<ScanSession>>,
    control: Sender<Control>,
    thread: JoinHandle<()>,
}

/// Launches and supervises the out-of-process scanner worker.
///
/// All session updates happen on one supervision thread per scan. Public
/// accessors only take short snapshots of the session, and notifications go
/// out after the session lock has been released. A worker that is still
/// shutting down never blocks the caller: the next scan waits for it on its
/// own supervision thread.
#[derive(Debug)]
pub struct ScanMaster {
    config: Arc<ScannerConfig>,
    host_store: Arc<PluginStore>,
    subscribers: Arc<Subscribers>,
    run: Mutex<Option<Run>>,
}

impl ScanMaster {
    pub fn new(config: Arc<ScannerConfig>, host_store: Arc<PluginStore>) -> Self {
        Self {
            config,
            host_store,
            subscribers: Arc::default(),
            run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Starts scanning `formats` (every format when empty). Returns `true`
    /// without doing anything if a scan is already running and `false` when
    /// the worker could not be spawned. While a cancelled worker is still
    /// quitting the launch is left to the new supervision thread, which
    /// reports a spawn failure as [`ScanEvent::Failed`].
    pub fn start_scan(&self, formats: &[PluginFormat]) -> bool {
        let mut slot = self.run.lock();
        if let Some(run) = slot.as_ref() {
            if run.session.lock().is_running() {
                return true;
            }
        }

        let formats = if formats.is_empty() {
            PluginFormat::ALL.to_vec()
        } else {
            formats.to_vec()
        };
        let mut session = ScanSession::new();
        session.begin(formats.clone());
        let session = Arc::new(Mutex::new(session));
        let (control_tx, control_rx) = unbounded();
        let mut supervision = Supervision {
            config: Arc::clone(&self.config),
            host_store: Arc::clone(&self.host_store),
            session: Arc::clone(&session),
            subscribers: Arc::clone(&self.subscribers),
            control: control_rx,
            worker: None,
        };

        let thread = match slot.take() {
            Some(previous) if !previous.thread.is_finished() => {
                debug!("previous scanner worker still shutting down, deferring launch");
                thread::spawn(move || supervision.run_after(previous))
            }
            previous => {
                if let Some(previous) = previous {
                    join_supervision(previous.thread);
                }
                if let Err(err) = supervision.start_worker() {
                    error!(%err, "plugin scan not started");
                    return false;
                }
                session.lock().worker_launched();
                thread::spawn(move || supervision.run())
            }
        };
        info!(?formats, "plugin scan started");
        *slot = Some(Run {
            session,
            control: control_tx,
            thread,
        });
        true
    }

    /// Asks the worker to quit. Does nothing when no scan is running.
    pub fn cancel(&self) {
        let slot = self.run.lock();
        let Some(run) = slot.as_ref() else {
            return;
        };
        if run.session.lock().request_quit() {
            let _ = run.control.send(Control::Quit);
        }
    }

    fn with_session<T>(&self, read: impl FnOnce(&ScanSession) -> T) -> Option<T> {
        self.run
            .lock()
            .as_ref()
            .map(|run| read(&run.session.lock()))
    }

    pub fn is_running(&self) -> bool {
        self.with_session(ScanSession::is_running).unwrap_or(false)
    }

    /// Fraction of the current format pass, `None` while unknown.
    pub fn progress(&self) -> Option<f32> {
        self.with_session(ScanSession::progress).flatten()
    }

    pub fn state(&self) -> ScanState {
        self.with_session(ScanSession::state)
            .unwrap_or(ScanState::Idle)
    }

    pub fn current_plugin(&self) -> Option<String> {
        self.with_session(|session| session.current().map(str::to_owned))
            .flatten()
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribers.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }
}

impl Drop for ScanMaster {
    // The supervision thread finishes the quit and reaps the worker on its own.
    fn drop(&mut self) {
        self.cancel();
    }
}

fn join_supervision(thread: JoinHandle<()>) {
    if thread.join().is_err() {
        error!("previous scanner supervision thread panicked");
    }
}

struct Supervision {
    config: Arc<ScannerConfig>,
    host_store: Arc<PluginStore>,
    session: Arc<Mutex<ScanSession>>,
    subscribers: Arc<Subscribers>,
    control: Receiver<Control>,
    worker: Option<WorkerProcess>,
}

impl Supervision {
    /// Waits for the previous scan to let go of its worker, then launches
    /// unless this scan was cancelled in the meantime.
    fn run_after(mut self, previous: Run) {
        join_supervision(previous.thread);
        {
            let session = Arc::clone(&self.session);
            let mut session = session.lock();
            if !session.is_running() {
                session.quit_complete();
                info!("plugin scan cancelled before launch");
                return;
            }
            match self.start_worker() {
                Ok(()) => session.worker_launched(),
                Err(err) => {
                    error!(%err, "plugin scan not started");
                    session.abandon();
                    drop(session);
                    self.subscribers
                        .dispatch([ScanEvent::Failed(err.to_string())]);
                    return;
                }
            }
        }
        self.run();
    }

    /// Starts a worker from a clean slate. Relaunches keep the list file so
    /// the next worker picks up where the crashed one stopped.
    fn start_worker(&mut self) -> Result<(), ScanError> {
        if let Err(err) = fs::remove_file(&self.config.list_file) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(%err, path = %self.config.list_file.display(), "failed to clear scan list");
            }
        }
        self.worker = Some(WorkerProcess::launch(&self.config)?);
        Ok(())
    }

    fn run(mut self) {
        let control = self.control.clone();
        while let Some(inbound) = self.worker.as_ref().map(|worker| worker.inbound.clone()) {
            select! {
                recv(control) -> _ => {
                    self.quit_worker();
                }
                recv(inbound) -> message => match message {
                    Ok(Inbound::Message(message)) => {
                        if let Some(worker) = self.worker.as_mut() {
                            worker.last_heard = Instant::now();
                        }
                        self.on_message(message);
                    }
                    Ok(Inbound::Lost) | Err(_) => self.on_worker_lost("connection lost"),
                },
                default(self.config.poll_interval) => self.on_tick(),
            }
        }
        debug!("scanner supervision finished");
    }

    fn on_message(&mut self, message: Message) {
        let reactions = self.session.lock().handle(message);
        for reaction in reactions {
            match reaction {
                Reaction::SendScanRequest(formats) => {
                    if let Some(worker) = self.worker.as_ref() {
                        if let Err(err) = worker.send(&Message::scan(&formats)) {
                            warn!(%err, "failed to send scan request");
                        }
                    }
                }
                Reaction::Notify(event) => self.subscribers.dispatch([event]),
                Reaction::Shutdown => self.finish(),
            }
        }
    }

    fn on_tick(&mut self) {
        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        if let Some(status) = worker.exit_status() {
            // Let the reader hand over whatever the worker wrote before dying.
            let inbound = worker.inbound.clone();
            while let Ok(Inbound::Message(message)) = inbound.recv_timeout(self.config.poll_interval)
            {
                self.on_message(message);
                if self.worker.is_none() {
                    return;
                }
            }
            self.on_worker_lost(&format!("worker exited with {status}"));
            return;
        }

        let silent_for = worker.last_heard.elapsed();
        if silent_for > self.config.launch_timeout && self.session.lock().expects_status() {
            warn!(?silent_for, "scanner worker stopped responding, killing it");
            worker.terminate();
            self.on_worker_lost("worker timed out");
        }
    }

    fn on_worker_lost(&mut self, reason: &str) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        worker.terminate();

        let (outcome, in_flight) = {
            let mut session = self.session.lock();
            let in_flight = session.current().map(str::to_owned);
            (session.worker_lost(self.config.max_relaunches), in_flight)
        };
        match outcome {
            CrashOutcome::Ignore => {
                debug!(%reason, "scanner worker went away");
                let event = {
                    let mut session = self.session.lock();
                    if session.state() == ScanState::Quitting {
                        session.quit_complete();
                        None
                    } else {
                        session.complete()
                    }
                };
                self.subscribers.dispatch(event);
            }
            CrashOutcome::Relaunch { rearm } => {
                warn!(%reason, plugin = ?in_flight, "scanner worker crashed, relaunching");
                self.rearm(rearm);
                if let Err(err) = self.host_store.merge_file(&self.config.list_file) {
                    warn!(%err, "keeping previous plugin list after crash");
                }
                self.relaunch();
            }
            CrashOutcome::GiveUp { reason, rearm } => {
                error!(%reason, "plugin scan abandoned");
                self.rearm(rearm);
                self.subscribers.dispatch([ScanEvent::Failed(reason)]);
            }
        }
    }

    fn rearm(&self, identifier: Option<String>) {
        let Some(identifier) = identifier else {
            return;
        };
        let marker = CrashMarker::new(&self.config.crash_marker);
        if let Err(err) = marker.arm(&identifier) {
            warn!(%err, %identifier, "failed to re-arm crash marker");
        }
    }

    fn relaunch(&mut self) {
        match WorkerProcess::launch(&self.config) {
            Ok(worker) => {
                self.worker = Some(worker);
                self.session.lock().worker_launched();
            }
            Err(err) => {
                error!(%err, "failed to relaunch scanner worker");
                self.session.lock().abandon();
                self.subscribers
                    .dispatch([ScanEvent::Failed(err.to_string())]);
            }
        }
    }

    /// The worker reported `finished`: let it go, then report.
    fn finish(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.quit(self.config.quit_timeout);
        }
        let event = self.session.lock().complete();
        info!("plugin scan finished");
        self.subscribers.dispatch(event);
    }

    fn quit_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.quit(self.config.quit_timeout);
        }
        self.session.lock().quit_complete();
        info!("plugin scan cancelled");
    }
}
