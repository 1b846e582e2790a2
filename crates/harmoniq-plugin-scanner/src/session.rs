use harmoniq_plugin_db::PluginFormat;
use tracing::{debug, warn};

use crate::events::ScanEvent;
use crate::ipc::{Message, WorkerState};

/// The master's view of its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    /// A worker was launched and has not started scanning yet.
    Waiting,
    Scanning,
    Finished,
    Quitting,
}

/// Side effects the supervisor performs after a session update, outside the
/// session lock and in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    SendScanRequest(Vec<PluginFormat>),
    Notify(ScanEvent),
    /// The worker is done; ask it to quit and wait for it before reporting.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrashOutcome {
    /// Expected exit, nothing to recover.
    Ignore,
    /// Start a new worker. `rearm` names an identifier that crashed twice in
    /// a row and must be blacklisted by the next worker.
    Relaunch { rearm: Option<String> },
    /// Stop scanning. `rearm` has the same meaning as for a relaunch.
    GiveUp {
        reason: String,
        rearm: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ScanSession {
    state: ScanState,
    formats: Vec<PluginFormat>,
    current: Option<String>,
    progress: Option<f32>,
    running: bool,
    worker_alive: bool,
    crashes: u32,
    last_crash: Option<String>,
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanSession {
    pub fn new() -> Self {
        Self {
            state: ScanState::Idle,
            formats: Vec::new(),
            current: None,
            progress: None,
            running: false,
            worker_alive: false,
            crashes: 0,
            last_crash: None,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn formats(&self) -> &[PluginFormat] {
        &self.formats
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn progress(&self) -> Option<f32> {
        self.progress
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn worker_alive(&self) -> bool {
        self.worker_alive
    }

    /// Whether a silent worker counts as hung.
    pub fn expects_status(&self) -> bool {
        self.worker_alive && matches!(self.state, ScanState::Waiting | ScanState::Scanning)
    }

    pub fn begin(&mut self, formats: Vec<PluginFormat>) {
        *self = Self {
            state: ScanState::Waiting,
            formats,
            running: true,
            ..Self::new()
        };
    }

    pub fn worker_launched(&mut self) {
        self.state = ScanState::Waiting;
        self.worker_alive = true;
        self.current = None;
        self.progress = None;
    }

    pub fn handle(&mut self, message: Message) -> Vec<Reaction> {
        if !matches!(self.state, ScanState::Waiting | ScanState::Scanning) {
            debug!(state = ?self.state, %message, "dropping worker message");
            return Vec::new();
        }
        match message {
            Message::State(WorkerState::Ready) => {
                if self.state == ScanState::Waiting {
                    vec![Reaction::SendScanRequest(self.formats.clone())]
                } else {
                    warn!("worker reported ready in the middle of a scan");
                    Vec::new()
                }
            }
            Message::State(WorkerState::Scanning) => {
                self.state = ScanState::Scanning;
                Vec::new()
            }
            Message::State(WorkerState::Finished) => {
                self.state = ScanState::Finished;
                self.current = None;
                vec![Reaction::Shutdown]
            }
            Message::Name(identifier) => {
                self.state = ScanState::Scanning;
                self.current = Some(identifier.clone());
                vec![Reaction::Notify(ScanEvent::ProbeStarted(identifier))]
            }
            Message::Progress(fraction) => {
                self.progress = Some(fraction);
                self.crashes = 0;
                self.last_crash = None;
                vec![Reaction::Notify(ScanEvent::Progress(fraction))]
            }
            other @ (Message::Scan(_) | Message::Quit) => {
                warn!(message = %other, "worker sent a master-only message");
                Vec::new()
            }
        }
    }

    /// Marks the session as quitting. Returns `false` when there is nothing
    /// to stop.
    pub fn request_quit(&mut self) -> bool {
        if !self.running && !self.worker_alive {
            return false;
        }
        self.state = ScanState::Quitting;
        self.running = false;
        true
    }

    /// The worker process went away (exit, lost pipe or killed after a
    /// timeout).
    pub fn worker_lost(&mut self, max_relaunches: u32) -> CrashOutcome {
        self.worker_alive = false;
        match self.state {
            ScanState::Waiting | ScanState::Scanning => {}
            ScanState::Finished | ScanState::Quitting | ScanState::Idle => {
                return CrashOutcome::Ignore;
            }
        }

        self.crashes += 1;
        let in_flight = self.current.take();
        self.progress = None;
        let rearm = match (&in_flight, &self.last_crash) {
            (Some(current), Some(previous)) if current == previous => Some(current.clone()),
            _ => None,
        };
        if self.crashes > max_relaunches.max(1) {
            self.state = ScanState::Idle;
            self.running = false;
            let reason = match in_flight {
                Some(identifier) => format!(
                    "scanner crashed {} times, last while probing {identifier}",
                    self.crashes
                ),
                None => format!("scanner crashed {} times in a row", self.crashes),
            };
            return CrashOutcome::GiveUp { reason, rearm };
        }

        self.last_crash = in_flight;
        self.state = ScanState::Waiting;
        CrashOutcome::Relaunch { rearm }
    }

    /// A relaunch could not spawn the worker.
    pub fn abandon(&mut self) {
        self.state = ScanState::Idle;
        self.running = false;
        self.worker_alive = false;
    }

    /// The worker is gone after `finished`; returns the terminal event.
    pub fn complete(&mut self) -> Option<ScanEvent> {
        self.worker_alive = false;
        if self.state != ScanState::Finished {
            return None;
        }
        self.running = false;
        self.progress = Some(1.0);
        Some(ScanEvent::Finished)
    }

    /// The worker is gone after `quit`.
    pub fn quit_complete(&mut self) {
        self.worker_alive = false;
        self.running = false;
        self.state = ScanState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn launched(formats: Vec<PluginFormat>) -> ScanSession {
        let mut session = ScanSession::new();
        session.begin(formats);
        session.worker_launched();
        session
    }

    #[test]
    fn ready_triggers_scan_request() {
        let mut session = launched(vec![PluginFormat::Clap, PluginFormat::Vst3]);
        assert!(session.is_running());
        assert_eq!(
            session.handle(Message::State(WorkerState::Ready)),
            vec![Reaction::SendScanRequest(vec![PluginFormat::Clap, PluginFormat::Vst3])]
        );
        assert_eq!(session.state(), ScanState::Waiting);
        session.handle(Message::State(WorkerState::Scanning));
        assert_eq!(session.state(), ScanState::Scanning);
    }

    #[test]
    fn probes_and_progress_are_forwarded() {
        let mut session = launched(vec![PluginFormat::Clap]);
        session.handle(Message::State(WorkerState::Scanning));
        assert_eq!(
            session.handle(Message::Name("/a.clap".into())),
            vec![Reaction::Notify(ScanEvent::ProbeStarted("/a.clap".into()))]
        );
        assert_eq!(session.current(), Some("/a.clap"));
        assert_eq!(
            session.handle(Message::Progress(0.5)),
            vec![Reaction::Notify(ScanEvent::Progress(0.5))]
        );
        assert_eq!(session.progress(), Some(0.5));
    }

    #[test]
    fn finished_waits_for_teardown_before_reporting() {
        let mut session = launched(vec![PluginFormat::Clap]);
        session.handle(Message::State(WorkerState::Scanning));
        assert_eq!(
            session.handle(Message::State(WorkerState::Finished)),
            vec![Reaction::Shutdown]
        );
        assert!(session.is_running());
        assert_eq!(session.worker_lost(3), CrashOutcome::Ignore);
        assert_eq!(session.complete(), Some(ScanEvent::Finished));
        assert!(!session.is_running());
        assert_eq!(session.progress(), Some(1.0));
    }

    #[test]
    fn quit_takes_precedence_over_late_status() {
        let mut session = launched(vec![PluginFormat::Clap]);
        session.handle(Message::State(WorkerState::Scanning));
        assert!(session.request_quit());
        assert!(!session.is_running());
        assert!(session.handle(Message::State(WorkerState::Finished)).is_empty());
        assert!(session.handle(Message::Progress(1.0)).is_empty());
        assert_eq!(session.state(), ScanState::Quitting);
        assert_eq!(session.worker_lost(3), CrashOutcome::Ignore);
        session.quit_complete();
        assert!(!session.request_quit());
    }

    #[test]
    fn idle_session_has_nothing_to_quit() {
        let mut session = ScanSession::new();
        assert!(!session.request_quit());
        assert_eq!(session.state(), ScanState::Idle);
    }

    #[test]
    fn crash_relaunches_and_resends_formats() {
        let mut session = launched(vec![PluginFormat::Vst3]);
        session.handle(Message::State(WorkerState::Scanning));
        session.handle(Message::Name("/first.vst3".into()));
        assert_eq!(
            session.worker_lost(3),
            CrashOutcome::Relaunch { rearm: None }
        );
        assert_eq!(session.state(), ScanState::Waiting);
        assert!(session.is_running());
        session.worker_launched();
        assert_eq!(
            session.handle(Message::State(WorkerState::Ready)),
            vec![Reaction::SendScanRequest(vec![PluginFormat::Vst3])]
        );
    }

    #[test]
    fn same_identifier_crashing_twice_is_rearmed() {
        let mut session = launched(vec![PluginFormat::Clap]);
        session.handle(Message::Name("/poison.clap".into()));
        assert_eq!(session.worker_lost(5), CrashOutcome::Relaunch { rearm: None });
        session.worker_launched();
        session.handle(Message::Name("/poison.clap".into()));
        assert_eq!(
            session.worker_lost(5),
            CrashOutcome::Relaunch {
                rearm: Some("/poison.clap".into())
            }
        );
    }

    #[test]
    fn crashes_without_progress_exhaust_relaunches() {
        let mut session = launched(vec![PluginFormat::Clap]);
        assert_eq!(session.worker_lost(2), CrashOutcome::Relaunch { rearm: None });
        session.worker_launched();
        assert_eq!(session.worker_lost(2), CrashOutcome::Relaunch { rearm: None });
        session.worker_launched();
        assert!(matches!(session.worker_lost(2), CrashOutcome::GiveUp { .. }));
        assert!(!session.is_running());
        assert_eq!(session.state(), ScanState::Idle);
    }

    #[test]
    fn giving_up_still_rearms_a_repeat_offender() {
        let mut session = launched(vec![PluginFormat::Clap]);
        session.handle(Message::Name("/poison.clap".into()));
        assert_eq!(session.worker_lost(1), CrashOutcome::Relaunch { rearm: None });
        session.worker_launched();
        session.handle(Message::Name("/poison.clap".into()));
        match session.worker_lost(1) {
            CrashOutcome::GiveUp { reason, rearm } => {
                assert_eq!(rearm.as_deref(), Some("/poison.clap"));
                assert!(reason.contains("/poison.clap"), "{reason}");
            }
            other => panic!("expected to give up, got {other:?}"),
        }
        assert!(!session.is_running());
    }

    #[test]
    fn progress_resets_crash_budget() {
        let mut session = launched(vec![PluginFormat::Clap]);
        assert_eq!(session.worker_lost(1), CrashOutcome::Relaunch { rearm: None });
        session.worker_launched();
        session.handle(Message::Progress(0.1));
        assert_eq!(session.worker_lost(1), CrashOutcome::Relaunch { rearm: None });
    }
}
