use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, TryRecvError};
use harmoniq_plugin_db::{
    find_candidates, is_up_to_date, read_list, write_list, CrashMarker, PluginFormat, PluginKey,
    PluginList, PluginProber,
};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::ipc::{spawn_reader, Inbound, IpcTransport, Message, WorkerState};

/// Why the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The master asked us to quit.
    Quit,
    /// The channel to the master is gone.
    Disconnected,
}

enum Halt {
    Exit(WorkerExit),
    Error(anyhow::Error),
}

impl From<anyhow::Error> for Halt {
    fn from(err: anyhow::Error) -> Self {
        Halt::Error(err)
    }
}

/// Runs the worker side of the scan protocol over `reader`/`writer` until
/// the master says `quit` or goes away.
pub fn run<P, R, W>(config: WorkerConfig, prober: P, reader: R, writer: W) -> Result<WorkerExit>
where
    P: PluginProber,
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let transport = IpcTransport::new(reader, writer);
    let inbox = spawn_reader(transport.clone(), "scan master");
    let mut worker = Worker {
        marker: CrashMarker::new(&config.crash_marker),
        list: PluginList::new(),
        config,
        prober,
        transport,
        inbox,
    };
    match worker.serve() {
        Ok(()) => Ok(WorkerExit::Disconnected),
        Err(Halt::Exit(exit)) => {
            info!(?exit, "scan worker stopping");
            Ok(exit)
        }
        Err(Halt::Error(err)) => Err(err),
    }
}

struct Worker<P, R: Read + 'static, W: Write + 'static> {
    config: WorkerConfig,
    prober: P,
    transport: IpcTransport<R, W>,
    inbox: Receiver<Inbound>,
    marker: CrashMarker,
    list: PluginList,
}

impl<P, R, W> Worker<P, R, W>
where
    P: PluginProber,
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    fn serve(&mut self) -> Result<(), Halt> {
        self.load()?;
        self.send(Message::State(WorkerState::Ready))?;
        loop {
            match self.inbox.recv() {
                Ok(Inbound::Message(Message::Scan(names))) => self.scan(&names)?,
                Ok(Inbound::Message(Message::Quit)) => return Err(Halt::Exit(WorkerExit::Quit)),
                Ok(Inbound::Message(other)) => warn!(message = %other, "unexpected message"),
                Ok(Inbound::Lost) | Err(_) => return Err(Halt::Exit(WorkerExit::Disconnected)),
            }
        }
    }

    /// Builds the starting list: the previous scan results, the host's user
    /// list and whatever a crashed predecessor left in the crash marker.
    fn load(&mut self) -> Result<(), Halt> {
        self.list = read_list(&self.config.list_file).unwrap_or_else(|err| {
            warn!(%err, "starting from an empty scan list");
            PluginList::new()
        });
        if let Some(user_list) = self.config.user_list.as_deref() {
            match read_list(user_list) {
                Ok(known) => self.list.merge(&known),
                Err(err) => warn!(%err, path = %user_list.display(), "ignoring user plugin list"),
            }
        }
        match self.marker.apply(&mut self.list) {
            Ok(dead) if !dead.is_empty() => {
                warn!(?dead, "blacklisted plugins that crashed the previous scanner");
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "failed to read crash marker"),
        }
        self.persist()?;
        Ok(())
    }

    fn scan(&mut self, names: &[String]) -> Result<(), Halt> {
        let formats: Vec<PluginFormat> = names
            .iter()
            .filter_map(|name| match name.parse::<PluginFormat>() {
                Ok(format) => Some(format),
                Err(err) => {
                    warn!(%err, "skipping format");
                    None
                }
            })
            .collect();
        info!(?formats, "scanning");
        self.send(Message::State(WorkerState::Scanning))?;
        for format in formats {
            self.scan_format(format)?;
            self.persist()?;
        }
        self.persist()?;
        self.send(Message::State(WorkerState::Finished))?;
        Ok(())
    }

    fn scan_format(&mut self, format: PluginFormat) -> Result<(), Halt> {
        let candidates = find_candidates(format, &self.config.search);
        debug!(%format, count = candidates.len(), "found candidates");
        if candidates.is_empty() {
            return self.send(Message::Progress(1.0));
        }
        let total = candidates.len();
        for (index, path) in candidates.iter().enumerate() {
            self.poll_inbox()?;
            self.visit(format, path)?;
            self.send(Message::Progress((index + 1) as f32 / total as f32))?;
        }
        Ok(())
    }

    fn visit(&mut self, format: PluginFormat, path: &Path) -> Result<(), Halt> {
        let identifier = path.display().to_string();
        if self.list.is_blacklisted(&identifier) {
            debug!(%identifier, "skipping blacklisted plugin");
            return Ok(());
        }
        self.send(Message::Name(identifier.clone()))?;

        let key = PluginKey::new(format, identifier.clone());
        if let Some(known) = self.list.get(&key) {
            if is_up_to_date(known, path) {
                debug!(%identifier, "already up to date");
                return Ok(());
            }
        }

        self.marker
            .arm(&identifier)
            .with_context(|| format!("failed to arm crash marker for {identifier}"))?;
        let probed = self.prober.probe(format, path);
        self.marker
            .disarm()
            .context("failed to clear crash marker")?;

        match probed {
            Ok(metadata) => {
                self.list.add(metadata.into_description(format, identifier));
            }
            Err(err) => {
                warn!(%identifier, %err, "probe failed, blacklisting");
                self.list.add_blacklisted(identifier);
            }
        }
        self.persist()?;
        Ok(())
    }

    fn poll_inbox(&self) -> Result<(), Halt> {
        loop {
            match self.inbox.try_recv() {
                Ok(Inbound::Message(Message::Quit)) => return Err(Halt::Exit(WorkerExit::Quit)),
                Ok(Inbound::Message(other)) => {
                    warn!(message = %other, "ignoring message while scanning")
                }
                Ok(Inbound::Lost) | Err(TryRecvError::Disconnected) => {
                    return Err(Halt::Exit(WorkerExit::Disconnected))
                }
                Err(TryRecvError::Empty) => return Ok(()),
            }
        }
    }

    fn send(&self, message: Message) -> Result<(), Halt> {
        self.transport.send(&message).map_err(|err| {
            debug!(%err, "lost the scan master");
            Halt::Exit(WorkerExit::Disconnected)
        })
    }

    fn persist(&self) -> Result<(), Halt> {
        write_list(&self.config.list_file, &self.list).with_context(|| {
            format!("failed to write scan list {}", self.config.list_file.display())
        })?;
        Ok(())
    }
}
