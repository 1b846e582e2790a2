//! Scripted stand-in for the scan worker used by the integration tests.
//!
//! The script holds one worker session per launch, separated by `---` lines.
//! Every launch plays the first session and writes the remaining ones back,
//! so a relaunched worker continues with the next session.

use std::fs;
use std::io::{self, Stdin, Stdout};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use harmoniq_plugin_db::{
    read_list, write_list, CrashMarker, PluginFormat, PluginList, PluginMetadata,
};
use harmoniq_plugin_scanner::ipc::{IpcError, IpcTransport, Message, WorkerState};
use harmoniq_plugin_scanner::WorkerConfig;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, value_name = "FILE")]
    script: PathBuf,
}

struct Session {
    transport: IpcTransport<Stdin, Stdout>,
    config: WorkerConfig,
    list: PluginList,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let Some(commands) = take_session(&args.script)? else {
        // Out of script: behave like a worker that dies on startup.
        process::exit(3);
    };

    let mut session = Session {
        transport: IpcTransport::new(io::stdin(), io::stdout()),
        config: WorkerConfig::from_env(),
        list: PluginList::new(),
    };
    for line in commands {
        let (command, argument) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        match command {
            "ready" => {
                session.load()?;
                session.send(Message::State(WorkerState::Ready))?;
                if !session.wait_for_scan()? {
                    return Ok(());
                }
            }
            "scanning" => session.send(Message::State(WorkerState::Scanning))?,
            "name" => session.send(Message::Name(argument.to_owned()))?,
            "progress" => session.send(Message::Progress(argument.parse()?))?,
            "probe" => {
                let (format, identifier) = argument
                    .split_once(' ')
                    .context("probe needs a format and an identifier")?;
                let format: PluginFormat = format.parse()?;
                session.send(Message::Name(identifier.to_owned()))?;
                session.list.add(stub(identifier).into_description(format, identifier));
                session.persist()?;
            }
            "fail" => {
                session.send(Message::Name(argument.to_owned()))?;
                session.list.add_blacklisted(argument);
                session.persist()?;
            }
            "arm" => CrashMarker::new(&session.config.crash_marker).arm(argument)?,
            "pidfile" => fs::write(argument, process::id().to_string())?,
            "send" => session.transport.send_frame(argument.as_bytes())?,
            "crash" => process::abort(),
            "hang" => loop {
                thread::sleep(Duration::from_secs(1));
            },
            "wait" => {
                session.wait_for_quit();
                return Ok(());
            }
            "finished" => {
                session.persist()?;
                session.send(Message::State(WorkerState::Finished))?;
                session.wait_for_quit();
                return Ok(());
            }
            "exit" => return Ok(()),
            other => bail!("unknown script command {other:?}"),
        }
    }
    Ok(())
}

/// Removes the first session from `path` and returns its commands.
fn take_session(path: &Path) -> Result<Option<Vec<String>>> {
    let script = fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))?;
    let mut sessions = script.split("\n---\n");
    let Some(first) = sessions.next().filter(|session| !session.trim().is_empty()) else {
        return Ok(None);
    };
    let rest: Vec<&str> = sessions.collect();
    fs::write(path, rest.join("\n---\n"))?;
    Ok(Some(
        first
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned)
            .collect(),
    ))
}

fn stub(identifier: &str) -> PluginMetadata {
    PluginMetadata {
        id: identifier.to_owned(),
        name: identifier.trim_start_matches('/').to_owned(),
        vendor: Some("Fake".into()),
        category: None,
        version: None,
        description: None,
        is_instrument: false,
        has_editor: false,
        num_inputs: 0,
        num_outputs: 2,
    }
}

impl Session {
    fn load(&mut self) -> Result<()> {
        self.list = read_list(&self.config.list_file).unwrap_or_default();
        CrashMarker::new(&self.config.crash_marker).apply(&mut self.list)?;
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        write_list(&self.config.list_file, &self.list)?;
        Ok(())
    }

    fn send(&self, message: Message) -> Result<()> {
        self.transport.send(&message)?;
        Ok(())
    }

    /// Returns `false` when the master asked to quit instead.
    fn wait_for_scan(&self) -> Result<bool> {
        loop {
            match self.transport.recv() {
                Ok(Message::Scan(_)) => return Ok(true),
                Ok(Message::Quit) | Err(IpcError::Disconnected) => return Ok(false),
                Ok(_) => {}
                Err(err) if !err.is_fatal() => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn wait_for_quit(&self) {
        loop {
            match self.transport.recv() {
                Ok(Message::Quit) => return,
                Err(err) if err.is_fatal() => return,
                _ => {}
            }
        }
    }
}
