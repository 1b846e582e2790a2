use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use harmoniq_plugin_db::{read_list, PluginFormat, PluginStore, ScanConfig};
use harmoniq_plugin_scanner::{
    PluginScanner, ScanEvent, ScanMaster, ScanState, ScannerConfig, Subscription, WorkerCommand,
};
use pretty_assertions::assert_eq;
use tempfile::{tempdir, TempDir};

fn fake_worker_executable() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_harmoniq-plugin-scanner-fake-worker"))
}

/// Writes one worker session per launch into the script file.
fn scripted_config(dir: &Path, sessions: &[&str]) -> ScannerConfig {
    let script = dir.join("worker-script.txt");
    fs::write(&script, sessions.join("\n---\n")).unwrap();
    let mut config = ScannerConfig::in_dir(dir);
    config.worker = WorkerCommand {
        executable: fake_worker_executable(),
        args: vec!["--script".into(), script.display().to_string()],
    };
    config.search = ScanConfig::with_roots(vec![dir.join("plugins")]);
    config.launch_timeout = Duration::from_secs(5);
    config.poll_interval = Duration::from_millis(20);
    config.quit_timeout = Duration::from_secs(2);
    config
}

fn collect_until(events: &Subscription, done: impl Fn(&ScanEvent) -> bool) -> Vec<ScanEvent> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        if let Some(event) = events.recv_timeout(Duration::from_millis(100)) {
            let finished = done(&event);
            seen.push(event);
            if finished {
                return seen;
            }
        }
    }
    panic!("timed out waiting for scan events, got {seen:?}");
}

fn is_terminal(event: &ScanEvent) -> bool {
    matches!(event, ScanEvent::Finished | ScanEvent::Failed(_))
}

fn probes(events: &[ScanEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| match event {
            ScanEvent::ProbeStarted(identifier) => Some(identifier.as_str()),
            _ => None,
        })
        .collect()
}

fn count(events: &[ScanEvent], wanted: &ScanEvent) -> usize {
    events.iter().filter(|event| *event == wanted).count()
}

fn scanner(dir: &TempDir, sessions: &[&str]) -> PluginScanner {
    PluginScanner::new(scripted_config(dir.path(), sessions)).unwrap()
}

fn wait_for_state(master: &ScanMaster, wanted: ScanState, within: Duration) -> Duration {
    let started = Instant::now();
    while master.state() != wanted {
        assert!(
            started.elapsed() < within,
            "still {:?} after {within:?}",
            master.state()
        );
        thread::sleep(Duration::from_millis(10));
    }
    started.elapsed()
}

fn worker_pid(path: &Path) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(pid) = fs::read_to_string(path) {
            if let Ok(pid) = pid.trim().parse() {
                return pid;
            }
        }
        assert!(Instant::now() < deadline, "worker never wrote its pid");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn two_format_scan_reloads_list_once() {
    let dir = tempdir().unwrap();
    let scanner = scanner(
        &dir,
        &["ready
scanning
probe clap /a1
progress 0.33
probe clap /a2
progress 0.66
fail /a3
progress 1
probe vst3 /b1
progress 0.5
probe vst3 /b2
progress 1
finished"],
    );
    let events = scanner.subscribe();
    assert!(scanner.start_scan(&[PluginFormat::Clap, PluginFormat::Vst3]));

    let mut seen = collect_until(&events, |event| *event == ScanEvent::PluginListChanged);
    thread::sleep(Duration::from_millis(200));
    seen.extend(events.receiver().try_iter());

    assert_eq!(probes(&seen), vec!["/a1", "/a2", "/a3", "/b1", "/b2"]);
    assert_eq!(count(&seen, &ScanEvent::Finished), 1);
    assert_eq!(count(&seen, &ScanEvent::PluginListChanged), 1);
    assert!(!seen.iter().any(|event| matches!(event, ScanEvent::Failed(_))));

    let list = scanner.plugin_list();
    let mut identifiers = list.identifiers();
    identifiers.sort_unstable();
    assert_eq!(identifiers, vec!["/a1", "/a2", "/b1", "/b2"]);
    assert!(list.is_blacklisted("/a3"));

    assert!(!scanner.is_running());
    assert_eq!(scanner.progress(), Some(1.0));
    let saved = read_list(&scanner.config().user_list).unwrap();
    assert_eq!(saved, list);
}

#[test]
fn crash_mid_probe_relaunches_and_blacklists_the_culprit() {
    let dir = tempdir().unwrap();
    let scanner = scanner(
        &dir,
        &[
            "ready
scanning
probe clap /a
progress 0.5
name /b
arm /b
crash",
            "ready
scanning
probe clap /c
progress 1
finished",
        ],
    );
    let events = scanner.subscribe();
    assert!(scanner.start_scan(&[PluginFormat::Clap]));
    let seen = collect_until(&events, |event| *event == ScanEvent::PluginListChanged);

    assert_eq!(probes(&seen), vec!["/a", "/b", "/c"]);
    assert_eq!(count(&seen, &ScanEvent::Finished), 1);
    let list = scanner.plugin_list();
    let mut identifiers = list.identifiers();
    identifiers.sort_unstable();
    assert_eq!(identifiers, vec!["/a", "/c"]);
    assert!(list.is_blacklisted("/b"));
}

#[test]
fn hung_worker_is_killed_and_replaced() {
    let dir = tempdir().unwrap();
    let mut config = scripted_config(
        dir.path(),
        &[
            "ready
scanning
name /slow
hang",
            "ready
scanning
probe clap /fast
progress 1
finished",
        ],
    );
    config.launch_timeout = Duration::from_millis(500);
    let scanner = PluginScanner::new(config).unwrap();
    let events = scanner.subscribe();
    assert!(scanner.start_scan(&[PluginFormat::Clap]));
    let seen = collect_until(&events, is_terminal);

    assert_eq!(seen.last(), Some(&ScanEvent::Finished));
    assert_eq!(probes(&seen), vec!["/slow", "/fast"]);
    let list = scanner.plugin_list();
    assert_eq!(list.identifiers(), vec!["/fast"]);
}

#[test]
fn repeated_crashes_without_progress_fail_the_scan() {
    let dir = tempdir().unwrap();
    let mut config = scripted_config(dir.path(), &["crash", "crash", "crash"]);
    config.max_relaunches = 2;
    let scanner = PluginScanner::new(config).unwrap();
    let events = scanner.subscribe();
    assert!(scanner.start_scan(&[PluginFormat::Clap]));
    let seen = collect_until(&events, is_terminal);

    assert!(matches!(seen.last(), Some(ScanEvent::Failed(_))));
    assert_eq!(count(&seen, &ScanEvent::Finished), 0);
    assert!(!scanner.is_running());
}

#[test]
fn same_plugin_crashing_twice_gets_blacklisted_by_the_supervisor() {
    let dir = tempdir().unwrap();
    let scanner = scanner(
        &dir,
        &[
            "ready
scanning
name /poison
crash",
            "ready
scanning
name /poison
crash",
            "ready
scanning
probe clap /ok
progress 1
finished",
        ],
    );
    let events = scanner.subscribe();
    assert!(scanner.start_scan(&[PluginFormat::Clap]));
    let seen = collect_until(&events, is_terminal);

    assert_eq!(seen.last(), Some(&ScanEvent::Finished));
    let list = scanner.plugin_list();
    assert!(list.is_blacklisted("/poison"));
    assert_eq!(list.identifiers(), vec!["/ok"]);
}

#[test]
fn malformed_messages_are_ignored() {
    let dir = tempdir().unwrap();
    let scanner = scanner(
        &dir,
        &["ready
scanning
send bogus:payload
send progress:abc
probe clap /a
progress 1
finished"],
    );
    let events = scanner.subscribe();
    assert!(scanner.start_scan(&[PluginFormat::Clap]));
    let seen = collect_until(&events, is_terminal);

    assert_eq!(seen.last(), Some(&ScanEvent::Finished));
    assert_eq!(scanner.plugin_list().identifiers(), vec!["/a"]);
}

#[test]
fn unlaunchable_worker_fails_start() {
    let dir = tempdir().unwrap();
    let mut config = scripted_config(dir.path(), &[]);
    config.worker.executable = dir.path().join("no-such-worker");
    let scanner = PluginScanner::new(config).unwrap();
    assert!(!scanner.start_scan(&[PluginFormat::Clap]));
    assert!(!scanner.is_running());
    assert_eq!(scanner.progress(), None);
}

#[test]
fn cancel_when_idle_does_nothing() {
    let dir = tempdir().unwrap();
    let scanner = scanner(&dir, &[]);
    let events = scanner.subscribe();
    scanner.cancel();
    scanner.cancel();
    assert!(!scanner.is_running());
    assert_eq!(events.recv_timeout(Duration::from_millis(100)), None);
}

#[test]
fn cancel_stops_a_running_worker() {
    let dir = tempdir().unwrap();
    let config = scripted_config(
        dir.path(),
        &["ready
scanning
name /a
wait"],
    );
    let store = Arc::new(PluginStore::open(&config.user_list).unwrap());
    let master = ScanMaster::new(Arc::new(config), store);
    let events = master.subscribe();

    assert!(master.start_scan(&[PluginFormat::Clap]));
    collect_until(&events, |event| matches!(event, ScanEvent::ProbeStarted(_)));
    assert!(master.is_running());
    assert_eq!(master.current_plugin().as_deref(), Some("/a"));
    // A second request while scanning is accepted without a new worker.
    assert!(master.start_scan(&[PluginFormat::Clap]));

    master.cancel();
    assert!(!master.is_running());
    let deadline = Instant::now() + Duration::from_secs(10);
    while master.state() != ScanState::Idle {
        assert!(Instant::now() < deadline, "worker did not quit");
        thread::sleep(Duration::from_millis(20));
    }
    thread::sleep(Duration::from_millis(100));
    let rest: Vec<_> = events.receiver().try_iter().collect();
    assert!(!rest.iter().any(is_terminal), "unexpected {rest:?}");
}

#[test]
fn worker_ignoring_quit_is_killed_after_the_grace_period() {
    let dir = tempdir().unwrap();
    let pidfile = dir.path().join("worker.pid");
    let session = format!(
        "ready
scanning
pidfile {}
name /a
hang",
        pidfile.display()
    );
    let mut config = scripted_config(dir.path(), &[&session]);
    config.launch_timeout = Duration::from_secs(30);
    config.quit_timeout = Duration::from_millis(300);
    let store = Arc::new(PluginStore::open(&config.user_list).unwrap());
    let master = ScanMaster::new(Arc::new(config), store);
    let events = master.subscribe();

    assert!(master.start_scan(&[PluginFormat::Clap]));
    collect_until(&events, |event| matches!(event, ScanEvent::ProbeStarted(_)));
    let pid = worker_pid(&pidfile);

    master.cancel();
    let took = wait_for_state(&master, ScanState::Idle, Duration::from_secs(5));
    assert!(took >= Duration::from_millis(250), "quit was not awaited: {took:?}");
    assert!(!master.is_running());
    if cfg!(target_os = "linux") {
        assert!(
            !Path::new(&format!("/proc/{pid}")).exists(),
            "worker {pid} is still around"
        );
    }
    let rest: Vec<_> = events.receiver().try_iter().collect();
    assert!(!rest.iter().any(is_terminal), "unexpected {rest:?}");
}

#[test]
fn starting_after_cancel_does_not_wait_for_teardown() {
    let dir = tempdir().unwrap();
    let mut config = scripted_config(
        dir.path(),
        &[
            "ready
scanning
name /a
hang",
            "ready
scanning
probe clap /b
progress 1
finished",
        ],
    );
    config.launch_timeout = Duration::from_secs(30);
    config.quit_timeout = Duration::from_secs(2);
    let scanner = Arc::new(PluginScanner::new(config).unwrap());
    let events = scanner.subscribe();

    assert!(scanner.start_scan(&[PluginFormat::Clap]));
    collect_until(&events, |event| matches!(event, ScanEvent::ProbeStarted(_)));
    scanner.cancel();

    let started = Instant::now();
    assert!(scanner.start_scan(&[PluginFormat::Clap]));
    assert!(
        started.elapsed() < Duration::from_millis(1000),
        "start_scan blocked for {:?}",
        started.elapsed()
    );

    let observer = {
        let scanner = Arc::clone(&scanner);
        thread::spawn(move || {
            let started = Instant::now();
            let running = scanner.is_running();
            let progress = scanner.progress();
            (running, progress, started.elapsed())
        })
    };
    let (running, progress, took) = observer.join().unwrap();
    assert!(running);
    assert_eq!(progress, None);
    assert!(took < Duration::from_millis(500), "is_running blocked for {took:?}");

    let seen = collect_until(&events, is_terminal);
    assert_eq!(seen.last(), Some(&ScanEvent::Finished));
    assert_eq!(probes(&seen), vec!["/b"]);
    assert_eq!(scanner.plugin_list().identifiers(), vec!["/b"]);
    assert!(!scanner.is_running());
}

#[test]
fn restart_while_the_old_worker_quits_launches_a_new_one() {
    let dir = tempdir().unwrap();
    let mut config = scripted_config(
        dir.path(),
        &[
            "ready
scanning
name /a
hang",
            "ready
scanning
probe clap /b
progress 1
finished",
        ],
    );
    config.launch_timeout = Duration::from_secs(30);
    config.quit_timeout = Duration::from_millis(500);
    let store = Arc::new(PluginStore::open(&config.user_list).unwrap());
    let master = ScanMaster::new(Arc::new(config), store);
    let events = master.subscribe();

    assert!(master.start_scan(&[PluginFormat::Clap]));
    collect_until(&events, |event| matches!(event, ScanEvent::ProbeStarted(_)));
    master.cancel();
    assert!(!master.is_running());
    assert_eq!(master.state(), ScanState::Quitting);

    assert!(master.start_scan(&[PluginFormat::Clap]));
    assert!(master.is_running());
    let seen = collect_until(&events, is_terminal);
    assert_eq!(seen.last(), Some(&ScanEvent::Finished));
    assert_eq!(probes(&seen), vec!["/b"]);
    wait_for_state(&master, ScanState::Finished, Duration::from_secs(5));
}
