use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use harmoniq_plugin_db::{
    find_candidates, CrashMarker, PluginFormat, PluginKey, PluginList, PluginStore, StoreError,
};
use tracing::{debug, error, info, warn};

use crate::config::ScannerConfig;
use crate::events::{ScanEvent, Subscribers, Subscription, SubscriptionId};
use crate::master::ScanMaster;

/// Host facing entry point: owns the user's plugin list and runs scans in a
/// supervised worker process.
///
/// Subscribers see the worker's notifications unchanged except for
/// [`ScanEvent::Finished`], which is held back until the scan results have
/// been loaded into [`PluginScanner::plugin_list`]. It is followed by
/// [`ScanEvent::PluginListChanged`] once the list was reloaded.
#[derive(Debug)]
pub struct PluginScanner {
    config: Arc<ScannerConfig>,
    store: Arc<PluginStore>,
    subscribers: Arc<Subscribers>,
    master: ScanMaster,
}

impl PluginScanner {
    /// Opens the user list and blacklists whatever a crashed scan left in the
    /// crash marker.
    pub fn new(config: ScannerConfig) -> Result<Self, StoreError> {
        let store = PluginStore::open(&config.user_list)?;
        let dead = store.apply_crash_marker(&CrashMarker::new(&config.crash_marker))?;
        if !dead.is_empty() {
            warn!(?dead, "blacklisted plugins left over from a crashed scan");
        }
        let config = Arc::new(config);
        let store = Arc::new(store);
        let subscribers = Arc::<Subscribers>::default();
        let master = ScanMaster::new(Arc::clone(&config), Arc::clone(&store));

        let forward = Forwarder {
            config: Arc::clone(&config),
            store: Arc::clone(&store),
            subscribers: Arc::clone(&subscribers),
        };
        let events = master.subscribe();
        thread::spawn(move || forward.run(events));

        Ok(Self {
            config,
            store,
            subscribers,
            master,
        })
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Starts scanning `formats`, or every format when empty. Returns `false`
    /// when the worker could not be launched.
    pub fn start_scan(&self, formats: &[PluginFormat]) -> bool {
        self.master.start_scan(formats)
    }

    /// Stops a running scan. Safe to call when idle.
    pub fn cancel(&self) {
        self.master.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.master.is_running()
    }

    pub fn progress(&self) -> Option<f32> {
        self.master.progress()
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribers.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Snapshot of the merged plugin list and blacklist.
    pub fn plugin_list(&self) -> PluginList {
        self.store.list()
    }

    pub fn store(&self) -> &PluginStore {
        &self.store
    }

    /// Allows a blacklisted plugin to be probed again by the next scan.
    pub fn remove_blacklisted(&self, identifier: &str) -> Result<(), StoreError> {
        self.store.remove_blacklisted(identifier)
    }

    /// Candidates on disk that were neither described nor blacklisted yet.
    /// Nothing is loaded to find them.
    pub fn unverified_plugins(&self, format: PluginFormat) -> Vec<PluginKey> {
        let list = self.store.list();
        let known: BTreeSet<&str> = list
            .descriptions_for(format)
            .map(|description| description.identifier())
            .collect();
        find_candidates(format, &self.config.search)
            .into_iter()
            .map(|path| path.display().to_string())
            .filter(|identifier| {
                !known.contains(identifier.as_str()) && !list.is_blacklisted(identifier)
            })
            .map(|identifier| PluginKey::new(format, identifier))
            .collect()
    }
}

struct Forwarder {
    config: Arc<ScannerConfig>,
    store: Arc<PluginStore>,
    subscribers: Arc<Subscribers>,
}

impl Forwarder {
    /// Relays every scan of the master until its last supervision thread is
    /// gone.
    fn run(self, events: Subscription) {
        while let Ok(event) = events.receiver().recv() {
            match event {
                ScanEvent::Finished => {
                    let changed = self.reload();
                    self.subscribers.dispatch([ScanEvent::Finished]);
                    if changed {
                        self.subscribers.dispatch([ScanEvent::PluginListChanged]);
                    }
                }
                other => self.subscribers.dispatch([other]),
            }
        }
        debug!("scan event forwarding stopped");
    }

    fn reload(&self) -> bool {
        if let Err(err) = self.store.reload_from(&self.config.list_file) {
            error!(%err, "keeping previous plugin list");
            return false;
        }
        if let Err(err) = self.store.save() {
            error!(%err, "failed to save plugin list");
        }
        info!(plugins = self.store.list().len(), "plugin list reloaded");
        true
    }
}
