//! The top-level RIME object: filesystem registry, device model, event broker,
//! background execution and the subset state machine.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use itertools::Itertools;
use tokio::sync::broadcast;

use crate::anonymise::{Anonymiser, NameAnonymiser};
use crate::config::Config;
use crate::contact::{Contact, GlobalContactId};
use crate::errors::{subset_error_code, CreateSubsetError, RimeError, SubsetErrorCode};
use crate::event::{Event, MediaData};
use crate::filesystem::{DeviceFilesystem, FilesystemRegistry};
use crate::filter::{ContactsFilter, EventsFilter, ProvidersFilter};
use crate::merge::{merge_contacts, MergedContact};
use crate::metadata::FsMetadata;
use crate::provider::{find_providers, DeviceContext, Provider};
use crate::session::Session;
use crate::subset::Subsetter;
use crate::utils::*;

/// A backup bound to its providers. Devices are created lazily per executor and are
/// not shared across threads; the registry and session store behind them are.
pub struct Device {
    pub id: String,
    pub fs: Arc<dyn DeviceFilesystem>,
    pub providers: HashMap<String, Box<dyn Provider>>,
    pub context: DeviceContext,
    metadata: Arc<FsMetadata>,
    session: Arc<Session>,
}

impl Device {
    fn new(id: &str, fs: Arc<dyn DeviceFilesystem>, session: Arc<Session>) -> Result<Device> {
        let metadata = Arc::new(FsMetadata::new());
        let providers = find_providers(&fs, &metadata)?;
        Ok(Device {
            id: id.to_owned(),
            fs,
            providers,
            context: DeviceContext::new(id),
            metadata,
            session,
        })
    }

    pub fn reload_providers(&mut self) -> EmptyRes {
        self.providers = find_providers(&self.fs, &self.metadata)?;
        Ok(())
    }

    pub fn country_code(&self) -> String {
        self.session.get_device_country_code(&self.id)
    }

    pub fn set_country_code(&self, country_code: &str) -> EmptyRes {
        self.session.set_device_country_code(&self.id, country_code)
    }

    pub fn is_subset(&self) -> bool {
        self.fs.is_subset_filesystem()
    }

    pub fn is_locked(&self) -> bool {
        self.fs.is_locked()
    }

    pub fn lock(&self, locked: bool) -> EmptyRes {
        self.fs.lock(locked)
    }

    pub fn is_encrypted(&self) -> bool {
        self.fs.as_encrypted().map(|fs| fs.is_encrypted()).unwrap_or(false)
    }

    /// Decrypts the backup and reloads providers so they see the cleartext.
    pub fn decrypt(&mut self, passphrase: &str) -> EmptyRes {
        let encrypted = self.fs.as_encrypted()
            .ok_or_else(|| RimeError::NotEncryptedDeviceType(self.id.clone()))?;
        encrypted.decrypt(passphrase)?;
        self.reload_providers()
    }
}

/// Published when the background subsetter finishes, successfully or not.
#[derive(Debug, Clone)]
pub struct SubsetComplete {
    pub success: bool,
    pub device_ids: Vec<String>,
    pub error_code: SubsetErrorCode,
    pub error_message: Option<String>,
}

/// Bounded broadcast channel per event name; publishing never blocks, slow
/// subscribers lag and lose the oldest events.
pub struct EventBroker {
    device_list_updated: broadcast::Sender<()>,
    subset_complete: broadcast::Sender<SubsetComplete>,
}

const BROKER_QUEUE_DEPTH: usize = 64;

impl EventBroker {
    fn new() -> Self {
        EventBroker {
            device_list_updated: broadcast::channel(BROKER_QUEUE_DEPTH).0,
            subset_complete: broadcast::channel(BROKER_QUEUE_DEPTH).0,
        }
    }

    pub fn subscribe_device_list_updated(&self) -> broadcast::Receiver<()> {
        self.device_list_updated.subscribe()
    }

    pub fn subscribe_subset_complete(&self) -> broadcast::Receiver<SubsetComplete> {
        self.subset_complete.subscribe()
    }

    pub fn publish_device_list_updated(&self) {
        let _ = self.device_list_updated.send(());
    }

    pub fn publish_subset_complete(&self, outcome: SubsetComplete) {
        let _ = self.subset_complete.send(outcome);
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// One worker thread; subset operations are serialised on it, and SQLite
/// connections it opens never leave it.
struct BackgroundExecutor {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundExecutor {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = std::thread::Builder::new()
            .name("rime-background".to_owned())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("Cannot spawn background worker");

        BackgroundExecutor {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    fn submit(&self, job: Job) -> EmptyRes {
        let tx = self.tx.lock().unwrap();
        tx.as_ref()
            .context("Background executor is shut down")?
            .send(job)
            .map_err(|_| anyhow!("Background executor is gone"))
    }
}

impl Drop for BackgroundExecutor {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain pending jobs and exit.
        self.tx.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

/// Per-executor device cache, reconciled against the registry on demand.
#[derive(Default)]
pub struct DeviceCache {
    devices: HashMap<String, Device>,
}

impl DeviceCache {
    pub fn new() -> Self {
        Default::default()
    }

    fn device<'a>(&'a mut self, rime: &Rime, device_id: &str) -> Result<&'a mut Device> {
        if !self.devices.contains_key(device_id) {
            let fs = rime.registry.read().unwrap().get(device_id)
                .ok_or_else(|| RimeError::DeviceNotFound(device_id.to_owned()))?;
            let device = Device::new(device_id, fs, Arc::clone(&rime.session))?;
            self.devices.insert(device_id.to_owned(), device);
        }
        Ok(self.devices.get_mut(device_id).unwrap())
    }

    /// Drops cached devices that no longer exist in (or changed identity within)
    /// the registry.
    pub fn reconcile(&mut self, rime: &Rime) {
        let registry = rime.registry.read().unwrap();
        self.devices.retain(|id, device| {
            matches!(registry.get(id), Some(fs) if Arc::ptr_eq(&fs, &device.fs))
        });
    }

    pub fn evict(&mut self, device_id: &str) {
        self.devices.remove(device_id);
    }
}

#[derive(Debug, Clone)]
pub struct SubsetTarget {
    pub old_device_id: String,
    pub new_device_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct EventsResult {
    pub device_ids: Vec<String>,
    pub provider_names: Vec<String>,
    pub events: Vec<Event>,
}

pub struct ContactsResult {
    pub contacts: Vec<Contact>,
    pub merged_contacts: Vec<MergedContact>,
}

pub struct Rime {
    pub config: Config,
    registry: RwLock<FilesystemRegistry>,
    session: Arc<Session>,
    broker: EventBroker,
    background: BackgroundExecutor,
    name_anonymisers: Mutex<Vec<Box<dyn NameAnonymiser>>>,
}

impl Rime {
    pub fn create(config: Config) -> Result<Arc<Rime>> {
        crate::sql::ensure_threadsafe()?;

        let registry = FilesystemRegistry::new(&config.base_path, config.passphrases.clone());
        let session = Arc::new(Session::open(&config.session_database)?);

        Ok(Arc::new(Rime {
            config,
            registry: RwLock::new(registry),
            session,
            broker: EventBroker::new(),
            background: BackgroundExecutor::new(),
            name_anonymisers: Mutex::new(vec![]),
        }))
    }

    pub fn broker(&self) -> &EventBroker {
        &self.broker
    }

    /// Registers a pluggable name anonymiser used by anonymising subsets.
    pub fn add_name_anonymiser(&self, plugin: Box<dyn NameAnonymiser>) {
        self.name_anonymisers.lock().unwrap().push(plugin);
    }

    pub fn rescan_devices(&self) {
        self.registry.write().unwrap().rescan();
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.registry.read().unwrap().device_ids()
    }

    pub fn has_device(&self, device_id: &str) -> bool {
        self.registry.read().unwrap().contains(device_id)
    }

    pub fn media_url(&self, contact_or_media_id: &str) -> String {
        format!("{}{}", self.config.media_url_prefix, contact_or_media_id)
    }

    pub fn provider_names(&self, cache: &mut DeviceCache, device_ids: &[String],
                          filter: &ProvidersFilter) -> Result<Vec<String>> {
        let mut names = vec![];
        for device_id in device_ids {
            let device = cache.device(self, device_id)?;
            names.extend(device.providers.keys()
                .filter(|name| filter.matches(name))
                .cloned());
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Cross-device event query. Results are sorted by (timestamp, device id) and
    /// carry their device id and session global ids.
    pub fn events(&self, cache: &mut DeviceCache, device_ids: &[String],
                  filter: &EventsFilter) -> Result<EventsResult> {
        let mut result = EventsResult::default();

        for device_id in device_ids.iter().sorted() {
            let device = cache.device(self, device_id)?;
            if device.is_locked() {
                continue;
            }

            // Providers are visited in name order so result ordering (and tie-breaks
            // in the final sort) is stable across runs.
            for provider_name in device.providers.keys().sorted().cloned().collect_vec() {
                if !filter.accepts_provider(&provider_name) {
                    continue;
                }
                let provider = &device.providers[&provider_name];
                let mut provider_events = filter.apply(
                    provider.search_events(&device.context, filter)?);

                for event in &mut provider_events {
                    event.set_device_id(device_id);
                    if let Event::Message(message) = event {
                        if let Some(session) = &mut message.session {
                            let global_id = format!("{device_id}:{provider_name}:{}", session.local_id);
                            session.global_id = Some(global_id.clone());
                            message.session_id = global_id;
                        }
                    }
                }

                if !provider_events.is_empty() {
                    result.provider_names.push(provider_name.clone());
                }
                result.events.extend(provider_events);
            }
            result.device_ids.push(device_id.clone());
        }

        result.device_ids.sort();
        result.provider_names.sort();
        result.provider_names.dedup();
        // Stable sort keeps ties in provider order across repeated calls.
        result.events.sort_by(|a, b| {
            (a.timestamp(), a.device_id()).cmp(&(b.timestamp(), b.device_id()))
        });
        Ok(result)
    }

    pub fn contacts(&self, cache: &mut DeviceCache, device_ids: &[String],
                    filter: &ContactsFilter) -> Result<ContactsResult> {
        let mut all_contacts = vec![];
        let mut country_codes: HashMap<String, String> = HashMap::new();

        for device_id in device_ids.iter().sorted() {
            let device = cache.device(self, device_id)?;
            if device.is_locked() {
                continue;
            }
            country_codes.insert(device_id.clone(), device.country_code());
            for provider_name in device.providers.keys().sorted().cloned().collect_vec() {
                all_contacts.extend(device.providers[&provider_name].search_contacts(filter)?);
            }
        }

        let merged_contacts = merge_contacts(all_contacts.clone(), |device_id| {
            country_codes.get(device_id).cloned()
                .unwrap_or_else(|| crate::session::DEFAULT_COUNTRY_CODE.to_owned())
        });

        Ok(ContactsResult { contacts: all_contacts, merged_contacts })
    }

    /// Resolves `device:provider:local` (the local id may contain slashes) to an
    /// open media stream.
    pub fn get_media(&self, cache: &mut DeviceCache, media_id: &str) -> Result<MediaData> {
        let id = GlobalContactId::from_string(media_id)?;
        let device = cache.device(self, &id.device_id)?;
        let provider = device.providers.get(&id.provider_name)
            .with_context(|| format!("No provider {} on device {}", id.provider_name, id.device_id))?;
        provider.get_media(&id.local_id)
    }

    pub fn decrypt_device(&self, cache: &mut DeviceCache, device_id: &str,
                          passphrase: &str) -> EmptyRes {
        cache.device(self, device_id)?.decrypt(passphrase)
    }

    pub fn delete_device(&self, cache: &mut DeviceCache, device_id: &str) -> Result<bool> {
        let deleted = {
            let mut registry = self.registry.write().unwrap();
            match registry.delete(device_id) {
                Ok(()) => true,
                Err(e) if e.downcast_ref::<RimeError>()
                    == Some(&RimeError::DeviceNotFound(device_id.to_owned())) => false,
                Err(e) => return Err(e),
            }
        };
        cache.evict(device_id);
        if deleted {
            self.broker.publish_device_list_updated();
        }
        Ok(deleted)
    }

    /// Queues a subset operation on the background executor and returns at once;
    /// completion is announced on the broker as `subset_complete` followed by
    /// `device_list_updated`.
    pub fn create_subset(self: &Arc<Self>, targets: Vec<SubsetTarget>,
                         events_filter: EventsFilter, contacts_filter: ContactsFilter,
                         anonymise: bool) -> EmptyRes {
        let rime = Arc::clone(self);
        self.background.submit(Box::new(move || {
            rime.run_subset_task(&targets, &events_filter, &contacts_filter, anonymise);
        }))
    }

    fn run_subset_task(self: &Arc<Self>, targets: &[SubsetTarget], events_filter: &EventsFilter,
                       contacts_filter: &ContactsFilter, anonymise: bool) {
        let mut cache = DeviceCache::new();
        let new_device_ids = targets.iter().map(|t| t.new_device_id.clone()).collect_vec();

        let mut created: Vec<String> = vec![];
        let result = self.run_subset(&mut cache, targets, events_filter, contacts_filter,
                                     anonymise, &mut created);

        match result {
            Ok(()) => {
                self.broker.publish_subset_complete(SubsetComplete {
                    success: true,
                    device_ids: new_device_ids,
                    error_code: SubsetErrorCode::None,
                    error_message: None,
                });
            }
            Err(e) => {
                log::error!("Subset failed: {e:#}");
                // Remove whatever was part-built so a retry starts clean. Only the
                // devices this run created, never a pre-existing target.
                for device_id in &created {
                    let mut registry = self.registry.write().unwrap();
                    if let Err(delete_error) = registry.delete(device_id) {
                        log::warn!("Cannot remove partial subset {device_id}: {delete_error}");
                    }
                }
                self.broker.publish_subset_complete(SubsetComplete {
                    success: false,
                    device_ids: new_device_ids,
                    error_code: subset_error_code(&e),
                    error_message: Some(format!("{e:#}")),
                });
            }
        }

        self.rescan_devices();
        self.broker.publish_device_list_updated();
    }

    #[allow(clippy::too_many_arguments)]
    fn run_subset(self: &Arc<Self>, cache: &mut DeviceCache, targets: &[SubsetTarget],
                  events_filter: &EventsFilter, contacts_filter: &ContactsFilter,
                  anonymise: bool, created: &mut Vec<String>) -> EmptyRes {
        // PREPARED: validate ids and create the empty, locked target filesystems.
        let mut prepared: Vec<(SubsetTarget, Arc<dyn DeviceFilesystem>)> = vec![];
        for target in targets {
            if !crate::filesystem::registry::is_valid_device_id(&target.new_device_id) {
                bail!(CreateSubsetError::name_invalid(&target.new_device_id));
            }
            if self.has_device(&target.new_device_id) {
                bail!(CreateSubsetError::name_exists(&target.new_device_id));
            }

            let source_fs = self.registry.read().unwrap().get(&target.old_device_id)
                .ok_or_else(|| RimeError::DeviceNotFound(target.old_device_id.clone()))?;
            let new_fs = self.registry.write().unwrap()
                .create_empty_subset_of(&source_fs, &target.new_device_id, true)?;
            created.push(target.new_device_id.clone());
            prepared.push((target.clone(), new_fs));
        }

        // One anonymisation map per subset operation, so substitutions agree across
        // all target devices.
        let name_anonymisers = self.name_anonymisers.lock().unwrap();
        let mut anonymiser = anonymise.then(|| Anonymiser::new(&name_anonymisers));

        for (target, new_fs) in prepared {
            // POPULATING: run each provider's subset over the filtered material.
            self.populate_subset(cache, &target.old_device_id, Arc::clone(&new_fs),
                                 events_filter, contacts_filter)?;

            // ANONYMISING: apply the declared PII fields in place, before unlock.
            if let Some(anonymiser) = &mut anonymiser {
                let source_device = cache.device(self, &target.old_device_id)?;
                let country_code = source_device.country_code();
                for provider in source_device.providers.values() {
                    anonymiser.anonymise_device_provider(new_fs.as_ref(), &country_code,
                                                         provider.as_ref())?;
                }
            }

            // FINALISED: reveal the finished device.
            new_fs.lock(false)?;
        }
        Ok(())
    }

    fn populate_subset(self: &Arc<Self>, cache: &mut DeviceCache, old_device_id: &str,
                       new_fs: Arc<dyn DeviceFilesystem>, events_filter: &EventsFilter,
                       contacts_filter: &ContactsFilter) -> EmptyRes {
        let subsetter = Subsetter::new(new_fs);
        let device = cache.device(self, old_device_id)?;

        for provider_name in device.providers.keys().sorted().cloned().collect_vec() {
            let provider = &device.providers[&provider_name];
            let events = if events_filter.accepts_provider(&provider_name) {
                events_filter.apply(provider.search_events(&device.context, events_filter)?)
            } else {
                vec![]
            };
            let contacts = contacts_filter.apply(provider.search_contacts(contacts_filter)?);
            provider.subset(&subsetter, &events, &contacts)?;
        }
        Ok(())
    }

    /// Watches the devices base path and publishes `device_list_updated` whenever
    /// the set of recognised devices changes. Errors are logged and the loop goes on.
    pub async fn watch_devices(self: Arc<Self>, poll_interval: Duration) {
        let mut known = self.device_ids();
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let rime = Arc::clone(&self);
            let current = tokio::task::spawn_blocking(move || {
                rime.rescan_devices();
                rime.device_ids()
            }).await;

            match current {
                Ok(current) => {
                    if current != known {
                        log::info!("Device list changed: {current:?}");
                        known = current;
                        self.broker.publish_device_list_updated();
                    }
                }
                Err(e) => log::warn!("Device watcher iteration failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
#[path = "rime_tests.rs"]
mod tests;
