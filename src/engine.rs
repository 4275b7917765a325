//! FoilPics - Vault Engine
//!
//! The facade owning the catalog, the key handles, the worker pool and the
//! observer notification queue. All mutation happens on the thread calling
//! the public operations; background tasks report back over a single event
//! channel drained here, so the observer always sees a coherent, eventually
//! consistent picture.

use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::SecretString;

use crate::catalog::{Catalog, Entry, VaultOrder};
use crate::config::{self, EngineConfig};
use crate::error::{VaultError, VaultResult};
use crate::keystore::{KeyFileState, KeyPair, KeyStore};
use crate::media::{MagicMimeProbe, MimeProbe};
use crate::observer::{
    ImageRequest, NullObserver, NullSourceCleanup, NullThumbnailSink, Role, SourceCleanup,
    ThumbnailSink, VaultObserver,
};
use crate::pool::{TaskHandle, TaskId, WorkerPool};
use crate::tasks::{self, TaskEvent};

/// Key and vault condition as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoilState {
    KeyMissing,
    KeyInvalid,
    KeyNotEncrypted,
    Locked,
    LockedTimedOut,
    Decrypting,
    GeneratingKey,
    KeyError,
    PicsReady,
}

// The order of constants must match the array in emit_queued_signals()
#[derive(Clone, Copy)]
#[repr(u32)]
enum Signal {
    CountChanged = 0,
    BusyChanged,
    KeyAvailableChanged,
    FoilStateChanged,
    ThumbnailSizeChanged,
    MayHaveEncryptedPicturesChanged,
}

const SIGNAL_COUNT: u32 = 6;

enum InsertMode {
    /// Global lower bound, descending by modification time.
    Sorted,
    /// Preserve the stream order of the reconstruction's ordered pass.
    Append,
    /// Reconstruction leftovers: sorted among themselves, after the
    /// ordered prefix.
    SortedSuffix,
}

/// The vault engine.
///
/// Not `Sync` by design: the catalog, the state machine and the signal
/// queue belong to the single thread driving the public operations.
pub struct PicsEngine {
    cfg: EngineConfig,
    key_store: KeyStore,
    pool: WorkerPool,
    events_tx: Sender<TaskEvent>,
    events_rx: Receiver<TaskEvent>,

    catalog: Catalog,
    foil_state: FoilState,
    keys: Option<KeyPair>,
    may_have_encrypted: bool,
    thumb_size: u32,
    max_decrypted_bytes: u64,
    queued_signals: u32,
    next_task_id: TaskId,
    /// Entries 0..ordered_prefix came from the order file during the
    /// current reconstruction and must keep their stream order.
    ordered_prefix: usize,

    observer: Box<dyn VaultObserver>,
    thumbnail_sink: Box<dyn ThumbnailSink>,
    source_cleanup: Box<dyn SourceCleanup>,
    mime_probe: Arc<dyn MimeProbe>,

    check_task: Option<TaskHandle>,
    save_task: Option<TaskHandle>,
    generate_task: Option<TaskHandle>,
    decrypt_catalog_task: Option<TaskHandle>,
    encrypt_tasks: Vec<TaskHandle>,
    image_request_tasks: Vec<TaskHandle>,
}

impl PicsEngine {
    /// Creates the engine: directories (0700), key probe, worker pool and
    /// the startup vault check.
    pub fn new(cfg: EngineConfig) -> VaultResult<Self> {
        config::create_private_dir(&cfg.pics_dir)?;
        let key_store = KeyStore::open(&cfg.key_dir)?;
        log::debug!("Key file {}", key_store.key_file().display());
        log::debug!("Pics dir {}", cfg.pics_dir.display());

        let foil_state = match key_store.probe() {
            KeyFileState::Missing => FoilState::KeyMissing,
            KeyFileState::NotEncrypted => FoilState::KeyNotEncrypted,
            KeyFileState::Encrypted => FoilState::Locked,
            KeyFileState::Invalid => FoilState::KeyInvalid,
        };

        let (events_tx, events_rx) = mpsc::channel();
        let pool = WorkerPool::new();
        let max_decrypted_bytes = cfg.cache_budget();
        let thumb_size = cfg.thumbnail_size;

        let mut engine = Self {
            cfg,
            key_store,
            pool,
            events_tx,
            events_rx,
            catalog: Catalog::default(),
            foil_state,
            keys: None,
            may_have_encrypted: false,
            thumb_size,
            max_decrypted_bytes,
            queued_signals: 0,
            next_task_id: 0,
            ordered_prefix: 0,
            observer: Box::new(NullObserver),
            thumbnail_sink: Box::new(NullThumbnailSink),
            source_cleanup: Box::new(NullSourceCleanup),
            mime_probe: Arc::new(MagicMimeProbe),
            check_task: None,
            save_task: None,
            generate_task: None,
            decrypt_catalog_task: None,
            encrypt_tasks: Vec::new(),
            image_request_tasks: Vec::new(),
        };

        let id = engine.next_id();
        engine.check_task = Some(tasks::submit_check_vault(
            &engine.pool,
            engine.events_tx.clone(),
            id,
            engine.cfg.pics_dir.clone(),
        ));
        Ok(engine)
    }

    pub fn set_observer(&mut self, observer: Box<dyn VaultObserver>) {
        self.observer = observer;
    }

    pub fn set_thumbnail_sink(&mut self, sink: Box<dyn ThumbnailSink>) {
        self.thumbnail_sink = sink;
    }

    pub fn set_source_cleanup(&mut self, cleanup: Box<dyn SourceCleanup>) {
        self.source_cleanup = cleanup;
    }

    pub fn set_mime_probe(&mut self, probe: Arc<dyn MimeProbe>) {
        self.mime_probe = probe;
    }

    // ======================================================================
    // Read surface
    // ======================================================================

    pub fn count(&self) -> usize {
        self.catalog.len()
    }

    pub fn busy(&self) -> bool {
        self.check_task.is_some()
            || self.save_task.is_some()
            || self.generate_task.is_some()
            || self.decrypt_catalog_task.is_some()
            || !self.encrypt_tasks.is_empty()
            || !self.image_request_tasks.is_empty()
    }

    pub fn key_available(&self) -> bool {
        self.keys.is_some()
    }

    pub fn foil_state(&self) -> FoilState {
        self.foil_state
    }

    pub fn may_have_encrypted_pictures(&self) -> bool {
        self.may_have_encrypted
    }

    pub fn thumbnail_size(&self) -> u32 {
        self.thumb_size
    }

    pub fn entry(&self, index: usize) -> Option<&Entry> {
        self.catalog.get(index)
    }

    pub fn pics_dir(&self) -> &Path {
        &self.cfg.pics_dir
    }

    // ======================================================================
    // Event pump
    // ======================================================================

    /// Drains pending task completions. Called at the start of every public
    /// operation; hosts with an event loop call it whenever the engine
    /// thread is idle.
    pub fn pump(&mut self) {
        while let Ok(ev) = self.events_rx.try_recv() {
            self.handle_event(ev);
            self.emit_queued_signals();
        }
    }

    /// Blocks draining completions until the engine is idle or `timeout`
    /// elapses. Returns whether idle was reached.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if !self.busy() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.events_rx.recv_timeout(deadline - now) {
                Ok(ev) => {
                    self.handle_event(ev);
                    self.emit_queued_signals();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return !self.busy(),
            }
        }
    }

    // ======================================================================
    // Intents
    // ======================================================================

    /// Generates a new key pair, wiping any previous catalog on success.
    /// Only meaningful while there is no usable key.
    pub fn generate_key(&mut self, bits: usize, passphrase: &str) {
        self.pump();
        if !matches!(
            self.foil_state,
            FoilState::KeyMissing | FoilState::KeyInvalid | FoilState::KeyError
        ) {
            return;
        }
        let was_busy = self.busy();
        if let Some(task) = self.generate_task.take() {
            task.release();
        }
        let id = self.next_id();
        self.generate_task = Some(tasks::submit_generate_key(
            &self.pool,
            self.events_tx.clone(),
            id,
            self.key_store.key_file().to_path_buf(),
            bits,
            SecretString::new(passphrase.to_owned()),
        ));
        self.set_foil_state(FoilState::GeneratingKey);
        if self.busy() != was_busy {
            self.queue_signal(Signal::BusyChanged);
        }
        self.emit_queued_signals();
    }

    /// Attempts to unlock the vault. On success the catalog reconstruction
    /// starts in the background and the state moves to `Decrypting`.
    pub fn unlock(&mut self, passphrase: &str) -> bool {
        self.pump();
        if matches!(
            self.foil_state,
            FoilState::PicsReady | FoilState::Decrypting | FoilState::GeneratingKey
        ) {
            return false;
        }
        let was_busy = self.busy();
        let mut ok = false;
        // First make sure that it's encrypted
        match self.key_store.try_unlock("") {
            Ok(_) => {
                log::warn!("Key not encrypted");
                self.set_foil_state(FoilState::KeyNotEncrypted);
            }
            Err(VaultError::WrongPassphrase) => match self.key_store.try_unlock(passphrase) {
                Ok(keys) => {
                    log::debug!("Passphrase accepted, thank you!");
                    self.set_keys(Some(keys.clone()));
                    // Now that we know the key, decrypt the pictures
                    if let Some(task) = self.decrypt_catalog_task.take() {
                        task.release();
                    }
                    self.clear_model();
                    let id = self.next_id();
                    self.decrypt_catalog_task = Some(tasks::submit_decrypt_catalog(
                        &self.pool,
                        self.events_tx.clone(),
                        id,
                        self.cfg.pics_dir.clone(),
                        keys,
                        self.thumb_size,
                    ));
                    self.set_foil_state(FoilState::Decrypting);
                    ok = true;
                }
                Err(VaultError::WrongPassphrase) => {
                    log::debug!("Wrong passphrase");
                    self.set_foil_state(FoilState::Locked);
                }
                Err(VaultError::KeyInvalid(e)) => {
                    log::warn!("Key invalid: {e}");
                    self.set_foil_state(FoilState::KeyInvalid);
                }
                Err(e) => {
                    log::warn!("{e}");
                    self.set_foil_state(FoilState::KeyMissing);
                }
            },
            Err(VaultError::KeyInvalid(e)) => {
                log::warn!("Key invalid: {e}");
                self.set_foil_state(FoilState::KeyInvalid);
            }
            Err(e) => {
                log::warn!("{e}");
                self.set_foil_state(FoilState::KeyMissing);
            }
        }
        if self.busy() != was_busy {
            self.queue_signal(Signal::BusyChanged);
        }
        self.emit_queued_signals();
        ok
    }

    /// Drops the key material and every decrypted byte from memory.
    /// In-flight save/reconstruction/import/image tasks are canceled; the
    /// startup check and a running key generation are left alone.
    pub fn lock(&mut self, timeout: bool) {
        self.pump();
        let was_busy = self.busy();
        if let Some(task) = self.save_task.take() {
            task.release();
        }
        if let Some(task) = self.decrypt_catalog_task.take() {
            task.release();
        }
        for task in self.encrypt_tasks.drain(..) {
            task.release();
        }
        for task in self.image_request_tasks.drain(..) {
            task.release();
        }
        self.clear_model();
        if self.busy() != was_busy {
            self.queue_signal(Signal::BusyChanged);
        }
        if self.keys.is_some() {
            self.set_keys(None);
            self.set_foil_state(if timeout {
                FoilState::LockedTimedOut
            } else {
                FoilState::Locked
            });
            log::debug!("Locked");
        } else {
            log::debug!("Nothing to lock, there's no key yet!");
        }
        self.emit_queued_signals();
    }

    /// True iff the stored key is passphrase-protected and `passphrase`
    /// opens it. Leaves all state untouched.
    pub fn check_password(&mut self, passphrase: &str) -> bool {
        self.pump();
        self.key_store.check_passphrase(passphrase)
    }

    /// Re-encrypts the private key under a new passphrase.
    pub fn change_password(&mut self, old: &str, new: &str) -> bool {
        self.pump();
        if !self.key_store.check_passphrase(old) {
            return false;
        }
        let Some(keys) = &self.keys else {
            return false;
        };
        match self.key_store.change_passphrase(&keys.private, new) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to change passphrase: {e}");
                false
            }
        }
    }

    /// Imports one picture. Returns whether an import task was queued.
    pub fn encrypt_file(&mut self, source: &Path, orientation: i32) -> bool {
        self.pump();
        let Some(keys) = self.keys.clone() else {
            return false;
        };
        let was_busy = self.busy();
        log::debug!("Encrypting {} {orientation}", source.display());
        let id = self.next_id();
        let handle = tasks::submit_encrypt(
            &self.pool,
            self.events_tx.clone(),
            id,
            source.to_path_buf(),
            self.cfg.pics_dir.clone(),
            keys,
            orientation,
            self.thumb_size,
            Arc::clone(&self.mime_probe),
        );
        self.encrypt_tasks.push(handle);
        if self.busy() != was_busy {
            self.queue_signal(Signal::BusyChanged);
        }
        self.emit_queued_signals();
        true
    }

    /// Exports the picture at `index` back to its original path. The vault
    /// copy is destroyed once the export succeeded.
    pub fn decrypt_at(&mut self, index: usize) {
        self.pump();
        log::debug!("{index}");
        self.submit_export_for(index, true);
        self.emit_queued_signals();
    }

    /// Exports every picture, oldest first; the newest one carries the
    /// order-file save.
    pub fn decrypt_all(&mut self) {
        self.pump();
        let n = self.catalog.len();
        if n == 0 {
            return;
        }
        log::debug!("Decrypting all {n} picture(s)");
        for index in (1..n).rev() {
            self.submit_export_for(index, false);
        }
        self.submit_export_for(0, true);
        self.emit_queued_signals();
    }

    /// Removes the picture at `index` from the vault entirely.
    pub fn remove_at(&mut self, index: usize) {
        self.pump();
        log::debug!("{index}");
        let Some(entry) = self.catalog.get(index) else {
            return;
        };
        let path = entry.stored_path.clone();
        let thumb_path = entry.thumb_path();
        self.destroy_item_at(index);
        if let Err(e) = fs::remove_file(&path) {
            log::warn!("Failed to delete {}: {e}", path.display());
        }
        if let Some(thumb) = thumb_path {
            if let Err(e) = fs::remove_file(&thumb) {
                log::warn!("Failed to delete {}: {e}", thumb.display());
            }
        }
        self.save_info();
        self.emit_queued_signals();
    }

    /// Fetches the decrypted image for the gallery. Cached plaintext is
    /// threaded through the task; the reply handle paired with `request`
    /// unblocks once a worker decoded the pixels.
    pub fn image_request(&mut self, stored_path: &Path, request: ImageRequest) {
        self.pump();
        let Some(keys) = self.keys.clone() else {
            drop(request); // empty reply
            return;
        };
        let was_busy = self.busy();
        let (cached, content_type) = match self
            .catalog
            .index_of_path(stored_path)
            .and_then(|i| self.catalog.get(i))
        {
            Some(entry) => (entry.decrypted_bytes.clone(), entry.content_type.clone()),
            None => (Vec::new(), String::new()),
        };
        log::debug!("Requesting {}", stored_path.display());
        let id = self.next_id();
        let handle = tasks::submit_image_request(
            &self.pool,
            self.events_tx.clone(),
            id,
            stored_path.to_path_buf(),
            cached,
            content_type,
            keys,
            request,
        );
        self.image_request_tasks.push(handle);
        if self.busy() != was_busy {
            self.queue_signal(Signal::BusyChanged);
        }
        self.emit_queued_signals();
    }

    pub fn set_thumbnail_size(&mut self, size: u32) {
        if self.thumb_size != size {
            self.thumb_size = size;
            log::debug!("{size}");
            self.queue_signal(Signal::ThumbnailSizeChanged);
            self.emit_queued_signals();
        }
    }

    // ======================================================================
    // Task completion handling
    // ======================================================================

    fn handle_event(&mut self, ev: TaskEvent) {
        match ev {
            TaskEvent::CheckVaultDone {
                id,
                may_have_encrypted,
            } => {
                if self.check_task.as_ref().map(|t| t.id) != Some(id) {
                    return;
                }
                log::debug!("Done");
                let was_busy = self.busy();
                if self.may_have_encrypted != may_have_encrypted {
                    self.may_have_encrypted = may_have_encrypted;
                    self.queue_signal(Signal::MayHaveEncryptedPicturesChanged);
                }
                self.check_task = None;
                if self.busy() != was_busy {
                    self.queue_signal(Signal::BusyChanged);
                }
            }

            TaskEvent::GenerateKeyDone { id, keys } => {
                if self.generate_task.as_ref().map(|t| t.id) != Some(id) {
                    return;
                }
                log::debug!("Got a new key");
                let was_busy = self.busy();
                self.generate_task = None;
                match keys {
                    Some(keys) => {
                        self.set_keys(Some(keys));
                        self.clear_model();
                        self.set_foil_state(FoilState::PicsReady);
                    }
                    None => {
                        self.set_keys(None);
                        self.set_foil_state(FoilState::KeyError);
                    }
                }
                if self.busy() != was_busy {
                    self.queue_signal(Signal::BusyChanged);
                }
            }

            TaskEvent::EncryptDone { id, source, entry } => {
                let Some(pos) = self.encrypt_tasks.iter().position(|t| t.id == id) else {
                    return;
                };
                let was_busy = self.busy();
                self.encrypt_tasks.remove(pos);
                log::debug!("Encrypted {}", source.display());
                if let Some(entry) = entry {
                    self.insert_model_data(*entry, InsertMode::Sorted);
                    self.save_info();
                    self.source_cleanup.notify_source_deleted(&source);
                }
                if self.busy() != was_busy {
                    self.queue_signal(Signal::BusyChanged);
                }
            }

            TaskEvent::CatalogProgress {
                id,
                entry,
                known_order,
            } => {
                if self.decrypt_catalog_task.as_ref().map(|t| t.id) != Some(id) {
                    // A stale progress message destroys its Entry here.
                    return;
                }
                let mode = if known_order {
                    InsertMode::Append
                } else {
                    InsertMode::SortedSuffix
                };
                self.insert_model_data(*entry, mode);
            }

            TaskEvent::CatalogDone { id, save_info } => {
                if self.decrypt_catalog_task.as_ref().map(|t| t.id) != Some(id) {
                    return;
                }
                log::debug!("{} picture(s) decrypted", self.catalog.len());
                let was_busy = self.busy();
                if save_info {
                    self.save_info();
                }
                self.decrypt_catalog_task = None;
                self.ordered_prefix = 0;
                if self.foil_state == FoilState::Decrypting {
                    self.set_foil_state(FoilState::PicsReady);
                }
                if self.busy() != was_busy {
                    self.queue_signal(Signal::BusyChanged);
                }
            }

            TaskEvent::ExportDone {
                id,
                stored_path,
                ok,
                last,
            } => {
                let index = (0..self.catalog.len()).find(|&i| {
                    self.catalog
                        .get(i)
                        .and_then(|e| e.decrypt_task.as_ref())
                        .map(|t| t.id)
                        == Some(id)
                });
                let Some(index) = index else {
                    return;
                };
                if let Some(entry) = self.catalog.get_mut(index) {
                    entry.decrypt_task = None;
                }
                if ok {
                    self.destroy_item_at(index);
                } else {
                    log::warn!("Failed to decrypt {}", stored_path.display());
                }
                if last {
                    self.save_info();
                }
            }

            TaskEvent::SaveCatalogDone { id } => {
                if self.save_task.as_ref().map(|t| t.id) != Some(id) {
                    return;
                }
                log::debug!("Done");
                let was_busy = self.busy();
                self.save_task = None;
                if self.busy() != was_busy {
                    self.queue_signal(Signal::BusyChanged);
                }
            }

            TaskEvent::ImageRequestDone {
                id,
                stored_path,
                fresh_bytes,
            } => {
                let Some(pos) = self.image_request_tasks.iter().position(|t| t.id == id) else {
                    return;
                };
                let was_busy = self.busy();
                self.image_request_tasks.remove(pos);
                if let Some(bytes) = fresh_bytes {
                    // Cache the freshly decrypted data
                    if let Some(index) = self.catalog.index_of_path(&stored_path) {
                        if let Some(entry) = self.catalog.get_mut(index) {
                            log::debug!("{} {} bytes", stored_path.display(), bytes.len());
                            entry.decrypted_bytes = bytes;
                        }
                        while self.too_much_data_decrypted() && self.drop_decrypted_data(index) {}
                    }
                }
                if self.busy() != was_busy {
                    self.queue_signal(Signal::BusyChanged);
                }
            }
        }
    }

    // ======================================================================
    // Catalog mutation
    // ======================================================================

    fn insert_model_data(&mut self, entry: Entry, mode: InsertMode) -> usize {
        let key = entry.stored_path.to_string_lossy().into_owned();
        self.thumbnail_sink.publish(&key, &entry.thumbnail);

        let pos = match mode {
            InsertMode::Sorted => self.catalog.lower_bound(&entry),
            InsertMode::Append => self.catalog.len(),
            InsertMode::SortedSuffix => self.catalog.lower_bound_from(self.ordered_prefix, &entry),
        };
        self.observer.begin_insert_rows(pos, pos);
        self.catalog.insert_at(pos, entry);
        match mode {
            InsertMode::Append => self.ordered_prefix = pos + 1,
            _ => {
                if pos < self.ordered_prefix {
                    self.ordered_prefix += 1;
                }
            }
        }
        log::debug!("{} at {pos}", self.catalog.len());

        // And this tells the app that we better not generate a new key:
        if !self.may_have_encrypted {
            self.may_have_encrypted = true;
            self.queue_signal(Signal::MayHaveEncryptedPicturesChanged);
        }
        self.observer.end_insert_rows();
        self.queue_signal(Signal::CountChanged);
        pos
    }

    fn destroy_item_at(&mut self, index: usize) {
        if index >= self.catalog.len() {
            return;
        }
        if let Some(entry) = self.catalog.get(index) {
            log::debug!("Removing {}", entry.stored_path.display());
            let key = entry.stored_path.to_string_lossy().into_owned();
            self.thumbnail_sink.release(&key);
        }
        self.observer.begin_remove_rows(index, index);
        let entry = self.catalog.remove(index);
        if let Some(task) = &entry.decrypt_task {
            task.release();
        }
        if index < self.ordered_prefix {
            self.ordered_prefix -= 1;
        }
        if self.catalog.is_empty() && self.may_have_encrypted {
            self.may_have_encrypted = false;
            self.queue_signal(Signal::MayHaveEncryptedPicturesChanged);
        }
        self.observer.end_remove_rows();
        self.queue_signal(Signal::CountChanged);
    }

    fn clear_model(&mut self) {
        let n = self.catalog.len();
        if n > 0 {
            self.observer.begin_remove_rows(0, n - 1);
            for i in 0..n {
                if let Some(entry) = self.catalog.get(i) {
                    let key = entry.stored_path.to_string_lossy().into_owned();
                    self.thumbnail_sink.release(&key);
                    if let Some(task) = &entry.decrypt_task {
                        task.release();
                    }
                }
            }
            self.catalog.clear();
            if self.may_have_encrypted {
                self.may_have_encrypted = false;
                self.queue_signal(Signal::MayHaveEncryptedPicturesChanged);
            }
            self.observer.end_remove_rows();
            self.queue_signal(Signal::CountChanged);
        }
        self.ordered_prefix = 0;
    }

    fn submit_export_for(&mut self, index: usize, last: bool) {
        let Some(keys) = self.keys.clone() else {
            return;
        };
        let (stored_path, thumb_path) = match self.catalog.get(index) {
            Some(entry) if entry.decrypt_task.is_none() => {
                (entry.stored_path.clone(), entry.thumb_path())
            }
            _ => return,
        };
        log::debug!("About to decrypt {}", stored_path.display());
        let id = self.next_id();
        let handle = tasks::submit_export(
            &self.pool,
            self.events_tx.clone(),
            id,
            stored_path,
            thumb_path,
            keys,
            last,
        );
        if let Some(entry) = self.catalog.get_mut(index) {
            entry.decrypt_task = Some(handle);
        }
    }

    fn save_info(&mut self) {
        let Some(keys) = self.keys.clone() else {
            return;
        };
        let was_busy = self.busy();
        if let Some(task) = self.save_task.take() {
            task.release();
        }
        let id = self.next_id();
        self.save_task = Some(tasks::submit_save_catalog(
            &self.pool,
            self.events_tx.clone(),
            id,
            self.cfg.pics_dir.clone(),
            keys,
            VaultOrder::from_catalog(&self.catalog),
        ));
        if self.busy() != was_busy {
            self.queue_signal(Signal::BusyChanged);
        }
    }

    // ======================================================================
    // Decrypted-bytes cache
    // ======================================================================

    /// The budget is breached only while at least two entries hold
    /// plaintext; a single oversized picture is always allowed to stay.
    fn too_much_data_decrypted(&self) -> bool {
        let mut count = 0usize;
        let mut total = 0u64;
        for entry in self.catalog.iter() {
            if !entry.decrypted_bytes.is_empty() {
                count += 1;
                total += entry.decrypted_bytes.len() as u64;
                if count > 1 && total > self.max_decrypted_bytes {
                    return true;
                }
            }
        }
        false
    }

    /// Evicts the populated slot with the greatest circular distance from
    /// `dont_touch`; ties go to the lower index.
    fn drop_decrypted_data(&mut self, dont_touch: usize) -> bool {
        let n = self.catalog.len();
        let mut drop_index = None;
        let mut max_distance = 0usize;
        for (i, entry) in self.catalog.iter().enumerate() {
            if i == dont_touch || entry.decrypted_bytes.is_empty() {
                continue;
            }
            let distance = circular_distance(i, dont_touch, n);
            if drop_index.is_none() || distance > max_distance {
                drop_index = Some(i);
                max_distance = distance;
            }
        }
        match drop_index {
            Some(i) => {
                if let Some(entry) = self.catalog.get_mut(i) {
                    log::debug!("Dropping {} at {i}", entry.stored_path.display());
                    entry.decrypted_bytes = Vec::new();
                }
                self.observer.data_changed(i, i, &[Role::DecryptedData]);
                true
            }
            None => false,
        }
    }

    // ======================================================================
    // Signals and state
    // ======================================================================

    fn queue_signal(&mut self, signal: Signal) {
        self.queued_signals |= 1u32 << (signal as u32);
    }

    fn emit_queued_signals(&mut self) {
        // The order must match the Signal enum
        for bit in 0..SIGNAL_COUNT {
            if self.queued_signals & (1 << bit) == 0 {
                continue;
            }
            self.queued_signals &= !(1 << bit);
            match bit {
                0 => self.observer.count_changed(),
                1 => self.observer.busy_changed(),
                2 => self.observer.key_available_changed(),
                3 => self.observer.foil_state_changed(),
                4 => self.observer.thumbnail_size_changed(),
                _ => self.observer.may_have_encrypted_pictures_changed(),
            }
        }
    }

    fn set_foil_state(&mut self, state: FoilState) {
        if self.foil_state != state {
            self.foil_state = state;
            self.queue_signal(Signal::FoilStateChanged);
        }
    }

    fn set_keys(&mut self, keys: Option<KeyPair>) {
        if keys.is_some() != self.keys.is_some() {
            self.queue_signal(Signal::KeyAvailableChanged);
        }
        self.keys = keys;
    }

    fn next_id(&mut self) -> TaskId {
        self.next_task_id += 1;
        self.next_task_id
    }
}

impl Drop for PicsEngine {
    fn drop(&mut self) {
        // Workers observe the pool's quit flag at their cancellation
        // points; replies owed to blocked readers are sent by the request
        // guards as the queue drains.
        if let Some(task) = self.check_task.take() {
            task.release();
        }
        if let Some(task) = self.save_task.take() {
            task.release();
        }
        if let Some(task) = self.generate_task.take() {
            task.release();
        }
        if let Some(task) = self.decrypt_catalog_task.take() {
            task.release();
        }
        for task in self.encrypt_tasks.drain(..) {
            task.release();
        }
        for task in self.image_request_tasks.drain(..) {
            task.release();
        }
    }
}

fn circular_distance(i: usize, k: usize, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let forward = (k + n - i) % n;
    let backward = (i + n - k) % n;
    forward.min(backward)
}
