//! FoilPics - Task Bodies
//!
//! Worker-side implementations of the engine's background tasks. Each body
//! receives its inputs by value at submission, polls its cancellation
//! token at the cancellation points (before disk reads, before envelope
//! decrypts, between loop iterations) and reports back over the engine's
//! event channel. The engine matches events against the handles it still
//! holds; events from released tasks are discarded over there.

use std::collections::BTreeMap;
use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use image::GenericImageView;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::SecretString;

use crate::catalog::{default_title, Entry, VaultOrder, INFO_FILE};
use crate::envelope::{self, EncryptOptions, Envelope};
use crate::error::{VaultError, VaultResult};
use crate::keystore::{self, KeyPair};
use crate::media::{self, FormatHint, MimeProbe};
use crate::observer::ImageRequest;
use crate::pool::{TaskHandle, TaskId, TaskState, WorkerPool};

pub const HEADER_ORIGINAL_PATH: &str = "Original-Path";
pub const HEADER_MODIFICATION_TIME: &str = "Modification-Time";
pub const HEADER_ACCESS_TIME: &str = "Access-Time";
pub const HEADER_ORIENTATION: &str = "Orientation";
pub const HEADER_TITLE: &str = "Title";

// Thumbnail specific headers
pub const HEADER_THUMB_FULL_WIDTH: &str = "Full-Width";
pub const HEADER_THUMB_FULL_HEIGHT: &str = "Full-Height";

/// Completion and progress messages consumed on the engine thread.
pub(crate) enum TaskEvent {
    CheckVaultDone {
        id: TaskId,
        may_have_encrypted: bool,
    },
    GenerateKeyDone {
        id: TaskId,
        keys: Option<KeyPair>,
    },
    EncryptDone {
        id: TaskId,
        source: PathBuf,
        entry: Option<Box<Entry>>,
    },
    CatalogProgress {
        id: TaskId,
        entry: Box<Entry>,
        known_order: bool,
    },
    CatalogDone {
        id: TaskId,
        save_info: bool,
    },
    ExportDone {
        id: TaskId,
        stored_path: PathBuf,
        ok: bool,
        last: bool,
    },
    SaveCatalogDone {
        id: TaskId,
    },
    ImageRequestDone {
        id: TaskId,
        stored_path: PathBuf,
        fresh_bytes: Option<Vec<u8>>,
    },
}

// ==========================================================================
// Shared helpers
// ==========================================================================

/// Decrypts one envelope and authenticates it, logging the failure mode.
pub(crate) fn decrypt_and_verify(keys: &KeyPair, path: &Path) -> Option<Envelope> {
    log::debug!("Decrypting {}", path.display());
    match envelope::decrypt_file(&keys.private, path) {
        Ok(env) => {
            if env.verify(&keys.public) {
                Some(env)
            } else {
                log::warn!("Could not verify {}", path.display());
                None
            }
        }
        Err(e) => {
            log::debug!("Failed to decrypt {}: {e}", path.display());
            None
        }
    }
}

fn random_name() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Creates a fresh, exclusively-owned file under a random 16-hex-digit
/// name. Collisions are resolved by retry; a hundred misses means the
/// directory is in a very strange state.
pub(crate) fn create_vault_file(dir: &Path) -> VaultResult<(File, PathBuf)> {
    create_unique_file(dir, random_name)
}

fn create_unique_file(
    dir: &Path,
    mut name: impl FnMut() -> String,
) -> VaultResult<(File, PathBuf)> {
    for _ in 0..100 {
        let path = dir.join(name());
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(VaultError::NameExhausted)
}

pub(crate) fn format_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn header_time(env: &Envelope, key: &str) -> Option<DateTime<Utc>> {
    env.header(key).and_then(parse_time)
}

fn header_int(env: &Envelope, key: &str, default: i32) -> i32 {
    env.header(key)
        .and_then(|v| v.trim().parse::<i32>().ok())
        .unwrap_or(default)
}

fn header_value<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

/// Restores atime/mtime parsed from envelope headers; either may be
/// absent, in which case that time is left alone.
fn set_file_times(path: &Path, atime: Option<&str>, mtime: Option<&str>) {
    let accessed = atime.and_then(parse_time);
    let modified = mtime.and_then(parse_time);
    if accessed.is_none() && modified.is_none() {
        return;
    }
    let mut times = FileTimes::new();
    if let Some(a) = accessed {
        times = times.set_accessed(SystemTime::from(a));
    }
    if let Some(m) = modified {
        times = times.set_modified(SystemTime::from(m));
    }
    let result = File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_times(times));
    if let Err(e) = result {
        log::warn!("Failed to set times on {}: {e}", path.display());
    }
}

/// Encrypts `thumb` into its own envelope next to the picture, carrying
/// the shared header subset plus the full-resolution dimensions. Returns
/// the new file's basename, or nothing when the write failed.
fn write_thumb(
    keys: &KeyPair,
    full_size: (u32, u32),
    src_headers: &[(String, String)],
    content_type: &str,
    thumb: &image::RgbaImage,
    dest_dir: &Path,
    hint: Option<FormatHint>,
) -> Option<String> {
    const COPIED: [&str; 5] = [
        HEADER_ORIGINAL_PATH,
        HEADER_TITLE,
        HEADER_MODIFICATION_TIME,
        HEADER_ORIENTATION,
        HEADER_ACCESS_TIME,
    ];
    let mut headers: Vec<(String, String)> = COPIED
        .iter()
        .filter_map(|key| header_value(src_headers, key).map(|v| (key.to_string(), v.to_string())))
        .collect();
    headers.push((HEADER_THUMB_FULL_WIDTH.into(), full_size.0.to_string()));
    headers.push((HEADER_THUMB_FULL_HEIGHT.into(), full_size.1.to_string()));

    let data = match media::encode(thumb, hint) {
        Ok(data) => data,
        Err(e) => {
            log::warn!("Failed to encode thumbnail: {e}");
            return None;
        }
    };
    let (mut file, path) = match create_vault_file(dest_dir) {
        Ok(out) => out,
        Err(e) => {
            log::warn!("Failed to create thumbnail file: {e}");
            return None;
        }
    };
    log::debug!("Writing thumbnail to {}", path.display());
    match envelope::encrypt(
        &mut file,
        &data,
        content_type,
        &headers,
        &keys.private,
        &keys.public,
        &EncryptOptions::default(),
    ) {
        Ok(()) => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        Err(e) => {
            log::warn!("Failed to write thumbnail: {e}");
            drop(file);
            let _ = fs::remove_file(&path);
            None
        }
    }
}

fn image_content_type(content_type: &str) -> bool {
    content_type.is_empty() || content_type.starts_with("image/")
}

// ==========================================================================
// CheckVault
// ==========================================================================

/// Scans the vault directory for anything that frames like an envelope.
/// Gates the "generate a new key" UX.
pub(crate) fn submit_check_vault(
    pool: &WorkerPool,
    tx: Sender<TaskEvent>,
    id: TaskId,
    dir: PathBuf,
) -> TaskHandle {
    pool.submit(id, move |state| {
        log::debug!("Checking {}", dir.display());
        let mut may_have_encrypted = false;
        if let Ok(listing) = fs::read_dir(&dir) {
            for dirent in listing.flatten() {
                if may_have_encrypted || state.is_canceled() {
                    break;
                }
                let path = dirent.path();
                if !path.is_file() || dirent.file_name() == INFO_FILE {
                    continue;
                }
                if let Ok(bytes) = fs::read(&path) {
                    if envelope::parse(&bytes).is_some() {
                        log::debug!("{} may be an encrypted picture", path.display());
                        may_have_encrypted = true;
                    }
                }
            }
        }
        let _ = tx.send(TaskEvent::CheckVaultDone {
            id,
            may_have_encrypted,
        });
    })
}

// ==========================================================================
// GenerateKey
// ==========================================================================

pub(crate) fn submit_generate_key(
    pool: &WorkerPool,
    tx: Sender<TaskEvent>,
    id: TaskId,
    key_file: PathBuf,
    bits: usize,
    passphrase: SecretString,
) -> TaskHandle {
    pool.submit(id, move |_state| {
        let keys = match keystore::generate_to_file(&key_file, bits, &passphrase) {
            Ok(keys) => Some(keys),
            Err(e) => {
                log::warn!("{e}");
                None
            }
        };
        let _ = tx.send(TaskEvent::GenerateKeyDone { id, keys });
    })
}

// ==========================================================================
// Encrypt (import)
// ==========================================================================

#[allow(clippy::too_many_arguments)]
pub(crate) fn submit_encrypt(
    pool: &WorkerPool,
    tx: Sender<TaskEvent>,
    id: TaskId,
    source: PathBuf,
    dest_dir: PathBuf,
    keys: KeyPair,
    orientation: i32,
    thumb_size: u32,
    probe: Arc<dyn MimeProbe>,
) -> TaskHandle {
    pool.submit(id, move |state| {
        let entry = encrypt_one(
            state,
            &source,
            &dest_dir,
            &keys,
            orientation,
            thumb_size,
            probe.as_ref(),
        );
        let _ = tx.send(TaskEvent::EncryptDone {
            id,
            source,
            entry: entry.map(Box::new),
        });
    })
}

fn encrypt_one(
    state: &TaskState,
    source: &Path,
    dest_dir: &Path,
    keys: &KeyPair,
    orientation: i32,
    thumb_size: u32,
    probe: &dyn MimeProbe,
) -> Option<Entry> {
    if state.is_canceled() {
        return None;
    }
    let bytes = match fs::read(source) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Failed to read {}: {e}", source.display());
            return None;
        }
    };

    let content_type = probe.probe(source).unwrap_or_default();
    if !content_type.is_empty() {
        log::debug!("{content_type}");
    }
    let hint = media::format_hint(&content_type);
    // A source the decoder cannot make sense of is silently discarded.
    let image = match media::decode(&bytes, hint) {
        Ok(image) => image,
        Err(e) => {
            log::debug!("Not an image: {} ({e})", source.display());
            return None;
        }
    };

    let title = default_title(source);
    let mut headers: Vec<(String, String)> = vec![
        (
            HEADER_ORIGINAL_PATH.into(),
            source.to_string_lossy().into_owned(),
        ),
        (HEADER_TITLE.into(), title.clone()),
        (HEADER_ORIENTATION.into(), orientation.to_string()),
    ];
    let mut mod_time = None;
    let mut source_times = None;
    if let Ok(meta) = fs::metadata(source) {
        if let (Ok(modified), Ok(accessed)) = (meta.modified(), meta.accessed()) {
            headers.push((HEADER_MODIFICATION_TIME.into(), format_time(modified)));
            headers.push((HEADER_ACCESS_TIME.into(), format_time(accessed)));
            mod_time = Some(DateTime::<Utc>::from(modified));
            source_times = Some((accessed, modified));
        }
    }

    let (mut file, dest) = match create_vault_file(dest_dir) {
        Ok(out) => out,
        Err(e) => {
            log::warn!("Failed to create vault file: {e}");
            return None;
        }
    };
    log::debug!("Writing {}", dest.display());

    let written = !state.is_canceled()
        && match envelope::encrypt(
            &mut file,
            &bytes,
            &content_type,
            &headers,
            &keys.private,
            &keys.public,
            &EncryptOptions::default(),
        ) {
            Ok(()) => file.sync_all().is_ok(),
            Err(e) => {
                log::warn!("Failed to encrypt {}: {e}", source.display());
                false
            }
        };
    if !written {
        drop(file);
        let _ = fs::remove_file(&dest);
        return None;
    }
    if let Some((accessed, modified)) = source_times {
        let times = FileTimes::new().set_accessed(accessed).set_modified(modified);
        if let Err(e) = file.set_times(times) {
            log::warn!("Failed to set times on {}: {e}", dest.display());
        }
    }
    drop(file);

    let thumb = media::thumbnail(&image, thumb_size, orientation);
    let thumb_name = write_thumb(
        keys,
        image.dimensions(),
        &headers,
        &content_type,
        &thumb,
        dest_dir,
        hint,
    );

    let entry = Entry::new(
        source.to_path_buf(),
        dest,
        image.dimensions(),
        thumb_name,
        thumb,
        title,
        content_type,
        orientation,
        mod_time,
    );
    // The source only goes away once the vault copy fully exists.
    if let Err(e) = fs::remove_file(source) {
        log::warn!("Failed to delete {}: {e}", source.display());
    }
    Some(entry)
}

// ==========================================================================
// DecryptCatalog (reconstruction)
// ==========================================================================

pub(crate) fn submit_decrypt_catalog(
    pool: &WorkerPool,
    tx: Sender<TaskEvent>,
    id: TaskId,
    dir: PathBuf,
    keys: KeyPair,
    thumb_size: u32,
) -> TaskHandle {
    pool.submit(id, move |state| {
        let save_info = reconstruct(state, &tx, id, &dir, &keys, thumb_size);
        let _ = tx.send(TaskEvent::CatalogDone { id, save_info });
    })
}

fn reconstruct(
    state: &TaskState,
    tx: &Sender<TaskEvent>,
    id: TaskId,
    dir: &Path,
    keys: &KeyPair,
    thumb_size: u32,
) -> bool {
    let mut save_info = false;
    if state.is_canceled() {
        return save_info;
    }
    log::debug!("Checking {}", dir.display());

    let mut file_map: BTreeMap<String, PathBuf> = BTreeMap::new();
    if let Ok(listing) = fs::read_dir(dir) {
        for dirent in listing.flatten() {
            let path = dirent.path();
            if path.is_file() {
                let name = dirent.file_name().to_string_lossy().into_owned();
                if name != INFO_FILE {
                    file_map.insert(name, path);
                }
            }
        }
    }

    // Restore the recorded order first.
    let info = VaultOrder::load(dir, keys);
    for image in &info.order {
        if state.is_canceled() {
            return save_info;
        }
        let image_path = file_map.remove(image);
        if image_path.is_none() {
            log::debug!("{image} oops!");
            save_info = true;
        }
        let thumb_path = info.thumbs.get(image).and_then(|thumb| {
            let path = file_map.remove(thumb);
            if path.is_none() {
                log::debug!("{thumb} oops!");
                save_info = true;
            }
            path
        });
        let Some(image_path) = image_path else {
            continue;
        };
        let entry = thumb_path
            .and_then(|thumb| decrypt_thumb(keys, &image_path, &thumb, thumb_size))
            .or_else(|| decrypt_image(keys, &image_path, dir, thumb_size));
        match entry {
            Some(entry) => {
                let _ = tx.send(TaskEvent::CatalogProgress {
                    id,
                    entry: Box::new(entry),
                    known_order: true,
                });
            }
            None => save_info = true,
        }
    }

    // Followed by whatever the order file did not mention.
    for path in file_map.into_values() {
        if state.is_canceled() {
            return save_info;
        }
        if let Some(entry) = decrypt_image(keys, &path, dir, thumb_size) {
            log::debug!("{} was not expected", path.display());
            save_info = true;
            let _ = tx.send(TaskEvent::CatalogProgress {
                id,
                entry: Box::new(entry),
                known_order: false,
            });
        }
    }
    save_info
}

/// Fast path: rebuild an Entry from its thumbnail envelope alone. The
/// thumbnail absolutely must carry the full-size headers and decode to
/// exactly the configured thumbnail size.
fn decrypt_thumb(
    keys: &KeyPair,
    image_path: &Path,
    thumb_path: &Path,
    thumb_size: u32,
) -> Option<Entry> {
    let env = decrypt_and_verify(keys, thumb_path)?;
    let width = header_int(&env, HEADER_THUMB_FULL_WIDTH, 0);
    let height = header_int(&env, HEADER_THUMB_FULL_HEIGHT, 0);
    let original_path = env.header(HEADER_ORIGINAL_PATH).unwrap_or_default();
    if width <= 0 || height <= 0 || original_path.is_empty() {
        return None;
    }
    if !image_content_type(&env.content_type) {
        log::warn!("Unexpected content type {}", env.content_type);
        return None;
    }
    // Thumbnail payloads are always this engine's own encoding, which may
    // differ from the source format; auto-detection sorts it out.
    let pixels = media::decode(&env.body, None).ok()?;
    if pixels.dimensions() != (thumb_size, thumb_size) {
        log::debug!(
            "{} has stale dimensions {:?}",
            thumb_path.display(),
            pixels.dimensions()
        );
        return None;
    }
    log::debug!("Loaded thumbnail from {}", thumb_path.display());
    Some(Entry::new(
        PathBuf::from(original_path),
        image_path.to_path_buf(),
        (width as u32, height as u32),
        thumb_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        pixels.to_rgba8(),
        env.header(HEADER_TITLE).unwrap_or_default().to_string(),
        env.content_type.clone(),
        header_int(&env, HEADER_ORIENTATION, 0),
        header_time(&env, HEADER_MODIFICATION_TIME),
    ))
}

/// Slow path: decrypt the full picture, regenerate and re-encrypt its
/// thumbnail.
fn decrypt_image(keys: &KeyPair, image_path: &Path, dir: &Path, thumb_size: u32) -> Option<Entry> {
    let env = decrypt_and_verify(keys, image_path)?;
    let original_path = env.header(HEADER_ORIGINAL_PATH).unwrap_or_default().to_string();
    if original_path.is_empty() {
        return None;
    }
    if !image_content_type(&env.content_type) {
        log::warn!("Unexpected content type {}", env.content_type);
        return None;
    }
    let hint = media::format_hint(&env.content_type);
    let image = media::decode(&env.body, hint).ok()?;
    log::debug!("Loaded image from {}", image_path.display());
    let degrees = header_int(&env, HEADER_ORIENTATION, 0);
    let thumb = media::thumbnail(&image, thumb_size, degrees);
    let thumb_name = write_thumb(
        keys,
        image.dimensions(),
        &env.headers,
        &env.content_type,
        &thumb,
        dir,
        hint,
    );
    Some(Entry::new(
        PathBuf::from(original_path),
        image_path.to_path_buf(),
        image.dimensions(),
        thumb_name,
        thumb,
        env.header(HEADER_TITLE).unwrap_or_default().to_string(),
        env.content_type.clone(),
        degrees,
        header_time(&env, HEADER_MODIFICATION_TIME),
    ))
}

// ==========================================================================
// Decrypt (export)
// ==========================================================================

pub(crate) fn submit_export(
    pool: &WorkerPool,
    tx: Sender<TaskEvent>,
    id: TaskId,
    stored_path: PathBuf,
    thumb_path: Option<PathBuf>,
    keys: KeyPair,
    last: bool,
) -> TaskHandle {
    pool.submit(id, move |state| {
        let mut ok = false;
        if !state.is_canceled() {
            if let Some(env) = decrypt_and_verify(&keys, &stored_path) {
                if !state.is_canceled() {
                    ok = save_decrypted(&env);
                    if ok {
                        if let Err(e) = fs::remove_file(&stored_path) {
                            log::warn!("Failed to delete {}: {e}", stored_path.display());
                        }
                        if let Some(thumb) = &thumb_path {
                            if let Err(e) = fs::remove_file(thumb) {
                                log::warn!("Failed to delete {}: {e}", thumb.display());
                            }
                        }
                    }
                }
            }
        }
        let _ = tx.send(TaskEvent::ExportDone {
            id,
            stored_path,
            ok,
            last,
        });
    })
}

fn save_decrypted(env: &Envelope) -> bool {
    let Some(dest) = env.header(HEADER_ORIGINAL_PATH) else {
        log::warn!("Original file name is unknown");
        return false;
    };
    match fs::write(dest, &env.body) {
        Ok(()) => {
            log::debug!("Wrote {dest}");
            set_file_times(
                Path::new(dest),
                env.header(HEADER_ACCESS_TIME),
                env.header(HEADER_MODIFICATION_TIME),
            );
            true
        }
        Err(e) => {
            log::warn!("Failed to write {dest}: {e}");
            false
        }
    }
}

// ==========================================================================
// SaveCatalog
// ==========================================================================

pub(crate) fn submit_save_catalog(
    pool: &WorkerPool,
    tx: Sender<TaskEvent>,
    id: TaskId,
    dir: PathBuf,
    keys: KeyPair,
    info: VaultOrder,
) -> TaskHandle {
    pool.submit(id, move |state| {
        if !state.is_canceled() {
            if let Err(e) = info.save(&dir, &keys) {
                log::warn!("Failed to save {}: {e}", dir.join(INFO_FILE).display());
            }
        }
        let _ = tx.send(TaskEvent::SaveCatalogDone { id });
    })
}

// ==========================================================================
// ImageRequest
// ==========================================================================

/// Decrypts (unless bytes were cached) and decodes one full image, then
/// replies to the blocked pixmap reader. The request guard guarantees the
/// reply happens exactly once even when the task is canceled early.
#[allow(clippy::too_many_arguments)]
pub(crate) fn submit_image_request(
    pool: &WorkerPool,
    tx: Sender<TaskEvent>,
    id: TaskId,
    stored_path: PathBuf,
    cached: Vec<u8>,
    content_type: String,
    keys: KeyPair,
    request: ImageRequest,
) -> TaskHandle {
    pool.submit(id, move |state| {
        let mut bytes = cached;
        let mut fresh = false;
        if bytes.is_empty() && !state.is_canceled() {
            if let Some(env) = decrypt_and_verify(&keys, &stored_path) {
                if !state.is_canceled() && !env.body.is_empty() {
                    bytes = env.body;
                    fresh = true;
                }
            }
        }
        if !bytes.is_empty() && !state.is_canceled() {
            let hint = media::format_hint(&content_type);
            match media::decode(&bytes, hint) {
                Ok(image) => {
                    log::debug!("{} {:?}", stored_path.display(), image.dimensions());
                    request.reply(Some(image));
                }
                Err(e) => {
                    log::warn!("Failed to decode {}: {e}", stored_path.display());
                    request.reply(None);
                }
            }
        } else {
            // Dropping the guard sends the empty reply.
            drop(request);
        }
        let _ = tx.send(TaskEvent::ImageRequestDone {
            id,
            stored_path,
            fresh_bytes: fresh.then_some(bytes),
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::test_key_pair;
    use image::{DynamicImage, RgbaImage};
    use tempfile::tempdir;

    #[test]
    fn random_names_are_sixteen_uppercase_hex_digits() {
        for _ in 0..32 {
            let name = random_name();
            assert_eq!(name.len(), 16);
            assert!(name
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn unique_file_survives_99_collisions() {
        let dir = tempdir().unwrap();
        for i in 0..99 {
            fs::write(dir.path().join(format!("TAKEN{i:011}")), b"x").unwrap();
        }
        let mut attempt = 0;
        let (_, path) = create_unique_file(dir.path(), || {
            let name = if attempt < 99 {
                format!("TAKEN{attempt:011}")
            } else {
                "FREE000000000000".to_string()
            };
            attempt += 1;
            name
        })
        .unwrap();
        assert_eq!(attempt, 100);
        assert_eq!(path.file_name().unwrap(), "FREE000000000000");
    }

    #[test]
    fn unique_file_gives_up_after_100_collisions() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("TAKEN"), b"x").unwrap();
        let mut attempts = 0;
        let result = create_unique_file(dir.path(), || {
            attempts += 1;
            "TAKEN".to_string()
        });
        assert!(matches!(result, Err(VaultError::NameExhausted)));
        assert_eq!(attempts, 100);
    }

    #[test]
    fn time_header_roundtrip_is_microsecond_exact() {
        let now = SystemTime::now();
        let encoded = format_time(now);
        let decoded = parse_time(&encoded).unwrap();
        let diff = DateTime::<Utc>::from(now)
            .signed_duration_since(decoded)
            .num_microseconds()
            .unwrap()
            .abs();
        assert!(diff <= 1);
        assert!(parse_time("not a time").is_none());
    }

    #[test]
    fn thumb_envelope_roundtrips_through_reconstruction() {
        let dir = tempdir().unwrap();
        let keys = test_key_pair();
        let thumb = RgbaImage::new(32, 32);
        let src_headers = vec![
            (HEADER_ORIGINAL_PATH.to_string(), "/tmp/pic.png".to_string()),
            (HEADER_TITLE.to_string(), "pic".to_string()),
            (HEADER_ORIENTATION.to_string(), "90".to_string()),
        ];
        let name = write_thumb(
            &keys,
            (640, 480),
            &src_headers,
            "image/png",
            &thumb,
            dir.path(),
            Some(FormatHint::Png),
        )
        .unwrap();

        let image_path = dir.path().join("0123456789ABCDEF");
        let entry = decrypt_thumb(&keys, &image_path, &dir.path().join(&name), 32).unwrap();
        assert_eq!(entry.full_size, (640, 480));
        assert_eq!(entry.orientation, 90);
        assert_eq!(entry.title, "pic");
        assert_eq!(entry.thumb_name.as_deref(), Some(name.as_str()));
        assert_eq!(entry.original_path, Path::new("/tmp/pic.png"));

        // A different configured size must reject the stored thumbnail.
        assert!(decrypt_thumb(&keys, &image_path, &dir.path().join(&name), 48).is_none());
    }

    #[test]
    fn decrypt_image_regenerates_a_thumbnail() {
        let dir = tempdir().unwrap();
        let keys = test_key_pair();
        let image = DynamicImage::new_rgb8(64, 40);
        let mut png = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let stored = dir.path().join("AAAA000000000000");
        let mut file = File::create(&stored).unwrap();
        let headers = vec![
            (HEADER_ORIGINAL_PATH.to_string(), "/tmp/x.png".to_string()),
            (HEADER_MODIFICATION_TIME.to_string(), "2024-05-01T10:20:30Z".to_string()),
        ];
        envelope::encrypt(
            &mut file,
            &png,
            "image/png",
            &headers,
            &keys.private,
            &keys.public,
            &EncryptOptions::default(),
        )
        .unwrap();
        drop(file);

        let entry = decrypt_image(&keys, &stored, dir.path(), 16).unwrap();
        assert_eq!(entry.full_size, (64, 40));
        assert_eq!(entry.thumbnail.dimensions(), (16, 16));
        assert!(entry.thumb_name.is_some());
        assert_eq!(
            entry.mod_time,
            parse_time("2024-05-01T10:20:30Z")
        );
        // The regenerated thumbnail envelope exists on disk.
        assert!(dir.path().join(entry.thumb_name.unwrap()).exists());
    }

    #[test]
    fn envelope_without_original_path_is_dropped() {
        let dir = tempdir().unwrap();
        let keys = test_key_pair();
        let image = DynamicImage::new_rgb8(8, 8);
        let mut png = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let stored = dir.path().join("BBBB000000000000");
        let mut file = File::create(&stored).unwrap();
        envelope::encrypt(
            &mut file,
            &png,
            "image/png",
            &[],
            &keys.private,
            &keys.public,
            &EncryptOptions::default(),
        )
        .unwrap();
        drop(file);
        assert!(decrypt_image(&keys, &stored, dir.path(), 16).is_none());
    }
}
