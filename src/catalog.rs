//! FoilPics - Catalog
//!
//! The in-memory ordered list of vault entries plus the `.info` order
//! file that makes the ordering durable across lock/unlock.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use image::RgbaImage;

use crate::envelope::{self, EncryptOptions};
use crate::error::VaultResult;
use crate::keystore::KeyPair;
use crate::pool::TaskHandle;

/// Name of the order file inside the vault directory.
pub const INFO_FILE: &str = ".info";
const INFO_CONTENTS: &[u8] = b"FoilPics";
const ORDER_HEADER: &str = "Order";
const ORDER_DELIMITER: char = ',';
const THUMB_DELIMITER: char = ':';

/// One picture in the vault.
pub struct Entry {
    /// Absolute path of the encrypted picture inside the vault directory
    pub stored_path: PathBuf,
    /// `basename(stored_path)`, the random name chosen at import
    pub stored_name: String,
    /// Basename of the encrypted thumbnail, if one exists
    pub thumb_name: Option<String>,
    /// Where the picture came from; the destination on export
    pub original_path: PathBuf,
    /// Basename of `original_path`
    pub file_name: String,
    /// Display title
    pub title: String,
    /// Content type recorded at import (may be empty)
    pub content_type: String,
    /// Degrees, one of 0/90/180/270
    pub orientation: i32,
    /// Full-resolution pixel size
    pub full_size: (u32, u32),
    /// Original modification time, when known
    pub mod_time: Option<DateTime<Utc>>,
    /// Decoded thumbnail pixels
    pub thumbnail: RgbaImage,
    /// Cached plaintext of the full picture; empty when not cached
    pub decrypted_bytes: Vec<u8>,
    /// At most one in-flight export task
    pub(crate) decrypt_task: Option<TaskHandle>,
}

impl Entry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        original_path: PathBuf,
        stored_path: PathBuf,
        full_size: (u32, u32),
        thumb_name: Option<String>,
        thumbnail: RgbaImage,
        title: String,
        content_type: String,
        orientation: i32,
        mod_time: Option<DateTime<Utc>>,
    ) -> Self {
        let stored_name = basename(&stored_path);
        let file_name = basename(&original_path);
        let title = if title.is_empty() {
            default_title(&original_path)
        } else {
            title
        };
        log::debug!("{file_name} {orientation}");
        Self {
            stored_path,
            stored_name,
            thumb_name,
            original_path,
            file_name,
            title,
            content_type,
            orientation,
            full_size,
            mod_time,
            thumbnail,
            decrypted_bytes: Vec::new(),
            decrypt_task: None,
        }
    }

    /// Path of the thumbnail envelope next to the picture, if any.
    pub fn thumb_path(&self) -> Option<PathBuf> {
        let dir = self.stored_path.parent()?;
        self.thumb_name.as_ref().map(|name| dir.join(name))
    }

    pub fn image_width(&self) -> u32 {
        self.full_size.0
    }

    pub fn image_height(&self) -> u32 {
        self.full_size.1
    }

    /// Entries without a known time sort after everything else.
    fn sort_time(&self) -> DateTime<Utc> {
        self.mod_time.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Display title for a picture: the file name without its extension.
pub fn default_title(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Ordered list of entries, most recent first.
#[derive(Default)]
pub struct Catalog {
    entries: Vec<Entry>,
}

impl Catalog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Entry> {
        self.entries.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    /// Lower-bound position under "descending by mod_time". Equal times
    /// place the new entry in front, matching lower-bound semantics.
    pub fn lower_bound(&self, entry: &Entry) -> usize {
        self.lower_bound_from(0, entry)
    }

    /// Lower bound restricted to the tail starting at `from`. Used while
    /// the ordered reconstruction prefix must stay untouched.
    pub fn lower_bound_from(&self, from: usize, entry: &Entry) -> usize {
        let from = from.min(self.entries.len());
        from + self.entries[from..]
            .iter()
            .position(|e| e.sort_time() <= entry.sort_time())
            .unwrap_or(self.entries.len() - from)
    }

    pub fn insert_at(&mut self, pos: usize, entry: Entry) {
        self.entries.insert(pos.min(self.entries.len()), entry);
    }

    /// Lower-bound insertion under "descending by mod_time".
    pub fn insert_sorted(&mut self, entry: Entry) -> usize {
        let pos = self.lower_bound(&entry);
        self.entries.insert(pos, entry);
        pos
    }

    /// Lower-bound insertion restricted to the tail starting at `from`.
    pub fn insert_sorted_from(&mut self, from: usize, entry: Entry) -> usize {
        let pos = self.lower_bound_from(from, &entry);
        self.entries.insert(pos, entry);
        pos
    }

    /// Appends regardless of time; reconstruction uses this to honor the
    /// persisted order.
    pub fn push(&mut self, entry: Entry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn remove(&mut self, index: usize) -> Entry {
        self.entries.remove(index)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn index_of_path(&self, path: &Path) -> Option<usize> {
        self.entries.iter().position(|e| e.stored_path == path)
    }
}

/// The durable ordering: picture names in catalog order plus the
/// picture-to-thumbnail mapping.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VaultOrder {
    pub order: Vec<String>,
    pub thumbs: HashMap<String, String>,
}

impl VaultOrder {
    /// Snapshot of the catalog's current order.
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let mut info = VaultOrder::default();
        for entry in catalog.iter() {
            info.order.push(entry.stored_name.clone());
            if let Some(thumb) = &entry.thumb_name {
                info.thumbs
                    .insert(entry.stored_name.clone(), thumb.clone());
            }
        }
        info
    }

    /// Parses the `Order` header value. Tokens are trimmed, empty tokens
    /// skipped, `image:thumb` records the thumbnail mapping.
    pub fn decode(value: &str) -> Self {
        let mut info = VaultOrder::default();
        for token in value.split(ORDER_DELIMITER) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.split_once(THUMB_DELIMITER) {
                Some((image, thumb)) => {
                    info.order.push(image.to_string());
                    info.thumbs.insert(image.to_string(), thumb.to_string());
                }
                None => info.order.push(token.to_string()),
            }
        }
        info
    }

    pub fn encode(&self) -> String {
        let mut buf = String::new();
        for image in &self.order {
            if !buf.is_empty() {
                buf.push(ORDER_DELIMITER);
            }
            buf.push_str(image);
            if let Some(thumb) = self.thumbs.get(image) {
                buf.push(THUMB_DELIMITER);
                buf.push_str(thumb);
            }
        }
        buf
    }

    /// Loads the order file. Any failure - missing file, decrypt or verify
    /// failure, missing header - yields an empty order.
    pub fn load(dir: &Path, keys: &KeyPair) -> Self {
        let path = dir.join(INFO_FILE);
        log::debug!("Loading {}", path.display());
        match envelope::decrypt_file(&keys.private, &path) {
            Ok(env) => {
                if !env.verify(&keys.public) {
                    log::warn!("Could not verify {}", path.display());
                    return VaultOrder::default();
                }
                env.header(ORDER_HEADER)
                    .map(VaultOrder::decode)
                    .unwrap_or_default()
            }
            Err(e) => {
                log::debug!("No usable order file: {e}");
                VaultOrder::default()
            }
        }
    }

    /// Writes the order file, replacing the previous one atomically from
    /// the engine's viewpoint.
    pub fn save(&self, dir: &Path, keys: &KeyPair) -> VaultResult<()> {
        let path = dir.join(INFO_FILE);
        let tmp = dir.join(".info.tmp");
        log::debug!("Saving {}", path.display());

        let headers = vec![(ORDER_HEADER.to_string(), self.encode())];
        let mut frame = Vec::new();
        envelope::encrypt(
            &mut frame,
            INFO_CONTENTS,
            "",
            &headers,
            &keys.private,
            &keys.public,
            &EncryptOptions::default(),
        )?;
        fs::write(&tmp, &frame)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::test_key_pair;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn entry(name: &str, time: Option<DateTime<Utc>>) -> Entry {
        Entry::new(
            PathBuf::from(format!("/photos/{name}.png")),
            PathBuf::from(format!("/vault/{name}")),
            (64, 48),
            None,
            RgbaImage::new(1, 1),
            String::new(),
            "image/png".into(),
            0,
            time,
        )
    }

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn titles_default_to_stem() {
        let e = entry("ABCD1234ABCD1234", None);
        assert_eq!(e.file_name, "ABCD1234ABCD1234.png");
        assert_eq!(e.title, "ABCD1234ABCD1234");
        assert_eq!(e.stored_name, "ABCD1234ABCD1234");
    }

    #[test]
    fn insertion_keeps_most_recent_first() {
        let mut catalog = Catalog::default();
        catalog.insert_sorted(entry("b", at(100)));
        catalog.insert_sorted(entry("c", at(300)));
        catalog.insert_sorted(entry("a", at(200)));
        catalog.insert_sorted(entry("old", None));
        let names: Vec<&str> = catalog.iter().map(|e| e.stored_name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b", "old"]);
    }

    #[test]
    fn equal_times_insert_in_front() {
        let mut catalog = Catalog::default();
        catalog.insert_sorted(entry("first", at(100)));
        let pos = catalog.insert_sorted(entry("second", at(100)));
        assert_eq!(pos, 0);
    }

    #[test]
    fn suffix_insertion_leaves_prefix_alone() {
        let mut catalog = Catalog::default();
        catalog.push(entry("p1", at(10)));
        catalog.push(entry("p2", at(500)));
        // Newer than both, but the ordered prefix must not move.
        let pos = catalog.insert_sorted_from(2, entry("x", at(1000)));
        assert_eq!(pos, 2);
        let pos = catalog.insert_sorted_from(2, entry("y", at(2000)));
        assert_eq!(pos, 2);
    }

    #[test]
    fn order_roundtrip() {
        let mut info = VaultOrder::default();
        info.order = vec!["AAAA".into(), "BBBB".into(), "CCCC".into()];
        info.thumbs.insert("AAAA".into(), "DDDD".into());
        info.thumbs.insert("CCCC".into(), "EEEE".into());
        assert_eq!(VaultOrder::decode(&info.encode()), info);
    }

    #[test]
    fn decode_trims_and_skips_empty_tokens() {
        let info = VaultOrder::decode(" AAAA:TTTT , , BBBB ,,");
        assert_eq!(info.order, vec!["AAAA", "BBBB"]);
        assert_eq!(info.thumbs.get("AAAA").unwrap(), "TTTT");
        assert!(info.thumbs.get("BBBB").is_none());
    }

    #[test]
    fn save_and_load_through_the_codec() {
        let dir = tempdir().unwrap();
        let keys = test_key_pair();
        let mut info = VaultOrder::default();
        info.order = vec!["0011223344556677".into()];
        info.thumbs
            .insert("0011223344556677".into(), "8899AABBCCDDEEFF".into());

        info.save(dir.path(), &keys).unwrap();
        assert!(dir.path().join(INFO_FILE).exists());
        assert_eq!(VaultOrder::load(dir.path(), &keys), info);
    }

    #[test]
    fn load_tolerates_garbage_and_absence() {
        let dir = tempdir().unwrap();
        let keys = test_key_pair();
        assert_eq!(VaultOrder::load(dir.path(), &keys), VaultOrder::default());
        fs::write(dir.path().join(INFO_FILE), b"scribble").unwrap();
        assert_eq!(VaultOrder::load(dir.path(), &keys), VaultOrder::default());
    }
}
