//! Steam shortcuts.vdf binary format codec and shortcut manager
//!
//! The on-disk format is a nested, depth-first tag stream: `0x00` opens a
//! map, `0x01` is a string, `0x02` a little-endian int32, `0x08` closes a
//! map. Keys and string values are NUL-terminated. The document root is a
//! single map keyed "shortcuts" containing entries keyed by decimal ordinal,
//! closed by two trailing `0x08` bytes.
//!
//! The in-memory model is an order-preserving list of typed nodes, so keys
//! written by other tools survive a modify-and-resave cycle untouched and
//! `encode(decode(b)) == b` holds byte-for-byte for well-formed input.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{DecodeError, StoreError};
use crate::logging::log_steam;

const TAG_MAP: u8 = 0x00;
const TAG_STRING: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_END: u8 = 0x08;

// ============================================================================
// Typed node tree
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VdfValue {
    String(String),
    Int(u32),
    Map(VdfMap),
}

/// An ordered key/value map. Order and key casing are significant: both are
/// reproduced exactly on encode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VdfMap {
    pairs: Vec<(String, VdfValue)>,
}

impl VdfMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(String, VdfValue)] {
        &self.pairs
    }

    /// Case-insensitive lookup (Steam itself is inconsistent about key
    /// casing in shortcuts.vdf).
    pub fn get(&self, key: &str) -> Option<&VdfValue> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(VdfValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<u32> {
        match self.get(key) {
            Some(VdfValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Replace the value for `key` in place, preserving its position and
    /// original casing; append with the given casing if absent.
    pub fn set(&mut self, key: &str, value: VdfValue) {
        match self
            .pairs
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, v)) => *v = value,
            None => self.pairs.push((key.to_string(), value)),
        }
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.set(key, VdfValue::String(value.to_string()));
    }

    pub fn set_int(&mut self, key: &str, value: u32) {
        self.set(key, VdfValue::Int(value));
    }

    fn push(&mut self, key: String, value: VdfValue) {
        self.pairs.push((key, value));
    }
}

// ============================================================================
// Decoder
// ============================================================================

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(DecodeError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn cstr(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        while *self
            .data
            .get(self.pos)
            .ok_or(DecodeError::Truncated(self.pos))?
            != 0x00
        {
            self.pos += 1;
        }
        let s = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| DecodeError::InvalidUtf8 { offset: start })?
            .to_string();
        self.pos += 1; // consume terminator
        Ok(s)
    }

    fn int32(&mut self) -> Result<u32, DecodeError> {
        if self.pos + 4 > self.data.len() {
            return Err(DecodeError::Truncated(self.pos));
        }
        let v = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    /// Parse map contents up to and including the closing `0x08`.
    fn map(&mut self, depth: usize) -> Result<VdfMap, DecodeError> {
        let mut map = VdfMap::new();
        loop {
            let tag = self.byte().map_err(|_| DecodeError::UnbalancedMap { depth })?;
            if tag == TAG_END {
                return Ok(map);
            }
            let key = self.cstr()?;
            let value = match tag {
                TAG_STRING => VdfValue::String(self.cstr()?),
                TAG_INT => VdfValue::Int(self.int32()?),
                TAG_MAP => VdfValue::Map(self.map(depth + 1)?),
                other => {
                    return Err(DecodeError::BadTag {
                        tag: other,
                        offset: self.pos - 1,
                    })
                }
            };
            map.push(key, value);
        }
    }
}

// ============================================================================
// Shortcut store
// ============================================================================

/// Decoded shortcuts.vdf document: the ordered entries of the root
/// "shortcuts" map, each an ordinal-keyed map of typed fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShortcutStore {
    entries: VdfMap,
    /// Root key exactly as read from the file. Steam accepts any casing
    /// and so must the re-encode, byte for byte.
    root_key: String,
}

impl Default for ShortcutStore {
    fn default() -> Self {
        Self {
            entries: VdfMap::new(),
            root_key: "shortcuts".to_string(),
        }
    }
}

impl ShortcutStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a shortcuts.vdf byte stream.
    ///
    /// Fails with `DecodeError` (never a partial document) on truncated
    /// input, unknown tag bytes, or unbalanced nesting. Callers must treat
    /// a failure as fatal and never write back.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut d = Decoder::new(data);

        let tag = d.byte().map_err(|_| DecodeError::BadRoot)?;
        if tag != TAG_MAP {
            return Err(DecodeError::BadRoot);
        }
        let root_key = d.cstr().map_err(|_| DecodeError::BadRoot)?;
        if !root_key.eq_ignore_ascii_case("shortcuts") {
            return Err(DecodeError::BadRoot);
        }

        let entries = d.map(1)?;

        // Closing byte of the (implicit) root map
        match d.byte() {
            Ok(TAG_END) => {}
            Ok(tag) => {
                return Err(DecodeError::BadTag {
                    tag,
                    offset: d.pos - 1,
                })
            }
            Err(_) => return Err(DecodeError::UnbalancedMap { depth: 1 }),
        }

        if d.pos != data.len() {
            return Err(DecodeError::BadTag {
                tag: data[d.pos],
                offset: d.pos,
            });
        }

        Ok(Self {
            entries,
            root_key,
        })
    }

    /// Encode back to the exact byte stream Steam's reader expects.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(TAG_MAP);
        out.extend_from_slice(self.root_key.as_bytes());
        out.push(0x00);
        encode_map(&mut out, &self.entries);
        out.push(TAG_END); // close root map
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry map at the given ordinal index.
    pub fn entry(&self, index: usize) -> Option<&VdfMap> {
        match self.entries.pairs().get(index) {
            Some((_, VdfValue::Map(m))) => Some(m),
            _ => None,
        }
    }

    fn entry_mut(&mut self, index: usize) -> Option<&mut VdfMap> {
        match self.entries.pairs.get_mut(index) {
            Some((_, VdfValue::Map(m))) => Some(m),
            _ => None,
        }
    }

    /// Find an entry by its natural key: the (Exe, StartDir) pair.
    pub fn find_by_key(&self, exe: &str, start_dir: &str) -> Option<usize> {
        (0..self.len()).find(|&i| {
            let Some(m) = self.entry(i) else { return false };
            m.get_str("Exe").map(unquote) == Some(unquote(exe))
                && m.get_str("StartDir").map(unquote) == Some(unquote(start_dir))
        })
    }

    /// Insert or update a shortcut.
    ///
    /// If an entry with the same (Exe, StartDir) pair exists, its fields are
    /// rewritten in place (ordinal unchanged, vendor keys untouched) and
    /// `created` is false. Otherwise a new entry is appended at the next
    /// contiguous ordinal. Repeated runs against the same install therefore
    /// never produce duplicate shortcuts.
    pub fn upsert(&mut self, candidate: &ShortcutEntry) -> (usize, bool) {
        match self.find_by_key(&candidate.exe, &candidate.start_dir) {
            Some(index) => {
                if let Some(map) = self.entry_mut(index) {
                    candidate.apply_to(map);
                }
                (index, false)
            }
            None => {
                let index = self.len();
                let mut map = VdfMap::new();
                candidate.apply_to(&mut map);
                self.entries
                    .push(index.to_string(), VdfValue::Map(map));
                (index, true)
            }
        }
    }
}

fn encode_map(out: &mut Vec<u8>, map: &VdfMap) {
    for (key, value) in map.pairs() {
        match value {
            VdfValue::String(s) => {
                out.push(TAG_STRING);
                out.extend_from_slice(key.as_bytes());
                out.push(0x00);
                out.extend_from_slice(s.as_bytes());
                out.push(0x00);
            }
            VdfValue::Int(v) => {
                out.push(TAG_INT);
                out.extend_from_slice(key.as_bytes());
                out.push(0x00);
                out.extend_from_slice(&v.to_le_bytes());
            }
            VdfValue::Map(m) => {
                out.push(TAG_MAP);
                out.extend_from_slice(key.as_bytes());
                out.push(0x00);
                encode_map(out, m);
            }
        }
    }
    out.push(TAG_END);
}

fn unquote(s: &str) -> &str {
    s.trim_matches('"')
}

// ============================================================================
// Shortcut entry (upsert candidate)
// ============================================================================

/// One Steam non-Steam game record, as this tool wants it to look.
/// Applying it to an existing entry overwrites these fields and leaves
/// everything else (vendor keys, unknown ints) in place.
#[derive(Clone, Debug)]
pub struct ShortcutEntry {
    pub app_id: u32,
    pub app_name: String,
    pub exe: String,
    pub start_dir: String,
    pub icon: String,
    pub launch_options: String,
    pub is_hidden: bool,
    pub last_play_time: u32,
    pub tags: Vec<String>,
}

impl ShortcutEntry {
    /// Create a new shortcut entry. The AppID is derived deterministically
    /// from the exe path and name (see `prefix::resolve_app_id`), so the
    /// same install always maps to the same shortcut.
    pub fn new(app_id: u32, app_name: &str, exe_path: &str, start_dir: &str) -> Self {
        Self {
            app_id,
            app_name: app_name.to_string(),
            exe: format!("\"{}\"", exe_path),
            start_dir: format!("\"{}\"", start_dir),
            icon: String::new(),
            launch_options: String::new(),
            is_hidden: false,
            last_play_time: 0,
            tags: vec!["Modforge".to_string()],
        }
    }

    pub fn with_launch_options(mut self, options: &str) -> Self {
        self.launch_options = options.to_string();
        self
    }

    pub fn with_icon(mut self, icon: &str) -> Self {
        self.icon = icon.to_string();
        self
    }

    fn apply_to(&self, map: &mut VdfMap) {
        // appid must come first on fresh entries; `set` keeps the position
        // on existing ones.
        map.set_int("appid", self.app_id);
        map.set_string("AppName", &self.app_name);
        map.set_string("Exe", &self.exe);
        map.set_string("StartDir", &self.start_dir);
        map.set_string("icon", &self.icon);
        map.set_string("LaunchOptions", &self.launch_options);
        map.set_int("IsHidden", self.is_hidden as u32);
        map.set_int("LastPlayTime", self.last_play_time);

        let mut tags = VdfMap::new();
        for (i, tag) in self.tags.iter().enumerate() {
            tags.push(i.to_string(), VdfValue::String(tag.clone()));
        }
        map.set("tags", VdfValue::Map(tags));
    }
}

// ============================================================================
// Persistence: locked read-mutate-write with atomic replace
// ============================================================================

/// Exclusive advisory lock held for the read-mutate-write span.
struct StoreLock {
    _file: fs::File,
}

impl StoreLock {
    fn acquire(store_path: &Path) -> std::io::Result<Self> {
        let lock_path = store_path.with_extension("vdf.lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { _file: file })
    }
}

// Dropping the file descriptor releases the flock.

/// Read the store from disk (empty store if the file does not exist yet).
pub fn load_store(path: &Path) -> Result<ShortcutStore, StoreError> {
    if !path.exists() {
        return Ok(ShortcutStore::new());
    }
    let data = fs::read(path)?;
    Ok(ShortcutStore::decode(&data)?)
}

/// Apply a mutation to the store file under an exclusive lock.
///
/// The sequence is: lock, read, decode, mutate, encode, write a temp file in
/// the same directory, atomically replace. A crash mid-write never leaves a
/// half-written store, and a decode failure aborts before any write. A
/// timestamped backup of the previous file is kept alongside.
pub fn update_store_file<T>(
    path: &Path,
    mutate: impl FnOnce(&mut ShortcutStore) -> T,
) -> Result<T, StoreError> {
    let _lock = StoreLock::acquire(path)?;

    let mut store = load_store(path)?;
    let result = mutate(&mut store);
    let encoded = store.encode();

    if path.exists() {
        let backup = path.with_extension(format!(
            "vdf.{}.bak",
            chrono::Local::now().timestamp()
        ));
        fs::copy(path, &backup)?;
    }

    let tmp = path.with_extension(format!("vdf.tmp.{}", std::process::id()));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    log_steam(&format!(
        "Wrote shortcut store ({} entries) to {}",
        store.len(),
        path.display()
    ));
    Ok(result)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(name: &str, exe: &str) -> ShortcutEntry {
        ShortcutEntry::new(0x8000_0001, name, exe, "/opt/lists")
    }

    /// Handcraft a store with a vendor-specific key this tool knows nothing
    /// about, placed between known fields.
    fn bytes_with_vendor_key() -> Vec<u8> {
        let mut b = Vec::new();
        b.push(0x00);
        b.extend_from_slice(b"shortcuts\x00");
        // entry "0"
        b.push(0x00);
        b.extend_from_slice(b"0\x00");
        b.push(0x02);
        b.extend_from_slice(b"appid\x00");
        b.extend_from_slice(&0x8000_0001u32.to_le_bytes());
        b.push(0x01);
        b.extend_from_slice(b"AppName\x00MyList\x00");
        b.push(0x01);
        b.extend_from_slice(b"CollectionsTag\x00vendor-data\x00"); // unknown key
        b.push(0x01);
        b.extend_from_slice(b"Exe\x00\"/opt/lists/ModOrganizer.exe\"\x00");
        b.push(0x01);
        b.extend_from_slice(b"StartDir\x00\"/opt/lists\"\x00");
        b.push(0x02);
        b.extend_from_slice(b"VendorCounter\x00");
        b.extend_from_slice(&7u32.to_le_bytes());
        b.push(0x08); // end entry
        b.push(0x08); // end shortcuts
        b.push(0x08); // end root
        b
    }

    #[test]
    fn decode_encode_is_byte_exact() {
        let bytes = bytes_with_vendor_key();
        let store = ShortcutStore::decode(&bytes).unwrap();
        assert_eq!(store.encode(), bytes);
    }

    #[test]
    fn root_key_casing_round_trips() {
        // Steam writes "shortcuts" but other tools have shipped other
        // casings; whatever was read must be re-emitted verbatim.
        let bytes = b"\x00Shortcuts\x00\x08\x08".to_vec();
        let store = ShortcutStore::decode(&bytes).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.encode(), bytes);
    }

    #[test]
    fn empty_store_round_trips() {
        let bytes = ShortcutStore::new().encode();
        let store = ShortcutStore::decode(&bytes).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.encode(), bytes);
    }

    #[test]
    fn vendor_keys_survive_modify_and_resave() {
        let store = ShortcutStore::decode(&bytes_with_vendor_key()).unwrap();
        let mut store = store;

        let mut candidate = sample_entry("MyList", "/opt/lists/ModOrganizer.exe");
        candidate.launch_options = "%command%".to_string();
        let (index, created) = store.upsert(&candidate);
        assert_eq!(index, 0);
        assert!(!created);

        let reparsed = ShortcutStore::decode(&store.encode()).unwrap();
        let entry = reparsed.entry(0).unwrap();
        assert_eq!(entry.get_str("CollectionsTag"), Some("vendor-data"));
        assert_eq!(entry.get_int("VendorCounter"), Some(7));
        assert_eq!(entry.get_str("LaunchOptions"), Some("%command%"));
        // position of the vendor key is untouched
        assert_eq!(entry.pairs()[2].0, "CollectionsTag");
    }

    #[test]
    fn decode_rejects_truncation() {
        let mut bytes = bytes_with_vendor_key();
        bytes.truncate(bytes.len() - 4);
        assert!(ShortcutStore::decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_bad_tag() {
        let mut bytes = bytes_with_vendor_key();
        // corrupt the appid tag byte
        let idx = bytes.iter().position(|&b| b == 0x02).unwrap();
        bytes[idx] = 0x07;
        match ShortcutStore::decode(&bytes) {
            Err(DecodeError::BadTag { tag: 0x07, .. }) => {}
            other => panic!("expected BadTag, got {:?}", other),
        }
    }

    #[test]
    fn decode_rejects_missing_root() {
        assert!(matches!(
            ShortcutStore::decode(b"\x01shortcuts\x00"),
            Err(DecodeError::BadRoot)
        ));
    }

    #[test]
    fn upsert_appends_at_next_ordinal() {
        let mut store = ShortcutStore::new();
        let (i0, c0) = store.upsert(&sample_entry("A", "/a/ModOrganizer.exe"));
        let (i1, c1) = store.upsert(&sample_entry("B", "/b/ModOrganizer.exe"));
        assert_eq!((i0, c0), (0, true));
        assert_eq!((i1, c1), (1, true));
        // ordinal keys are contiguous from 0
        let encoded = store.encode();
        let reparsed = ShortcutStore::decode(&encoded).unwrap();
        assert_eq!(reparsed.len(), 2);
        assert_eq!(reparsed.entry(1).unwrap().get_str("AppName"), Some("B"));
    }

    #[test]
    fn upsert_same_key_updates_in_place() {
        let mut store = ShortcutStore::new();
        store.upsert(&sample_entry("First", "/a/ModOrganizer.exe"));
        store.upsert(&sample_entry("Other", "/b/ModOrganizer.exe"));

        let mut second = sample_entry("Renamed", "/a/ModOrganizer.exe");
        second.launch_options = "FOO=1 %command%".to_string();
        let (index, created) = store.upsert(&second);

        assert_eq!(index, 0);
        assert!(!created);
        assert_eq!(store.len(), 2);
        let entry = store.entry(0).unwrap();
        assert_eq!(entry.get_str("AppName"), Some("Renamed"));
        assert_eq!(entry.get_str("LaunchOptions"), Some("FOO=1 %command%"));
    }

    #[test]
    fn update_store_file_is_atomic_and_creates_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shortcuts.vdf");

        update_store_file(&path, |store| {
            store.upsert(&sample_entry("A", "/a/ModOrganizer.exe"));
        })
        .unwrap();
        assert!(path.exists());

        update_store_file(&path, |store| {
            store.upsert(&sample_entry("B", "/b/ModOrganizer.exe"));
        })
        .unwrap();

        let store = load_store(&path).unwrap();
        assert_eq!(store.len(), 2);

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .collect();
        assert!(!backups.is_empty());
    }

    #[test]
    fn corrupt_store_is_never_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shortcuts.vdf");
        fs::write(&path, b"\x00shortcuts\x00\x00garbage").unwrap();

        let result = update_store_file(&path, |store| {
            store.upsert(&sample_entry("A", "/a/ModOrganizer.exe"));
        });
        assert!(result.is_err());
        // original bytes untouched
        assert_eq!(fs::read(&path).unwrap(), b"\x00shortcuts\x00\x00garbage");
    }
}
