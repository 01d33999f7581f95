//! `object_folder` — keyed persistent map, one JSON file per object.
//!
//! Values are serialized as UTF-8 JSON into `<dir>/<encoded-key>.json`.
//! Keys are opaque strings; bytes outside `[A-Za-z0-9._-]` are
//! percent-encoded in the file name so any key round-trips losslessly.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct ObjectFolder<T> {
    dir: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> ObjectFolder<T> {
    /// Open (or create) the folder at `dir`. Safe to call repeatedly.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            _marker: PhantomData,
        })
    }

    /// Root directory of this folder.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn put(&self, key: &str, value: &T) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidInput("empty object key".into()));
        }
        let json = serde_json::to_vec(value)?;
        fs::write(self.path_for(key), json)?;
        Ok(())
    }

    /// Fetch the object stored under `key`. An unreadable or undecodable
    /// file fails only this key with [`StoreError::CorruptData`].
    pub fn get(&self, key: &str) -> Result<Option<T>, StoreError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::CorruptData {
                table: self.dir.display().to_string(),
                detail: format!("undecodable object {key:?}: {e}"),
            })
    }

    pub fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(key).exists())
    }

    /// Delete the object if present.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All stored keys, in unspecified order.
    pub fn all_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(encoded) = name.strip_suffix(".json") {
                keys.push(decode_key(encoded));
            }
        }
        Ok(keys)
    }

    /// All `(key, object)` pairs. Undecodable files fail the scan.
    pub fn all_objects(&self) -> Result<Vec<(String, T)>, StoreError> {
        let mut out = Vec::new();
        for key in self.all_keys()? {
            if let Some(value) = self.get(&key)? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// Number of stored objects.
    pub fn size(&self) -> Result<usize, StoreError> {
        Ok(self.all_keys()?.len())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

/// Percent-encode every byte outside `[A-Za-z0-9._-]`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn decode_key(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(b) = u8::from_str_radix(&encoded[i + 1..i + 3], 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
