use std::fs;
use std::path::Path;

use crate::error::StoreError;
use crate::memory::{MemoryStore, StoreSnapshot};

/// Encodes a [`StoreSnapshot`] to CBOR bytes.
pub fn encode_snapshot_cbor(snapshot: &StoreSnapshot) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(snapshot, &mut out)
        .map_err(|e| StoreError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decodes a [`StoreSnapshot`] from CBOR bytes.
pub fn decode_snapshot_cbor(bytes: &[u8]) -> Result<StoreSnapshot, StoreError> {
    ciborium::de::from_reader(bytes).map_err(|e| StoreError::Decode(e.to_string()))
}

/// Saves the store contents to `path` as CBOR, via a temporary sibling file.
pub fn save_to_path(path: impl AsRef<Path>, store: &MemoryStore) -> Result<(), StoreError> {
    let bytes = encode_snapshot_cbor(&store.snapshot())?;
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(StoreError::Write)?;
    fs::rename(&tmp, path).map_err(StoreError::Write)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<MemoryStore, StoreError> {
    let bytes = fs::read(path.as_ref()).map_err(StoreError::Read)?;
    Ok(MemoryStore::from_snapshot(decode_snapshot_cbor(&bytes)?))
}

/// Loads the store if the file exists; otherwise returns an empty store.
pub fn load_or_default(path: impl AsRef<Path>) -> Result<MemoryStore, StoreError> {
    if !path.as_ref().exists() {
        return Ok(MemoryStore::new());
    }
    load_from_path(path)
}
