//! On-disk checkpoint format.
//!
//! A checkpoint is a directory holding an attribute store (`attributes.bin`,
//! every configuration object's register values), any number of raw memory
//! images (`*.img`) and, once fully written, a `complete` marker.

use crate::value::Value;
use bincode::{
    self,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
    Decode, Encode,
};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ATTRIBUTES_FILE: &str = "attributes.bin";
pub const MEMORY_IMAGE_EXTENSION: &str = "img";
pub const COMPLETE_MARKER: &str = "complete";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(String),

    #[error("Checkpoint encoding error: {0}")]
    Serialization(String),

    #[error("Checkpoint decoding error: {0}")]
    Deserialization(String),

    #[error("Configuration object {0:?} not found in checkpoint")]
    MissingObject(String),

    #[error("Register {register:?} not found on {object:?}")]
    MissingRegister { object: String, register: String },

    #[error("Memory image {0:?} not found in checkpoint")]
    MissingImage(String),
}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        CheckpointError::Io(err.to_string())
    }
}
impl From<EncodeError> for CheckpointError {
    fn from(err: EncodeError) -> Self {
        CheckpointError::Serialization(format!("Bincode encoding error: {}", err))
    }
}
impl From<DecodeError> for CheckpointError {
    fn from(err: DecodeError) -> Self {
        CheckpointError::Deserialization(format!("Bincode decoding error: {}", err))
    }
}

fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Register values of every configuration object in a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct AttributeStore {
    objects: BTreeMap<String, BTreeMap<String, Value>>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the attribute store of the checkpoint at `dir`.
    pub fn read(dir: &Path) -> Result<Self, CheckpointError> {
        let path = dir.join(ATTRIBUTES_FILE);
        let bytes = fs::read(&path)
            .map_err(|e| CheckpointError::Io(format!("Failed to read {:?}: {}", path, e)))?;
        let (store, _) = bincode::decode_from_slice(&bytes, bincode_config())?;
        Ok(store)
    }

    /// Writes the attribute store into the checkpoint at `dir`, creating the
    /// directory if needed.
    pub fn write(&self, dir: &Path) -> Result<(), CheckpointError> {
        fs::create_dir_all(dir)?;
        let bytes = bincode::encode_to_vec(self, bincode_config())?;
        let path = dir.join(ATTRIBUTES_FILE);
        fs::write(&path, bytes)
            .map_err(|e| CheckpointError::Io(format!("Failed to write {:?}: {}", path, e)))
    }

    pub fn get(&self, object: &str, register: &str) -> Result<&Value, CheckpointError> {
        self.objects
            .get(object)
            .ok_or_else(|| CheckpointError::MissingObject(object.to_string()))?
            .get(register)
            .ok_or_else(|| CheckpointError::MissingRegister {
                object: object.to_string(),
                register: register.to_string(),
            })
    }

    pub fn get_mut(&mut self, object: &str, register: &str) -> Result<&mut Value, CheckpointError> {
        self.objects
            .get_mut(object)
            .ok_or_else(|| CheckpointError::MissingObject(object.to_string()))?
            .get_mut(register)
            .ok_or_else(|| CheckpointError::MissingRegister {
                object: object.to_string(),
                register: register.to_string(),
            })
    }

    pub fn set(&mut self, object: &str, register: &str, value: Value) {
        self.objects
            .entry(object.to_string())
            .or_default()
            .insert(register.to_string(), value);
    }

    pub fn remove_object(&mut self, object: &str) -> Option<BTreeMap<String, Value>> {
        self.objects.remove(object)
    }

    pub fn objects(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, Value>)> {
        self.objects.iter()
    }
}

/// Reading and editing the attributes of a written checkpoint. Debugger
/// backends implement this so that injection and comparison go through the
/// session that wrote the checkpoint; the defaults handle the native format.
pub trait AttributeAccess {
    fn read_checkpoint(&self, path: &Path) -> Result<AttributeStore, CheckpointError> {
        AttributeStore::read(path)
    }

    fn get_attr<'a>(
        &self,
        store: &'a AttributeStore,
        object: &str,
        register: &str,
    ) -> Result<&'a Value, CheckpointError> {
        store.get(object, register)
    }

    fn set_attr(&self, store: &mut AttributeStore, object: &str, register: &str, value: Value) {
        store.set(object, register, value);
    }
}

/// Attribute access for checkpoints outside any debugger session.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeAttributes;

impl AttributeAccess for NativeAttributes {}

/// Copies every regular file of `source` into `destination`.
pub fn copy_checkpoint(source: &Path, destination: &Path) -> Result<(), CheckpointError> {
    fs::create_dir_all(destination)?;
    let entries = fs::read_dir(source)
        .map_err(|e| CheckpointError::Io(format!("Failed to read checkpoint {:?}: {}", source, e)))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() {
            let file_name = entry.file_name();
            if file_name == COMPLETE_MARKER {
                continue;
            }
            fs::copy(&path, destination.join(&file_name)).map_err(|e| {
                CheckpointError::Io(format!("Failed to copy {:?} into {:?}: {}", path, destination, e))
            })?;
        }
    }
    Ok(())
}

pub fn mark_complete(dir: &Path) -> Result<(), CheckpointError> {
    fs::write(dir.join(COMPLETE_MARKER), b"")?;
    Ok(())
}

pub fn is_complete(dir: &Path) -> bool {
    dir.join(COMPLETE_MARKER).is_file()
}

/// Names of the memory images in a checkpoint, sorted.
pub fn memory_images(dir: &Path) -> Result<Vec<String>, CheckpointError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == MEMORY_IMAGE_EXTENSION) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

pub fn read_memory_image(dir: &Path, name: &str) -> Result<Vec<u8>, CheckpointError> {
    let path = dir.join(name);
    if !path.is_file() {
        return Err(CheckpointError::MissingImage(name.to_string()));
    }
    Ok(fs::read(path)?)
}

pub fn write_memory_image(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, CheckpointError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    fs::write(&path, bytes)?;
    Ok(path)
}

/// MD5 over every file name and content in the checkpoint, in name order.
/// Two checkpoints with the same fingerprint hold identical state.
pub fn fingerprint(dir: &Path) -> Result<String, CheckpointError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut context = md5::Context::new();
    for path in files {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            context.consume(name.as_bytes());
        }
        let mut contents = Vec::new();
        fs::File::open(&path)?.read_to_end(&mut contents)?;
        context.consume(&contents);
    }
    Ok(format!("{:x}", context.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_store() -> AttributeStore {
        let mut store = AttributeStore::new();
        store.set("DUT.cpu[0]", "pc", Value::Scalar(0x1000));
        store.set(
            "DUT.cpu[0]",
            "gprs",
            Value::Array(vec![Value::Scalar(1), Value::Scalar(2)]),
        );
        store
    }

    #[test]
    fn attribute_store_persists_through_disk() {
        let dir = tempdir().unwrap();
        let store = sample_store();
        store.write(dir.path()).unwrap();

        let loaded = AttributeStore::read(dir.path()).unwrap();
        assert_eq!(loaded, store);
        assert_eq!(loaded.get("DUT.cpu[0]", "pc").unwrap(), &Value::Scalar(0x1000));
    }

    #[test]
    fn get_reports_missing_object_and_register() {
        let store = sample_store();
        assert_eq!(
            store.get("DUT.cpu[1]", "pc"),
            Err(CheckpointError::MissingObject("DUT.cpu[1]".to_string()))
        );
        assert!(matches!(
            store.get("DUT.cpu[0]", "lr"),
            Err(CheckpointError::MissingRegister { .. })
        ));
    }

    #[test]
    fn read_of_missing_checkpoint_is_io_error() {
        let dir = tempdir().unwrap();
        match AttributeStore::read(&dir.path().join("absent")) {
            Err(CheckpointError::Io(msg)) => assert!(msg.contains("attributes.bin")),
            other => panic!("Expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn copy_checkpoint_preserves_fingerprint_but_not_marker() {
        let dir = tempdir().unwrap();
        let gold = dir.path().join("gold");
        sample_store().write(&gold).unwrap();
        write_memory_image(&gold, "ram.img", &[0xAA; 64]).unwrap();
        mark_complete(&gold).unwrap();

        let copy = dir.path().join("copy");
        copy_checkpoint(&gold, &copy).unwrap();
        assert!(!is_complete(&copy), "Copies start incomplete");
        mark_complete(&copy).unwrap();
        assert_eq!(fingerprint(&gold).unwrap(), fingerprint(&copy).unwrap());

        write_memory_image(&copy, "ram.img", &[0xAB; 64]).unwrap();
        assert_ne!(fingerprint(&gold).unwrap(), fingerprint(&copy).unwrap());
    }

    #[test]
    fn memory_images_are_listed_in_order() {
        let dir = tempdir().unwrap();
        write_memory_image(dir.path(), "b.img", &[1]).unwrap();
        write_memory_image(dir.path(), "a.img", &[2]).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        assert_eq!(memory_images(dir.path()).unwrap(), vec!["a.img", "b.img"]);
        assert_eq!(
            read_memory_image(dir.path(), "c.img"),
            Err(CheckpointError::MissingImage("c.img".to_string()))
        );
    }
}
