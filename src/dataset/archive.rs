//! Reader for `torch.save` zip archives.
//!
//! An archive holds `<prefix>/data.pkl`, an optional `<prefix>/byteorder`
//! marker and one raw blob per storage under `<prefix>/data/<key>`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use tracing::debug;
use zip::ZipArchive;

use crate::dataset::pickle::{self, Value};
use crate::dataset::tensor::{Tensor, TensorRef};
use crate::error::DecodeError;

const PICKLE_ENTRY: &str = "data.pkl";
const MAX_PREALLOC: usize = 64 << 20;

/// A fully loaded archive: the decoded object tree plus every storage blob.
#[derive(Debug)]
pub struct TorchArchive {
    root: Value,
    storages: HashMap<String, Vec<u8>>,
    big_endian: bool,
}

impl TorchArchive {
    /// Opens and decodes the archive at `path`.
    pub fn open(path: &Path) -> Result<Self, DecodeError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self, DecodeError> {
        let mut zip = ZipArchive::new(reader)?;
        let names: Vec<String> = zip.file_names().map(str::to_string).collect();

        let pickle_name = names
            .iter()
            .filter(|name| name.ends_with(PICKLE_ENTRY))
            .min_by_key(|name| name.len())
            .ok_or(DecodeError::MissingPickle)?
            .clone();
        let prefix = &pickle_name[..pickle_name.len() - PICKLE_ENTRY.len()];

        let pickle_bytes = read_entry(&mut zip, &pickle_name)?;
        let root = pickle::decode(&pickle_bytes)?;

        let byteorder_name = format!("{prefix}byteorder");
        let big_endian = if names.contains(&byteorder_name) {
            let marker = read_entry(&mut zip, &byteorder_name)?;
            String::from_utf8_lossy(&marker).trim() == "big"
        } else {
            false
        };

        let data_prefix = format!("{prefix}data/");
        let mut storages = HashMap::new();
        for name in &names {
            if let Some(key) = name.strip_prefix(&data_prefix) {
                if key.is_empty() || key.contains('/') {
                    continue;
                }
                storages.insert(key.to_string(), read_entry(&mut zip, name)?);
            }
        }

        debug!(
            entries = names.len(),
            storages = storages.len(),
            big_endian,
            "Torch archive loaded"
        );

        Ok(TorchArchive {
            root,
            storages,
            big_endian,
        })
    }

    /// The unpickled top-level object.
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Attaches storage bytes to a tensor description.
    pub fn tensor(&self, tref: &TensorRef) -> Result<Tensor<'_>, DecodeError> {
        let data = self
            .storages
            .get(&tref.storage.key)
            .ok_or_else(|| DecodeError::MissingStorage(tref.storage.key.clone()))?;
        Tensor::new(tref, data, self.big_endian)
    }
}

fn read_entry<R: Read + Seek>(zip: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>, DecodeError> {
    let mut entry = zip.by_name(name)?;
    // declared entry sizes are untrusted
    let capacity = usize::try_from(entry.size()).map_or(0, |n| n.min(MAX_PREALLOC));
    let mut buf = Vec::with_capacity(capacity);
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}
