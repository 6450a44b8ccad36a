//! Typed view over a decoded heterogeneous graph batch.
//!
//! A batch pickles as an object whose state holds `_global_store` (graph
//! level attributes such as `scenario_id`) and `_node_store_dict`, which maps
//! node types (`vehicle`, `lanelet`, ...) to storages. Every storage keeps
//! its attributes in a `_mapping` dict.

use std::path::Path;

use crate::dataset::archive::TorchArchive;
use crate::dataset::pickle::Value;
use crate::dataset::tensor::{Tensor, TensorRef};
use crate::error::DecodeError;

/// Attribute keys whose leading dimension counts nodes.
const NODE_COUNT_KEYS: [&str; 6] = ["x", "feat", "pos", "batch", "node_type", "n_id"];

/// Attributes of one node type.
#[derive(Debug, Clone)]
pub struct NodeStore {
    name: String,
    attrs: Vec<(String, Value)>,
}

impl NodeStore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.attrs.iter().map(|(k, _)| k.as_str())
    }

    /// A tensor attribute, if present and tensor-valued.
    pub fn tensor_ref(&self, key: &str) -> Option<&TensorRef> {
        self.get(key).and_then(Value::as_tensor)
    }

    /// The per-timestep boundary tensor of a batched store.
    pub fn ptr(&self) -> Option<&TensorRef> {
        self.tensor_ref("ptr")
    }
}

/// A decoded dataset file.
#[derive(Debug)]
pub struct SceneGraph {
    archive: TorchArchive,
    global: Vec<(String, Value)>,
    stores: Vec<NodeStore>,
}

impl SceneGraph {
    pub fn open(path: &Path) -> Result<Self, DecodeError> {
        Self::from_archive(TorchArchive::open(path)?)
    }

    pub fn from_archive(archive: TorchArchive) -> Result<Self, DecodeError> {
        let root = archive.root();

        let global = find_key(root, "_global_store")
            .or_else(|| find_key(root, "_store"))
            .map(mapping_of)
            .unwrap_or_default();

        let stores = match find_key(root, "_node_store_dict").and_then(Value::as_dict) {
            Some(entries) => entries
                .iter()
                .filter_map(|(k, v)| {
                    k.as_str().map(|name| NodeStore {
                        name: name.to_string(),
                        attrs: mapping_of(v),
                    })
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(SceneGraph {
            archive,
            global,
            stores,
        })
    }

    /// Graph-level attribute such as `scenario_id`.
    pub fn global(&self, key: &str) -> Option<&Value> {
        self.global.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn stores(&self) -> &[NodeStore] {
        &self.stores
    }

    pub fn node_store(&self, name: &str) -> Option<&NodeStore> {
        self.stores.iter().find(|s| s.name == name)
    }

    pub fn require_store(&self, name: &str) -> Result<&NodeStore, DecodeError> {
        self.node_store(name)
            .ok_or_else(|| DecodeError::MissingNodeStore(name.to_string()))
    }

    pub fn tensor(&self, tref: &TensorRef) -> Result<Tensor<'_>, DecodeError> {
        self.archive.tensor(tref)
    }

    /// Materializes `store[key]` when it is a tensor.
    pub fn store_tensor(
        &self,
        store: &NodeStore,
        key: &str,
    ) -> Result<Option<Tensor<'_>>, DecodeError> {
        store.tensor_ref(key).map(|t| self.tensor(t)).transpose()
    }

    /// Node count of a store.
    ///
    /// An explicit `num_nodes` attribute wins. Otherwise the count is the
    /// leading dimension of the first node-indexed tensor, then of any
    /// tensor whose key mentions `node`.
    pub fn num_nodes(&self, store: &NodeStore) -> Result<Option<usize>, DecodeError> {
        match store.get("num_nodes") {
            Some(Value::Int(n)) => return non_negative("num_nodes", *n).map(Some),
            Some(Value::Tensor(t)) => {
                let tensor = self.tensor(t)?;
                if tensor.numel() != 1 {
                    return Err(invalid("num_nodes", "expected a scalar tensor"));
                }
                let n = tensor.to_i64_vec()?[0];
                return non_negative("num_nodes", n).map(Some);
            }
            Some(Value::None) | None => {}
            Some(_) => return Err(invalid("num_nodes", "expected an integer")),
        }

        let by_known_key = store
            .attrs
            .iter()
            .filter(|(k, _)| NODE_COUNT_KEYS.contains(&k.as_str()))
            .find_map(|(_, v)| v.as_tensor());
        let by_node_key = || {
            store
                .attrs
                .iter()
                .filter(|(k, _)| k.contains("node"))
                .find_map(|(_, v)| v.as_tensor())
        };

        Ok(by_known_key.or_else(by_node_key).and_then(TensorRef::dim0))
    }
}

/// Depth-first search for a string key in nested dicts and object states.
fn find_key<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
    match value {
        Value::Dict(entries) => entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
            .or_else(|| entries.iter().find_map(|(_, v)| find_key(v, key))),
        Value::Object { state: Some(state), .. } => find_key(state, key),
        Value::List(items) | Value::Tuple(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}

/// The attribute mapping of a storage object, or of a bare dict.
fn mapping_of(value: &Value) -> Vec<(String, Value)> {
    let mapping = match value {
        Value::Object { .. } => value.state().and_then(|s| s.get("_mapping")),
        Value::Dict(_) => value.get("_mapping").or(Some(value)),
        _ => None,
    };

    mapping
        .and_then(Value::as_dict)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
                .collect()
        })
        .unwrap_or_default()
}

fn non_negative(key: &str, n: i64) -> Result<usize, DecodeError> {
    usize::try_from(n).map_err(|_| invalid(key, "negative count"))
}

fn invalid(key: &str, reason: &str) -> DecodeError {
    DecodeError::InvalidAttribute {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
