//! Builds small `torch.save`-style archives holding a heterogeneous graph
//! batch, so tests can run against real files.

#![allow(dead_code)]

use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// One attribute value inside a storage `_mapping`.
pub enum Attr {
    Long(Vec<i64>),
    /// Raw long storage viewed through an explicit shape and stride.
    LongView {
        values: Vec<i64>,
        shape: Vec<usize>,
        stride: Vec<usize>,
    },
    Matrix(Vec<Vec<f32>>),
    BoolColumn(Vec<bool>),
    Int(i64),
    StrList(Vec<String>),
}

pub struct Store {
    pub name: String,
    pub attrs: Vec<(String, Attr)>,
}

impl Store {
    pub fn new(name: &str) -> Self {
        Store {
            name: name.to_string(),
            attrs: Vec::new(),
        }
    }

    pub fn with(mut self, key: &str, attr: Attr) -> Self {
        self.attrs.push((key.to_string(), attr));
        self
    }
}

/// A batch with a global store and any number of node stores.
pub struct SceneSpec {
    pub global: Vec<(String, Attr)>,
    pub stores: Vec<Store>,
}

impl SceneSpec {
    pub fn new() -> Self {
        SceneSpec {
            global: Vec::new(),
            stores: Vec::new(),
        }
    }

    pub fn global(mut self, key: &str, attr: Attr) -> Self {
        self.global.push((key.to_string(), attr));
        self
    }

    pub fn store(mut self, store: Store) -> Self {
        self.stores.push(store);
        self
    }

    pub fn write(&self, path: &Path) {
        fs::write(path, self.archive_bytes()).unwrap();
    }

    pub fn archive_bytes(&self) -> Vec<u8> {
        let mut p = PickleWriter::new();

        p.global("torch_geometric.data.hetero_data", "HeteroData");
        p.op(b')');
        p.op(0x81);
        p.op(b'q');
        p.op(0);

        p.op(b'}');
        p.string("_global_store");
        p.storage_object("", &self.global);
        p.op(b's');

        p.string("_node_store_dict");
        p.op(b'}');
        for store in &self.stores {
            p.string(&store.name);
            p.storage_object(&store.name, &store.attrs);
            p.op(b's');
        }
        p.op(b's');

        p.op(b'b');
        p.op(b'.');

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        writer.start_file("archive/data.pkl", options).unwrap();
        writer.write_all(&p.buf).unwrap();
        writer.start_file("archive/byteorder", options).unwrap();
        writer.write_all(b"little").unwrap();
        for (key, bytes) in &p.storages {
            writer
                .start_file(format!("archive/data/{key}"), options)
                .unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.start_file("archive/version", options).unwrap();
        writer.write_all(b"3\n").unwrap();
        writer.finish().unwrap().into_inner()
    }
}

/// Boundary sequence for the given per-timestep vehicle counts.
pub fn ptr_for(counts: &[i64]) -> Vec<i64> {
    let mut ptr = vec![0];
    for c in counts {
        ptr.push(ptr[ptr.len() - 1] + c);
    }
    ptr
}

/// A vehicle store batched over timesteps with the given counts.
pub fn batched_vehicles(counts: &[i64]) -> Store {
    let ptr = ptr_for(counts);
    let total = *ptr.last().unwrap() as usize;
    let batch = counts
        .iter()
        .enumerate()
        .flat_map(|(t, c)| std::iter::repeat(t as i64).take(*c as usize))
        .collect();

    Store::new("vehicle")
        .with("x", Attr::Matrix(vec![vec![0.0; 11]; total]))
        .with("batch", Attr::Long(batch))
        .with("ptr", Attr::Long(ptr))
}

struct PickleWriter {
    buf: Vec<u8>,
    storages: Vec<(String, Vec<u8>)>,
}

impl PickleWriter {
    fn new() -> Self {
        PickleWriter {
            buf: vec![0x80, 0x02],
            storages: Vec::new(),
        }
    }

    fn op(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn string(&mut self, s: &str) {
        self.op(b'X');
        self.buf.extend((s.len() as u32).to_le_bytes());
        self.buf.extend(s.as_bytes());
    }

    fn int(&mut self, v: i64) {
        if (0..256).contains(&v) {
            self.op(b'K');
            self.op(v as u8);
        } else if let Ok(v) = i32::try_from(v) {
            self.op(b'J');
            self.buf.extend(v.to_le_bytes());
        } else {
            self.op(0x8a);
            self.op(8);
            self.buf.extend(v.to_le_bytes());
        }
    }

    fn global(&mut self, module: &str, name: &str) {
        self.op(b'c');
        self.buf.extend(format!("{module}\n{name}\n").as_bytes());
    }

    fn storage_object(&mut self, key: &str, attrs: &[(String, Attr)]) {
        self.global("torch_geometric.data.storage", "NodeStorage");
        self.op(b')');
        self.op(0x81);

        self.op(b'}');
        self.string("_mapping");
        self.op(b'}');
        for (name, attr) in attrs {
            self.string(name);
            self.attr(attr);
            self.op(b's');
        }
        self.op(b's');

        // back reference to the parent batch
        self.string("_parent");
        self.op(b'h');
        self.op(0);
        self.op(b's');

        self.string("_key");
        self.string(key);
        self.op(b's');

        self.op(b'b');
    }

    fn attr(&mut self, attr: &Attr) {
        match attr {
            Attr::Int(v) => self.int(*v),
            Attr::StrList(items) => {
                self.op(b']');
                self.op(b'(');
                for item in items {
                    self.string(item);
                }
                self.op(b'e');
            }
            Attr::Long(values) => {
                let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                self.tensor("LongStorage", bytes, values.len(), &[values.len()], None);
            }
            Attr::LongView {
                values,
                shape,
                stride,
            } => {
                let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                let stride = Some(stride.as_slice());
                self.tensor("LongStorage", bytes, values.len(), shape, stride);
            }
            Attr::Matrix(rows) => {
                let cols = rows.first().map_or(0, Vec::len);
                let bytes = rows.iter().flatten().flat_map(|v| v.to_le_bytes()).collect();
                let shape = [rows.len(), cols];
                self.tensor("FloatStorage", bytes, rows.len() * cols, &shape, None);
            }
            Attr::BoolColumn(values) => {
                let bytes = values.iter().map(|b| *b as u8).collect();
                self.tensor("BoolStorage", bytes, values.len(), &[values.len(), 1], None);
            }
        }
    }

    fn tensor(
        &mut self,
        class: &str,
        bytes: Vec<u8>,
        numel: usize,
        shape: &[usize],
        stride: Option<&[usize]>,
    ) {
        let key = self.storages.len().to_string();
        self.storages.push((key.clone(), bytes));

        let stride = match stride {
            Some(stride) => stride.to_vec(),
            None => {
                let mut stride = vec![1usize; shape.len()];
                for i in (0..shape.len().saturating_sub(1)).rev() {
                    stride[i] = stride[i + 1] * shape[i + 1];
                }
                stride
            }
        };

        self.global("torch._utils", "_rebuild_tensor_v2");
        self.op(b'(');

        self.op(b'(');
        self.string("storage");
        self.global("torch", class);
        self.string(&key);
        self.string("cpu");
        self.int(numel as i64);
        self.op(b't');
        self.op(b'Q');

        self.int(0);
        self.usize_tuple(shape);
        self.usize_tuple(&stride);
        self.op(0x89);
        self.global("collections", "OrderedDict");
        self.op(b')');
        self.op(b'R');

        self.op(b't');
        self.op(b'R');
    }

    fn usize_tuple(&mut self, values: &[usize]) {
        self.op(b'(');
        for v in values {
            self.int(*v as i64);
        }
        self.op(b't');
    }
}
