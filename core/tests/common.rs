#![allow(dead_code)]

use dense_search_backend_core::{
    Backend, BackendError, BackendLoader, Batch, Device, Embeddings,
};
use dense_search_core::{CorpusItem, QueryItem};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub fn is_close(a: f32, b: f32) -> bool {
    is_close::default().abs_tol(1e-5).is_close(a, b)
}

/// Embeddings looked up by input text
#[derive(Default)]
pub struct LookupTable {
    embeddings: HashMap<String, Vec<f32>>,
    /// Texts whose encoding fails
    poisoned: HashSet<String>,
    /// Texts whose encoding panics the worker thread
    crashing: HashSet<String>,
}

impl LookupTable {
    pub fn insert(&mut self, text: impl Into<String>, embedding: Vec<f32>) {
        self.embeddings.insert(text.into(), embedding);
    }

    pub fn poison(&mut self, text: impl Into<String>) {
        self.poisoned.insert(text.into());
    }

    pub fn crash_on(&mut self, text: impl Into<String>) {
        self.crashing.insert(text.into());
    }
}

pub struct LookupBackend {
    table: Arc<LookupTable>,
    max_batch_size: Option<usize>,
}

impl Backend for LookupBackend {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn max_batch_size(&self) -> Option<usize> {
        self.max_batch_size
    }

    fn embed(&self, batch: Batch) -> Result<Embeddings, BackendError> {
        batch
            .inputs
            .iter()
            .map(|input| {
                let text = input.joined();
                if self.table.crashing.contains(&text) {
                    panic!("device lost while encoding `{text}`");
                }
                if self.table.poisoned.contains(&text) {
                    return Err(BackendError::Inference(format!("cannot encode `{text}`")));
                }
                self.table
                    .embeddings
                    .get(&text)
                    .cloned()
                    .ok_or_else(|| BackendError::Inference(format!("unknown input `{text}`")))
            })
            .collect()
    }
}

pub struct LookupLoader {
    pub table: Arc<LookupTable>,
    pub max_batch_size: Option<usize>,
    /// Devices that refuse to load
    pub broken_devices: Vec<String>,
    pub loads: AtomicUsize,
}

impl LookupLoader {
    pub fn new(table: LookupTable) -> Self {
        Self {
            table: Arc::new(table),
            max_batch_size: Some(3),
            broken_devices: Vec::new(),
            loads: AtomicUsize::new(0),
        }
    }
}

impl BackendLoader for LookupLoader {
    fn load(&self, device: &Device) -> Result<Box<dyn Backend + Send>, BackendError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.broken_devices.iter().any(|d| d == device.as_str()) {
            return Err(BackendError::Start(format!("{device} is unavailable")));
        }
        Ok(Box::new(LookupBackend {
            table: self.table.clone(),
            max_batch_size: self.max_batch_size,
        }))
    }
}

pub fn devices(n: usize) -> Vec<Device> {
    (0..n).map(|i| Device::new(format!("cpu:{i}"))).collect()
}

pub fn corpus_item(id: &str, text: &str) -> CorpusItem {
    CorpusItem {
        id: id.to_string(),
        title: None,
        text: text.to_string(),
    }
}

pub fn query_item(id: &str, text: &str) -> QueryItem {
    QueryItem {
        id: id.to_string(),
        text: text.to_string(),
    }
}

/// Deterministic pseudo-random vectors
pub fn pseudo_random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            (0..dim)
                .map(|_| {
                    state = state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    ((state >> 33) as f32 / (1u64 << 31) as f32) * 2.0 - 1.0
                })
                .collect()
        })
        .collect()
}
