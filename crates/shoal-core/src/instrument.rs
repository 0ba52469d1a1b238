//! At-most-once cache of instrumented code.
//!
//! Producing instrumented code is expensive, and many workers ask for the same
//! unit at once. [`CodeCache`] keys each `(variant, name)` pair to its own
//! `OnceLock`: the first caller runs the [`CodeLoader`], concurrent callers
//! for the same key block on that cell, and later callers read it directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::report::{PropertyValue, Reportable};

/// Which flavour of a code unit is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodeVariant {
    /// The code as found, untouched.
    Uninstrumented,
    /// Full instrumentation, as divers need it.
    Heavy,
    /// Decision-recording only, as surfers need it.
    Light,
}

impl std::fmt::Display for CodeVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CodeVariant::Uninstrumented => "uninstrumented",
            CodeVariant::Heavy => "heavy",
            CodeVariant::Light => "light",
        };
        f.write_str(s)
    }
}

/// Computes a code unit. `Ok(None)` means the unit does not exist.
pub trait CodeLoader: Send + Sync {
    fn load(&self, variant: CodeVariant, name: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

impl<F> CodeLoader for F
where
    F: Fn(CodeVariant, &str) -> anyhow::Result<Option<Vec<u8>>> + Send + Sync,
{
    fn load(&self, variant: CodeVariant, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self(variant, name)
    }
}

type Cell = Arc<OnceLock<Option<Arc<[u8]>>>>;

pub struct CodeCache {
    loader: Box<dyn CodeLoader>,
    cells: Mutex<HashMap<(CodeVariant, String), Cell>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CodeCache {
    pub fn new<L: CodeLoader + 'static>(loader: L) -> Self {
        Self {
            loader: Box::new(loader),
            cells: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve a code unit, loading it on first request only.
    ///
    /// A loader error is logged and remembered as not-found.
    pub fn resolve(&self, variant: CodeVariant, name: &str) -> Option<Arc<[u8]>> {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cells.entry((variant, name.to_string())).or_default())
        };

        let mut loaded = false;
        let code = cell.get_or_init(|| {
            loaded = true;
            match self.loader.load(variant, name) {
                Ok(code) => {
                    debug!(%variant, name, found = code.is_some(), "code unit loaded");
                    code.map(Arc::from)
                }
                Err(err) => {
                    warn!(%variant, name, error = %err, "failed to load code unit");
                    None
                }
            }
        });
        if loaded {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        code.clone()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of distinct keys requested so far.
    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("entries", &self.len())
            .field("hits", &self.hit_count())
            .field("misses", &self.miss_count())
            .finish()
    }
}

impl Reportable for CodeCache {
    fn name(&self) -> String {
        "Instrumentation".into()
    }

    fn property_names(&self) -> Vec<String> {
        vec![
            "cache-hit-count".into(),
            "cache-miss-count".into(),
            "#cached".into(),
        ]
    }

    fn property_values(&self) -> Vec<PropertyValue> {
        vec![
            self.hit_count().into(),
            self.miss_count().into(),
            self.len().into(),
        ]
    }
}
