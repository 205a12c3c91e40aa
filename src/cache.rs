//! Caching of opened modules and their parsed CFI tables.
//!
//! Parsing an executable's headers and `.eh_frame` section is far too
//! expensive to repeat for every frame of every backtrace, so the cache
//! guarantees at most one parse per file path for its lifetime. Failures
//! are cached too: a module that failed to open once is not retried.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::eh_frame::CfiTable;
use crate::elf::ElfModule;
use crate::error::{Error, ModuleError};

/// A shared, thread-safe cache of parsed modules keyed by file path.
///
/// Cheap to share by reference; all methods take `&self`.
#[derive(Default)]
pub struct ModuleCache {
    modules: Mutex<HashMap<PathBuf, Arc<ModuleSlot>>>,
}

#[derive(Default)]
struct ModuleSlot {
    once: OnceLock<Result<Arc<CachedModule>, ModuleError>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached module for `path`, opening and parsing it on the
    /// first call. Concurrent calls for the same path block until the one
    /// doing the work finishes, then share its result.
    pub fn open_module(&self, path: &Path) -> Result<Arc<CachedModule>, ModuleError> {
        let slot = {
            let mut modules = self.modules.lock().unwrap();
            modules.entry(path.to_owned()).or_default().clone()
        };
        // Initialization runs outside the map lock so a slow parse of one
        // module doesn't stall lookups of others.
        slot.once
            .get_or_init(|| {
                debug!(path = %path.display(), "opening module");
                ElfModule::open(path).map(|module| {
                    Arc::new(CachedModule {
                        module,
                        cfi: OnceLock::new(),
                    })
                })
            })
            .clone()
    }

    /// Number of distinct paths that have been requested.
    pub fn len(&self) -> usize {
        self.modules.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.lock().unwrap().is_empty()
    }
}

/// An opened module plus its lazily-built CFI table.
pub struct CachedModule {
    module: ElfModule,
    cfi: OnceLock<Result<Arc<CfiTable>, Error>>,
}

impl CachedModule {
    pub fn module(&self) -> &ElfModule {
        &self.module
    }

    /// The module's parsed CFI table, built on first use.
    ///
    /// The table is immutable once built, so callers across threads share
    /// one `Arc` and never re-parse.
    pub fn cfi_table(&self) -> Result<Arc<CfiTable>, Error> {
        self.cfi
            .get_or_init(|| {
                let (data, section_vaddr) = self.module.read_eh_frame()?;
                debug!(
                    path = %self.module.path().display(),
                    size = data.len(),
                    section_vaddr,
                    "parsing .eh_frame"
                );
                let address_size = self.module.class().address_size();
                let table = CfiTable::parse(data, section_vaddr, address_size)?;
                Ok(Arc::new(table))
            })
            .clone()
    }
}
