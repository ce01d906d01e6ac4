//! Dynamic loading of integrator kernels
//!
//! Kernels ship as shared libraries. The loader resolves a library name to a
//! path using platform naming conventions and a search list, keeps each
//! library loaded for as long as any binding holds it, and copies resolved
//! entry points out as plain function pointers.

use libloading::Library;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Library loading errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    /// Library file not found in search paths
    #[error("kernel library not found: {0}")]
    LibraryNotFound(String),

    /// Symbol not found in library
    #[error("symbol '{symbol}' not found in kernel library '{library}'")]
    SymbolNotFound { library: String, symbol: String },

    /// Failed to load library
    #[error("failed to load kernel library: {0}")]
    LoadFailed(String),

    /// Library was built for another integer width
    #[error("kernel is configured for {configured}-bit integers, binding expects {expected}-bit")]
    WidthMismatch { configured: u32, expected: u32 },

    /// No library named in configuration
    #[error("no kernel library configured (set [kernel] library or ODEBRIDGE_KERNEL_LIBRARY)")]
    NotConfigured,
}

/// Kernel library loader with caching and platform-specific path resolution
///
/// # Safety
///
/// Loading a library runs its initialization code inside this process.
/// Only load kernels you trust.
pub struct LibraryLoader {
    /// Loaded libraries by resolved path
    loaded: HashMap<PathBuf, Arc<Library>>,
    search_paths: Vec<PathBuf>,
}

impl LibraryLoader {
    /// Loader with the platform's default search paths
    pub fn new() -> Self {
        Self {
            loaded: HashMap::new(),
            search_paths: Self::default_search_paths(),
        }
    }

    /// Loader searching `paths` first, then the platform defaults
    pub fn with_search_paths(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut search_paths: Vec<PathBuf> = paths.into_iter().collect();
        search_paths.extend(Self::default_search_paths());
        Self {
            loaded: HashMap::new(),
            search_paths,
        }
    }

    /// Platform library directories, current directory first
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/lib"));

            if cfg!(target_pointer_width = "64") {
                paths.push(PathBuf::from("/usr/lib64"));
                paths.push(PathBuf::from("/lib64"));
            }
        }

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/opt/homebrew/lib"));
        }

        #[cfg(target_os = "windows")]
        {
            if let Ok(system_root) = std::env::var("SystemRoot") {
                paths.push(PathBuf::from(format!("{}\\System32", system_root)));
            }
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.insert(0, cwd);
        }

        paths
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Resolve a kernel name such as `radau5` to a library file
    ///
    /// Paths that exist are used as given. Bare names are tried with the
    /// platform prefix and extension in every search path.
    fn resolve_library_path(&self, name: &Path) -> Option<PathBuf> {
        if name.components().count() > 1 || name.is_absolute() {
            return name.exists().then(|| name.to_path_buf());
        }
        let name = name.to_str()?;

        let extensions: &[&str] = if cfg!(target_os = "windows") {
            &["dll"]
        } else if cfg!(target_os = "macos") {
            &["dylib", "so"]
        } else {
            &["so"]
        };
        let prefixes: &[&str] = if cfg!(target_os = "windows") {
            &["", "lib"]
        } else {
            &["lib", ""]
        };

        for search_path in &self.search_paths {
            let exact = search_path.join(name);
            if exact.is_file() {
                return Some(exact);
            }
            for prefix in prefixes {
                for ext in extensions {
                    let full_path = search_path.join(format!("{}{}.{}", prefix, name, ext));
                    if full_path.exists() {
                        return Some(full_path);
                    }
                }
            }
        }

        None
    }

    /// Load a library by name or path, reusing an already loaded instance
    pub fn load(&mut self, name: &Path) -> Result<Arc<Library>, LoadError> {
        let path = self
            .resolve_library_path(name)
            .ok_or_else(|| LoadError::LibraryNotFound(name.display().to_string()))?;

        if let Some(library) = self.loaded.get(&path) {
            return Ok(library.clone());
        }

        // SAFETY: kernel initialization code is trusted by the caller
        let library = unsafe { Library::new(&path) }
            .map_err(|e| LoadError::LoadFailed(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(target: "odebridge::loader", path = %path.display(), "loaded kernel library");

        let library = Arc::new(library);
        self.loaded.insert(path, library.clone());
        Ok(library)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy a function pointer out of a loaded library
///
/// # Safety
///
/// `T` must be the exact function pointer type of the symbol, and the pointer
/// must not be called after `library` is unloaded.
pub unsafe fn resolve_symbol<T: Copy>(
    library: &Library,
    library_name: &Path,
    symbol_name: &str,
) -> Result<T, LoadError> {
    library
        .get::<T>(symbol_name.as_bytes())
        .map(|symbol| *symbol)
        .map_err(|_| LoadError::SymbolNotFound {
            library: library_name.display().to_string(),
            symbol: symbol_name.to_string(),
        })
}
