//! Identity catalog: the immutable index of `root/<identity>/<image>`.
//!
//! Scanned once before any producer starts. Symbolic links to identity
//! folders and to images are followed.

use crate::error::{PipelineError, PipelineResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

/// One identity (a person/class) and the images that show it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Name of the identity directory. Only a grouping key, never interpreted.
    pub name: String,
    pub images: Vec<PathBuf>,
}

/// Immutable catalog of identities scanned from a corpus laid out as
/// `root/<identity>/<image>`.
///
/// The catalog is built once and then shared by every producer thread. Cloning
/// only bumps the `Arc`, and since nothing mutates it after construction no
/// locking is needed for concurrent reads.
///
/// # Example
/// ```ignore
/// let catalog = IdentityCatalog::scan("./faces", &CatalogOptions::default())?;
/// println!("{} identities", catalog.len());
/// ```
#[derive(Debug, Clone)]
pub struct IdentityCatalog {
    identities: Arc<[Identity]>,
}

/// Controls how identity directories are scanned.
#[derive(Debug, Clone, Default)]
pub struct CatalogOptions {
    /// Extensions to keep (case-insensitive). Empty keeps every regular file.
    pub extensions: Vec<String>,
    /// Descend into nested folders below each identity directory.
    pub recurse: bool,
}

impl CatalogOptions {
    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|e| e.to_lowercase()).collect();
        self
    }

    pub fn with_recursion(mut self, recurse: bool) -> Self {
        self.recurse = recurse;
        self
    }

    fn accepts(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.contains(&e.to_lowercase()))
    }
}

impl IdentityCatalog {
    /// Builds a catalog from in-memory identities, dropping those without images.
    pub fn new(identities: Vec<Identity>) -> Self {
        let identities: Vec<Identity> = identities
            .into_iter()
            .filter(|identity| !identity.images.is_empty())
            .collect();
        Self {
            identities: identities.into(),
        }
    }

    /// Scans `root`: every immediate subdirectory becomes one identity and every
    /// regular file inside it one image reference.
    ///
    /// Entries are visited in file-name order so the same corpus always yields
    /// the same label assignment. Fails if `root` is missing, not a directory,
    /// or unreadable. An empty result is not an error.
    pub fn scan(root: impl AsRef<Path>, options: &CatalogOptions) -> PipelineResult<Self> {
        let root = root.as_ref();
        let unreadable = |path: &Path, source: std::io::Error| PipelineError::CorpusUnreadable {
            path: path.to_path_buf(),
            source,
        };

        let metadata = fs::metadata(root).map_err(|e| unreadable(root, e))?;
        if !metadata.is_dir() {
            return Err(unreadable(
                root,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let mut identities = Vec::new();
        let identity_dirs = WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name();

        for entry in identity_dirs {
            let entry = entry.map_err(|e| walk_error(root, e))?;
            if !entry.file_type().is_dir() {
                continue;
            }

            let images = Self::scan_identity(entry.path(), options)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if images.is_empty() {
                debug!(identity = %name, "skipping identity without images");
                continue;
            }
            identities.push(Identity { name, images });
        }

        let catalog = Self::new(identities);
        info!(
            root = %root.display(),
            identities = catalog.len(),
            images = catalog.total_images(),
            "identity catalog built"
        );
        Ok(catalog)
    }

    fn scan_identity(dir: &Path, options: &CatalogOptions) -> PipelineResult<Vec<PathBuf>> {
        let max_depth = if options.recurse { usize::MAX } else { 1 };
        let mut images = Vec::new();

        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(true)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| walk_error(dir, e))?;
            // With links followed, `file_type` describes the link target.
            if entry.file_type().is_file() && options.accepts(entry.path()) {
                images.push(entry.into_path());
            }
        }
        Ok(images)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Identity> {
        self.identities.get(index)
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn total_images(&self) -> usize {
        self.identities.iter().map(|i| i.images.len()).sum()
    }
}

fn walk_error(fallback: &Path, err: walkdir::Error) -> PipelineError {
    let path = err
        .path()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| fallback.to_path_buf());
    PipelineError::CorpusUnreadable {
        path,
        source: err.into(),
    }
}
