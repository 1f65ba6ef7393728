//! Library path resolution and working copies of input files.
//!
//! A dependency is declared by its install path on the device
//! (`/usr/lib/libSystem.B.dylib`, `/System/Library/Frameworks/...`). A
//! [`LibraryResolver`] turns that into a file on the host, and a
//! [`FileStager`] decides which file the loader actually maps.

use crate::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Finds the host file for a declared dependency path.
pub trait LibraryResolver {
    /// Returns `None` when the library is not available.
    fn resolve(&self, install_path: &str) -> Option<PathBuf>;
}

impl<F> LibraryResolver for F
where
    F: Fn(&str) -> Option<PathBuf>,
{
    fn resolve(&self, install_path: &str) -> Option<PathBuf> {
        self(install_path)
    }
}

/// Resolves system libraries against a directory holding a copy of the
/// device's `/System/Library/Frameworks` and `/usr/lib` trees.
#[derive(Debug, Clone)]
pub struct FrameworkRoot {
    root: PathBuf,
}

impl FrameworkRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LibraryResolver for FrameworkRoot {
    fn resolve(&self, install_path: &str) -> Option<PathBuf> {
        let name = canonical_library_path(install_path);
        let relative = name
            .strip_prefix("/System/Library/Frameworks/")
            .map(|rest| Path::new("System/Library/Frameworks").join(rest))
            .or_else(|| name.strip_prefix("/usr/lib/").map(|rest| Path::new("usr/lib").join(rest)));
        let Some(relative) = relative else {
            warn!("missing library {} (not a system path)", install_path);
            return None;
        };
        let path = self.root.join(relative);
        if !path.is_file() {
            warn!("missing library {}", name);
            return None;
        }
        debug!("resolved {} to {}", install_path, path.display());
        Some(path)
    }
}

/// Rewrites an install path to the layout library roots use: `libc++`
/// becomes `libcpp` and framework version directories are flattened.
pub fn canonical_library_path(install_path: &str) -> String {
    let mut name = install_path.replace("libc++", "libcpp");
    for version in ["Versions/A/", "Versions/B/", "Versions/C/"] {
        name = name.replace(version, "");
    }
    name
}

/// Short name an image is registered under: the canonical file name.
pub fn canonical_library_name(path: &str) -> String {
    let canonical = canonical_library_path(path);
    match canonical.rsplit_once('/') {
        Some((_, name)) => name.to_string(),
        None => canonical,
    }
}

/// Decides which file the loader maps for a given input path.
pub trait FileStager {
    fn stage(&self, path: &Path) -> Result<PathBuf>;
}

/// Maps input files where they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct InPlace;

impl FileStager for InPlace {
    fn stage(&self, path: &Path) -> Result<PathBuf> {
        Ok(path.to_path_buf())
    }
}

/// Copies input files into a scratch work directory before mapping them.
#[derive(Debug, Clone)]
pub struct WorkDir {
    dir: PathBuf,
}

impl WorkDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Removes everything in the work directory and recreates it empty.
    pub fn reset(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}

impl FileStager for WorkDir {
    fn stage(&self, path: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let name = path.file_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", path.display()),
            )
        })?;
        let copy = self.dir.join(name);
        if copy != path {
            std::fs::copy(path, &copy)?;
            debug!("staged {} as {}", path.display(), copy.display());
        }
        Ok(copy)
    }
}
