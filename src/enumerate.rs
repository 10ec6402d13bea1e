//! File enumeration module
//!
//! Walks an input tree with `walkdir` and returns the PDFs and images to
//! analyse as a sorted, deduplicated list of absolute paths.
//!
//! Directory read failures (permission denied, broken links, symlink loops)
//! are reported through a diagnostic callback and the affected subtree is
//! skipped; they never abort the scan.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

use crate::record::FileType;

/// Image extensions recognised by default
pub const DEFAULT_IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "tiff", "tif", "bmp"];

/// Folder names skipped by default
pub const DEFAULT_EXCLUDED_FOLDERS: [&str; 2] = ["$RECYCLE.BIN", "System Volume Information"];

/// Default number of records per sink batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Enumeration error types
#[derive(Debug, Error)]
pub enum EnumerateError {
    #[error("Input path does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EnumerateError>;

/// Scan options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOptions {
    /// Directory base names skipped with their whole subtree
    pub excluded_folders: BTreeSet<String>,
    /// Deepest directory level descended into (root = 0)
    pub max_depth: Option<usize>,
    /// Records per sink batch
    pub batch_size: usize,
    /// Analyse files on more than one thread
    pub parallel: bool,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            excluded_folders: DEFAULT_EXCLUDED_FOLDERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_depth: None,
            batch_size: DEFAULT_BATCH_SIZE,
            parallel: true,
        }
    }
}

impl ProcessingOptions {
    /// Create a new options builder
    pub fn builder() -> ProcessingOptionsBuilder {
        ProcessingOptionsBuilder::default()
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded_folders.contains(name)
    }
}

/// Builder for ProcessingOptions
#[derive(Debug, Default)]
pub struct ProcessingOptionsBuilder {
    options: ProcessingOptions,
}

impl ProcessingOptionsBuilder {
    /// Add a folder name to skip
    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.options.excluded_folders.insert(name.into());
        self
    }

    /// Replace the excluded folder set
    pub fn excluded_folders<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.excluded_folders = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_depth(mut self, depth: Option<usize>) -> Self {
        self.options.max_depth = depth;
        self
    }

    /// Set batch size (minimum 1)
    pub fn batch_size(mut self, size: usize) -> Self {
        self.options.batch_size = size.max(1);
        self
    }

    pub fn parallel(mut self, enabled: bool) -> Self {
        self.options.parallel = enabled;
        self
    }

    pub fn build(self) -> ProcessingOptions {
        self.options
    }
}

/// File selected for analysis
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceFile {
    pub path: PathBuf,
    pub kind: FileType,
}

/// Enumeration result
#[derive(Debug, Clone, Default)]
pub struct EnumeratedFiles {
    /// Sorted by path, no duplicates
    pub files: Vec<SourceFile>,
    /// Directories that could not be read
    pub skipped: Vec<PathBuf>,
}

impl EnumeratedFiles {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn pdf_count(&self) -> usize {
        self.files.iter().filter(|f| f.kind == FileType::Pdf).count()
    }

    pub fn image_count(&self) -> usize {
        self.files.iter().filter(|f| f.kind == FileType::Image).count()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

/// Split a selection into PDFs and images, keeping order
pub fn partition(files: &[SourceFile]) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut pdfs = Vec::new();
    let mut images = Vec::new();
    for file in files {
        match file.kind {
            FileType::Pdf => pdfs.push(file.path.clone()),
            FileType::Image => images.push(file.path.clone()),
        }
    }
    (pdfs, images)
}

/// Recursive file enumerator
#[derive(Debug, Clone)]
pub struct FileEnumerator {
    include_pdf: bool,
    include_images: bool,
    image_extensions: BTreeSet<String>,
    options: ProcessingOptions,
}

impl Default for FileEnumerator {
    fn default() -> Self {
        Self::new(ProcessingOptions::default())
    }
}

impl FileEnumerator {
    pub fn new(options: ProcessingOptions) -> Self {
        Self {
            include_pdf: true,
            include_images: true,
            image_extensions: DEFAULT_IMAGE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            options,
        }
    }

    pub fn include_pdf(mut self, enabled: bool) -> Self {
        self.include_pdf = enabled;
        self
    }

    pub fn include_images(mut self, enabled: bool) -> Self {
        self.include_images = enabled;
        self
    }

    /// Replace the accepted image extensions (with or without leading dot)
    pub fn image_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.image_extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn options(&self) -> &ProcessingOptions {
        &self.options
    }

    /// Classify a path by extension (case-insensitive)
    pub fn classify(&self, path: &Path) -> Option<FileType> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if self.include_pdf && ext == "pdf" {
            Some(FileType::Pdf)
        } else if self.include_images && self.image_extensions.contains(&ext) {
            Some(FileType::Image)
        } else {
            None
        }
    }

    /// Enumerate matching files below `root`
    ///
    /// `on_diagnostic` receives one message per unreadable directory.
    pub fn enumerate<F>(&self, root: &Path, mut on_diagnostic: F) -> Result<EnumeratedFiles>
    where
        F: FnMut(&str),
    {
        if !root.exists() {
            return Err(EnumerateError::RootNotFound(root.to_path_buf()));
        }
        let root = root.canonicalize()?;

        let mut found: BTreeMap<PathBuf, FileType> = BTreeMap::new();
        let mut skipped = Vec::new();

        if root.is_file() {
            if let Some(kind) = self.classify(&root) {
                found.insert(root.clone(), kind);
            }
            return Ok(Self::collect(found, skipped));
        }

        let mut walker = WalkDir::new(&root).follow_links(true);
        if let Some(depth) = self.options.max_depth {
            // files of a directory at depth d sit at walk depth d + 1
            walker = walker.max_depth(depth + 1);
        }

        let entries = walker
            .into_iter()
            .filter_entry(|entry| !self.is_excluded_dir(entry));

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| root.clone());
                    let message = format!("Skipping {}: {}", path.display(), err);
                    tracing::warn!("{}", message);
                    on_diagnostic(&message);
                    skipped.push(path);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            let Some(kind) = self.classify(entry.path()) else {
                continue;
            };

            let path = entry
                .path()
                .canonicalize()
                .unwrap_or_else(|_| entry.path().to_path_buf());
            found.entry(path).or_insert(kind);
        }

        tracing::debug!(root = %root.display(), files = found.len(), "enumeration finished");
        Ok(Self::collect(found, skipped))
    }

    fn is_excluded_dir(&self, entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| self.options.is_excluded(name))
    }

    fn collect(found: BTreeMap<PathBuf, FileType>, skipped: Vec<PathBuf>) -> EnumeratedFiles {
        EnumeratedFiles {
            files: found
                .into_iter()
                .map(|(path, kind)| SourceFile { path, kind })
                .collect(),
            skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &Path, rel: &str) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, b"x").unwrap();
        path
    }

    fn names(files: &EnumeratedFiles) -> Vec<String> {
        files
            .files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_default_options() {
        let opts = ProcessingOptions::default();
        assert!(opts.is_excluded("$RECYCLE.BIN"));
        assert!(opts.is_excluded("System Volume Information"));
        assert_eq!(opts.max_depth, None);
        assert_eq!(opts.batch_size, 1000);
        assert!(opts.parallel);
    }

    #[test]
    fn test_builder() {
        let opts = ProcessingOptions::builder()
            .exclude("tmp")
            .max_depth(Some(2))
            .batch_size(0)
            .parallel(false)
            .build();
        assert!(opts.is_excluded("tmp"));
        assert!(opts.is_excluded("$RECYCLE.BIN"));
        assert_eq!(opts.max_depth, Some(2));
        assert_eq!(opts.batch_size, 1);
        assert!(!opts.parallel);

        let only = ProcessingOptions::builder().excluded_folders(["tmp"]).build();
        assert!(!only.is_excluded("$RECYCLE.BIN"));
    }

    #[test]
    fn test_classify_case_insensitive() {
        let e = FileEnumerator::default();
        assert_eq!(e.classify(Path::new("a.PDF")), Some(FileType::Pdf));
        assert_eq!(e.classify(Path::new("a.JpEg")), Some(FileType::Image));
        assert_eq!(e.classify(Path::new("a.gif")), None);
        assert_eq!(e.classify(Path::new("README")), None);

        let pdf_only = FileEnumerator::default().include_images(false);
        assert_eq!(pdf_only.classify(Path::new("a.png")), None);

        let custom = FileEnumerator::default().image_extensions([".GIF"]);
        assert_eq!(custom.classify(Path::new("a.gif")), Some(FileType::Image));
        assert_eq!(custom.classify(Path::new("a.png")), None);
    }

    #[test]
    fn test_enumerate_sorted_and_filtered() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "b.pdf");
        touch(tmp.path(), "a.png");
        touch(tmp.path(), "notes.txt");
        touch(tmp.path(), "sub/c.TIF");

        let files = FileEnumerator::default()
            .enumerate(tmp.path(), |_| {})
            .unwrap();

        assert_eq!(names(&files), vec!["a.png", "b.pdf", "c.TIF"]);
        assert_eq!(files.pdf_count(), 1);
        assert_eq!(files.image_count(), 2);
        assert!(files.files.iter().all(|f| f.path.is_absolute()));
    }

    #[test]
    fn test_excluded_folders_skipped() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "keep.pdf");
        touch(tmp.path(), "$RECYCLE.BIN/deleted.pdf");
        touch(tmp.path(), "deep/System Volume Information/x.png");

        let files = FileEnumerator::default()
            .enumerate(tmp.path(), |_| {})
            .unwrap();
        assert_eq!(names(&files), vec!["keep.pdf"]);
    }

    #[test]
    fn test_max_depth() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "root.pdf");
        touch(tmp.path(), "l1/one.pdf");
        touch(tmp.path(), "l1/l2/two.pdf");

        let at = |depth| {
            let opts = ProcessingOptions::builder().max_depth(Some(depth)).build();
            FileEnumerator::new(opts)
                .enumerate(tmp.path(), |_| {})
                .unwrap()
                .len()
        };
        assert_eq!(at(0), 1);
        assert_eq!(at(1), 2);
        assert_eq!(at(5), 3);
    }

    #[test]
    fn test_type_filters() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.pdf");
        touch(tmp.path(), "b.jpg");

        let pdfs = FileEnumerator::default()
            .include_images(false)
            .enumerate(tmp.path(), |_| {})
            .unwrap();
        assert_eq!(names(&pdfs), vec!["a.pdf"]);

        let images = FileEnumerator::default()
            .include_pdf(false)
            .enumerate(tmp.path(), |_| {})
            .unwrap();
        assert_eq!(names(&images), vec!["b.jpg"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_duplicates_counted_once() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "real/doc.pdf");
        std::os::unix::fs::symlink(tmp.path().join("real"), tmp.path().join("alias")).unwrap();

        let files = FileEnumerator::default()
            .enumerate(tmp.path(), |_| {})
            .unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_single_file_root() {
        let tmp = TempDir::new().unwrap();
        let pdf = touch(tmp.path(), "only.pdf");

        let files = FileEnumerator::default().enumerate(&pdf, |_| {}).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_missing_root() {
        let result = FileEnumerator::default().enumerate(Path::new("/nonexistent/scan"), |_| {});
        assert!(matches!(result, Err(EnumerateError::RootNotFound(_))));
    }

    #[test]
    fn test_partition_keeps_order() {
        let files = vec![
            SourceFile { path: "/b.png".into(), kind: FileType::Image },
            SourceFile { path: "/a.pdf".into(), kind: FileType::Pdf },
            SourceFile { path: "/c.png".into(), kind: FileType::Image },
        ];
        let (pdfs, images) = partition(&files);
        assert_eq!(pdfs, vec![PathBuf::from("/a.pdf")]);
        assert_eq!(images, vec![PathBuf::from("/b.png"), PathBuf::from("/c.png")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directories_reported_and_siblings_kept() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.pdf");
        touch(tmp.path(), "sub/b.png");
        // a link back to the root and a link to nothing both fail to descend
        std::os::unix::fs::symlink(tmp.path(), tmp.path().join("sub/loop")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("missing"), tmp.path().join("gone")).unwrap();

        let mut diagnostics = Vec::new();
        let files = FileEnumerator::default()
            .enumerate(tmp.path(), |msg| diagnostics.push(msg.to_string()))
            .unwrap();

        assert_eq!(names(&files), vec!["a.pdf", "b.png"]);
        assert_eq!(files.skipped.len(), 2);
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics.iter().all(|d| d.starts_with("Skipping ")));

        let skipped: Vec<String> = files
            .skipped
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(skipped.contains(&"loop".to_string()));
        assert!(skipped.contains(&"gone".to_string()));
    }
}
