// Working file set - paths that must be present in the next bundle

use std::path::{Path, PathBuf};

/// Ordered, duplicate-free set of absolute file paths
///
/// Insertion order is kept so builds are reproducible, but carries no meaning
/// for the bundler.
#[derive(Debug, Clone, Default)]
pub struct WorkingFileSet {
    files: Vec<PathBuf>,
}

impl WorkingFileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a path; returns `false` if it was already present
    pub fn add(&mut self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        if self.contains(&path) {
            return false;
        }
        self.files.push(path);
        true
    }

    /// Remove a path; returns `false` if it was not present
    pub fn remove(&mut self, path: &Path) -> bool {
        match self.files.iter().position(|f| f == path) {
            Some(idx) => {
                self.files.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.iter().any(|f| f == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_adds_are_ignored() {
        let mut set = WorkingFileSet::new();
        assert!(set.add("/src/a.js"));
        assert!(set.add("/src/b.js"));
        assert!(!set.add("/src/a.js"));
        assert!(!set.add(PathBuf::from("/src/b.js")));

        let files: Vec<_> = set.iter().collect();
        assert_eq!(files, vec![Path::new("/src/a.js"), Path::new("/src/b.js")]);
    }

    #[test]
    fn every_unique_path_kept_exactly_once() {
        let mut set = WorkingFileSet::new();
        let sequence = ["a", "b", "a", "c", "b", "b", "d", "a"];
        for name in sequence {
            set.add(format!("/src/{}.js", name));
        }

        assert_eq!(set.len(), 4);
        for name in ["a", "b", "c", "d"] {
            let path = PathBuf::from(format!("/src/{}.js", name));
            assert_eq!(set.iter().filter(|p| *p == path).count(), 1);
        }
    }

    #[test]
    fn remove_then_add_again() {
        let mut set = WorkingFileSet::new();
        set.add("/src/a.js");
        set.add("/src/b.js");

        assert!(set.remove(Path::new("/src/a.js")));
        assert!(!set.remove(Path::new("/src/a.js")));
        assert!(!set.contains(Path::new("/src/a.js")));

        assert!(set.add("/src/a.js"));
        let files: Vec<_> = set.iter().collect();
        assert_eq!(files, vec![Path::new("/src/b.js"), Path::new("/src/a.js")]);
    }

    #[test]
    fn empty_set() {
        let set = WorkingFileSet::new();
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
    }
}
