//! Inclusion predicates applied while walking a directory tree

use std::path::{Component, Path, PathBuf};

/// Decides whether a path encountered during a walk belongs in a snapshot.
pub trait Predicate: Send + Sync {
    fn include(&self, path: &Path, is_dir: bool) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Path, bool) -> bool + Send + Sync,
{
    fn include(&self, path: &Path, is_dir: bool) -> bool {
        self(path, is_dir)
    }
}

pub struct AllowAll;

impl Predicate for AllowAll {
    fn include(&self, _path: &Path, _is_dir: bool) -> bool {
        true
    }
}

/// Excludes regular files whose leaf name starts with a dot.
pub struct ExcludeDotfiles;

impl Predicate for ExcludeDotfiles {
    fn include(&self, path: &Path, is_dir: bool) -> bool {
        if is_dir {
            return true;
        }
        !path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(false)
    }
}

/// Excludes dot directories and everything beneath them.
///
/// Only components below `root` are inspected, so a root that itself
/// lives inside a dot directory is still walked.
pub struct ExcludeDotDirs {
    root: PathBuf,
}

impl ExcludeDotDirs {
    pub fn under(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Predicate for ExcludeDotDirs {
    fn include(&self, path: &Path, is_dir: bool) -> bool {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        // Files are judged by their containing directories only
        let dirs = if is_dir { Some(rel) } else { rel.parent() };
        let Some(dirs) = dirs else { return true };
        !dirs.components().any(|c| match c {
            Component::Normal(s) => s.to_string_lossy().starts_with('.'),
            _ => false,
        })
    }
}

/// Excludes regular files whose path ends with `suffix`.
pub struct ExcludeSuffix(pub String);

impl Predicate for ExcludeSuffix {
    fn include(&self, path: &Path, is_dir: bool) -> bool {
        is_dir || !path.to_string_lossy().ends_with(self.0.as_str())
    }
}

/// Excludes any entry with exactly this leaf name.
pub struct ExcludeName(pub String);

impl Predicate for ExcludeName {
    fn include(&self, path: &Path, _is_dir: bool) -> bool {
        path.file_name()
            .map(|n| n.to_string_lossy() != self.0.as_str())
            .unwrap_or(true)
    }
}

/// Excludes any entry whose leaf name starts with this prefix.
pub struct ExcludePrefix(pub String);

impl Predicate for ExcludePrefix {
    fn include(&self, path: &Path, _is_dir: bool) -> bool {
        path.file_name()
            .map(|n| !n.to_string_lossy().starts_with(self.0.as_str()))
            .unwrap_or(true)
    }
}

/// Excludes one exact path (typically the walk root).
pub struct ExcludePath(pub PathBuf);

impl Predicate for ExcludePath {
    fn include(&self, path: &Path, _is_dir: bool) -> bool {
        path != self.0
    }
}

/// Logical AND of any number of predicates. An empty set allows everything.
#[derive(Default)]
pub struct AllOf {
    parts: Vec<Box<dyn Predicate>>,
}

impl AllOf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and<P: Predicate + 'static>(mut self, p: P) -> Self {
        self.parts.push(Box::new(p));
        self
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl Predicate for AllOf {
    fn include(&self, path: &Path, is_dir: bool) -> bool {
        self.parts.iter().all(|p| p.include(path, is_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_includes_everything() {
        assert!(AllowAll.include(Path::new("/a/.b/.c"), false));
        assert!(AllowAll.include(Path::new("/a/.b"), true));
    }

    #[test]
    fn dotfiles() {
        assert!(!ExcludeDotfiles.include(Path::new("/r/dir/.hidden"), false));
        assert!(ExcludeDotfiles.include(Path::new("/r/dir/visible"), false));
        // directories are never judged by this predicate
        assert!(ExcludeDotfiles.include(Path::new("/r/.git"), true));
    }

    #[test]
    fn dot_dirs() {
        let p = ExcludeDotDirs::under("/home/u/.config/root");
        assert!(!p.include(Path::new("/home/u/.config/root/.git"), true));
        assert!(!p.include(Path::new("/home/u/.config/root/.git/HEAD"), false));
        assert!(!p.include(Path::new("/home/u/.config/root/.git/refs/main"), false));
        assert!(p.include(Path::new("/home/u/.config/root/.env"), false));
        assert!(p.include(Path::new("/home/u/.config/root/src/lib.rs"), false));
        assert!(p.include(Path::new("/home/u/.config/root/src"), true));
    }

    #[test]
    fn suffix() {
        let p = ExcludeSuffix(".tmp".into());
        assert!(!p.include(Path::new("/r/a.tmp"), false));
        assert!(p.include(Path::new("/r/a.txt"), false));
        assert!(p.include(Path::new("/r/cache.tmp"), true));
    }

    #[test]
    fn prefix() {
        let p = ExcludePrefix(".pairsync.tmp".into());
        assert!(!p.include(Path::new("/r/.pairsync.tmpX1b2c3"), false));
        assert!(p.include(Path::new("/r/.pairsync"), false));
        assert!(p.include(Path::new("/r/dir/notes.tmp"), false));
    }

    #[test]
    fn composed_with_and() {
        let policy = AllOf::new()
            .and(ExcludeName(".pairsync".into()))
            .and(ExcludePath(PathBuf::from("/r")))
            .and(|path: &Path, _is_dir: bool| !path.ends_with("skip.me"));

        assert_eq!(policy.len(), 3);
        assert!(!policy.include(Path::new("/r"), true));
        assert!(!policy.include(Path::new("/r/.pairsync"), false));
        assert!(!policy.include(Path::new("/r/x/skip.me"), false));
        assert!(policy.include(Path::new("/r/x/keep.me"), false));
        assert!(AllOf::new().include(Path::new("/anything"), false));
    }
}
