// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory [Filesystem].

use crate::volume::{EntryKind, Filesystem, Owner};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
struct Node {
    kind: EntryKind,
    owner: Option<Owner>,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<Utf8PathBuf, Node>,
    mounted: BTreeSet<Utf8PathBuf>,
    renames: usize,
    fail_renames: bool,
}

impl Inner {
    fn has_children(&self, path: &Utf8Path) -> bool {
        self.nodes.keys().any(|p| p.as_path() != path && p.starts_with(path))
    }

    fn insert_dirs(&mut self, path: &Utf8Path) -> io::Result<()> {
        for dir in path.ancestors().collect::<Vec<_>>().into_iter().rev() {
            if dir.as_str().is_empty() {
                continue;
            }
            match self.nodes.get(dir) {
                Some(Node { kind: EntryKind::Directory, .. }) => (),
                Some(_) => return Err(already_exists(dir)),
                None => {
                    self.nodes.insert(
                        dir.to_owned(),
                        Node { kind: EntryKind::Directory, owner: None },
                    );
                }
            }
        }
        Ok(())
    }

    fn insert(&mut self, path: &Utf8Path, kind: EntryKind) -> io::Result<()> {
        if self.nodes.contains_key(path) {
            return Err(already_exists(path));
        }
        if let Some(parent) = path.parent() {
            self.insert_dirs(parent)?;
        }
        self.nodes.insert(path.to_owned(), Node { kind, owner: None });
        Ok(())
    }
}

fn not_found(path: &Utf8Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{path} not found"))
}

fn already_exists(path: &Utf8Path) -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, format!("{path} exists"))
}

/// Paths are taken literally: symlinks are recorded but never followed, so
/// a link target is only "populated" if it was added as its own directory.
#[derive(Debug, Default)]
pub struct FakeFilesystem {
    inner: Mutex<Inner>,
}

impl FakeFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn add_dir(&self, path: impl AsRef<Utf8Path>) {
        self.inner().insert_dirs(path.as_ref()).unwrap();
    }

    pub fn add_file(&self, path: impl AsRef<Utf8Path>) {
        self.inner().insert(path.as_ref(), EntryKind::File).unwrap();
    }

    pub fn add_symlink(&self, link: impl AsRef<Utf8Path>, target: impl AsRef<Utf8Path>) {
        let target = target.as_ref().to_owned();
        self.inner().insert(link.as_ref(), EntryKind::Symlink(target)).unwrap();
    }

    /// Removes `path` and everything below it.
    pub fn remove(&self, path: impl AsRef<Utf8Path>) {
        let path = path.as_ref();
        self.inner().nodes.retain(|p, _| !p.starts_with(path));
    }

    /// Creates `path` as a directory and marks it mounted.
    pub fn mount(&self, path: impl AsRef<Utf8Path>) {
        let path = path.as_ref();
        let mut inner = self.inner();
        inner.insert_dirs(path).unwrap();
        inner.mounted.insert(path.to_owned());
    }

    /// Makes every later rename fail.
    pub fn fail_renames(&self) {
        self.inner().fail_renames = true;
    }

    pub fn rename_count(&self) -> usize {
        self.inner().renames
    }

    pub fn kind(&self, path: impl AsRef<Utf8Path>) -> Option<EntryKind> {
        self.inner().nodes.get(path.as_ref()).map(|n| n.kind.clone())
    }

    pub fn owner(&self, path: impl AsRef<Utf8Path>) -> Option<Owner> {
        self.inner().nodes.get(path.as_ref()).and_then(|n| n.owner)
    }
}

impl Filesystem for FakeFilesystem {
    fn entry(&self, path: &Utf8Path) -> io::Result<Option<EntryKind>> {
        Ok(self.kind(path))
    }

    fn is_empty_dir(&self, path: &Utf8Path) -> io::Result<bool> {
        let inner = self.inner();
        match inner.nodes.get(path) {
            Some(Node { kind: EntryKind::Directory, .. }) => {
                Ok(!inner.has_children(path))
            }
            Some(_) => Err(io::Error::other(format!("{path} is not a directory"))),
            None => Err(not_found(path)),
        }
    }

    fn is_mounted(&self, path: &Utf8Path) -> io::Result<bool> {
        Ok(self.inner().mounted.contains(path))
    }

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
        let mut inner = self.inner();
        if inner.fail_renames {
            return Err(io::Error::other("injected rename failure"));
        }
        if !inner.nodes.contains_key(from) {
            return Err(not_found(from));
        }
        if inner.nodes.contains_key(to) {
            return Err(already_exists(to));
        }
        let moved: Vec<Utf8PathBuf> =
            inner.nodes.keys().filter(|p| p.starts_with(from)).cloned().collect();
        for old in moved {
            if let Some(node) = inner.nodes.remove(&old) {
                let new = match old.strip_prefix(from) {
                    Ok(rest) if !rest.as_str().is_empty() => to.join(rest),
                    _ => to.to_owned(),
                };
                inner.nodes.insert(new, node);
            }
        }
        inner.renames += 1;
        Ok(())
    }

    fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
        self.inner().insert(link, EntryKind::Symlink(target.to_owned()))
    }

    fn remove_file(&self, path: &Utf8Path) -> io::Result<()> {
        let mut inner = self.inner();
        match inner.nodes.get(path) {
            Some(Node { kind: EntryKind::Directory, .. }) => {
                Err(io::Error::other(format!("{path} is a directory")))
            }
            Some(_) => {
                inner.nodes.remove(path);
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }

    fn remove_dir(&self, path: &Utf8Path) -> io::Result<()> {
        let mut inner = self.inner();
        match inner.nodes.get(path) {
            Some(Node { kind: EntryKind::Directory, .. }) => {
                if inner.has_children(path) {
                    return Err(io::Error::other(format!("{path} is not empty")));
                }
                inner.nodes.remove(path);
                Ok(())
            }
            Some(_) => Err(io::Error::other(format!("{path} is not a directory"))),
            None => Err(not_found(path)),
        }
    }

    fn create_dir(&self, path: &Utf8Path) -> io::Result<()> {
        self.inner().insert_dirs(path)
    }

    fn walk(&self, root: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>> {
        let inner = self.inner();
        if !inner.nodes.contains_key(root) {
            return Err(not_found(root));
        }
        Ok(inner
            .nodes
            .keys()
            .filter(|p| p.as_path() != root && p.starts_with(root))
            .cloned()
            .collect())
    }

    fn chown(&self, path: &Utf8Path, owner: Owner) -> io::Result<()> {
        match self.inner().nodes.get_mut(path) {
            Some(node) => {
                node.owner = Some(owner);
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rename_moves_subtree() {
        let fs = FakeFilesystem::new();
        fs.add_file("/a/b/c");
        fs.add_file("/ab/d");
        fs.rename(Utf8Path::new("/a"), Utf8Path::new("/z")).unwrap();

        assert_eq!(fs.kind("/z/b/c"), Some(EntryKind::File));
        assert_eq!(fs.kind("/a"), None);
        // Only whole components match.
        assert_eq!(fs.kind("/ab/d"), Some(EntryKind::File));
        assert_eq!(fs.rename_count(), 1);
    }
}
