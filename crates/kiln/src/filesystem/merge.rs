//! Promoting a diff layer into a lower layer.
//!
//! The walk classifies every entry of the source (diff) layer against the
//! corresponding path in the target layer and applies the rule table:
//!
//! ```text
//!            target: absent   file/whiteout    directory
//! src absent         -        -                - (skip subtree)
//! src file           move     replace          replace
//! src whiteout       -        move marker      move marker, stop descending
//! src dir            move*    open-or-replace  copy attributes, descend
//! ```
//!
//! `*` = move and stop descending. A whiteout is never moved onto the
//! bottom layer; the deletion is applied by removing the target instead.
//! Every rule is idempotent, so an aborted merge can simply be re-run.

use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use kiln_common::{KilnError, KilnResult};
use walkdir::WalkDir;

use super::overlay::LayerStack;

/// What a path is, seen from overlayfs's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    /// Nothing at this path.
    Absent,
    /// A regular file, symlink, or special file.
    File,
    /// An overlayfs whiteout marker (character device 0:0).
    Whiteout,
    /// A directory.
    Dir,
}

fn classify(path: &Path) -> KilnResult<EntryKind> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.is_dir() {
                Ok(EntryKind::Dir)
            } else if meta.file_type().is_char_device() && meta.rdev() == 0 {
                Ok(EntryKind::Whiteout)
            } else {
                Ok(EntryKind::File)
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(EntryKind::Absent),
        Err(err) => Err(KilnError::Io(err)),
    }
}

/// Create a whiteout marker: a character device with device number 0.
pub(crate) fn create_whiteout(path: &Path) -> KilnResult<()> {
    use rustix::fs::{FileType, Mode, mknodat};

    mknodat(
        rustix::fs::CWD,
        path,
        FileType::CharacterDevice,
        Mode::empty(),
        0,
    )
    .map_err(|e| KilnError::Io(e.into()))
}

/// Copy ownership, mode, and timestamps without touching content.
///
/// Failures (for instance chown without privilege) are logged and
/// swallowed: a merge must not abort over metadata it cannot set.
fn copy_attributes(src: &Path, dst: &Path) {
    use rustix::fs::{AtFlags, Timespec, Timestamps, utimensat};
    use rustix::process::{Gid, Uid};

    let meta = match std::fs::symlink_metadata(src) {
        Ok(meta) => meta,
        Err(err) => {
            tracing::debug!(src = %src.display(), %err, "Cannot stat source for attribute copy");
            return;
        }
    };

    if let Err(err) =
        std::fs::set_permissions(dst, std::fs::Permissions::from_mode(meta.mode() & 0o7777))
    {
        tracing::debug!(dst = %dst.display(), %err, "Cannot copy mode");
    }
    if let Err(err) = rustix::fs::chown(
        dst,
        Some(Uid::from_raw(meta.uid())),
        Some(Gid::from_raw(meta.gid())),
    ) {
        tracing::debug!(dst = %dst.display(), %err, "Cannot copy ownership");
    }
    let times = Timestamps {
        last_access: Timespec {
            tv_sec: meta.atime(),
            tv_nsec: meta.atime_nsec(),
        },
        last_modification: Timespec {
            tv_sec: meta.mtime(),
            tv_nsec: meta.mtime_nsec(),
        },
    };
    if let Err(err) = utimensat(rustix::fs::CWD, dst, &times, AtFlags::empty()) {
        tracing::debug!(dst = %dst.display(), %err, "Cannot copy timestamps");
    }
}

fn remove_if_exists(path: &Path) -> KilnResult<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(KilnError::Io(err)),
    };
    if meta.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

impl LayerStack {
    /// Merge the whole diff layer into the bottom (distribution) layer.
    pub fn merge(&self) -> KilnResult<()> {
        self.merge_into(0)
    }

    /// Merge the diff layer into the layer at `dst` (which must be below
    /// the top).
    pub fn merge_into(&self, dst: usize) -> KilnResult<()> {
        let src = self.layers.len() - 1;
        if dst >= src {
            return Err(KilnError::Internal {
                message: format!("merge target {dst} is not below the diff layer {src}"),
            });
        }
        self.merge_subtree(Path::new("/"), src, dst)
    }

    /// Merge the subtree rooted at `path` from layer `src` into layer
    /// `dst`.
    ///
    /// Errors abort the walk without undoing already-merged entries; the
    /// rule table is idempotent, so re-running completes the merge.
    pub fn merge_subtree(&self, path: &Path, src: usize, dst: usize) -> KilnResult<()> {
        let rel = path.strip_prefix("/").unwrap_or(path);
        let uroot = &self.layers[src];
        let lroot = &self.layers[dst];
        let walk_base = uroot.join(rel);

        if let Some(parent) = lroot.join(rel).parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Directories whose children were merged in place; emptied-out
        // sources are removed bottom-up afterwards.
        let mut merged_dirs: Vec<PathBuf> = Vec::new();

        let mut walker = WalkDir::new(&walk_base).follow_links(false).into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                // The walk base may not exist (nothing to merge), and
                // entries may vanish when a parent was moved wholesale.
                Err(err)
                    if err
                        .io_error()
                        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) =>
                {
                    continue;
                }
                Err(err) => {
                    return Err(KilnError::Internal {
                        message: format!("merge walk failed: {err}"),
                    });
                }
            };

            let upath = entry.path().to_path_buf();
            let entry_rel = upath
                .strip_prefix(uroot)
                .map_err(|_| KilnError::Internal {
                    message: format!("walk escaped the source layer: {}", upath.display()),
                })?
                .to_path_buf();
            let lpath = lroot.join(&entry_rel);

            tracing::trace!(path = %upath.display(), "Merging entry");

            let utp = classify(&upath)?;
            let ltp = classify(&lpath)?;

            match utp {
                EntryKind::Absent => {}

                EntryKind::File | EntryKind::Whiteout => {
                    remove_if_exists(&lpath)?;
                    // A whiteout on the bottom layer would hide nothing;
                    // dropping it applies the deletion.
                    if !(dst == 0 && utp == EntryKind::Whiteout) {
                        std::fs::rename(&upath, &lpath)?;
                    } else {
                        std::fs::remove_file(&upath)?;
                    }
                }

                EntryKind::Dir => match ltp {
                    EntryKind::Absent => {
                        std::fs::rename(&upath, &lpath)?;
                        walker.skip_current_dir();
                    }
                    EntryKind::Dir => {
                        copy_attributes(&upath, &lpath);
                        if entry.depth() > 0 {
                            merged_dirs.push(upath);
                        }
                    }
                    EntryKind::File | EntryKind::Whiteout => {
                        if self.open_directory(&entry_rel, &upath, &lpath, dst)? {
                            if entry.depth() > 0 {
                                merged_dirs.push(upath);
                            }
                        } else {
                            walker.skip_current_dir();
                        }
                    }
                },
            }
        }

        for dir in merged_dirs.iter().rev() {
            if let Err(err) = std::fs::remove_dir(dir) {
                tracing::debug!(dir = %dir.display(), %err, "Merged source directory not empty");
            }
        }
        Ok(())
    }

    /// Handle a source directory covering a target file or whiteout.
    ///
    /// If no layer further down supplies directory content for this path,
    /// the directory replaces the target wholesale; returns `false` (stop
    /// descending). Otherwise the cover is "opened": the target becomes a
    /// real directory and every name visible in the layers strictly
    /// between the found replacement and the target gets a whiteout, so
    /// those names stay hidden once the covering file is gone; returns
    /// `true` (keep descending).
    fn open_directory(
        &self,
        rel: &Path,
        upath: &Path,
        lpath: &Path,
        dst: usize,
    ) -> KilnResult<bool> {
        let (file_layer, has_dir) = self.next_layer_with_file(rel, dst)?;
        if !has_dir {
            remove_if_exists(lpath)?;
            std::fs::rename(upath, lpath)?;
            return Ok(false);
        }

        remove_if_exists(lpath)?;
        std::fs::create_dir(lpath)?;
        copy_attributes(upath, lpath);

        let lbound = file_layer.map_or(0, |l| l + 1);
        for name in self.visible_names(rel, lbound, dst - 1)? {
            create_whiteout(&lpath.join(name))?;
        }
        Ok(true)
    }

    /// Scan downward from `below` for the first layer carrying a file or
    /// whiteout at `rel`, noting whether any directory sits in between.
    fn next_layer_with_file(
        &self,
        rel: &Path,
        below: usize,
    ) -> KilnResult<(Option<usize>, bool)> {
        let mut has_dir = false;
        for index in (0..below).rev() {
            match classify(&self.layers[index].join(rel))? {
                EntryKind::File | EntryKind::Whiteout => return Ok((Some(index), has_dir)),
                EntryKind::Dir => has_dir = true,
                EntryKind::Absent => {}
            }
        }
        Ok((None, has_dir))
    }

    /// Names visible under `rel` across layers `lbound..=ubound`, applying
    /// whiteouts of higher layers against lower ones.
    fn visible_names(
        &self,
        rel: &Path,
        lbound: usize,
        ubound: usize,
    ) -> KilnResult<Vec<std::ffi::OsString>> {
        let mut names = std::collections::BTreeSet::new();
        for index in lbound..=ubound {
            let dir = self.layers[index].join(rel);
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) if err.kind() == std::io::ErrorKind::NotADirectory => continue,
                Err(err) => return Err(KilnError::Io(err)),
            };
            for entry in entries {
                let entry = entry?;
                match classify(&entry.path())? {
                    EntryKind::Whiteout => {
                        names.remove(&entry.file_name());
                    }
                    EntryKind::Absent => {}
                    _ => {
                        names.insert(entry.file_name());
                    }
                }
            }
        }
        Ok(names.into_iter().collect())
    }
}
