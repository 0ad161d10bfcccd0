//! Tree primitives shared by the version and run engines: the hard-link
//! snapshot walk, inode-identity tree comparison, and the plain recursive
//! copy used when forking a tale.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Snapshot `crt` into the empty directory `new`, hard-linking every regular
/// file. `old` is the previous snapshot, threaded through the recursion so
/// each level can match entries against it; an `old` entry only counts when
/// it exists and has the same kind (dir vs file) as the current one.
///
/// A failed hard link aborts the walk; the caller is expected to remove the
/// partially built destination.
pub fn snapshot_recursive(old: Option<&Path>, crt: &Path, new: &Path) -> io::Result<()> {
    for entry in fs::read_dir(crt)? {
        let entry = entry?;
        let name = entry.file_name();
        let crt_child = crt.join(&name);
        let new_child = new.join(&name);
        let crt_is_dir = fs::metadata(&crt_child)?.is_dir();

        let old_child = old.map(|o| o.join(&name)).filter(|oc| match fs::metadata(oc) {
            Ok(old_meta) => old_meta.is_dir() == crt_is_dir,
            Err(_) => false,
        });

        if crt_is_dir {
            fs::create_dir(&new_child)?;
            snapshot_recursive(old_child.as_deref(), &crt_child, &new_child)?;
        } else {
            if let Err(e) = fs::hard_link(&crt_child, &new_child) {
                log::warn!("link {:?} -> {:?}: {}", crt_child, new_child, e);
                return Err(e);
            }
            copy_stat(&crt_child, &new_child)?;
        }
    }
    Ok(())
}

/// Propagate mode and timestamps from `src` onto `dst`.
pub fn copy_stat(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::metadata(src)?;
    fs::set_permissions(dst, meta.permissions())?;

    let atime = nix::sys::time::TimeSpec::new(meta.atime(), meta.atime_nsec());
    let mtime = nix::sys::time::TimeSpec::new(meta.mtime(), meta.mtime_nsec());
    nix::sys::stat::utimensat(
        None,
        dst,
        &atime,
        &mtime,
        nix::sys::stat::UtimensatFlags::NoFollowSymlink,
    )
    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

/// Same inode on the same device.
pub fn same_file(a: &Path, b: &Path) -> io::Result<bool> {
    let ma = fs::metadata(a)?;
    let mb = fs::metadata(b)?;
    Ok(ma.dev() == mb.dev() && ma.ino() == mb.ino())
}

/// Two trees are the same iff they are structurally identical and every file
/// pair shares an inode. A missing `old` (or any one-sided entry) means not
/// the same.
pub fn same_tree(old: Option<&Path>, crt: &Path) -> io::Result<bool> {
    let Some(old) = old else {
        return Ok(false);
    };
    if !old.exists() {
        return Ok(false);
    }

    // Entries present only in `old` also break equality.
    for entry in fs::read_dir(old)? {
        let entry = entry?;
        if !crt.join(entry.file_name()).exists() {
            return Ok(false);
        }
    }

    for entry in fs::read_dir(crt)? {
        let entry = entry?;
        let name = entry.file_name();
        let old_child = old.join(&name);
        let crt_child = crt.join(&name);

        if !old_child.exists() {
            return Ok(false);
        }
        let crt_is_dir = fs::metadata(&crt_child)?.is_dir();
        if crt_is_dir != fs::metadata(&old_child)?.is_dir() {
            return Ok(false);
        }
        if crt_is_dir {
            if !same_tree(Some(&old_child), &crt_child)? {
                return Ok(false);
            }
        } else if !same_file(&old_child, &crt_child)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Recursively copy `src` into `dst` (which must exist), duplicating file
/// contents and recreating symlinks verbatim. Used by fork, where the clone
/// must not share inodes with the source tale.
pub fn copy_tree_preserving_links(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in walkdir::WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let target = dst.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copy_stat(entry.path(), &target)?;
        }
    }
    Ok(())
}
