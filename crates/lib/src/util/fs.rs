//! Filesystem helpers shared by tree copies and the layer store.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

/// Copy the contents of directory `src` into `dst`, creating `dst` if needed.
///
/// Existing files in `dst` are overwritten; entries of `dst` that are not in
/// `src` are left alone. Symlinks are recreated as symlinks on unix and
/// followed elsewhere. File and directory permissions are carried over.
/// Entries for which `skip` returns true are not copied.
///
/// Returns the number of files (and symlinks) written.
pub fn copy_dir_all<F>(src: &Path, dst: &Path, skip: F) -> io::Result<u64>
where
  F: Fn(&Path) -> bool,
{
  fs::create_dir_all(dst)?;
  let mut copied = 0;
  // applied after the walk so read-only directories can still be filled
  let mut dir_permissions = Vec::new();

  let walker = WalkDir::new(src)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| e.depth() == 0 || !skip(e.path()));

  for entry in walker {
    let entry = entry.map_err(io::Error::other)?;
    let rel = match entry.path().strip_prefix(src) {
      Ok(rel) if !rel.as_os_str().is_empty() => rel,
      _ => continue,
    };
    let target = dst.join(rel);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      if target.is_file() || target.is_symlink() {
        fs::remove_file(&target)?;
      }
      fs::create_dir_all(&target)?;
      dir_permissions.push((target, entry.metadata().map_err(io::Error::other)?.permissions()));
    } else if file_type.is_symlink() {
      remove_existing(&target)?;
      copy_symlink(entry.path(), &target)?;
      copied += 1;
    } else if file_type.is_file() {
      remove_existing(&target)?;
      fs::copy(entry.path(), &target)?;
      copied += 1;
    }
  }

  for (dir, permissions) in dir_permissions.into_iter().rev() {
    fs::set_permissions(&dir, permissions)?;
  }

  Ok(copied)
}

/// Remove everything inside `dir` and leave it as an empty directory.
pub fn clear_dir(dir: &Path) -> io::Result<()> {
  match fs::remove_dir_all(dir) {
    Ok(()) => {}
    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
    Err(e) => return Err(e),
  }
  fs::create_dir_all(dir)
}

fn remove_existing(target: &Path) -> io::Result<()> {
  let Ok(meta) = fs::symlink_metadata(target) else {
    return Ok(());
  };
  if meta.is_dir() {
    fs::remove_dir_all(target)
  } else {
    fs::remove_file(target)
  }
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> io::Result<()> {
  let link = fs::read_link(src)?;
  std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, target: &Path) -> io::Result<()> {
  if src.is_dir() {
    copy_dir_all(src, target, |_| false).map(|_| ())
  } else {
    fs::copy(src, target).map(|_| ())
  }
}
