// Duplicate file/folder name handling
//
// Output files and playlist folders never overwrite anything: when the name is
// taken, " (1)", " (2)", ... is appended until a free one is found. The probe
// decides what counts as taken; items also consult names reserved in memory.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// Extensions that count as a collision for a single item
const ITEM_EXTENSIONS: [&str; 2] = ["mp3", "mp4"];

/// `base` with " (n)" appended to its last component
fn with_suffix(base: &Path, n: u32) -> PathBuf {
    let mut name: OsString = base.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!(" ({})", n));
    base.with_file_name(name)
}

/// `base` + "." + `ext`, without treating dots in the title as an extension
fn with_ext(base: &Path, ext: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(".");
    path.push(ext);
    PathBuf::from(path)
}

fn first_free<F>(base: &Path, taken: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    if !taken(base) {
        return base.to_path_buf();
    }
    let mut i = 1;
    loop {
        let candidate = with_suffix(base, i);
        if !taken(&candidate) {
            return candidate;
        }
        i += 1;
    }
}

/// Stem (no extension) for an item so that neither `.mp3` nor `.mp4` exists yet.
pub fn resolve_unique<F>(base: &Path, exists: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    first_free(base, |stem| {
        ITEM_EXTENSIONS.iter().any(|ext| exists(&with_ext(stem, ext)))
    })
}

/// Free directory name for a playlist folder
pub fn resolve_unique_dir<F>(base: &Path, exists: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    first_free(base, exists)
}

/// Resolve against the real filesystem and create the folder.
///
/// `create_dir` fails if someone grabbed the name in between; that is reported
/// instead of silently sharing the folder.
pub fn create_unique_dir(base: &Path) -> io::Result<PathBuf> {
    if let Some(parent) = base.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let dir = resolve_unique_dir(base, |p| p.exists());
    std::fs::create_dir(&dir)?;
    Ok(dir)
}

/// Final output path for an item stem
pub fn output_path(stem: &Path, ext: &str) -> PathBuf {
    with_ext(stem, ext)
}
