use std::path::Path;
use std::time::Instant;

pub use anyhow::{anyhow, bail, ensure, Context, Result};

#[cfg(test)]
pub mod test_utils;

pub type EmptyRes = Result<()>;

#[macro_export]
macro_rules! err {
    ($($arg:tt)*) => {Err(anyhow::anyhow!($($arg)*))};
}

pub use crate::err;

/// Runs `block`, then `log_result` with the result and elapsed wall-clock milliseconds.
pub fn measure<T, B, L>(block: B, log_result: L) -> T
    where B: FnOnce() -> T,
          L: FnOnce(&T, u128)
{
    let start_time = Instant::now();
    let result = block();
    log_result(&result, start_time.elapsed().as_millis());
    result
}

pub fn path_to_str(path: &Path) -> Result<&str> {
    path.to_str().with_context(|| format!("Path {path:?} is not a valid string"))
}

pub fn path_file_name(path: &Path) -> Result<&str> {
    path.file_name().and_then(|p| p.to_str())
        .with_context(|| format!("Path {path:?} does not have a file name"))
}

/// Joins a virtual device path (leading slash optional, always '/'-separated) onto an
/// on-disk root.
pub fn syspath(root: &Path, vpath: &str) -> std::path::PathBuf {
    let mut out = root.to_path_buf();
    for part in vpath.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}

/// Virtual-path dirname. Not `Path::parent` because device paths are always
/// '/'-separated regardless of the host OS.
pub fn vpath_dirname(vpath: &str) -> &str {
    match vpath.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &vpath[..idx],
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
        write!(acc, "{b:02x}").unwrap();
        acc
    })
}
