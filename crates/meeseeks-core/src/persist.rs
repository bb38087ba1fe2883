//! Atomic JSON file persistence: write to a sibling `.tmp` path and rename
//! over the target so a concurrent reader never observes a partial write.
//! Same pattern used throughout this codebase for on-disk state.

use std::path::Path;

use serde::Serialize;

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let json = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Appends one newline-delimited JSON record to `path`, opening it in append
/// mode. Used for the history log, which unlike the checkpoint file is never
/// rewritten wholesale.
pub fn append_json_line<T: Serialize>(
    file: &mut std::fs::File,
    value: &T,
) -> std::io::Result<()> {
    use std::io::Write;
    let json = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()
}
