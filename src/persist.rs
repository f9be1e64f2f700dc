//! Shared atomic-write helper for the identity and trust stores
//! (spec.md §9 "File persistence race": write to a temp file and
//! atomically rename).

use std::io;
use std::path::Path;

pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
