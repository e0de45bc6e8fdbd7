//! Folder creation and writability probes.

use std::path::Path;

use crate::errors::{EngineError, EngineResult};

/// Create `folder` (recursively) and verify the process can write into it.
pub fn ensure_writable_dir(folder: &Path) -> EngineResult<()> {
    std::fs::create_dir_all(folder).map_err(|e| EngineError::from_io(&e))?;
    if !folder.is_dir() {
        return Err(EngineError::invalid_target(folder.display().to_string()));
    }
    // A metadata readonly bit is not authoritative on every filesystem, so
    // probe with an actual create+remove.
    let probe = folder.join(".vv-write-probe");
    std::fs::write(&probe, b"").map_err(|e| EngineError::from_io(&e))?;
    std::fs::remove_file(&probe).map_err(|e| EngineError::from_io(&e))?;
    Ok(())
}
