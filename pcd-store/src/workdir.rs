use std::fs;
use std::path::Path;

use pcd_core::error::{Result, TilerError};

/// What to do when the output directory already holds a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOption {
    AbortIfExists,
    Overwrite,
    Incremental,
}

/// Verify the output directory before any point is read. An existing
/// conversion is detected by its `cloud.js` marker.
pub fn verify_work_dir(work_dir: &Path, option: StoreOption) -> Result<()> {
    if work_dir.exists() {
        let marker = work_dir.join("cloud.js");
        if marker.exists() && option == StoreOption::AbortIfExists {
            return Err(TilerError::Configuration(format!(
                "output directory {:?} is not empty; pass --overwrite to replace its contents",
                work_dir
            )));
        }

        if option == StoreOption::Incremental {
            log::info!("appending to existing output directory {:?}", work_dir);
            return Ok(());
        }

        log::info!("output directory not empty, removing existing files");
        for entry in fs::read_dir(work_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
    } else {
        log::info!("output directory does not exist, creating it");
        fs::create_dir_all(work_dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pcd-workdir-test-{}-{}",
            std::process::id(),
            name
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn creates_missing_directory() {
        let dir = temp_dir("create");
        verify_work_dir(&dir, StoreOption::AbortIfExists).unwrap();
        assert!(dir.exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn aborts_on_existing_conversion() {
        let dir = temp_dir("abort");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cloud.js"), "{}").unwrap();
        let err = verify_work_dir(&dir, StoreOption::AbortIfExists);
        assert!(matches!(err, Err(TilerError::Configuration(_))));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn overwrite_clears_directory() {
        let dir = temp_dir("overwrite");
        fs::create_dir_all(dir.join("data")).unwrap();
        fs::write(dir.join("cloud.js"), "{}").unwrap();
        fs::write(dir.join("data").join("r.bin"), [0u8; 12]).unwrap();
        verify_work_dir(&dir, StoreOption::Overwrite).unwrap();
        assert!(fs::read_dir(&dir).unwrap().next().is_none());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn incremental_keeps_existing_files() {
        let dir = temp_dir("incremental");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cloud.js"), "{}").unwrap();
        verify_work_dir(&dir, StoreOption::Incremental).unwrap();
        assert!(dir.join("cloud.js").exists());
        fs::remove_dir_all(&dir).unwrap();
    }
}
