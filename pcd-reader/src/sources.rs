use std::path::{Path, PathBuf};

use glob::glob;

/// Expand CLI input patterns into concrete source files: glob patterns are
/// resolved, directories contribute their `.bin` files, and anything that
/// does not exist is dropped with a warning.
pub fn expand_sources(patterns: &[String]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for pattern in patterns {
        if pattern.contains('*') || pattern.contains('?') || pattern.contains('[') {
            match glob(pattern) {
                Ok(entries) => {
                    for entry in entries {
                        match entry {
                            Ok(path) => paths.push(path),
                            Err(e) => log::warn!("glob entry error: {e}"),
                        }
                    }
                }
                Err(e) => log::warn!("invalid glob pattern \"{pattern}\": {e}"),
            }
        } else {
            paths.push(PathBuf::from(pattern));
        }
    }

    let mut sources = Vec::new();
    for path in paths {
        if path.is_dir() {
            collect_directory(&path, &mut sources);
        } else if path.is_file() {
            sources.push(path);
        } else {
            log::warn!("can't open input file {:?}", path);
        }
    }
    sources
}

fn collect_directory(dir: &Path, sources: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("can't read input directory {:?}: {e}", dir);
            return;
        }
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("bin"))
                    .unwrap_or(false)
        })
        .collect();
    found.sort();
    sources.extend(found);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn directories_contribute_their_bin_files_sorted() {
        let dir = std::env::temp_dir().join(format!(
            "pcd-sources-test-{}-dir",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("b.bin"), []).unwrap();
        fs::write(dir.join("a.bin"), []).unwrap();
        fs::write(dir.join("notes.txt"), []).unwrap();

        let sources = expand_sources(&[dir.to_string_lossy().into_owned()]);
        let names: Vec<_> = sources
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.bin", "b.bin"]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_inputs_are_dropped() {
        let sources = expand_sources(&["/no/such/file.bin".to_string()]);
        assert!(sources.is_empty());
    }
}
