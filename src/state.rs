//! State directory checks

use crate::{Error, Result};
use std::fs;
use std::io;
use std::path::Path;

/// Written and removed again to prove the directory is writable
const WRITE_TEST_FILE: &str = ".iptproxy-writetest";

/// prepare_state_dir makes sure path exists, is a directory and can be
/// written to
pub fn prepare_state_dir(path: &Path) -> Result<()> {
    check(path).map_err(|source| Error::StateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn check(path: &Path) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a directory"));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => create_dir(path)?,
        Err(e) => return Err(e),
    }

    let probe = path.join(WRITE_TEST_FILE);
    fs::File::create(&probe)?;
    fs::remove_file(&probe)
}

#[cfg(unix)]
fn create_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}
