//! Utilities pertaining to filesystem and other os-level settings
//!

use camino::Utf8Path;
use simple_error::{SimpleResult, try_with};

/// Create a novel directory path if it does not exist already
///
/// If the directory already exists no operations are performed
///
/// * `label` - used to describe the error directory in an error message
///
pub fn create_dir_all(dir: &Utf8Path, label: &str) -> SimpleResult<()> {
    if !dir.is_dir() {
        try_with!(
            std::fs::create_dir_all(dir),
            "Can't create new {label} directory at '{dir}'"
        );
    }
    Ok(())
}

/// Remove a file if it exists, treating an already missing file as success
///
pub fn remove_file_if_present(filename: &Utf8Path) -> SimpleResult<()> {
    if filename.exists() {
        try_with!(
            std::fs::remove_file(filename),
            "Can't remove intermediate file '{filename}'"
        );
    }
    Ok(())
}

/// Attempt to increase open file limit to the system's hard limit on *nix-like systems
///
/// This is an optional increase so continue through all failure cases without error.
///
pub fn attempt_max_open_file_limit() {
    use rlimit::Resource;

    let (soft, hard) = match Resource::NOFILE.get() {
        Ok(x) => x,
        Err(_) => return,
    };

    if soft < hard {
        rlimit::setrlimit(Resource::NOFILE, hard, hard).unwrap_or_default();
    }
}
