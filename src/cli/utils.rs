use camino::{Utf8Path, Utf8PathBuf};
use simple_error::{SimpleResult, bail, try_with};

/// Check the input alignment path and expand it into the list of sample alignment files
///
/// A file path is a single sample. A directory path is a batch of samples, one for each file
/// with a '.bam' extension found directly inside it, in name order.
///
/// Assumes no logger has been configured yet
///
pub fn get_input_alignment_files(path: &Utf8Path, label: &str) -> SimpleResult<Vec<Utf8PathBuf>> {
    if path.as_str().is_empty() {
        bail!("Must specify {label} file");
    }
    if !path.exists() {
        bail!("Can't find specified {label} file: '{path}'");
    }
    if path.is_file() {
        return Ok(vec![path.to_owned()]);
    }
    if !path.is_dir() {
        bail!("Specified {label} path does not appear to be a file or directory: '{path}'");
    }

    let entries = try_with!(
        path.read_dir_utf8(),
        "Can't read {label} directory: '{path}'"
    );
    let mut files = Vec::new();
    for entry in entries {
        let entry = try_with!(entry, "Can't read {label} directory: '{path}'");
        let entry_path = entry.path();
        if entry_path.is_file() && entry_path.extension() == Some("bam") {
            files.push(entry_path.to_owned());
        }
    }
    if files.is_empty() {
        bail!("No '.bam' files found in {label} directory: '{path}'");
    }
    files.sort();
    Ok(files)
}
