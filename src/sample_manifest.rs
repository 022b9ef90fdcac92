//! Track the completion of every window expected for one sample
//!
//! The manifest is created from the split result and holds the exact set of windows which must
//! complete filtering before the sample can be merged. Worker threads record completions through
//! a shared reference, and the merge stage consumes the manifest.
//!

use std::collections::BTreeMap;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use simple_error::{SimpleResult, bail};

use crate::splitter::Window;

/// Filtered output recorded for one completed window
#[derive(Clone, Debug)]
pub struct CompletedWindow {
    pub filename: Utf8PathBuf,
    pub record_count: usize,
}

struct ManifestState {
    /// Map from window index to its filtered output, None until the window completes
    windows: BTreeMap<usize, Option<CompletedWindow>>,
    pending_count: usize,
}

pub struct SampleManifest {
    sample_stem: String,
    split_dir: Utf8PathBuf,
    state: Mutex<ManifestState>,
}

impl SampleManifest {
    pub fn new(sample_stem: &str, split_dir: &Utf8Path, windows: &[Window]) -> Self {
        let windows = windows
            .iter()
            .map(|x| (x.index, None))
            .collect::<BTreeMap<_, _>>();
        let pending_count = windows.len();
        Self {
            sample_stem: sample_stem.to_string(),
            split_dir: split_dir.to_owned(),
            state: Mutex::new(ManifestState {
                windows,
                pending_count,
            }),
        }
    }

    pub fn sample_stem(&self) -> &str {
        &self.sample_stem
    }

    pub fn split_dir(&self) -> &Utf8Path {
        &self.split_dir
    }

    /// Record the filtered output of a window
    ///
    /// Each expected window may be completed exactly once.
    ///
    pub fn complete_window(
        &self,
        window_index: usize,
        filename: &Utf8Path,
        record_count: usize,
    ) -> SimpleResult<()> {
        let mut state = self.state.lock().unwrap();
        let entry = match state.windows.get_mut(&window_index) {
            Some(x) => x,
            None => bail!(
                "Window {window_index} is not expected for sample '{}'",
                self.sample_stem
            ),
        };
        if entry.is_some() {
            bail!(
                "Window {window_index} of sample '{}' was completed more than once",
                self.sample_stem
            );
        }
        *entry = Some(CompletedWindow {
            filename: filename.to_owned(),
            record_count,
        });
        state.pending_count -= 1;
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending_count
    }

    pub fn window_count(&self) -> usize {
        self.state.lock().unwrap().windows.len()
    }

    /// Get all completed windows in index order, failing if any window is still pending
    ///
    pub fn into_completed_windows(self) -> SimpleResult<Vec<(usize, CompletedWindow)>> {
        let sample_stem = self.sample_stem;
        let state = self.state.into_inner().unwrap();
        if state.pending_count > 0 {
            let pending = state
                .windows
                .iter()
                .filter(|(_, x)| x.is_none())
                .map(|(x, _)| x.to_string())
                .collect::<Vec<_>>();
            bail!(
                "{} of {} windows of sample '{sample_stem}' have not completed: {}",
                state.pending_count,
                state.windows.len(),
                pending.join(",")
            );
        }
        Ok(state
            .windows
            .into_iter()
            .filter_map(|(index, x)| x.map(|x| (index, x)))
            .collect())
    }
}
