use hdf5::types::VarLenUnicode;
use hdf5::File;
use std::path::Path;
use std::str::FromStr;

use super::config::RunState;
use super::error::FinalizeError;

const FRAME_AXES: &str = "experiment_identifier:y:x";

/// Post-pass over the finished temporary file, run exactly once on the
/// designated reader after the writer barrier.
///
/// Adds the stable `data_1`/`data_2` aliases and axis metadata, counts the
/// persisted frames, then atomically publishes the file: the rename to the
/// final path is the last irreversible action, so any earlier failure
/// leaves the temporary file unpublished for forensic inspection. Returns
/// the frame count.
pub fn finalize(state: &RunState) -> Result<u64, FinalizeError> {
    let n_frames = annotate(&state.temp_path, state)?;
    std::fs::rename(&state.temp_path, &state.final_path)?;
    restrict_permissions(&state.final_path)?;
    log::info!(
        "Moved temporary file {} to {}",
        state.temp_path.display(),
        state.final_path.display()
    );
    Ok(n_frames)
}

/// Link and annotate the datasets in place; the file is closed again before
/// the caller renames it.
fn annotate(path: &Path, state: &RunState) -> Result<u64, FinalizeError> {
    let file = File::open_rw(path)?;

    let mut n_frames = 0u64;
    if state.output.save_pnccd && file.link_exists("entry_1/detector_1/data") {
        let data = file.dataset("entry_1/detector_1/data")?;
        n_frames = data.shape()[0] as u64;
        if n_frames > 0 {
            file.link_soft("/entry_1/detector_1", "entry_1/data_1")?;
            data.new_attr::<VarLenUnicode>()
                .create("axes")?
                .write_scalar(&VarLenUnicode::from_str(FRAME_AXES).unwrap())?;
        }
    }
    log::info!("Counting in total {} frames.", n_frames);

    if state.output.save_multiple && file.link_exists("entry_1/detector_1/patterson") {
        let patterson = file.dataset("entry_1/detector_1/patterson")?;
        patterson
            .new_attr::<VarLenUnicode>()
            .create("axes")?
            .write_scalar(&VarLenUnicode::from_str(FRAME_AXES).unwrap())?;
    }

    if state.output.save_tof && file.link_exists("entry_1/detector_2") {
        file.link_soft("/entry_1/detector_2", "entry_1/data_2")?;
    }
    log::info!("Successfully created soft links and attributes");

    Ok(n_frames)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), FinalizeError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o770))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), FinalizeError> {
    Ok(())
}
