//! Archival of per-stream results.
//!
//! One JSON file per stream, named after the flow UUID, grouped by subtest
//! kind: `<data_dir>/<kind>/<uuid>.json`. Files appear atomically: the
//! record is written to a temporary sibling and renamed into place, so a
//! concurrent reader never observes a partial record.

use std::fs;
use std::path::{Path, PathBuf};

use crate::model::StreamResult;
use crate::proto::Error;

/// Where the archive for this result will live.
pub fn result_path(data_dir: &Path, result: &StreamResult) -> PathBuf {
    data_dir
        .join(result.sub_type.to_string())
        .join(format!("{}.json", result.uuid))
}

/// Writes the result record, creating the kind directory as needed.
pub fn write_result(data_dir: &Path, result: &StreamResult) -> Result<(), Error> {
    let path = result_path(data_dir, result);
    let dir = path.parent().expect("result path always has a parent");
    fs::create_dir_all(dir)?;

    let body = serde_json::to_vec_pretty(result)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}
