//! Header summaries for DICOM files fetched by the download queue.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dicom_object::{open_file, DefaultDicomObject};

use crate::queue::{Transfer, TransferState};

/// Header attributes reported for each inspected file.
pub const SUMMARY_FIELD_NAMES: &[&str] = &[
    "PatientID",
    "PatientSex",
    "StudyDate",
    "StudyDescription",
    "StudyInstanceUID",
    "SeriesDescription",
    "SeriesInstanceUID",
    "SeriesNumber",
    "Modality",
    "Manufacturer",
    "SOPInstanceUID",
    "InstanceNumber",
    "Rows",
    "Columns",
    "NumberOfFrames",
    "SliceThickness",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DicomSummary {
    pub path: PathBuf,
    pub fields: Vec<(String, String)>,
}

/// Opens a local DICOM file and reads its summary fields.
pub fn inspect_dicom(path: &Path) -> Result<DicomSummary> {
    let object = open_file(path).with_context(|| format!("Could not open {}", path.display()))?;
    Ok(DicomSummary {
        path: path.to_path_buf(),
        fields: summary_fields(&object),
    })
}

/// Summaries for every completed transfer that holds a readable DICOM file.
///
/// Zip bundles are skipped; unreadable files are logged and left out.
pub fn inspect_completed(transfers: &[Transfer]) -> Vec<DicomSummary> {
    transfers
        .iter()
        .filter(|transfer| transfer.state == TransferState::Completed)
        .filter(|transfer| {
            transfer
                .destination
                .extension()
                .map_or(true, |ext| !ext.eq_ignore_ascii_case("zip"))
        })
        .filter_map(|transfer| match inspect_dicom(&transfer.destination) {
            Ok(summary) => Some(summary),
            Err(err) => {
                log::warn!("skipping {}: {err:#}", transfer.destination.display());
                None
            }
        })
        .collect()
}

fn summary_fields(object: &DefaultDicomObject) -> Vec<(String, String)> {
    SUMMARY_FIELD_NAMES
        .iter()
        .filter_map(|name| {
            let element = object.element_by_name(name).ok()?;
            let value = element.to_str().ok()?;
            let value = value.trim();
            (!value.is_empty()).then(|| (name.to_string(), value.to_string()))
        })
        .collect()
}
