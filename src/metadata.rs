use crate::path::Level;

/// Fields that carry a human-readable name for a record.
pub const LABEL_TAGS: &[&str] = &["ID", "id", "name", "Name", "label"];

pub const MR_SESSION: &str = "xnat:mrSessionData";
pub const PET_SESSION: &str = "xnat:petSessionData";

/// Session types an experiment search is restricted to, queried in order.
pub const SEARCH_SESSION_TYPES: [&str; 2] = [MR_SESSION, PET_SESSION];

const PROJECT_TAGS: &[&str] = &[
    "last_accessed_497",
    "ID",
    "id",
    "insert_user",
    "pi",
    "insert_date",
    "description",
    "secondary_ID",
    "pi_lastname",
    "pi_firstname",
    "project_invs",
    "project_access_img",
    "user_role_497",
    "quarantine_status",
    "URI",
];

const SUBJECT_TAGS: &[&str] = &[
    "ID",
    "label",
    "insert_date",
    "insert_user",
    "totalRecords",
    "project",
    "URI",
];

const EXPERIMENT_TAGS: &[&str] = &[
    "ID",
    "label",
    "insert_date",
    "totalRecords",
    "date",
    "project",
    "xsiType",
    "xnat:subjectassessordata/id",
    "URI",
];

const SCAN_TAGS: &[&str] = &[
    "series_description",
    "note",
    "type",
    "xsiType",
    "quality",
    "xnat_imagescandata_id",
    "URI",
    "ID",
];

const RESOURCE_TAGS: &[&str] = &[
    "element_name",
    "category",
    "cat_id",
    "xnat_abstractresource_id",
    "cat_desc",
];

const FILE_TAGS: &[&str] = &[
    "Size",
    "file_format",
    "file_content",
    "collection",
    "file_tags",
    "cat_ID",
    "URI",
    "Name",
];

/// Full column set shown for records at `level`.
pub fn tags(level: Level) -> &'static [&'static str] {
    match level {
        Level::Projects => PROJECT_TAGS,
        Level::Subjects => SUBJECT_TAGS,
        Level::Experiments => EXPERIMENT_TAGS,
        Level::Scans => SCAN_TAGS,
        Level::Resources => RESOURCE_TAGS,
        Level::Files | Level::Slicer => FILE_TAGS,
    }
}

/// Short column set for compact displays.
pub fn lite_tags(level: Level) -> &'static [&'static str] {
    match level {
        Level::Projects => &["last_accessed_497"],
        Level::Subjects => &["label"],
        Level::Experiments => &["date"],
        Level::Scans => &["series_description", "type", "quality"],
        Level::Resources => &["element_name"],
        Level::Files | Level::Slicer => &["Size"],
    }
}

/// Columns matched by a wildcard search at `level`.
pub fn search_tags(level: Level) -> &'static [&'static str] {
    match level {
        Level::Projects => &[
            "ID",
            "secondary_ID",
            "name",
            "pi_firstname",
            "pi_lastname",
            "description",
        ],
        Level::Subjects | Level::Experiments => &["ID", "label"],
        _ => &[],
    }
}

/// Converts bytes to megabytes, truncating (not rounding) the fraction to
/// `decimal_places` digits.
pub fn bytes_to_mb(bytes: u64, decimal_places: usize) -> f64 {
    let quotient = bytes as f64 / (1024.0 * 1024.0);
    let text = quotient.to_string();
    let (whole, fraction) = text.split_once('.').unwrap_or((text.as_str(), ""));

    let mut truncated = whole.to_string();
    if decimal_places > 0 && !fraction.is_empty() {
        truncated.push('.');
        truncated.extend(fraction.chars().take(decimal_places));
    }
    truncated.parse::<f64>().unwrap_or(quotient)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_to_mb_truncates_instead_of_rounding() {
        assert_eq!(bytes_to_mb(2_097_152, 2), 2.0);
        // 1.999999... MB stays below 2
        assert_eq!(bytes_to_mb(2_097_151, 2), 1.99);
        assert_eq!(bytes_to_mb(1_572_864, 1), 1.5);
        assert_eq!(bytes_to_mb(1_572_864, 0), 1.0);
        assert_eq!(bytes_to_mb(0, 2), 0.0);
    }

    #[test]
    fn file_and_slicer_levels_share_columns() {
        assert_eq!(tags(Level::Files), tags(Level::Slicer));
        assert!(tags(Level::Files).contains(&"Size"));
        assert_eq!(lite_tags(Level::Scans).len(), 3);
    }

    #[test]
    fn only_upper_levels_are_searchable() {
        for level in Level::SEARCHABLE {
            assert!(!search_tags(level).is_empty(), "{level}");
        }
        assert!(search_tags(Level::Files).is_empty());
    }
}
