use std::time::Duration;

use crate::error::{ArchiveError, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MB_DECIMAL_PLACES: usize = 2;

/// Connection settings for one archive host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Always ends with exactly one `/`.
    pub host: String,
    pub username: String,
    pub password: String,
    pub mb_decimal_places: usize,
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    /// `None` leaves stalled transfers blocking until the server gives up.
    pub request_timeout: Option<Duration>,
}

impl ArchiveConfig {
    pub fn new(host: &str, username: &str, password: &str) -> Result<Self> {
        let host = normalize_host(host)?;
        Ok(Self {
            host,
            username: username.to_string(),
            password: password.to_string(),
            mb_decimal_places: DEFAULT_MB_DECIMAL_PLACES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_mb_decimal_places(mut self, places: usize) -> Self {
        self.mb_decimal_places = places;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

pub fn normalize_host(host: &str) -> Result<String> {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ArchiveError::Configuration(
            "Archive host must not be empty.".to_string(),
        ));
    }
    if !trimmed.contains("://") {
        return Err(ArchiveError::Configuration(format!(
            "Archive host '{trimmed}' must include a scheme (http:// or https://)."
        )));
    }
    Ok(format!("{trimmed}/"))
}

/// Splits a percent-encoded `username:password` string.
pub fn parse_credentials(value: &str) -> Result<(String, String)> {
    let trimmed = value.trim();
    let Some((user, pass)) = trimmed.split_once(':') else {
        return Err(ArchiveError::Configuration(
            "auth must be encoded as username:password (percent-encoded).".to_string(),
        ));
    };
    let user = percent_decode(user.trim())?;
    let pass = percent_decode(pass.trim())?;
    if user.is_empty() || pass.is_empty() {
        return Err(ArchiveError::Configuration(
            "Archive credentials must include both user and password.".to_string(),
        ));
    }
    Ok((user, pass))
}

fn percent_decode(value: &str) -> Result<String> {
    let invalid = || ArchiveError::Configuration("Invalid percent-encoding in credentials.".into());
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' => {
                if index + 2 >= bytes.len() {
                    return Err(invalid());
                }
                let hi = decode_hex_digit(bytes[index + 1]).ok_or_else(invalid)?;
                let lo = decode_hex_digit(bytes[index + 2]).ok_or_else(invalid)?;
                decoded.push((hi << 4) | lo);
                index += 3;
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8(decoded).map_err(|_| {
        ArchiveError::Configuration("Credentials contain invalid UTF-8 after decoding.".into())
    })
}

fn decode_hex_digit(value: u8) -> Option<u8> {
    match value {
        b'0'..=b'9' => Some(value - b'0'),
        b'a'..=b'f' => Some(value - b'a' + 10),
        b'A'..=b'F' => Some(value - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_gets_single_trailing_separator() {
        let config = ArchiveConfig::new("https://central.example.org//", "u", "p")
            .expect("host should normalize");
        assert_eq!(config.host, "https://central.example.org/");

        let config =
            ArchiveConfig::new("http://localhost:8080", "u", "p").expect("host should normalize");
        assert_eq!(config.host, "http://localhost:8080/");
    }

    #[test]
    fn empty_or_schemeless_host_is_rejected() {
        assert!(matches!(
            ArchiveConfig::new("  ", "u", "p"),
            Err(ArchiveError::Configuration(_))
        ));
        assert!(matches!(
            ArchiveConfig::new("central.example.org", "u", "p"),
            Err(ArchiveError::Configuration(_))
        ));
    }

    #[test]
    fn credentials_are_percent_decoded() {
        let (user, pass) = parse_credentials("viewer%40lab:p%3Ass+word").expect("should parse");
        assert_eq!(user, "viewer@lab");
        assert_eq!(pass, "p:ss word");
    }

    #[test]
    fn credentials_require_both_parts() {
        let error = parse_credentials("vieweruser").expect_err("should fail");
        assert!(error.to_string().contains("username:password"));
        let error = parse_credentials("vieweruser:").expect_err("should fail");
        assert!(error.to_string().contains("both user and password"));
    }

    #[test]
    fn truncated_percent_escape_is_rejected() {
        assert!(parse_credentials("user:pass%4").is_err());
    }

    #[test]
    fn chunk_size_never_drops_to_zero() {
        let config = ArchiveConfig::new("http://localhost", "u", "p")
            .expect("host should normalize")
            .with_chunk_size(0);
        assert_eq!(config.chunk_size, 1);
    }
}
