//! Structural validation of inbound query parameters.
//!
//! Only shape is checked here (formats, ranges, casing); whether a code
//! or date actually exists is the upstream's call.

use chrono::NaiveDate;

use crate::error::GatewayError;

/// Upper bound the provider accepts per page.
pub const MAX_LIMIT: u32 = 100;

pub struct RequestValidator;

impl RequestValidator {
    /// Uppercase an IATA-style code (airport, airline or flight number).
    pub fn normalize_iata(name: &str, value: &str) -> Result<String, GatewayError> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.len() > 8 {
            return Err(GatewayError::Validation(format!(
                "{} must be 1-8 characters",
                name
            )));
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(GatewayError::Validation(format!(
                "{} must be alphanumeric",
                name
            )));
        }
        Ok(trimmed.to_uppercase())
    }

    /// Two-letter country code, uppercased.
    pub fn normalize_country(value: &str) -> Result<String, GatewayError> {
        let trimmed = value.trim();
        if trimmed.len() != 2 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(GatewayError::Validation(
                "country_iso2 must be a two-letter code".to_string(),
            ));
        }
        Ok(trimmed.to_uppercase())
    }

    /// Strict `YYYY-MM-DD`. chrono alone accepts unpadded months and
    /// days, so the shape is checked first.
    pub fn validate_date(name: &str, value: &str) -> Result<(), GatewayError> {
        let bytes = value.as_bytes();
        let shape_ok = bytes.len() == 10
            && bytes[4] == b'-'
            && bytes[7] == b'-'
            && bytes
                .iter()
                .enumerate()
                .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
        if !shape_ok || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_err() {
            return Err(GatewayError::Validation(format!(
                "{} must be a YYYY-MM-DD date",
                name
            )));
        }
        Ok(())
    }

    pub fn validate_date_range(start: &str, end: &str) -> Result<(), GatewayError> {
        Self::validate_date("start_date", start)?;
        Self::validate_date("end_date", end)?;
        if start > end {
            return Err(GatewayError::Validation(
                "start_date must not be after end_date".to_string(),
            ));
        }
        Ok(())
    }

    /// Lowercased flight status keyword.
    pub fn normalize_status(value: &str) -> Result<String, GatewayError> {
        let trimmed = value.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(GatewayError::Validation(
                "flight_status must be a single keyword".to_string(),
            ));
        }
        Ok(trimmed.to_lowercase())
    }

    /// Parse and clamp `limit` into [1, MAX_LIMIT]; absent means the max.
    pub fn parse_limit(value: Option<&str>) -> Result<u32, GatewayError> {
        match value {
            None => Ok(MAX_LIMIT),
            Some(raw) => {
                let parsed: u32 = raw.trim().parse().map_err(|_| {
                    GatewayError::Validation("limit must be a positive integer".to_string())
                })?;
                Ok(parsed.clamp(1, MAX_LIMIT))
            }
        }
    }
}
