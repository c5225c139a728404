//! # Station Codec
//!
//! Conversion between road-engineering station notation and linear distance.
//!
//! A station is written `km+m`: whole kilometers, a `+`, then the meter
//! remainder padded to three digits. `1+250` is 1250 meters from the
//! project datum. Positions before the datum carry a leading minus that
//! applies to the whole station (`-0+250` is -250 meters).
//!
//! Formatting truncates toward zero, so it is lossy below one meter:
//!
//! ```
//! use roadsense_logger::station::{format_station, parse_station};
//!
//! assert_eq!(format_station(1250.9), "1+250");
//! assert_eq!(parse_station("1+250").unwrap(), 1250.0);
//! ```

use crate::error::{Result, RoadsenseError};

/// Separator between the kilometer and meter parts
pub const STATION_SEPARATOR: char = '+';

/// Station of a segment that starts at the project datum
pub const ZERO_STATION: &str = "0+000";

/// Format a distance in meters as a station string
///
/// Fractional meters are truncated toward zero before splitting into
/// kilometers and meters. Non-finite input formats as [`ZERO_STATION`].
///
/// # Examples
///
/// ```
/// use roadsense_logger::station::format_station;
///
/// assert_eq!(format_station(0.0), "0+000");
/// assert_eq!(format_station(12_005.0), "12+005");
/// assert_eq!(format_station(-1250.0), "-1+250");
/// ```
pub fn format_station(distance_m: f64) -> String {
    // `as` saturates and maps NaN to 0
    let whole = distance_m.trunc() as i64;
    let sign = if whole < 0 { "-" } else { "" };
    let magnitude = whole.unsigned_abs();

    format!(
        "{}{}{}{:03}",
        sign,
        magnitude / 1000,
        STATION_SEPARATOR,
        magnitude % 1000
    )
}

/// Parse a station string into meters
///
/// # Errors
///
/// Returns [`RoadsenseError::InvalidStationFormat`] when the input does not
/// split into exactly two numeric parts around a single `+`, when either
/// part is not finite, or when the meter part is negative. The codec never
/// substitutes a default; callers that want one must choose it explicitly.
pub fn parse_station(station: &str) -> Result<f64> {
    let invalid = || RoadsenseError::InvalidStationFormat(station.to_string());

    let mut parts = station.trim().split(STATION_SEPARATOR);
    let (km_part, m_part) = match (parts.next(), parts.next(), parts.next()) {
        (Some(km), Some(m), None) => (km.trim(), m.trim()),
        _ => return Err(invalid()),
    };

    let km: f64 = km_part.parse().map_err(|_| invalid())?;
    let m: f64 = m_part.parse().map_err(|_| invalid())?;

    if !km.is_finite() || !m.is_finite() || m < 0.0 {
        return Err(invalid());
    }

    let magnitude = km.abs() * 1000.0 + m;
    if km_part.starts_with('-') {
        Ok(-magnitude)
    } else {
        Ok(magnitude)
    }
}

/// Distance in meters from `start_station` to `current_station`
///
/// Negative results mean the current position lies before the start and
/// are returned as-is.
pub fn chainage(start_station: &str, current_station: &str) -> Result<f64> {
    Ok(parse_station(current_station)? - parse_station(start_station)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_format_pads_meters() {
        assert_eq!(format_station(1250.0), "1+250");
        assert_eq!(format_station(1005.0), "1+005");
        assert_eq!(format_station(999.0), "0+999");
        assert_eq!(format_station(0.0), ZERO_STATION);
    }

    #[test]
    fn test_format_truncates_fractions() {
        assert_eq!(format_station(1250.99), "1+250");
        assert_eq!(format_station(0.4), "0+000");
        assert_eq!(format_station(-0.4), "0+000");
    }

    #[test]
    fn test_format_negative_distances() {
        assert_eq!(format_station(-250.0), "-0+250");
        assert_eq!(format_station(-1250.7), "-1+250");
    }

    #[test]
    fn test_format_non_finite_is_zero() {
        assert_eq!(format_station(f64::NAN), ZERO_STATION);
    }

    #[test]
    fn test_parse_known_stations() {
        assert_eq!(assert_ok!(parse_station("1+250")), 1250.0);
        assert_eq!(assert_ok!(parse_station("0+000")), 0.0);
        assert_eq!(assert_ok!(parse_station(" 12+005 ")), 12_005.0);
        assert_eq!(assert_ok!(parse_station("2+12.5")), 2012.5);
    }

    #[test]
    fn test_parse_negative_station() {
        assert_eq!(assert_ok!(parse_station("-0+250")), -250.0);
        assert_eq!(assert_ok!(parse_station("-1+250")), -1250.0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = assert_err!(parse_station("garbage"));
        match err {
            RoadsenseError::InvalidStationFormat(input) => assert_eq!(input, "garbage"),
            other => panic!("Expected InvalidStationFormat, got: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_malformed_shapes() {
        for input in ["", "+", "1+", "+250", "1+2+3", "1250", "a+250", "1+b", "1+-5", "inf+0", "1+NaN"] {
            assert!(
                parse_station(input).is_err(),
                "{:?} should not parse as a station",
                input
            );
        }
    }

    #[test]
    fn test_format_then_parse_within_one_meter() {
        let mut x = 0.0_f64;
        while x < 50_000.0 {
            let recovered = parse_station(&format_station(x)).unwrap();
            assert!(
                (x - recovered).abs() < 1.0,
                "{} formatted as {} recovered as {}",
                x,
                format_station(x),
                recovered
            );
            assert!(recovered <= x);
            x += 37.31;
        }
    }

    #[test]
    fn test_negative_format_parse_agree() {
        for x in [-0.5, -1.0, -999.0, -1000.0, -1234.5, -75_010.0] {
            let recovered = parse_station(&format_station(x)).unwrap();
            assert!((x - recovered).abs() < 1.0, "{} recovered as {}", x, recovered);
        }
    }

    #[test]
    fn test_chainage_is_difference_of_parses() {
        let stations = ["0+000", "0+050", "1+250", "3+007", "-0+100"];
        for a in stations {
            for b in stations {
                let expected = parse_station(b).unwrap() - parse_station(a).unwrap();
                assert_eq!(chainage(a, b).unwrap(), expected);
            }
        }
    }

    #[test]
    fn test_chainage_preserves_backward_travel() {
        assert_eq!(chainage("1+250", "1+000").unwrap(), -250.0);
    }

    #[test]
    fn test_chainage_propagates_invalid_station() {
        assert!(chainage("oops", "1+000").is_err());
        assert!(chainage("1+000", "oops").is_err());
    }
}
