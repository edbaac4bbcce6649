use std::time::Duration;

use crate::error::ValidationError;

/// Parses `250ms`, `5s`, `2m`, `1h` or bare seconds.
pub(crate) fn parse_duration_value(value: &str) -> Result<Duration, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::DurationEmpty);
    }

    let digits_len = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    if digits_len == 0 {
        return Err(ValidationError::InvalidDurationFormat {
            value: value.to_owned(),
        });
    }
    let (num_part, unit_part) = value.split_at(digits_len);
    let number: u64 = num_part
        .parse()
        .map_err(|err| ValidationError::InvalidDurationNumber {
            value: value.to_owned(),
            source: err,
        })?;

    let duration = match unit_part {
        "ms" => Duration::from_millis(number),
        "" | "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(scale_seconds(number, 60)?),
        "h" => Duration::from_secs(scale_seconds(number, 3600)?),
        unit => {
            return Err(ValidationError::InvalidDurationUnit {
                unit: unit.to_owned(),
            });
        }
    };

    if duration.is_zero() {
        return Err(ValidationError::DurationZero);
    }

    Ok(duration)
}

fn scale_seconds(number: u64, seconds_per_unit: u64) -> Result<u64, ValidationError> {
    number
        .checked_mul(seconds_per_unit)
        .ok_or(ValidationError::DurationOverflow)
}
