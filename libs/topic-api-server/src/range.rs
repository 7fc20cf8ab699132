use crate::ApiError;

/// Parse an offset range path segment into `(start, count)`.
///
/// `"N"` reads one record at N. `"A-B"` starts at A and reads
/// `|B - A + 1|` records, so a reversed range such as `"7-5"` still
/// starts at 7.
pub fn parse_offset_range(raw: &str) -> Result<(i64, u64), ApiError> {
    let (start, count) = match raw.split_once('-') {
        None => (parse_offset(raw)?, 1),
        Some((from, to)) => {
            let from = parse_offset(from)?;
            let to = parse_offset(to)?;
            let span = (to - from)
                .checked_add(1)
                .ok_or_else(|| ApiError::BadRequest(format!("offset range '{raw}' is too large")))?;
            (from, span.unsigned_abs())
        }
    };
    Ok((start, count))
}

fn parse_offset(raw: &str) -> Result<i64, ApiError> {
    let offset: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid offset '{raw}'")))?;
    if offset < 0 {
        return Err(ApiError::BadRequest(format!("negative offset {offset}")));
    }
    Ok(offset)
}

/// Parse a partition path segment, rejecting negative ids.
pub fn parse_partition(raw: &str) -> Result<i32, ApiError> {
    let partition: i32 = raw
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid partition '{raw}'")))?;
    if partition < 0 {
        return Err(ApiError::BadRequest(format!("negative partition {partition}")));
    }
    Ok(partition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_offset_reads_one() {
        assert_eq!(parse_offset_range("5").unwrap(), (5, 1));
    }

    #[test]
    fn inclusive_range() {
        assert_eq!(parse_offset_range("5-7").unwrap(), (5, 3));
        assert_eq!(parse_offset_range("2-2").unwrap(), (2, 1));
    }

    #[test]
    fn reversed_range_keeps_literal_start() {
        assert_eq!(parse_offset_range("7-5").unwrap(), (7, 1));
        assert_eq!(parse_offset_range("9-5").unwrap(), (9, 3));
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        for raw in ["", "x", "5-", "-5", "1-2-3", "a-b"] {
            assert!(
                matches!(parse_offset_range(raw), Err(ApiError::BadRequest(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn range_spanning_all_offsets_is_rejected() {
        assert!(matches!(
            parse_offset_range("0-9223372036854775807"),
            Err(ApiError::BadRequest(_))
        ));
        assert_eq!(
            parse_offset_range("1-9223372036854775807").unwrap(),
            (1, i64::MAX as u64)
        );
    }

    #[test]
    fn partitions_must_be_non_negative_integers() {
        assert_eq!(parse_partition("3").unwrap(), 3);
        assert!(parse_partition("-1").is_err());
        assert!(parse_partition("one").is_err());
    }
}
