use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Parse a timestamp column. Offset-less values are read as UTC.
pub fn parse_timestamp(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    relay_core::time::parse_timestamp(raw).ok_or_else(|| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid timestamp: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::MessageKind;

    #[test]
    fn parse_enum_success() {
        let kind: MessageKind = parse_enum("server", "messages", "kind").unwrap();
        assert_eq!(kind, MessageKind::Server);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<MessageKind, _> = parse_enum("INVALID", "messages", "kind");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "kind", .. })
        ));
    }

    #[test]
    fn parse_timestamp_roundtrips_utc() {
        let now = Utc::now();
        let parsed = parse_timestamp(&now.to_rfc3339(), "messages", "timestamp").unwrap();
        assert_eq!(parsed, now);
    }

    #[test]
    fn parse_timestamp_rejects_garbage() {
        let result = parse_timestamp("yesterday", "messages", "timestamp");
        assert!(matches!(result, Err(StoreError::CorruptRow { column: "timestamp", .. })));
    }
}
