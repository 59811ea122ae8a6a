//! Schema management for variable tables

use crate::error::Result;

use super::backend::SizeLimits;
use super::driver::Driver;

/// Length of a writer GUID as stored (hyphenated UUID)
pub const WRITER_GUID_LENGTH: usize = 36;

/// Create the variable table if it does not exist
///
/// `rowid` is AUTOINCREMENT so sequence numbers are never reused, even after
/// the newest row is deleted; pollers rely on that for their watermark.
pub fn ensure_schema(driver: &mut dyn Driver, table: &str, limits: SizeLimits) -> Result<()> {
    driver.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                rowid INTEGER PRIMARY KEY AUTOINCREMENT,
                name VARCHAR({name_len}) NOT NULL UNIQUE,
                type VARCHAR({type_len}),
                value BLOB,
                writer_guid CHAR({guid_len}) NOT NULL
            )",
            table = table,
            name_len = limits.max_name_length,
            type_len = limits.max_type_length,
            guid_len = WRITER_GUID_LENGTH,
        ),
        &[],
    )?;

    driver.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_writer ON {table} (writer_guid, rowid)",
            table = table
        ),
        &[],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::Connector;
    use crate::storage::sqlite::SqliteConnector;

    #[test]
    fn test_ensure_schema_is_idempotent() {
        let mut driver = SqliteConnector::in_memory().connect().unwrap();
        ensure_schema(driver.as_mut(), "variables", SizeLimits::default()).unwrap();
        ensure_schema(driver.as_mut(), "variables", SizeLimits::default()).unwrap();

        let rows = driver
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'variables'",
                &[],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
