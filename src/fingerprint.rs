// ABOUTME: Deterministic row and table fingerprints plus snapshot diffing
// ABOUTME: Pure functions; SHA-256 over a canonical, column-sorted row encoding

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{ReplicationError, Result};
use crate::model::{Delta, Row, TableSnapshot};

/// Fingerprint a single row.
///
/// The row is encoded as a JSON object whose keys are the column names in
/// lexicographic order and whose values are each column's canonical string
/// (or `null`). The SHA-256 of that encoding is returned as lowercase hex.
/// Two rows with equal values produce equal fingerprints regardless of the
/// order their columns were produced in.
pub fn row_fingerprint(row: &Row) -> Result<String> {
    let mut canonical: BTreeMap<&str, Option<String>> = BTreeMap::new();
    for (column, value) in row {
        let text = value.as_canonical_text().map_err(|message| {
            ReplicationError::validation("", format!("column '{}': {}", column, message))
        })?;
        canonical.insert(column.as_str(), text);
    }

    let encoded = serde_json::to_string(&canonical)
        .map_err(|e| ReplicationError::validation("", format!("row encoding failed: {}", e)))?;

    Ok(sha256_hex(encoded.as_bytes()))
}

/// Fingerprint a whole table.
///
/// Row fingerprints are sorted before being concatenated and hashed again, so
/// the result does not depend on the order the source returned rows in.
pub fn table_fingerprint<'a, I>(rows: I) -> Result<String>
where
    I: IntoIterator<Item = &'a Row>,
{
    let mut digests = rows
        .into_iter()
        .map(row_fingerprint)
        .collect::<Result<Vec<_>>>()?;
    digests.sort_unstable();

    Ok(sha256_hex(digests.concat().as_bytes()))
}

/// Classify the difference between two snapshots of the same table.
///
/// - inserted: keys only in `current`
/// - updated: keys in both whose row fingerprints differ
/// - deleted: keys only in `previous`, carrying the previous values
///
/// Each set is ordered by primary key.
pub fn diff(previous: &TableSnapshot, current: &TableSnapshot) -> Result<Delta> {
    let table = current.table_name.as_str();
    let mut delta = Delta::default();

    for (key, current_row) in &current.rows {
        match previous.rows.get(key) {
            None => delta.inserted.push(current_row.clone()),
            Some(previous_row) => {
                let before = row_fingerprint(previous_row).map_err(|e| e.for_table(table))?;
                let after = row_fingerprint(current_row).map_err(|e| e.for_table(table))?;
                if before != after {
                    delta.updated.push(current_row.clone());
                }
            }
        }
    }

    delta.deleted = previous
        .rows
        .iter()
        .filter(|(key, _)| !current.rows.contains_key(*key))
        .map(|(_, row)| row.clone())
        .collect();

    Ok(delta)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
