//! CommandComplete handling: tag parsing and replicated-write
//! reconciliation.

use log::error;

use crate::errors::Error;

/// Affected-row count from a CommandComplete tag, when the tag carries one.
/// `INSERT 0 5` → 5, `UPDATE 3` → 3, `SELECT 7` → 7, `BEGIN` → none.
pub fn rows_from_tag(tag: &str) -> Option<u64> {
    let mut words = tag.split_ascii_whitespace();
    let verb = words.next()?;
    match verb {
        "INSERT" => {
            let _oid = words.next()?;
            words.next()?.parse().ok()
        }
        "UPDATE" | "DELETE" | "SELECT" | "MERGE" | "MOVE" | "FETCH" | "COPY" => {
            words.next()?.parse().ok()
        }
        _ => None,
    }
}

/// Result of comparing per-backend CommandComplete tags for one replicated
/// write.
pub struct Reconciliation {
    /// The tag the client sees (the first backend's).
    pub tag: String,
    /// Set when the backends disagreed on affected rows.
    pub mismatch: Option<Error>,
}

/// Compare the tags returned by every backend that executed a replicated
/// statement. Divergent row counts are surfaced as one `XX001` error; the
/// statement is not rolled back.
pub fn reconcile(tags: &[(usize, String)]) -> Reconciliation {
    let tag = tags
        .first()
        .map(|(_, tag)| tag.clone())
        .unwrap_or_default();

    if tags.len() < 2 {
        return Reconciliation {
            tag,
            mismatch: None,
        };
    }

    let counts: Vec<(usize, Option<u64>)> = tags
        .iter()
        .map(|(node, tag)| (*node, rows_from_tag(tag)))
        .collect();

    let reference = counts[0].1;
    if counts.iter().all(|(_, count)| *count == reference) {
        return Reconciliation {
            tag,
            mismatch: None,
        };
    }

    let detail = counts
        .iter()
        .map(|(node, count)| match count {
            Some(count) => format!("node {node}: {count}"),
            None => format!("node {node}: (no count)"),
        })
        .collect::<Vec<_>>()
        .join(", ");
    for (node, tag) in tags {
        error!("affected tuples mismatch: node {node} returned tag {tag:?}");
    }

    Reconciliation {
        tag,
        mismatch: Some(Error::MismatchedTuples(format!(
            "backends returned different numbers of affected tuples: {detail}"
        ))),
    }
}
