use std::collections::BTreeMap;

use crate::{lease::Lease, Error, Result};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// One lease per path.
    pub survivors: Vec<Lease>,
    /// Rows that lost the tie-break and must be deleted durably.
    pub discarded: Vec<Lease>,
}

/// Picks the row with the greatest create time for every path.
///
/// Fails with [`Error::DuplicateSession`] when that greatest create time is
/// shared by several rows of the same path, since no winner can be chosen.
pub fn reconcile(rows: Vec<Lease>) -> Result<Reconciled> {
    let mut by_path: BTreeMap<String, Vec<Lease>> = BTreeMap::new();
    for row in rows {
        by_path.entry(row.path.clone()).or_default().push(row);
    }

    let mut reconciled = Reconciled::default();
    for (path, mut group) in by_path {
        // Newest first; session id keeps the order stable.
        group.sort_by(|a, b| {
            b.create_time_us
                .cmp(&a.create_time_us)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });

        let newest = group[0].create_time_us;
        let tied = group.iter().take_while(|l| l.create_time_us == newest).count();
        if tied > 1 {
            return Err(Error::DuplicateSession {
                path,
                count: tied,
                create_time_us: newest,
            });
        }

        let mut rest = group.into_iter();
        if let Some(winner) = rest.next() {
            reconciled.survivors.push(winner);
        }
        reconciled.discarded.extend(rest);
    }

    Ok(reconciled)
}
