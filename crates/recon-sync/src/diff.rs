//! Merge-join classifier over two key-ordered sequences.

use std::iter::{Fuse, Peekable};
use std::vec;

use recon_core::{DiffSide, Key, Keyed, SyncError, SyncStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum DiffEntry<U, D> {
    Create(U),
    Read(U, D),
    Update(U, D),
    Delete(D),
}

impl<U, D> DiffEntry<U, D> {
    pub fn status(&self) -> SyncStatus {
        match self {
            DiffEntry::Create(_) => SyncStatus::Create,
            DiffEntry::Read(..) => SyncStatus::Read,
            DiffEntry::Update(..) => SyncStatus::Update,
            DiffEntry::Delete(_) => SyncStatus::Delete,
        }
    }
}

/// Which categories the classifier emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffFilter {
    pub create: bool,
    pub read: bool,
    pub update: bool,
    pub delete: bool,
}

impl Default for DiffFilter {
    fn default() -> Self {
        Self {
            create: true,
            read: false,
            update: true,
            delete: true,
        }
    }
}

impl DiffFilter {
    pub fn all() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn create_only() -> Self {
        Self {
            create: true,
            read: false,
            update: false,
            delete: false,
        }
    }

    pub fn allows(&self, status: SyncStatus) -> bool {
        match status {
            SyncStatus::Create => self.create,
            SyncStatus::Read => self.read,
            SyncStatus::Update => self.update,
            SyncStatus::Delete => self.delete,
        }
    }
}

fn first_disorder<U: Keyed>(rows: &[U]) -> Option<(Key, Key)> {
    rows.windows(2)
        .find(|pair| pair[0].key() >= pair[1].key())
        .map(|pair| (pair[0].key().clone(), pair[1].key().clone()))
}

/// Lazy classification of an in-memory upstream slice against a streamed downstream sequence.
///
/// Both sides must be strictly ascending by key. Upstream order is checked up front, downstream
/// order as rows arrive; either violation is yielded once as an error and ends the iteration.
pub struct RowDiff<U, D, I, F>
where
    I: Iterator<Item = D>,
{
    upstream: Peekable<vec::IntoIter<U>>,
    downstream: Fuse<I>,
    current: Option<D>,
    last_downstream: Option<Key>,
    filter: DiffFilter,
    requires_update: F,
    pending_error: Option<SyncError>,
    finished: bool,
}

impl<U, D, I, F> RowDiff<U, D, I, F>
where
    U: Keyed,
    D: Keyed,
    I: Iterator<Item = D>,
    F: Fn(&U, &D) -> bool,
{
    pub fn new(
        upstream: Vec<U>,
        downstream: impl IntoIterator<IntoIter = I>,
        filter: DiffFilter,
        requires_update: F,
    ) -> Self {
        let pending_error = first_disorder(&upstream).map(|(previous, next)| {
            SyncError::OrderingViolation {
                side: DiffSide::Upstream,
                previous,
                next,
            }
        });
        Self {
            upstream: upstream.into_iter().peekable(),
            downstream: downstream.into_iter().fuse(),
            current: None,
            last_downstream: None,
            filter,
            requires_update,
            pending_error,
            finished: false,
        }
    }

    fn fail(&mut self, err: SyncError) -> Option<Result<DiffEntry<U, D>, SyncError>> {
        self.finished = true;
        Some(Err(err))
    }

    fn pull_downstream(&mut self) -> Result<(), SyncError> {
        if self.current.is_some() {
            return Ok(());
        }
        let Some(row) = self.downstream.next() else {
            return Ok(());
        };
        if let Some(previous) = &self.last_downstream {
            if previous >= row.key() {
                return Err(SyncError::OrderingViolation {
                    side: DiffSide::Downstream,
                    previous: previous.clone(),
                    next: row.key().clone(),
                });
            }
        }
        self.last_downstream = Some(row.key().clone());
        self.current = Some(row);
        Ok(())
    }
}

impl<U, D, I, F> Iterator for RowDiff<U, D, I, F>
where
    U: Keyed,
    D: Keyed,
    I: Iterator<Item = D>,
    F: Fn(&U, &D) -> bool,
{
    type Item = Result<DiffEntry<U, D>, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(err) = self.pending_error.take() {
                return self.fail(err);
            }
            if let Err(err) = self.pull_downstream() {
                return self.fail(err);
            }

            let Some(down) = self.current.as_ref() else {
                // downstream exhausted: whatever is left upstream is new
                let Some(up) = self.upstream.next() else {
                    self.finished = true;
                    return None;
                };
                if self.filter.create {
                    return Some(Ok(DiffEntry::Create(up)));
                }
                continue;
            };

            let ordering = self.upstream.peek().map(|up| up.key().cmp(down.key()));
            match ordering {
                Some(std::cmp::Ordering::Less) => {
                    let Some(up) = self.upstream.next() else { continue };
                    if self.filter.create {
                        return Some(Ok(DiffEntry::Create(up)));
                    }
                }
                Some(std::cmp::Ordering::Equal) => {
                    let (Some(up), Some(down)) = (self.upstream.next(), self.current.take()) else {
                        continue;
                    };
                    if !self.filter.read && !self.filter.update {
                        continue;
                    }
                    if (self.requires_update)(&up, &down) {
                        if self.filter.update {
                            return Some(Ok(DiffEntry::Update(up, down)));
                        }
                    } else if self.filter.read {
                        return Some(Ok(DiffEntry::Read(up, down)));
                    }
                }
                _ => {
                    let Some(down) = self.current.take() else { continue };
                    if self.filter.delete {
                        return Some(Ok(DiffEntry::Delete(down)));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        key: Key,
        version: u32,
    }

    impl Keyed for Row {
        fn key(&self) -> &Key {
            &self.key
        }
    }

    fn row(key: i64, version: u32) -> Row {
        Row {
            key: Key::Int(key),
            version,
        }
    }

    fn newer(up: &Row, down: &Row) -> bool {
        up.version > down.version
    }

    fn classify(up: Vec<Row>, down: Vec<Row>, filter: DiffFilter) -> Vec<(SyncStatus, i64)> {
        RowDiff::new(up, down, filter, newer)
            .map(|entry| {
                let entry = entry.expect("ordered input");
                let key = match &entry {
                    DiffEntry::Create(u) | DiffEntry::Read(u, _) | DiffEntry::Update(u, _) => {
                        u.key.clone()
                    }
                    DiffEntry::Delete(d) => d.key.clone(),
                };
                (entry.status(), key.as_int().expect("int key"))
            })
            .collect()
    }

    #[test]
    fn classifies_read_update_create() {
        let out = classify(
            vec![row(1, 1), row(2, 2), row(3, 1)],
            vec![row(1, 1), row(2, 1)],
            DiffFilter::all(),
        );
        assert_eq!(
            out,
            vec![
                (SyncStatus::Read, 1),
                (SyncStatus::Update, 2),
                (SyncStatus::Create, 3)
            ]
        );
    }

    #[test]
    fn interleaved_gaps_produce_creates_and_deletes_in_key_order() {
        let out = classify(
            vec![row(2, 1), row(5, 1), row(9, 1)],
            vec![row(1, 1), row(5, 1), row(7, 1), row(12, 1)],
            DiffFilter::default(),
        );
        assert_eq!(
            out,
            vec![
                (SyncStatus::Delete, 1),
                (SyncStatus::Create, 2),
                (SyncStatus::Delete, 7),
                (SyncStatus::Create, 9),
                (SyncStatus::Delete, 12),
            ]
        );
    }

    #[test]
    fn create_only_never_asks_for_comparisons() {
        let out: Vec<_> = RowDiff::new(
            vec![row(1, 5), row(2, 1)],
            vec![row(1, 1), row(3, 1)],
            DiffFilter::create_only(),
            |_: &Row, _: &Row| -> bool { panic!("update comparison computed") },
        )
        .map(|entry| entry.expect("ordered").status())
        .collect();
        assert_eq!(out, vec![SyncStatus::Create]);
    }

    #[test]
    fn upstream_disorder_is_reported_before_anything_else() {
        let mut diff = RowDiff::new(vec![row(2, 1), row(1, 1)], Vec::<Row>::new(), DiffFilter::all(), newer);
        let err = diff.next().expect("item").unwrap_err();
        assert!(matches!(
            err,
            SyncError::OrderingViolation { side: DiffSide::Upstream, .. }
        ));
        assert!(diff.next().is_none());
    }

    #[test]
    fn downstream_duplicates_stop_the_stream() {
        let results: Vec<_> = RowDiff::new(
            vec![row(1, 1)],
            vec![row(3, 1), row(3, 1)],
            DiffFilter::default(),
            newer,
        )
        .collect();
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Ok(DiffEntry::Create(_))));
        assert!(matches!(results[1], Ok(DiffEntry::Delete(_))));
        assert!(matches!(
            results[2],
            Err(SyncError::OrderingViolation {
                side: DiffSide::Downstream,
                ..
            })
        ));
    }

    #[test]
    fn empty_sides() {
        assert!(classify(Vec::new(), Vec::new(), DiffFilter::all()).is_empty());
        assert_eq!(
            classify(Vec::new(), vec![row(4, 1)], DiffFilter::default()),
            vec![(SyncStatus::Delete, 4)]
        );
    }
}
