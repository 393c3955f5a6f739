//! Pending notification discovery
//!
//! Markers live in the reserved notification family, one column per observed
//! column, one version per arm. A scan reports each `(row, column)` once,
//! with its newest marker version.

use std::sync::Arc;

use tracing::debug;

use seep_core::{
    decode_ack, notify_column, Bytes, CellIter, CellOp, Column, ColumnFilter, EntryKind,
    Notification, ScanRequest, SeepResult, Span, Store, NOTIFY_FAMILY,
};

/// Reads and clears notification markers
#[derive(Clone)]
pub struct NotificationManager {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationManager").finish_non_exhaustive()
    }
}

impl NotificationManager {
    /// Manager over `store`
    pub fn new(store: Arc<dyn Store>) -> Self {
        NotificationManager { store }
    }

    /// Pending notifications in `span`, newest marker per `(row, column)`
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned. Items fail
    /// individually if a marker cannot be decoded.
    pub fn scan_pending(&self, span: &Span) -> SeepResult<PendingNotifications<'_>> {
        let request = ScanRequest::new(span.clone(), ColumnFilter::family(NOTIFY_FAMILY))
            .kinds([EntryKind::Notify]);
        Ok(PendingNotifications {
            cells: self.store.scan(&request)?,
            last: None,
        })
    }

    /// Newest marker of `(row, column)` visible before `before`
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the marker is corrupt.
    pub fn newest_marker(
        &self,
        row: &Bytes,
        column: &Column,
        before: u64,
    ) -> SeepResult<Option<Notification>> {
        let request = marker_request(row, column).before(before);
        match self.store.scan(&request)?.next() {
            Some(cell) => Notification::from_marker(&cell).map(Some),
            None => Ok(None),
        }
    }

    /// True if the notification was already processed
    ///
    /// A committed acknowledgement started after the marker was armed means
    /// the observer already ran against this change. This happens when the
    /// processing transaction committed but did not get to clear the marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn is_acknowledged(&self, notification: &Notification) -> SeepResult<bool> {
        let request = ScanRequest::new(
            Span::exact(notification.row.clone()),
            ColumnFilter::column(notification.column.clone()),
        )
        .kinds([EntryKind::Ack]);
        for cell in self.store.scan(&request)? {
            if cell.key.ts < notification.ts {
                // newest first
                break;
            }
            // the value is checked so a torn entry is not taken as an ack
            decode_ack(&cell.value)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Delete every marker version of `notification` up to its timestamp
    ///
    /// Versions armed later stay pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn clear(&self, notification: &Notification) -> SeepResult<usize> {
        let request = marker_request(&notification.row, &notification.column)
            .before(notification.ts.saturating_add(1));
        let ops: Vec<CellOp> = self
            .store
            .scan(&request)?
            .map(|cell| CellOp::Delete(cell.key))
            .collect();
        let cleared = ops.len();
        if cleared > 0 {
            self.store.batch_write(ops)?;
        }
        debug!(
            row = %notification.row,
            column = %notification.column,
            ts = notification.ts,
            cleared,
            "Cleared notification markers"
        );
        Ok(cleared)
    }
}

fn marker_request(row: &Bytes, column: &Column) -> ScanRequest {
    ScanRequest::new(
        Span::exact(row.clone()),
        ColumnFilter::column(notify_column(column)),
    )
    .kinds([EntryKind::Notify])
}

/// Lazy sequence of pending notifications
///
/// Marker versions of one `(row, column)` are adjacent and newest first, so
/// only the first of each run is reported.
pub struct PendingNotifications<'a> {
    cells: CellIter<'a>,
    last: Option<(Bytes, Column)>,
}

impl Iterator for PendingNotifications<'_> {
    type Item = SeepResult<Notification>;

    fn next(&mut self) -> Option<Self::Item> {
        for cell in self.cells.by_ref() {
            let seen = matches!(
                &self.last,
                Some((row, column)) if *row == cell.key.row && *column == cell.key.column
            );
            if seen {
                continue;
            }
            self.last = Some((cell.key.row.clone(), cell.key.column.clone()));
            return Some(Notification::from_marker(&cell));
        }
        None
    }
}
