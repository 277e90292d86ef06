//! Outstanding-request table of an I/O queue pair.
//!
//! A command id is a plain index into this table: `row = cid / qsize`, `col = cid % qsize`. New
//! commands use the ring slot they were written to as their column, and start looking at row 0.
//! When the device has not yet completed the previous command in that column, the next row is
//! tried, up to [`MAX_ROWS`].

/// Rows beyond this would mean more than `4 * qsize` requests outstanding on one queue.
pub const MAX_ROWS: usize = 4;

#[derive(Debug)]
pub struct PendingTable<T> {
    qsize: u16,
    rows: Vec<Box<[Option<T>]>>,
    outstanding: usize,
}

impl<T> PendingTable<T> {
    pub fn new(qsize: u16) -> Self {
        assert!(qsize > 0);
        assert!(
            usize::from(qsize) * MAX_ROWS <= usize::from(u16::MAX) + 1,
            "queue depth {qsize} does not fit the command id space"
        );
        let mut table = Self {
            qsize,
            rows: Vec::with_capacity(MAX_ROWS),
            outstanding: 0,
        };
        table.grow();
        table
    }

    fn grow(&mut self) {
        let row = (0..self.qsize).map(|_| None).collect();
        self.rows.push(row);
    }

    /// Stores `value` for the command written at ring slot `col` and returns its command id.
    ///
    /// Panics when every row already holds an outstanding command for `col`.
    pub fn insert(&mut self, col: u16, value: T) -> u16 {
        assert!(col < self.qsize);
        let col_idx = usize::from(col);
        for row in 0..MAX_ROWS {
            if row == self.rows.len() {
                self.grow();
            }
            let slot = &mut self.rows[row][col_idx];
            if slot.is_none() {
                *slot = Some(value);
                self.outstanding += 1;
                // Fits: checked against the id space in `new`.
                return (row * usize::from(self.qsize) + col_idx) as u16;
            }
        }
        panic!(
            "all {MAX_ROWS} pending rows busy for slot {col} (qsize {})",
            self.qsize
        );
    }

    /// Removes and returns the request for `cid`, if one is outstanding.
    pub fn take(&mut self, cid: u16) -> Option<T> {
        let row = usize::from(cid / self.qsize);
        let col = usize::from(cid % self.qsize);
        let value = self.rows.get_mut(row)?[col].take();
        if value.is_some() {
            self.outstanding -= 1;
        }
        value
    }

    pub fn len(&self) -> usize {
        self.outstanding
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding == 0
    }

    /// Rows allocated so far.
    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    /// Removes every outstanding request.
    pub fn drain(&mut self) -> Vec<T> {
        self.outstanding = 0;
        self.rows
            .iter_mut()
            .flat_map(|row| row.iter_mut().filter_map(Option::take))
            .collect()
    }
}
