use std::collections::VecDeque;

use arrayvec::ArrayVec;

use crate::types::ContentType;
use crate::Error;

/// Most records one confirmation can complete. Bounded by the queue depth.
pub(crate) const MAX_CONFIRMED: usize = 32;

/// Maps "bytes sent" confirmations from a stream transport back onto records.
///
/// Records are pushed in the order they are handed to the transport. Confirmed
/// byte counts accumulate and complete records front to back.
#[derive(Debug)]
pub(crate) struct TxConfirmation {
    entries: VecDeque<(usize, ContentType)>,
    depth: usize,
    partial: usize,
}

impl TxConfirmation {
    pub fn new(depth: usize) -> Self {
        TxConfirmation {
            entries: VecDeque::with_capacity(depth),
            depth: depth.min(MAX_CONFIRMED),
            partial: 0,
        }
    }

    /// Whether `n` more records fit.
    pub fn has_room(&self, n: usize) -> bool {
        self.entries.len() + n <= self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, len: usize, ctype: ContentType) -> Result<(), Error> {
        if !self.has_room(1) {
            return Err(Error::TxConfirmationFull);
        }
        self.entries.push_back((len, ctype));
        Ok(())
    }

    /// Account `n` confirmed bytes and return the records now fully sent.
    pub fn confirm(&mut self, n: usize) -> ArrayVec<(usize, ContentType), MAX_CONFIRMED> {
        let mut done = ArrayVec::new();
        self.partial += n;

        while let Some(&(len, ctype)) = self.entries.front() {
            if self.partial < len {
                break;
            }
            self.partial -= len;
            self.entries.pop_front();
            done.push((len, ctype));
        }

        if self.entries.is_empty() && self.partial > 0 {
            warn!("{} confirmed bytes beyond sent records", self.partial);
            self.partial = 0;
        }

        done
    }
}
