/// Sliding replay window for DTLS record sequence numbers.
///
/// Anchored at the highest accepted sequence number with a 32-bit bitmap of the
/// last 32 numbers. Bit 0 is the anchor itself.
///
/// Checking and updating are split: a record is checked before it is verified
/// and the window is only updated once verification succeeded, so a forged
/// record cannot move the anchor.
#[derive(Debug, Default)]
pub(crate) struct ReplayWindow {
    top: u64,
    bitmap: u32,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether `seq` is fresh.
    pub fn check(&self, seq: u64) -> bool {
        if seq > self.top {
            return true;
        }
        let offset = self.top - seq;
        if offset >= 32 {
            return false; // too old
        }
        self.bitmap & (1 << offset) == 0
    }

    /// Mark `seq` as seen.
    pub fn update(&mut self, seq: u64) {
        if seq >= self.top {
            let shift = seq - self.top;
            if shift >= 32 {
                self.bitmap = 1;
            } else {
                self.bitmap = (self.bitmap << shift) | 1;
            }
            self.top = seq;
        } else {
            let offset = self.top - seq;
            if offset < 32 {
                self.bitmap |= 1 << offset;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(w: &mut ReplayWindow, seq: u64) -> bool {
        if w.check(seq) {
            w.update(seq);
            true
        } else {
            false
        }
    }

    #[test]
    fn accepts_fresh_and_rejects_duplicate() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 0));
        assert!(!accept(&mut w, 0)); // duplicate
        assert!(accept(&mut w, 1));
        assert!(!accept(&mut w, 1));
    }

    #[test]
    fn accepts_out_of_order_within_window() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 10)); // establish top=10
        assert!(accept(&mut w, 8)); // unseen within 32
        assert!(!accept(&mut w, 8)); // duplicate now
        assert!(accept(&mut w, 9));
    }

    #[test]
    fn rejects_too_old() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 100));
        // offset = 32 -> too old
        assert!(!accept(&mut w, 68));
        // offset = 31 -> allowed once
        assert!(accept(&mut w, 69));
        assert!(!accept(&mut w, 69));
    }

    #[test]
    fn newer_always_advances_anchor() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 1));
        assert!(accept(&mut w, 80));
        assert_eq!(w.top, 80);
        assert_eq!(w.bitmap, 1);
        assert!(accept(&mut w, 79));
        assert!(!accept(&mut w, 15));
    }

    #[test]
    fn check_does_not_mutate() {
        let mut w = ReplayWindow::new();
        w.update(5);
        assert!(w.check(6));
        assert!(w.check(6));
        assert!(!w.check(5));
        w.reset();
        assert!(w.check(5));
    }
}
