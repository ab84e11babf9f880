/// Flight retransmission countdown, measured in engine ticks.
///
/// Starts at the initial value and doubles with every retransmission until the
/// retry limit is reached.
#[derive(Debug)]
pub(crate) struct RetransmitTimer {
    initial: u32,
    limit: u32,
    remaining: u32,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    /// Not armed.
    Idle,
    Running,
    /// Resend the flight.
    Expired,
    /// Retry limit reached.
    Exhausted,
}

impl RetransmitTimer {
    pub fn new(initial: u32, limit: u32) -> Self {
        RetransmitTimer {
            initial,
            limit,
            remaining: 0,
            count: 0,
        }
    }

    /// Arm for a new flight.
    pub fn start(&mut self) {
        self.count = 0;
        self.remaining = self.initial;
    }

    pub fn stop(&mut self) {
        self.remaining = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.remaining > 0
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn tick(&mut self) -> TimerEvent {
        match self.remaining {
            0 => TimerEvent::Idle,
            1 => {
                if self.count < self.limit {
                    self.count += 1;
                    self.remaining = self.initial.saturating_mul(1 << self.count);
                    TimerEvent::Expired
                } else {
                    self.remaining = 0;
                    TimerEvent::Exhausted
                }
            }
            _ => {
                self.remaining -= 1;
                TimerEvent::Running
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticks_until_event(t: &mut RetransmitTimer) -> (u32, TimerEvent) {
        let mut n = 0;
        loop {
            n += 1;
            match t.tick() {
                TimerEvent::Running => continue,
                e => return (n, e),
            }
        }
    }

    #[test]
    fn backoff_doubles() {
        let mut t = RetransmitTimer::new(4, 3);
        assert_eq!(t.tick(), TimerEvent::Idle);

        t.start();
        assert_eq!(ticks_until_event(&mut t), (4, TimerEvent::Expired));
        assert_eq!(t.count(), 1);
        assert_eq!(ticks_until_event(&mut t), (8, TimerEvent::Expired));
        assert_eq!(ticks_until_event(&mut t), (16, TimerEvent::Expired));
        assert_eq!(t.count(), 3);
        assert_eq!(ticks_until_event(&mut t), (32, TimerEvent::Exhausted));
        assert!(!t.is_armed());
        assert_eq!(t.tick(), TimerEvent::Idle);
    }

    #[test]
    fn start_resets_count() {
        let mut t = RetransmitTimer::new(2, 6);
        t.start();
        ticks_until_event(&mut t);
        assert_eq!(t.count(), 1);
        t.start();
        assert_eq!(t.count(), 0);
        assert_eq!(ticks_until_event(&mut t), (2, TimerEvent::Expired));
        t.stop();
        assert_eq!(t.tick(), TimerEvent::Idle);
    }
}
