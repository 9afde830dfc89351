//! Timing wheel for rate-paced packet injection.
//!
//! A bucketed calendar queue over the timestamp counter. Enqueueing a packet
//! for dispatch at TSC `t` places it in bucket `(t / width) mod n`; each
//! dispatch iteration drains every bucket whose time has come. Entries are
//! plain `(session, slot, seq)` triples so the wheel holds no back-pointers
//! into session state.

use std::collections::VecDeque;

/// One paced packet.
///
/// `seq` is the slot's transmit sequence: values below the request's packet
/// count are request-data fragments, values at or above it are
/// request-for-response packets. A wheel-resident entry has already consumed
/// a session credit but has not yet advanced `num_tx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelEnt {
    pub session_num: u16,
    pub slot_idx: u8,
    pub seq: u16,
}

pub struct TimingWheel {
    buckets: Vec<VecDeque<(u64, WheelEnt)>>,
    num_buckets: usize,
    bucket_width_tsc: u64,
    /// TSC up to which buckets have been drained.
    cur_tsc: u64,
    count: usize,
}

impl TimingWheel {
    pub fn new(num_buckets: usize, bucket_width_tsc: u64, now_tsc: u64) -> Self {
        assert!(num_buckets.is_power_of_two());
        assert!(bucket_width_tsc > 0);
        Self {
            buckets: (0..num_buckets).map(|_| VecDeque::new()).collect(),
            num_buckets,
            bucket_width_tsc,
            cur_tsc: now_tsc,
            count: 0,
        }
    }

    #[inline]
    fn bucket_of(&self, tsc: u64) -> usize {
        ((tsc / self.bucket_width_tsc) as usize) & (self.num_buckets - 1)
    }

    /// Horizon covered by one lap of the wheel.
    #[inline]
    pub fn horizon_tsc(&self) -> u64 {
        self.bucket_width_tsc * self.num_buckets as u64
    }

    /// Queue `ent` for dispatch at `dispatch_tsc`. Times in the past or
    /// beyond the horizon are clamped so one lap always reaches them.
    pub fn insert(&mut self, dispatch_tsc: u64, ent: WheelEnt) {
        let t = dispatch_tsc
            .max(self.cur_tsc)
            .min(self.cur_tsc + self.horizon_tsc() - self.bucket_width_tsc);
        let idx = self.bucket_of(t);
        self.buckets[idx].push_back((t, ent));
        self.count += 1;
    }

    /// Advance to `now_tsc`, appending every due entry to `out` in time
    /// order. Reuses the caller's buffer; it is not cleared here.
    pub fn advance_into(&mut self, now_tsc: u64, out: &mut Vec<WheelEnt>) {
        if now_tsc <= self.cur_tsc || self.count == 0 {
            self.cur_tsc = self.cur_tsc.max(now_tsc);
            return;
        }

        let start_bucket = (self.cur_tsc / self.bucket_width_tsc) as usize;
        let end_bucket = (now_tsc / self.bucket_width_tsc) as usize;
        let laps = (end_bucket - start_bucket + 1).min(self.num_buckets);

        for b in 0..laps {
            let idx = (start_bucket + b) & (self.num_buckets - 1);
            let bucket = &mut self.buckets[idx];
            let mut remaining = bucket.len();
            while remaining > 0 {
                remaining -= 1;
                let (t, ent) = bucket.pop_front().unwrap();
                if t <= now_tsc {
                    out.push(ent);
                    self.count -= 1;
                } else {
                    // Next lap's entry sharing the bucket; keep it.
                    bucket.push_back((t, ent));
                }
            }
        }

        self.cur_tsc = now_tsc;
    }

    /// Entries currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Discard every entry belonging to `session_num` (session teardown).
    pub fn purge_session(&mut self, session_num: u16) -> usize {
        let mut purged = 0;
        for bucket in &mut self.buckets {
            let before = bucket.len();
            bucket.retain(|(_, e)| e.session_num != session_num);
            purged += before - bucket.len();
        }
        self.count -= purged;
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ent(seq: u16) -> WheelEnt {
        WheelEnt {
            session_num: 1,
            slot_idx: 0,
            seq,
        }
    }

    #[test]
    fn due_entries_drain_in_time_order() {
        let mut wheel = TimingWheel::new(8, 100, 1000);
        wheel.insert(1150, ent(0));
        wheel.insert(1350, ent(1));
        wheel.insert(1250, ent(2));

        let mut out = Vec::new();
        wheel.advance_into(1200, &mut out);
        assert_eq!(out, vec![ent(0)]);

        out.clear();
        wheel.advance_into(1400, &mut out);
        assert_eq!(out, vec![ent(2), ent(1)]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn past_times_dispatch_immediately() {
        let mut wheel = TimingWheel::new(8, 100, 5000);
        wheel.insert(10, ent(3));
        let mut out = Vec::new();
        wheel.advance_into(5001, &mut out);
        assert_eq!(out, vec![ent(3)]);
    }

    #[test]
    fn beyond_horizon_is_clamped() {
        let mut wheel = TimingWheel::new(8, 100, 0);
        wheel.insert(1_000_000, ent(4));
        let mut out = Vec::new();
        wheel.advance_into(wheel.horizon_tsc(), &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn purge_drops_only_matching_session() {
        let mut wheel = TimingWheel::new(8, 100, 0);
        wheel.insert(50, ent(0));
        wheel.insert(
            60,
            WheelEnt {
                session_num: 9,
                slot_idx: 1,
                seq: 0,
            },
        );
        assert_eq!(wheel.purge_session(1), 1);
        assert_eq!(wheel.len(), 1);
    }
}
