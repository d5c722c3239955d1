//! BarrierRecord - バリアの共有状態
//!
//! The same record is kept in memory by the in-process barrier and persisted as
//! JSON by the file barrier, so every decision about release and timeout lives
//! here and both backends behave identically.
//!
//! # 状態遷移
//! - `Gathering`: 参加者を集めている
//! - `Released`: 必要数がそろった（全員に true）
//! - `TimedOut`: 期限切れ（全員に false）
//!
//! Released / TimedOut は一度決まったら変わりません。到着済みの全参加者が結果を
//! 確認（acknowledge）したらレコードは削除され、同じ group id を再利用できます。
//! 確認されないまま `deadline + grace` を過ぎたレコードも削除対象です。
//!
//! `arrived` は必要数を超えません。期限切れ後の到着や必要数を超えた到着は
//! `late` に入り、結果は常に false です。

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{GroupId, ParticipantId};
use super::job::to_chrono;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierPhase {
    Gathering,
    Released,
    TimedOut,
}

/// Result of [`BarrierRecord::arrive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Newly counted.
    Recorded,
    /// Already counted in this round; nothing changed.
    AlreadyArrived,
    /// Not counted: the round timed out, or it already has everyone it needs.
    LateArrival,
    /// The previous round is still being drained; retry once it is removed.
    NextRound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierRecord {
    pub group_id: GroupId,
    /// Fixed by the first `wait` call.
    pub required: Option<usize>,
    /// Counted participants in arrival order.
    pub arrived: Vec<ParticipantId>,
    #[serde(default)]
    pub late: BTreeSet<ParticipantId>,
    pub acknowledged: BTreeSet<ParticipantId>,
    pub created_at: DateTime<Utc>,
    /// First wait time + timeout.
    pub deadline: Option<DateTime<Utc>>,
    pub phase: BarrierPhase,
    pub settled_at: Option<DateTime<Utc>>,
}

impl BarrierRecord {
    pub fn new(group_id: GroupId, now: DateTime<Utc>) -> Self {
        Self {
            group_id,
            required: None,
            arrived: Vec::new(),
            late: BTreeSet::new(),
            acknowledged: BTreeSet::new(),
            created_at: now,
            deadline: None,
            phase: BarrierPhase::Gathering,
            settled_at: None,
        }
    }

    fn has_arrived(&self, participant: &ParticipantId) -> bool {
        self.arrived.contains(participant) || self.late.contains(participant)
    }

    pub fn arrive(&mut self, participant: &ParticipantId, now: DateTime<Utc>) -> Arrival {
        if self.has_arrived(participant) {
            // 結果を確認済みの参加者が再度 signal した = 次のラウンド
            if self.acknowledged.contains(participant) {
                return Arrival::NextRound;
            }
            if self.late.contains(participant) {
                return Arrival::LateArrival;
            }
            return Arrival::AlreadyArrived;
        }

        match self.phase {
            BarrierPhase::Gathering => {
                self.arrived.push(participant.clone());
                self.try_release(now);
                Arrival::Recorded
            }
            BarrierPhase::TimedOut => {
                self.late.insert(participant.clone());
                Arrival::LateArrival
            }
            BarrierPhase::Released => Arrival::NextRound,
        }
    }

    /// Records a waiter's observation and returns the outcome once settled.
    ///
    /// `None` means "still gathering, keep waiting". Only participants that
    /// arrived are counted as having acknowledged the outcome.
    pub fn observe(
        &mut self,
        participant: &ParticipantId,
        required: usize,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Option<bool> {
        if self.required.is_none() {
            self.required = Some(required);
            // 必要数より先に着いた分だけ数える
            if self.arrived.len() > required {
                let extra = self.arrived.split_off(required);
                self.late.extend(extra);
            }
        }
        if self.deadline.is_none() {
            self.deadline = Some(now + to_chrono(timeout));
        }

        if self.phase == BarrierPhase::Gathering {
            self.try_release(now);
        }
        if self.phase == BarrierPhase::Gathering
            && self.deadline.is_some_and(|deadline| now >= deadline)
        {
            self.phase = BarrierPhase::TimedOut;
            self.settled_at = Some(now);
        }

        let released = match self.phase {
            BarrierPhase::Gathering => return None,
            BarrierPhase::Released => true,
            BarrierPhase::TimedOut => false,
        };
        if self.has_arrived(participant) {
            self.acknowledged.insert(participant.clone());
        }
        if self.late.contains(participant) {
            return Some(false);
        }
        Some(released)
    }

    /// A participant gave up waiting (cancelled). Once the record is settled
    /// it no longer holds the record open.
    pub fn abandon(&mut self, participant: &ParticipantId) {
        if self.phase != BarrierPhase::Gathering && self.has_arrived(participant) {
            self.acknowledged.insert(participant.clone());
        }
    }

    fn try_release(&mut self, now: DateTime<Utc>) {
        let Some(required) = self.required else {
            return;
        };
        if self.arrived.len() >= required {
            self.phase = BarrierPhase::Released;
            self.settled_at = Some(now);
        }
    }

    /// Settled and every arrived participant has seen the outcome.
    pub fn is_drained(&self) -> bool {
        self.phase != BarrierPhase::Gathering
            && self
                .arrived
                .iter()
                .chain(self.late.iter())
                .all(|p| self.acknowledged.contains(p))
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now.signed_duration_since(self.created_at) > to_chrono(stale_after)
    }

    /// Nobody will act on this record any more and it can be removed.
    ///
    /// Past `deadline + grace` every live waiter has had time to observe the
    /// outcome; a waiter that shows up later starts a fresh round.
    pub fn is_expired(&self, now: DateTime<Utc>, stale_after: Duration, grace: Duration) -> bool {
        self.is_drained()
            || self.is_stale(now, stale_after)
            || self
                .deadline
                .is_some_and(|deadline| now > deadline + to_chrono(grace))
    }

    /// Time left until the shared deadline, if one is set.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.deadline
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(name: &str) -> ParticipantId {
        ParticipantId::new(name)
    }

    fn record(now: DateTime<Utc>) -> BarrierRecord {
        BarrierRecord::new(GroupId::new("g1"), now)
    }

    #[test]
    fn signal_is_idempotent() {
        let now = Utc::now();
        let mut rec = record(now);

        assert_eq!(rec.arrive(&p("dev1"), now), Arrival::Recorded);
        assert_eq!(rec.arrive(&p("dev1"), now), Arrival::AlreadyArrived);
        assert_eq!(rec.arrived.len(), 1);
    }

    #[test]
    fn releases_when_required_count_arrives() {
        let now = Utc::now();
        let timeout = Duration::from_secs(30);
        let mut rec = record(now);

        rec.arrive(&p("dev1"), now);
        assert_eq!(rec.observe(&p("dev1"), 2, timeout, now), None);

        rec.arrive(&p("dev2"), now);
        assert_eq!(rec.phase, BarrierPhase::Released);
        assert_eq!(rec.observe(&p("dev1"), 2, timeout, now), Some(true));
        assert!(!rec.is_drained());
        assert_eq!(rec.observe(&p("dev2"), 2, timeout, now), Some(true));
        assert!(rec.is_drained());
    }

    #[test]
    fn timeout_is_shared_by_everyone_who_arrived() {
        let t0 = Utc::now();
        let timeout = Duration::from_secs(30);
        let mut rec = record(t0);

        rec.arrive(&p("dev1"), t0);
        assert_eq!(rec.observe(&p("dev1"), 3, timeout, t0), None);
        rec.arrive(&p("dev2"), t0);

        let late = t0 + chrono::Duration::seconds(31);
        assert_eq!(rec.observe(&p("dev2"), 3, timeout, late), Some(false));
        // the last participant shows up after the timeout: no partial release
        assert_eq!(rec.arrive(&p("dev3"), late), Arrival::LateArrival);
        assert_eq!(rec.observe(&p("dev3"), 3, timeout, late), Some(false));
        assert_eq!(rec.observe(&p("dev1"), 3, timeout, late), Some(false));
        assert_eq!(rec.phase, BarrierPhase::TimedOut);
        assert!(rec.is_drained());
    }

    #[test]
    fn deadline_is_fixed_by_the_first_wait() {
        let t0 = Utc::now();
        let mut rec = record(t0);
        rec.arrive(&p("dev1"), t0);
        rec.observe(&p("dev1"), 2, Duration::from_secs(10), t0);

        let later = t0 + chrono::Duration::seconds(5);
        rec.observe(&p("dev1"), 2, Duration::from_secs(10), later);

        assert_eq!(rec.remaining(later), Some(Duration::from_secs(5)));
    }

    #[test]
    fn acknowledged_participant_signalling_again_starts_next_round() {
        let now = Utc::now();
        let mut rec = record(now);
        rec.arrive(&p("dev1"), now);
        rec.observe(&p("dev1"), 1, Duration::from_secs(1), now);

        assert_eq!(rec.arrive(&p("dev1"), now), Arrival::NextRound);
    }

    #[test]
    fn arrivals_beyond_required_are_not_counted() {
        let now = Utc::now();
        let mut rec = record(now);
        for name in ["dev1", "dev2", "dev3"] {
            assert_eq!(rec.arrive(&p(name), now), Arrival::Recorded);
        }

        assert_eq!(rec.observe(&p("dev1"), 2, Duration::from_secs(30), now), Some(true));
        assert_eq!(rec.arrived, vec![p("dev1"), p("dev2")]);
        assert!(rec.late.contains(&p("dev3")));
        // the third one was not part of this round
        assert_eq!(rec.observe(&p("dev3"), 2, Duration::from_secs(30), now), Some(false));
        assert_eq!(rec.arrive(&p("dev4"), now), Arrival::NextRound);
        assert_eq!(rec.arrived.len(), 2);
    }

    #[test]
    fn late_arrivals_stay_out_of_the_count() {
        let t0 = Utc::now();
        let mut rec = record(t0);
        rec.arrive(&p("dev1"), t0);
        assert_eq!(rec.observe(&p("dev1"), 2, Duration::from_secs(1), t0), None);
        let late = t0 + chrono::Duration::seconds(2);
        assert_eq!(rec.observe(&p("dev1"), 2, Duration::from_secs(1), late), Some(false));

        assert_eq!(rec.arrive(&p("dev2"), late), Arrival::LateArrival);
        assert_eq!(rec.arrive(&p("dev2"), late), Arrival::LateArrival);
        assert_eq!(rec.arrived, vec![p("dev1")]);
        assert!(!rec.is_drained());
    }

    #[test]
    fn abandoned_record_expires_after_deadline_and_grace() {
        let t0 = Utc::now();
        let stale_after = Duration::from_secs(600);
        let grace = Duration::from_millis(200);
        let mut rec = record(t0);
        rec.arrive(&p("dev1"), t0);
        assert_eq!(rec.observe(&p("dev1"), 2, Duration::from_millis(100), t0), None);
        // dev1 is cancelled while gathering and never observes again

        let before = t0 + chrono::Duration::milliseconds(250);
        let after = t0 + chrono::Duration::milliseconds(400);
        assert!(!rec.is_expired(before, stale_after, grace));
        assert!(rec.is_expired(after, stale_after, grace));
    }

    #[test]
    fn cancelled_waiter_counts_as_acknowledged_once_settled() {
        let now = Utc::now();
        let mut rec = record(now);
        rec.arrive(&p("dev1"), now);
        rec.arrive(&p("dev2"), now);
        rec.abandon(&p("dev2"));
        assert!(!rec.acknowledged.contains(&p("dev2")));

        assert_eq!(rec.observe(&p("dev1"), 2, Duration::from_secs(30), now), Some(true));
        rec.abandon(&p("dev2"));
        assert!(rec.is_drained());
    }

    #[test]
    fn stale_records_are_detected() {
        let t0 = Utc::now();
        let rec = record(t0);
        let stale_after = Duration::from_secs(600);

        assert!(!rec.is_stale(t0 + chrono::Duration::seconds(599), stale_after));
        assert!(rec.is_stale(t0 + chrono::Duration::seconds(601), stale_after));
    }

    #[test]
    fn record_persists_as_json() {
        let now = Utc::now();
        let mut rec = record(now);
        rec.arrive(&p("dev1"), now);

        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"group_id\":\"g1\""));
        assert!(json.contains("\"phase\":\"gathering\""));
        let back: BarrierRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
