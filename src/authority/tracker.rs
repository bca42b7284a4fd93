//! View progression state machine, driven by heartbeats and periodic ticks.
//!
//! This is deliberately free of any I/O: the serving layer feeds it ping
//! events and tick instants, and reads back view snapshots. All safety
//! reasoning about view changes lives here.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::authority::{View, ViewNum};

/// Liveness record for one known replica.
struct ServerRecord {
    /// Instant of the most recent heartbeat.
    last_ping: Instant,

    /// Derived liveness flag, refreshed on every tick.
    alive: bool,
}

/// Tracks replica liveness and owns the authoritative view sequence.
///
/// The view number only ever moves forward, by exactly 1 per change. The
/// primary role never moves off a view that its primary has not acknowledged
/// by pinging with the current view number.
pub(crate) struct ViewTracker {
    /// Current authoritative view.
    view: View,

    /// True iff the current view has no primary, or its primary has pinged
    /// advertising the current view number.
    primary_acked: bool,

    /// A replica missing heartbeats for longer than this is declared dead.
    dead_interval: Duration,

    /// Liveness records of all replicas that ever pinged. Never evicted.
    servers: HashMap<String, ServerRecord>,

    /// Registration order of replicas, used as the deterministic tie-break
    /// when picking a new primary or backup.
    order: Vec<String>,
}

impl ViewTracker {
    /// Creates a new tracker at the initial empty view.
    pub(crate) fn new(dead_interval: Duration) -> Self {
        ViewTracker {
            view: View::initial(),
            // no primary initially, so considered acked
            primary_acked: true,
            dead_interval,
            servers: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Records a heartbeat from the named server, registering it on first
    /// contact, and returns a snapshot of the current view.
    pub(crate) fn handle_ping(
        &mut self,
        server: &str,
        view_num: ViewNum,
        now: Instant,
    ) -> View {
        match self.servers.get_mut(server) {
            Some(record) => {
                record.last_ping = now;
                record.alive = true;
            }
            None => {
                self.servers.insert(
                    server.to_string(),
                    ServerRecord {
                        last_ping: now,
                        alive: true,
                    },
                );
                self.order.push(server.to_string());
            }
        }

        if self.view.primary_is(server) && view_num == self.view.number {
            self.primary_acked = true;
        }

        self.view.clone()
    }

    /// Returns a snapshot of the current view.
    pub(crate) fn current_view(&self) -> View {
        self.view.clone()
    }

    /// One failure-detection pass. Applies the first applicable view-change
    /// rule, so the view advances at most once per tick and every published
    /// view number stays observable for at least one tick interval. Returns
    /// the new view if one was installed.
    pub(crate) fn tick(&mut self, now: Instant) -> Option<View> {
        self.refresh_alive(now);

        // dead primary
        if let Some(primary) = self.view.primary.clone() {
            if !self.is_alive(&primary) {
                if !self.primary_acked {
                    // the primary never confirmed this view; promoting now
                    // could install a backup holding a stale store
                    return None;
                }
                let backup =
                    self.view.backup.clone().filter(|b| self.is_alive(b));
                return Some(match backup {
                    Some(backup) => self.advance(Some(backup), None),
                    None => self.advance(None, None),
                });
            }
        }

        // dead backup: drop it, no acknowledgement required
        if let Some(backup) = self.view.backup.clone() {
            if !self.is_alive(&backup) {
                let primary = self.view.primary.clone();
                return Some(self.advance(primary, None));
            }
        }

        // vacant primary
        if self.view.primary.is_none() && self.primary_acked {
            let backup = self.view.backup.clone();
            if let Some(pick) = self.pick_alive_except(backup.as_deref()) {
                return Some(self.advance(Some(pick), backup));
            }
        }

        // vacant backup
        if self.view.primary.is_some()
            && self.primary_acked
            && self.view.backup.is_none()
        {
            let primary = self.view.primary.clone();
            if let Some(pick) = self.pick_alive_except(primary.as_deref()) {
                return Some(self.advance(primary, Some(pick)));
            }
        }

        None
    }

    /// Installs the next view. The acknowledgement flag is reset to match
    /// its definition: a view with a primary starts unacked until that
    /// primary pings with the new number.
    fn advance(
        &mut self,
        primary: Option<String>,
        backup: Option<String>,
    ) -> View {
        self.view = View {
            number: self.view.number + 1,
            primary,
            backup,
        };
        self.primary_acked = self.view.primary.is_none();
        self.view.clone()
    }

    /// Refreshes the alive flag of every record from its last ping time.
    fn refresh_alive(&mut self, now: Instant) {
        for record in self.servers.values_mut() {
            record.alive =
                now.duration_since(record.last_ping) <= self.dead_interval;
        }
    }

    /// True if the named server has pinged recently enough. A server that
    /// never pinged is dead.
    fn is_alive(&self, server: &str) -> bool {
        self.servers.get(server).map(|r| r.alive).unwrap_or(false)
    }

    /// Picks the earliest-registered alive server other than `except`.
    fn pick_alive_except(&self, except: Option<&str>) -> Option<String> {
        self.order
            .iter()
            .find(|s| self.is_alive(s.as_str()) && except != Some(s.as_str()))
            .cloned()
    }
}

#[cfg(test)]
mod tracker_tests {
    use super::*;

    const DEAD: Duration = Duration::from_millis(1500);
    const TICK: Duration = Duration::from_millis(500);

    const R1: &str = "127.0.0.1:52701";
    const R2: &str = "127.0.0.1:52702";
    const R3: &str = "127.0.0.1:52703";

    /// Ticks until no more rules fire, asserting every advance increments
    /// the view number by exactly 1. Returns the settled view.
    fn settle(tracker: &mut ViewTracker, now: Instant) -> View {
        loop {
            let before = tracker.current_view().number;
            match tracker.tick(now) {
                Some(view) => assert_eq!(view.number, before + 1),
                None => return tracker.current_view(),
            }
        }
    }

    /// Drives the tracker to view (2, R1, R2) with R1 having acked view 2.
    fn two_replica_cluster(tracker: &mut ViewTracker, t0: Instant) {
        tracker.handle_ping(R1, 0, t0);
        assert_eq!(tracker.tick(t0).unwrap().number, 1);
        tracker.handle_ping(R1, 1, t0);
        tracker.handle_ping(R2, 0, t0);
        assert_eq!(tracker.tick(t0).unwrap().number, 2);
        tracker.handle_ping(R1, 2, t0);
        tracker.handle_ping(R2, 2, t0);
    }

    #[test]
    fn starts_at_initial_view() {
        let tracker = ViewTracker::new(DEAD);
        assert_eq!(tracker.current_view(), View::initial());
    }

    #[test]
    fn no_view_without_servers() {
        let mut tracker = ViewTracker::new(DEAD);
        assert!(tracker.tick(Instant::now()).is_none());
        assert_eq!(tracker.current_view().number, 0);
    }

    #[test]
    fn first_server_becomes_primary() {
        let mut tracker = ViewTracker::new(DEAD);
        let t0 = Instant::now();
        assert_eq!(tracker.handle_ping(R1, 0, t0).number, 0);

        let view = tracker.tick(t0).unwrap();
        assert_eq!(view.number, 1);
        assert!(view.primary_is(R1));
        assert!(view.backup.is_none());

        // nobody else around: nothing more to do this tick or the next
        assert!(tracker.tick(t0).is_none());
    }

    #[test]
    fn second_server_becomes_backup_after_ack() {
        let mut tracker = ViewTracker::new(DEAD);
        let t0 = Instant::now();
        tracker.handle_ping(R1, 0, t0);
        tracker.tick(t0);
        tracker.handle_ping(R2, 0, t0);

        // view 1 not yet acked by R1: no backup assignment allowed
        assert!(tracker.tick(t0).is_none());

        tracker.handle_ping(R1, 1, t0);
        let view = tracker.tick(t0).unwrap();
        assert_eq!(view.number, 2);
        assert!(view.primary_is(R1));
        assert!(view.backup_is(R2));
    }

    #[test]
    fn acked_backup_promoted_on_primary_death() {
        let mut tracker = ViewTracker::new(DEAD);
        let t0 = Instant::now();
        two_replica_cluster(&mut tracker, t0);

        // R1 goes silent; R2 keeps pinging
        let t1 = t0 + DEAD + TICK;
        tracker.handle_ping(R2, 2, t1);
        let view = tracker.tick(t1).unwrap();
        assert_eq!(view.number, 3);
        assert!(view.primary_is(R2));
        assert!(view.backup.is_none());
    }

    #[test]
    fn no_promotion_without_ack() {
        let mut tracker = ViewTracker::new(DEAD);
        let t0 = Instant::now();
        tracker.handle_ping(R1, 0, t0);
        tracker.tick(t0);
        tracker.handle_ping(R1, 1, t0);
        tracker.handle_ping(R2, 0, t0);
        tracker.tick(t0);
        assert_eq!(tracker.current_view().number, 2);

        // R1 dies before ever advertising view 2; R2 stays alive. The view
        // must stay pinned at 2 no matter how much time passes.
        for i in 1..10 {
            let t = t0 + DEAD + TICK * i;
            tracker.handle_ping(R2, 2, t);
            assert!(tracker.tick(t).is_none());
            let view = tracker.current_view();
            assert_eq!(view.number, 2);
            assert!(view.primary_is(R1));
        }
    }

    #[test]
    fn dead_backup_dropped_without_ack_requirement() {
        let mut tracker = ViewTracker::new(DEAD);
        let t0 = Instant::now();
        two_replica_cluster(&mut tracker, t0);

        // R2 goes silent; the drop itself needs no fresh acknowledgement
        let t1 = t0 + DEAD + TICK;
        tracker.handle_ping(R1, 2, t1);
        let view = tracker.tick(t1).unwrap();
        assert_eq!(view.number, 3);
        assert!(view.primary_is(R1));
        assert!(view.backup.is_none());

        // replacement backup only after R1 acks view 3
        tracker.handle_ping(R3, 0, t1);
        assert!(tracker.tick(t1).is_none());
        tracker.handle_ping(R1, 3, t1);
        let view = tracker.tick(t1).unwrap();
        assert_eq!(view.number, 4);
        assert!(view.primary_is(R1));
        assert!(view.backup_is(R3));
    }

    #[test]
    fn sole_replica_death_then_replacement() {
        let mut tracker = ViewTracker::new(DEAD);
        let t0 = Instant::now();
        tracker.handle_ping(R1, 0, t0);
        tracker.tick(t0);
        tracker.handle_ping(R1, 1, t0);

        // R1 dies with nobody else: the primary slot empties first, then a
        // later joiner fills it
        let t1 = t0 + DEAD + TICK;
        let view = tracker.tick(t1).unwrap();
        assert_eq!(view.number, 2);
        assert!(view.primary.is_none());
        assert!(view.backup.is_none());

        tracker.handle_ping(R2, 0, t1);
        let view = tracker.tick(t1).unwrap();
        assert_eq!(view.number, 3);
        assert!(view.primary_is(R2));
    }

    #[test]
    fn revived_server_counts_as_alive_again() {
        let mut tracker = ViewTracker::new(DEAD);
        let t0 = Instant::now();
        two_replica_cluster(&mut tracker, t0);

        // both die with view 2 acked: the dead backup cannot be promoted,
        // so the primary slot simply empties
        let t1 = t0 + DEAD + TICK;
        let view = settle(&mut tracker, t1);
        assert_eq!(view.number, 3);
        assert!(view.primary.is_none());
        assert!(view.backup.is_none());

        // a restarted R2 process pings afresh and walks back up to primary
        let t2 = t1 + TICK;
        tracker.handle_ping(R2, 0, t2);
        let view = settle(&mut tracker, t2);
        assert_eq!(view.number, 4);
        assert!(view.primary_is(R2));
        assert!(view.backup.is_none());
    }

    #[test]
    fn pick_follows_registration_order() {
        let mut tracker = ViewTracker::new(DEAD);
        let t0 = Instant::now();
        tracker.handle_ping(R3, 0, t0);
        tracker.handle_ping(R1, 0, t0);
        tracker.handle_ping(R2, 0, t0);

        let view = tracker.tick(t0).unwrap();
        assert!(view.primary_is(R3));
        tracker.handle_ping(R3, 1, t0);
        let view = tracker.tick(t0).unwrap();
        assert!(view.backup_is(R1));
    }

    #[test]
    fn full_failover_chain_publishes_every_view() {
        let mut tracker = ViewTracker::new(DEAD);
        let mut now = Instant::now();
        two_replica_cluster(&mut tracker, now);

        // kill R1 -> R2 promoted (view 3)
        now += DEAD + TICK;
        tracker.handle_ping(R2, 2, now);
        assert_eq!(settle(&mut tracker, now).number, 3);

        // R3 joins -> backup (view 4), after R2 acks 3
        tracker.handle_ping(R2, 3, now);
        tracker.handle_ping(R3, 0, now);
        let view = settle(&mut tracker, now);
        assert_eq!(view.number, 4);
        assert!(view.primary_is(R2));
        assert!(view.backup_is(R3));

        // kill R2 -> R3 promoted (view 5), only once R2 acked 4
        tracker.handle_ping(R2, 4, now);
        tracker.handle_ping(R3, 4, now);
        now += DEAD + TICK;
        tracker.handle_ping(R3, 4, now);
        let view = settle(&mut tracker, now);
        assert_eq!(view.number, 5);
        assert!(view.primary_is(R3));
        assert!(view.backup.is_none());
    }

    #[test]
    fn ping_with_stale_view_number_is_no_ack() {
        let mut tracker = ViewTracker::new(DEAD);
        let t0 = Instant::now();
        tracker.handle_ping(R1, 0, t0);
        tracker.tick(t0);
        tracker.handle_ping(R2, 0, t0);

        // R1 advertising 0 does not acknowledge view 1
        tracker.handle_ping(R1, 0, t0);
        assert!(tracker.tick(t0).is_none());
        tracker.handle_ping(R1, 1, t0);
        assert!(tracker.tick(t0).is_some());
    }
}
