use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::paxos::View;
use crate::paxos::cluster::Cluster;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorAction {
    Nothing,

    // We lead the current view and should tell everybody.
    SendAlive,

    // We have not heard from the leader in too long.
    SuspectLeader,
}

// Decides when the leader of the current view is considered failed. The leader
// sends heartbeats, followers time out. Followers further away from the
// leader in id order wait longer, so that usually only one of them starts a
// new view.
pub struct FailureDetector {
    cluster: Cluster,
    alive_interval: Duration,
    suspect_timeout: Duration,
    next_alive: Option<Instant>,
    suspect_at: Option<Instant>,

    // How long to wait for the leader of the current view.
    current_timeout: Duration,
}

impl FailureDetector {
    pub fn new(cluster: Cluster, alive_interval: Duration, suspect_timeout: Duration) -> Self {
        FailureDetector {
            cluster,
            alive_interval,
            suspect_timeout,
            next_alive: None,
            suspect_at: None,
            current_timeout: suspect_timeout,
        }
    }

    // Stops all timers, e.g., while the replica is recovering.
    pub fn pause(&mut self) {
        self.next_alive = None;
        self.suspect_at = None;
    }

    // Resets the detector for the supplied view.
    pub fn on_view(&mut self, view: View, now: Instant) {
        if self.cluster.is_leader(view) {
            self.suspect_at = None;
            self.next_alive = Some(now);
            return;
        }
        let distance = self.cluster.distance_from_leader(view).max(1) as u32;
        self.current_timeout =
            add_jitter(self.suspect_timeout) + self.suspect_timeout * (distance - 1) / 2;
        self.next_alive = None;
        self.suspect_at = Some(now + self.current_timeout);
    }

    // Called for any message which shows the leader is making progress.
    pub fn on_leader_heard(&mut self, now: Instant) {
        if self.suspect_at.is_some() {
            self.suspect_at = Some(now + self.current_timeout);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match (self.next_alive, self.suspect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> DetectorAction {
        if let Some(next) = self.next_alive {
            if next <= now {
                self.next_alive = Some(now + self.alive_interval);
                return DetectorAction::SendAlive;
            }
        }
        if let Some(suspect) = self.suspect_at {
            if suspect <= now {
                self.suspect_at = None;
                return DetectorAction::SuspectLeader;
            }
        }
        DetectorAction::Nothing
    }
}

// Returns a duration no lower than the supplied bound, with some additive jitter.
fn add_jitter(lower: Duration) -> Duration {
    let lower_ms = lower.as_millis() as u64;
    let upper_ms = (lower_ms as f64 * 1.3) as u64;
    if upper_ms <= lower_ms {
        return lower;
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(lower_ms..upper_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALIVE: Duration = Duration::from_millis(50);
    const SUSPECT: Duration = Duration::from_millis(200);

    #[test]
    fn test_leader_sends_alive() {
        let mut detector = FailureDetector::new(Cluster::new(2, 3), ALIVE, SUSPECT);
        let now = Instant::now();
        detector.on_view(2, now);
        assert_eq!(detector.deadline(), Some(now));
        assert_eq!(detector.on_tick(now), DetectorAction::SendAlive);
        assert_eq!(detector.on_tick(now), DetectorAction::Nothing);
        assert_eq!(detector.on_tick(now + ALIVE), DetectorAction::SendAlive);
    }

    #[test]
    fn test_follower_suspects() {
        let mut detector = FailureDetector::new(Cluster::new(1, 3), ALIVE, SUSPECT);
        let now = Instant::now();
        detector.on_view(0, now);
        assert_eq!(detector.on_tick(now + SUSPECT / 2), DetectorAction::Nothing);

        // Hearing from the leader pushes the deadline out.
        detector.on_leader_heard(now + SUSPECT / 2);
        assert_eq!(detector.on_tick(now + SUSPECT), DetectorAction::Nothing);

        let late = now + SUSPECT * 3;
        assert_eq!(detector.on_tick(late), DetectorAction::SuspectLeader);

        // Only once per view.
        assert_eq!(detector.on_tick(late), DetectorAction::Nothing);
        assert_eq!(detector.deadline(), None);
    }

    #[test]
    fn test_distant_followers_wait_longer() {
        let now = Instant::now();
        let mut near = FailureDetector::new(Cluster::new(1, 5), ALIVE, SUSPECT);
        let mut far = FailureDetector::new(Cluster::new(4, 5), ALIVE, SUSPECT);
        near.on_view(0, now);
        far.on_view(0, now);

        // Jitter is at most 30%, distance adds half a timeout per step.
        assert!(near.deadline().unwrap() < now + SUSPECT * 13 / 10);
        assert!(far.deadline().unwrap() >= now + SUSPECT * 5 / 2);
    }

    #[test]
    fn test_pause() {
        let mut detector = FailureDetector::new(Cluster::new(0, 3), ALIVE, SUSPECT);
        detector.on_view(0, Instant::now());
        detector.pause();
        assert_eq!(detector.deadline(), None);
        assert_eq!(detector.on_tick(Instant::now()), DetectorAction::Nothing);
    }
}
