use std::time::Duration;

use crate::GcKind;

/// Pauses above this are reported as warnings.
pub const LONG_PAUSE: Duration = Duration::from_millis(40);

const MB: f64 = (1024 * 1024) as f64;

#[derive(Debug, Default, Clone, Copy)]
pub struct PauseStats {
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
    pub total: Duration,
}

impl PauseStats {
    fn record(&mut self, pause: Duration) {
        if self.count == 0 {
            self.min = pause;
            self.max = pause;
        } else {
            self.min = self.min.min(pause);
            self.max = self.max.max(pause);
        }
        self.total += pause;
        self.count += 1;
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// Cumulative pause and size statistics per collection kind.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub young: PauseStats,
    young_alive: usize,
    young_commit: usize,
    young_promoted: usize,

    pub partial: PauseStats,
    partial_freed: usize,
    partial_old_commit: usize,
    partial_non_movable_commit: usize,

    pub full: PauseStats,
    full_alive: usize,
    full_young_commit: usize,
    full_old_commit: usize,
    full_non_movable_freed: usize,
    full_non_movable_commit: usize,

    last_kind: Option<GcKind>,
    last_pause: Duration,
}

impl GcStats {
    pub fn record_young(&mut self, pause: Duration, alive: usize, promoted: usize, commit: usize) {
        self.young.record(pause);
        self.young_alive += alive;
        self.young_promoted += promoted;
        self.young_commit += commit;
        self.last(GcKind::Young, pause);
    }

    pub fn record_partial(&mut self, pause: Duration, freed: usize, old_commit: usize, non_movable_commit: usize) {
        self.partial.record(pause);
        self.partial_freed += freed;
        self.partial_old_commit += old_commit;
        self.partial_non_movable_commit += non_movable_commit;
        self.last(GcKind::Partial, pause);
    }

    pub fn record_full(
        &mut self,
        pause: Duration,
        alive: usize,
        young_commit: usize,
        old_commit: usize,
        non_movable_freed: usize,
        non_movable_commit: usize,
    ) {
        self.full.record(pause);
        self.full_alive += alive;
        self.full_young_commit += young_commit;
        self.full_old_commit += old_commit;
        self.full_non_movable_freed += non_movable_freed;
        self.full_non_movable_commit += non_movable_commit;
        self.last(GcKind::Full, pause);
    }

    fn last(&mut self, kind: GcKind, pause: Duration) {
        self.last_kind = Some(kind);
        self.last_pause = pause;
    }

    pub fn last_collection(&self) -> Option<(GcKind, Duration)> {
        self.last_kind.map(|k| (k, self.last_pause))
    }

    pub fn collection_count(&self) -> u64 {
        self.young.count + self.partial.count + self.full.count
    }

    /// Whether the last pause exceeded [`LONG_PAUSE`].
    pub fn check_long_pause(&self) -> bool {
        match self.last_collection() {
            Some((kind, pause)) if pause > LONG_PAUSE => {
                log::warn!("long {kind:?} gc pause: {:.3}ms", pause.as_secs_f64() * 1000.0);
                true
            }
            _ => false,
        }
    }

    pub fn print_statistic_result(&self) {
        log::debug!("gc statistics:");
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        if self.young.count != 0 {
            let n = self.young.count as usize;
            log::debug!(
                "  young: count {} pause min {:.3}ms max {:.3}ms total {:.3}ms avg {:.3}ms \
                 alive total {:.2}MB avg {:.2}MB commit total {:.2}MB alive rate {:.3} \
                 promoted total {:.2}MB avg {:.2}MB",
                n,
                ms(self.young.min),
                ms(self.young.max),
                ms(self.young.total),
                ms(self.young.average()),
                self.young_alive as f64 / MB,
                (self.young_alive / n) as f64 / MB,
                self.young_commit as f64 / MB,
                ratio(self.young_alive, self.young_commit),
                self.young_promoted as f64 / MB,
                (self.young_promoted / n) as f64 / MB,
            );
        }
        if self.partial.count != 0 {
            let n = self.partial.count as usize;
            log::debug!(
                "  partial: count {} pause min {:.3}ms max {:.3}ms total {:.3}ms avg {:.3}ms \
                 freed total {:.2}MB avg {:.2}MB old commit {:.2}MB non-movable commit {:.2}MB \
                 free rate {:.3}",
                n,
                ms(self.partial.min),
                ms(self.partial.max),
                ms(self.partial.total),
                ms(self.partial.average()),
                self.partial_freed as f64 / MB,
                (self.partial_freed / n) as f64 / MB,
                self.partial_old_commit as f64 / MB,
                self.partial_non_movable_commit as f64 / MB,
                ratio(
                    self.partial_freed,
                    self.partial_old_commit + self.partial_non_movable_commit
                ),
            );
        }
        if self.full.count != 0 {
            let n = self.full.count as usize;
            let commit = self.full_young_commit + self.full_old_commit;
            log::debug!(
                "  full: count {} pause min {:.3}ms max {:.3}ms total {:.3}ms avg {:.3}ms \
                 alive total {:.2}MB avg {:.2}MB young commit {:.2}MB old commit {:.2}MB \
                 free rate {:.3} non-movable freed {:.2}MB commit {:.2}MB free rate {:.3}",
                n,
                ms(self.full.min),
                ms(self.full.max),
                ms(self.full.total),
                ms(self.full.average()),
                self.full_alive as f64 / MB,
                (self.full_alive / n) as f64 / MB,
                self.full_young_commit as f64 / MB,
                self.full_old_commit as f64 / MB,
                1.0 - ratio(self.full_alive, commit),
                self.full_non_movable_freed as f64 / MB,
                self.full_non_movable_commit as f64 / MB,
                ratio(self.full_non_movable_freed, self.full_non_movable_commit),
            );
        }
    }
}

fn ratio(a: usize, b: usize) -> f64 {
    if b == 0 { 0.0 } else { a as f64 / b as f64 }
}
