#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub script_precise: u64,
    pub script_approx: u64,
    pub script_total: u64,
    pub build_index: usize,
    pub build_total: usize,
}

/// Per-script progress counters. The approximate counter advances once per
/// executed command of the current script; the precise counter only counts
/// commands of sections not yet marked processed. Both are capped at the
/// script total, and the approximate counter is pulled up to the precise one
/// at section boundaries so it never runs behind.
#[derive(Debug, Default)]
struct ProgressTracker {
    script_total: u64,
    precise: u64,
    approx: u64,
    build_index: usize,
    build_total: usize,
}

impl ProgressTracker {
    fn begin_build(&mut self, build_total: usize) {
        self.build_total = build_total;
    }

    fn begin_script(&mut self, script_total: u64, build_index: usize) {
        self.script_total = script_total;
        self.precise = 0;
        self.approx = 0;
        self.build_index = build_index;
    }

    fn bump_approx(&mut self) {
        if self.approx < self.script_total {
            self.approx += 1;
        }
    }

    fn bump_precise(&mut self) {
        if self.precise < self.script_total {
            self.precise += 1;
        }
    }

    fn reconcile(&mut self) {
        self.approx = self.approx.max(self.precise);
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            script_precise: self.precise,
            script_approx: self.approx,
            script_total: self.script_total,
            build_index: self.build_index,
            build_total: self.build_total,
        }
    }
}

#[cfg(test)]
mod progress_tests {
    use super::*;

    #[test]
    fn counters_cap_at_the_script_total() {
        let mut tracker = ProgressTracker::default();
        tracker.begin_build(2);
        tracker.begin_script(3, 0);
        for _ in 0..5 {
            tracker.bump_approx();
            tracker.bump_precise();
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.script_approx, 3);
        assert_eq!(snapshot.script_precise, 3);
        assert_eq!(snapshot.build_total, 2);
    }

    #[test]
    fn reconcile_never_lowers_the_approximate_counter() {
        let mut tracker = ProgressTracker::default();
        tracker.begin_script(10, 0);
        tracker.bump_approx();
        tracker.bump_approx();
        tracker.bump_precise();
        tracker.reconcile();
        assert_eq!(tracker.snapshot().script_approx, 2);

        tracker.bump_precise();
        tracker.bump_precise();
        tracker.reconcile();
        assert_eq!(tracker.snapshot().script_approx, 3);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let mut tracker = ProgressTracker::default();
        tracker.begin_build(3);
        tracker.begin_script(5, 1);
        tracker.bump_approx();
        let json = serde_json::to_string(&tracker.snapshot()).expect("serialize");
        assert_eq!(
            json,
            r#"{"scriptPrecise":0,"scriptApprox":1,"scriptTotal":5,"buildIndex":1,"buildTotal":3}"#
        );
    }

    #[test]
    fn begin_script_resets_per_script_state() {
        let mut tracker = ProgressTracker::default();
        tracker.begin_script(4, 0);
        tracker.bump_approx();
        tracker.begin_script(6, 1);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.script_approx, 0);
        assert_eq!(snapshot.script_total, 6);
        assert_eq!(snapshot.build_index, 1);
    }
}
