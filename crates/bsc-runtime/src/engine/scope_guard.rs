#[derive(Debug)]
struct SetLocalState {
    state: LocalState,
    backup: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ErrorOffState {
    state: LocalState,
    /// First muted line; the window closes once `start_line + line_count`
    /// is reached.
    start_line: usize,
    line_count: usize,
}

#[derive(Debug, Clone, Copy)]
enum ErrorOffTrigger {
    LineReached(usize),
    Force,
}

impl BuildEngine {
    fn enable_set_local(&mut self) {
        self.set_local_stack.push(SetLocalState {
            state: self.peek_local_state(),
            backup: self.vars.get_var_dict(VarTier::Local),
        });
    }

    /// Pops the innermost isolation scope if it belongs to the current frame
    /// and restores the backed-up local tier. Out-parameter destinations keep
    /// their written values across the restore.
    fn try_exit_isolated_scope(&mut self) -> bool {
        let current = self.peek_local_state();
        let owned = self
            .set_local_stack
            .last()
            .is_some_and(|top| top.state == current);
        if !owned {
            return false;
        }
        let Some(top) = self.set_local_stack.pop() else {
            return false;
        };
        let preserve = self.out_param_var_keys();
        self.vars
            .set_var_dict(VarTier::Local, top.backup, Some(&preserve));
        true
    }

    fn out_param_var_keys(&self) -> Vec<String> {
        self.cur_out_params
            .iter()
            .filter_map(|p| trim_percent(p))
            .collect()
    }

    /// Demotes error-grade entries while a suppression window is active.
    /// The line bound is checked before muting, so the first line past the
    /// window is already unmuted, and re-checked after, so the window reports
    /// itself closed as soon as its last line has run.
    fn process_error_off(&mut self, line_idx: usize, logs: &mut [LogEntry]) {
        if self.error_off.is_some() {
            self.disable_error_off(ErrorOffTrigger::LineReached(line_idx));
        }
        if self.error_off.is_none() {
            return;
        }
        for entry in logs.iter_mut() {
            if matches!(
                entry.state,
                LogState::Error | LogState::Warning | LogState::Overwrite
            ) {
                entry.state = LogState::Muted;
            }
        }
        self.disable_error_off(ErrorOffTrigger::LineReached(line_idx + 1));
    }

    /// Closes the window when it belongs to the current frame and the
    /// trigger condition holds. Returns whether a window was closed.
    fn disable_error_off(&mut self, trigger: ErrorOffTrigger) -> bool {
        let Some(window) = self.error_off else {
            return false;
        };
        if window.state != self.peek_local_state() {
            return false;
        }
        let expired = match trigger {
            ErrorOffTrigger::Force => true,
            ErrorOffTrigger::LineReached(line_idx) => {
                window.start_line + window.line_count <= line_idx
            }
        };
        if !expired {
            return false;
        }
        self.error_off = None;
        self.error_off_pending = None;
        true
    }
}

#[cfg(test)]
mod scope_guard_tests {
    use super::*;
    use crate::engine::runtime_test_support::empty_engine;

    #[test]
    fn isolation_scope_only_exits_in_its_own_frame() {
        let mut engine = empty_engine();
        engine.push_local_state(LocalStateOptions::default());
        engine.vars.set_value(VarTier::Local, "X", "before");
        engine.enable_set_local();
        engine.vars.set_value(VarTier::Local, "X", "inside");

        engine.push_local_state(LocalStateOptions::default());
        assert!(!engine.try_exit_isolated_scope());
        assert_eq!(engine.vars.get_value("X"), "inside");

        engine.pop_local_state();
        assert!(engine.try_exit_isolated_scope());
        assert_eq!(engine.vars.get_value("X"), "before");
        assert!(engine.set_local_stack.is_empty());
    }

    #[test]
    fn exit_preserves_out_param_destinations() {
        let mut engine = empty_engine();
        engine.push_local_state(LocalStateOptions::default());
        engine.cur_out_params = vec!["%Dest%".to_string()];
        engine.enable_set_local();
        engine.vars.set_value(VarTier::Local, "Dest", "result");
        engine.vars.set_value(VarTier::Local, "Scratch", "tmp");

        assert!(engine.try_exit_isolated_scope());
        assert_eq!(engine.vars.get_value("Dest"), "result");
        assert_eq!(engine.vars.get_value("Scratch"), "");
    }

    #[test]
    fn suppression_window_mutes_exactly_its_span() {
        let mut engine = empty_engine();
        engine.push_local_state(LocalStateOptions::default());
        engine.error_off = Some(ErrorOffState {
            state: engine.peek_local_state(),
            start_line: 10,
            line_count: 3,
        });

        for line in 10..13 {
            let mut logs = vec![LogEntry::new(LogState::Error, "boom")];
            engine.process_error_off(line, &mut logs);
            assert_eq!(logs[0].state, LogState::Muted, "line {line}");
        }
        // Closed right after its last line ran.
        assert!(engine.error_off.is_none());

        let mut logs = vec![LogEntry::new(LogState::Error, "boom")];
        engine.process_error_off(13, &mut logs);
        assert_eq!(logs[0].state, LogState::Error);
    }

    #[test]
    fn suppression_window_ignores_other_frames() {
        let mut engine = empty_engine();
        engine.push_local_state(LocalStateOptions::default());
        engine.error_off = Some(ErrorOffState {
            state: engine.peek_local_state(),
            start_line: 0,
            line_count: 2,
        });

        // A nested frame still mutes but never closes the caller's window.
        engine.push_local_state(LocalStateOptions::default());
        let mut logs = vec![LogEntry::new(LogState::Warning, "w")];
        engine.process_error_off(5, &mut logs);
        assert_eq!(logs[0].state, LogState::Muted);
        assert!(engine.error_off.is_some());
        assert!(!engine.disable_error_off(ErrorOffTrigger::Force));

        engine.pop_local_state();
        assert!(engine.disable_error_off(ErrorOffTrigger::Force));
    }
}
