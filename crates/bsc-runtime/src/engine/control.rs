impl BuildEngine {
    /// Writes a destination of any shape: `%Var%`, `#N`, `#oN`, `#r`, `#c`.
    /// The final (expanded) form is stored; `NIL` deletes a variable.
    fn cmd_set(&mut self, var: &str, value: &str, global: bool, logs: &mut Vec<LogEntry>) {
        let final_value = match self.expand_all(value) {
            Ok(value) => value,
            Err(error) => {
                logs.push(entry_from_error(error));
                return;
            }
        };
        let nil = final_value.eq_ignore_ascii_case("NIL");

        match detect_var_key(var) {
            VarKeyKind::Variable(key) => {
                if nil {
                    let deleted_global = self.vars.delete_key(VarTier::Global, &key);
                    let deleted_local = self.vars.delete_key(VarTier::Local, &key);
                    if deleted_global {
                        logs.push(LogEntry::new(
                            LogState::Success,
                            format!("Global variable [%{key}%] was deleted"),
                        ));
                    } else if deleted_local {
                        logs.push(LogEntry::new(
                            LogState::Success,
                            format!("Local variable [%{key}%] was deleted"),
                        ));
                    } else {
                        logs.push(LogEntry::new(
                            LogState::Ignore,
                            format!("Variable [%{key}%] does not exist"),
                        ));
                    }
                    return;
                }
                if !self.compat.overridable_fixed_variables
                    && self.vars.exists_in(VarTier::Fixed, &key)
                {
                    logs.push(LogEntry::new(
                        LogState::Warning,
                        format!("Fixed variable [{var}] cannot be overriden"),
                    ));
                    return;
                }
                if self.vars.check_circular_reference(&key, &final_value) {
                    logs.push(LogEntry::new(
                        LogState::Error,
                        format!("Variable [%{key}%] has a circular reference in [{final_value}]"),
                    ));
                    return;
                }
                if global {
                    logs.push(self.vars.set_value(VarTier::Global, &key, final_value));
                    self.vars.delete_key(VarTier::Local, &key);
                } else {
                    logs.push(self.vars.set_value(VarTier::Local, &key, final_value));
                }
            }
            VarKeyKind::InParam(index) => {
                // Parameters are never removed, "NIL" is stored literally.
                if final_value.to_ascii_lowercase().contains(&format!("#{index}")) {
                    logs.push(LogEntry::new(
                        LogState::Error,
                        "Section parameter cannot have a circular reference",
                    ));
                    return;
                }
                self.cur_in_params.insert(index, final_value.clone());
                logs.push(LogEntry::new(
                    LogState::Success,
                    format!("Section parameter [#{index}] set to [{final_value}]"),
                ));
            }
            VarKeyKind::OutParam(index) => {
                if self.compat.disable_extended_section_params {
                    logs.push(LogEntry::new(
                        LogState::Warning,
                        "Section out parameters are disabled by the compatibility option",
                    ));
                    return;
                }
                logs.push(self.set_out_param(index, final_value));
            }
            VarKeyKind::ReturnValue => {
                if self.compat.disable_extended_section_params {
                    logs.push(LogEntry::new(
                        LogState::Warning,
                        "ReturnValue [#r] is disabled by the compatibility option",
                    ));
                    return;
                }
                if nil {
                    self.return_value.clear();
                    logs.push(LogEntry::new(LogState::Success, "ReturnValue [#r] deleted"));
                } else {
                    self.return_value = final_value.clone();
                    logs.push(LogEntry::new(
                        LogState::Success,
                        format!("ReturnValue [#r] set to [{final_value}]"),
                    ));
                }
            }
            VarKeyKind::LoopCounter => {
                if nil {
                    logs.push(LogEntry::new(
                        LogState::Warning,
                        "LoopCounter [#c] cannot be deleted",
                    ));
                    return;
                }
                if !self.compat.overridable_loop_counter {
                    logs.push(LogEntry::new(
                        LogState::Warning,
                        "LoopCounter [#c] cannot be overriden",
                    ));
                    return;
                }
                logs.push(self.set_loop_counter(&final_value));
            }
            VarKeyKind::Invalid => {
                logs.push(LogEntry::new(
                    LogState::Error,
                    format!("Invalid variable name [{var}], must start and end with %"),
                ));
            }
        }
    }

    fn set_out_param(&mut self, index: usize, value: String) -> LogEntry {
        let token = format!("#o{index}");
        if value.to_ascii_lowercase().contains(&token) {
            return LogEntry::new(
                LogState::Error,
                "Section out parameter cannot have a circular reference",
            );
        }
        let Some(var_key) = self.cur_out_params.get(index - 1).cloned() else {
            return LogEntry::new(
                LogState::Error,
                format!("[{token}] is not referencing any variables"),
            );
        };
        let Some(key) = trim_percent(&var_key) else {
            return LogEntry::new(
                LogState::CriticalError,
                format!("[{token}] is referencing invalid variable"),
            );
        };
        self.vars.set_value(VarTier::Local, &key, value.clone());
        LogEntry::new(
            LogState::Success,
            format!("[{var_key}], reference of [{token}], set to [{value}]"),
        )
    }

    fn set_loop_counter(&mut self, value: &str) -> LogEntry {
        let Some(top) = self.loop_stack.last_mut() else {
            return LogEntry::new(
                LogState::Error,
                "Loop is not running, unable to update LoopCounter [#c]",
            );
        };
        match top {
            EngineLoopState::Index(_) => match value.parse::<i64>() {
                Ok(counter) => {
                    *top = EngineLoopState::Index(counter);
                    LogEntry::new(
                        LogState::Success,
                        format!("LoopCounter [#c] set to [{counter}]"),
                    )
                }
                Err(_) => LogEntry::new(
                    LogState::Error,
                    format!("Loop is iterating an index, but new value [{value}] is not a valid integer"),
                ),
            },
            EngineLoopState::Letter(_) => match parse_loop_letter(value) {
                Ok(letter) => {
                    let letter = letter.to_ascii_uppercase();
                    *top = EngineLoopState::Letter(letter);
                    LogEntry::new(
                        LogState::Success,
                        format!("LoopCounter [#c] set to [{letter}]"),
                    )
                }
                Err(_) => LogEntry::new(
                    LogState::Error,
                    format!("Loop is iterating a drive letter, but new value [{value}] is not a valid drive letter"),
                ),
            },
        }
    }

    /// Imports a script's variable block into the local or global tier.
    fn cmd_add_variables(
        &mut self,
        script: Option<&str>,
        section: &str,
        global: bool,
        logs: &mut Vec<LogEntry>,
    ) {
        let script_name = match script.map(|s| self.expand_all(s)).transpose() {
            Ok(name) => name,
            Err(error) => {
                logs.push(entry_from_error(error));
                return;
            }
        };
        let target = match script_name.as_deref() {
            None => Some(self.current_script()),
            Some(name) => self
                .scripts
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(name)),
        };
        let Some(target) = target else {
            logs.push(LogEntry::new(
                LogState::Error,
                format!(
                    "Script [{}] is not part of the build",
                    script_name.unwrap_or_default()
                ),
            ));
            return;
        };

        let tier = if global { VarTier::Global } else { VarTier::Local };
        let variables = target.variables.clone();
        let target_name = target.name.clone();
        let count = variables.len();
        for (key, value) in variables {
            self.vars.set_value(tier, &key, value);
        }
        logs.push(LogEntry::new(
            LogState::Success,
            format!(
                "Added [{count}] variables from section [{section}] of [{target_name}] to {tier} variables"
            ),
        ));
    }

    fn cmd_set_macro(
        &mut self,
        name: &str,
        command: Option<&CommandNode>,
        global: bool,
        logs: &mut Vec<LogEntry>,
    ) {
        let scope = if global { "global" } else { "local" };
        match command {
            Some(body) => {
                self.macros.set(name, body.clone(), global);
                logs.push(LogEntry::new(
                    LogState::Success,
                    format!("Macro [{name}] set to [{}] ({scope})", body.raw),
                ));
            }
            None => {
                if self.macros.delete(name, global) {
                    logs.push(LogEntry::new(
                        LogState::Success,
                        format!("Macro [{name}] deleted ({scope})"),
                    ));
                } else {
                    logs.push(LogEntry::new(
                        LogState::Ignore,
                        format!("Macro [{name}] does not exist"),
                    ));
                }
            }
        }
    }

    /// Copies one in-parameter into a destination variable. Missing
    /// parameters read as empty.
    fn cmd_get_param(&mut self, index: usize, dest_var: &str, logs: &mut Vec<LogEntry>) {
        let value = self.cur_in_params.get(&index).cloned().unwrap_or_default();
        self.set_dest_variable(dest_var, &value, logs);
    }

    /// Writes a literal, already-expanded value to a `%Var%` destination.
    fn set_dest_variable(&mut self, var: &str, value: &str, logs: &mut Vec<LogEntry>) {
        match detect_var_key(var) {
            VarKeyKind::Variable(key) => {
                logs.push(self.vars.set_value(VarTier::Local, &key, value));
            }
            _ => logs.push(LogEntry::new(
                LogState::Error,
                format!("Invalid variable name [{var}], must start and end with %"),
            )),
        }
    }

    fn cmd_exit(&mut self, message: &str, no_warn: bool, logs: &mut Vec<LogEntry>) {
        let message = match self.expand_all(message) {
            Ok(message) => message,
            Err(error) => {
                logs.push(entry_from_error(error));
                return;
            }
        };
        self.halt.set(HaltCause::ScriptExit);
        let state = if no_warn { LogState::Ignore } else { LogState::Warning };
        logs.push(LogEntry::new(state, message));
    }

    fn cmd_halt(&mut self, message: &str, logs: &mut Vec<LogEntry>) {
        let message = match self.expand_all(message) {
            Ok(message) => message,
            Err(error) => {
                logs.push(entry_from_error(error));
                return;
            }
        };
        // A tracked external process must not outlive the build.
        self.stop.sub_process().kill_active();
        self.halt.set(HaltCause::Command);
        logs.push(LogEntry::new(LogState::Warning, message));
    }

    /// Opens an error suppression window for the next `lines` lines. The
    /// window is registered pending so this command's own entries stay
    /// visible, and it can be attributed to the parent frame when the enable
    /// came through a single-command If link.
    fn cmd_error_off(&mut self, cmd: &CommandNode, lines: &str, logs: &mut Vec<LogEntry>) {
        let lines = match self.expand_all(lines) {
            Ok(value) => value,
            Err(error) => {
                logs.push(entry_from_error(error));
                return;
            }
        };
        let count: usize = match lines.parse() {
            Ok(count) if count >= 1 => count,
            _ => {
                logs.push(LogEntry::new(
                    LogState::Error,
                    format!("[{lines}] is not a valid positive integer"),
                ));
                return;
            }
        };
        if self.error_off.is_some() || self.error_off_pending.is_some() {
            logs.push(LogEntry::new(
                LogState::Ignore,
                "ErrorOff is already enabled",
            ));
            return;
        }

        let state = if self.error_off_depth_minus_one {
            self.error_off_depth_minus_one = false;
            let stack = &self.local_state_stack;
            stack
                .get(stack.len().saturating_sub(2))
                .copied()
                .unwrap_or_else(|| self.peek_local_state())
        } else {
            self.peek_local_state()
        };
        self.error_off_pending = Some(ErrorOffState {
            state,
            start_line: cmd.line_idx + 1,
            line_count: count,
        });
        logs.push(LogEntry::new(
            LogState::Success,
            format!("Error and warning logs will be muted for [{count}] lines"),
        ));
    }
}

#[cfg(test)]
mod control_tests {
    use super::*;
    use crate::engine::runtime_test_support::{
        engine_with, main_section_ref, node, script_with_sections,
    };

    fn bare_engine() -> BuildEngine {
        engine_with(vec![script_with_sections(
            1,
            "main.script",
            vec![("Process", vec![])],
        )])
        .0
    }

    #[test]
    fn set_nil_deletes_the_variable_from_both_tiers() {
        let mut engine = bare_engine();
        let mut logs = Vec::new();
        engine.vars.set_value(VarTier::Global, "A", "g");
        engine.vars.set_value(VarTier::Local, "A", "l");

        // One NIL removes the key everywhere; the message names the
        // higher tier when both held it.
        engine.cmd_set("%A%", "NIL", false, &mut logs);
        assert!(logs[0].message.contains("Global variable [%A%] was deleted"));
        assert_eq!(engine.vars.get_value("A"), "");

        engine.vars.set_value(VarTier::Local, "A", "l");
        logs.clear();
        engine.cmd_set("%A%", "nil", false, &mut logs);
        assert!(logs[0].message.contains("Local variable [%A%] was deleted"));

        logs.clear();
        engine.cmd_set("%A%", "NIL", false, &mut logs);
        assert_eq!(logs[0].state, LogState::Ignore);
    }

    #[test]
    fn set_global_shadows_out_the_local_copy() {
        let mut engine = bare_engine();
        let mut logs = Vec::new();
        engine.vars.set_value(VarTier::Local, "B", "local");
        engine.cmd_set("%B%", "global", true, &mut logs);
        assert!(!engine.vars.exists_in(VarTier::Local, "B"));
        assert_eq!(engine.vars.get_value_of(VarTier::Global, "B"), "global");
    }

    #[test]
    fn fixed_variables_resist_set_unless_compat_allows() {
        let mut engine = bare_engine();
        let mut logs = Vec::new();
        engine.cmd_set("%BaseDir%", "elsewhere", false, &mut logs);
        assert_eq!(logs[0].state, LogState::Warning);

        engine.compat.overridable_fixed_variables = true;
        engine.vars = VariableStore::new(VarOptions {
            overridable_fixed_variables: true,
        });
        engine.vars.set_value(VarTier::Fixed, "BaseDir", "orig");
        logs.clear();
        engine.cmd_set("%BaseDir%", "elsewhere", false, &mut logs);
        assert_eq!(logs[0].state, LogState::Success);
        assert_eq!(engine.vars.get_value("BaseDir"), "elsewhere");
    }

    #[test]
    fn set_writes_param_slots_and_return_value() {
        let mut engine = bare_engine();
        let mut logs = Vec::new();
        engine.cmd_set("#2", "two", false, &mut logs);
        assert_eq!(engine.cur_in_params.get(&2).map(String::as_str), Some("two"));

        engine.cur_out_params = vec!["%Dest%".to_string()];
        engine.cmd_set("#o1", "out", false, &mut logs);
        assert_eq!(engine.vars.get_value("Dest"), "out");

        engine.cmd_set("#r", "ret", false, &mut logs);
        assert_eq!(engine.return_value, "ret");
        engine.cmd_set("#r", "NIL", false, &mut logs);
        assert_eq!(engine.return_value, "");

        logs.clear();
        engine.cmd_set("#o9", "out", false, &mut logs);
        assert_eq!(logs[0].state, LogState::Error);
    }

    #[test]
    fn loop_counter_writes_respect_the_compat_gate() {
        let mut engine = bare_engine();
        let mut logs = Vec::new();
        engine.loop_stack.push(EngineLoopState::Index(3));

        engine.cmd_set("#c", "9", false, &mut logs);
        assert_eq!(logs[0].state, LogState::Warning);
        assert_eq!(engine.loop_stack.last(), Some(&EngineLoopState::Index(3)));

        engine.compat.overridable_loop_counter = true;
        logs.clear();
        engine.cmd_set("#c", "9", false, &mut logs);
        assert_eq!(engine.loop_stack.last(), Some(&EngineLoopState::Index(9)));

        logs.clear();
        engine.cmd_set("#c", "x", false, &mut logs);
        assert_eq!(logs[0].state, LogState::Error);
    }

    #[test]
    fn add_variables_imports_a_script_block() {
        let (mut engine, _sink) = engine_with(vec![
            script_with_sections(1, "main.script", vec![("Process", vec![])]),
            script_with_sections(2, "lib.script", vec![("Process", vec![])])
                .with_variable("LibVer", "2.1"),
        ]);
        let mut logs = Vec::new();
        engine.cmd_add_variables(Some("lib.script"), "Variables", true, &mut logs);
        assert_eq!(logs[0].state, LogState::Success);
        assert_eq!(engine.vars.get_value_of(VarTier::Global, "LibVer"), "2.1");

        logs.clear();
        engine.cmd_add_variables(Some("nope.script"), "Variables", false, &mut logs);
        assert_eq!(logs[0].state, LogState::Error);
    }

    #[test]
    fn set_macro_defines_and_deletes() {
        let mut engine = bare_engine();
        let mut logs = Vec::new();
        let body = node("Echo,hi", 0, CommandKind::None);
        engine.cmd_set_macro("Hi", Some(&body), false, &mut logs);
        assert!(engine.macros.contains("hi"));

        logs.clear();
        engine.cmd_set_macro("Hi", None, false, &mut logs);
        assert!(!engine.macros.contains("hi"));

        logs.clear();
        engine.cmd_set_macro("Hi", None, false, &mut logs);
        assert_eq!(logs[0].state, LogState::Ignore);
    }

    #[test]
    fn get_param_reads_missing_slots_as_empty() {
        let mut engine = bare_engine();
        let mut logs = Vec::new();
        engine.cur_in_params.insert(1, "one".to_string());
        engine.cmd_get_param(1, "%P%", &mut logs);
        assert_eq!(engine.vars.get_value("P"), "one");
        engine.cmd_get_param(5, "%Q%", &mut logs);
        assert_eq!(engine.vars.get_value_of(VarTier::Local, "Q"), "");
        assert!(engine.vars.exists_in(VarTier::Local, "Q"));
    }

    #[test]
    fn exit_and_halt_raise_their_flags() {
        let (mut engine, sink) = engine_with(vec![script_with_sections(
            1,
            "main.script",
            vec![("Process", vec![])],
        )]);
        let section = main_section_ref(&engine);

        let exit = node(
            "Exit,done,NOWARN",
            0,
            CommandKind::Exit {
                message: "done".to_string(),
                no_warn: true,
            },
        );
        engine.execute_command(&section, &exit);
        assert!(engine.halt.script_halt());
        assert!(!engine.halt.build_halt());
        assert_eq!(sink.count_state(LogState::Ignore), 1);

        engine.halt.reset();
        let halt = node(
            "Halt,stop everything",
            1,
            CommandKind::Halt {
                message: "stop everything".to_string(),
            },
        );
        engine.execute_command(&section, &halt);
        assert!(engine.halt.build_halt());
        assert_eq!(engine.halt.reason(), HaltReason::HaltCommand);
        assert_eq!(sink.count_state(LogState::Warning), 1);
    }

    #[test]
    fn error_off_rejects_bad_counts_and_double_enables() {
        let mut engine = bare_engine();
        let mut logs = Vec::new();
        let cmd = node(
            "System,ErrorOff,0",
            9,
            CommandKind::ErrorOff {
                lines: "0".to_string(),
            },
        );
        engine.cmd_error_off(&cmd, "0", &mut logs);
        assert_eq!(logs[0].state, LogState::Error);
        assert!(engine.error_off_pending.is_none());

        logs.clear();
        engine.cmd_error_off(&cmd, "3", &mut logs);
        assert_eq!(logs[0].state, LogState::Success);
        let pending = engine.error_off_pending.expect("pending window");
        assert_eq!(pending.start_line, 10);
        assert_eq!(pending.line_count, 3);

        logs.clear();
        engine.cmd_error_off(&cmd, "2", &mut logs);
        assert_eq!(logs[0].state, LogState::Ignore);
    }

    #[test]
    fn error_off_in_an_if_link_binds_to_the_parent_frame() {
        let (mut engine, _sink) = engine_with(vec![script_with_sections(
            1,
            "main.script",
            vec![("Process", vec![])],
        )]);
        let section = main_section_ref(&engine);
        engine.push_local_state(LocalStateOptions::default());
        let parent = engine.peek_local_state();

        let guarded = node(
            "If,1,Equal,1,System,ErrorOff,2",
            3,
            CommandKind::If {
                condition: Condition::new(ConditionKind::Equal {
                    left: "1".to_string(),
                    right: "1".to_string(),
                }),
                link: vec![node(
                    "System,ErrorOff,2",
                    3,
                    CommandKind::ErrorOff {
                        lines: "2".to_string(),
                    },
                )],
            },
        );
        engine.execute_command(&section, &guarded);
        let window = engine
            .error_off
            .or(engine.error_off_pending)
            .expect("window registered");
        assert_eq!(window.state, parent);
    }
}
