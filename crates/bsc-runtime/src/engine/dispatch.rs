fn entry_from_error(error: EngineError) -> LogEntry {
    let state = if error.is_internal() {
        LogState::CriticalError
    } else {
        LogState::Error
    };
    LogEntry::new(state, error.to_string())
}

impl BuildEngine {
    /// Runs one command: polls the stop request, promotes a pending error
    /// suppression window, dispatches by kind, applies suppression and the
    /// stop-on-error policy to the collected entries, writes them to the
    /// sink and advances progress.
    fn execute_command(&mut self, section: &SectionRef, cmd: &CommandNode) {
        if self.stop.take_user_requested() {
            self.halt.set(HaltCause::User);
        }
        if self.halt.script_halt() {
            return;
        }
        // Windows opened by the previous command start muting here, so the
        // opening command's own entries stay visible.
        if let Some(pending) = self.error_off_pending.take() {
            self.error_off = Some(pending);
        }

        let state = self.peek_local_state();
        let mut logs: Vec<LogEntry> = Vec::new();
        if let CommandKind::External { op, .. } = &cmd.kind {
            if cmd.kind.is_deprecated() {
                logs.push(LogEntry::new(
                    LogState::Warning,
                    format!("Command [{op}] is deprecated"),
                ));
            }
        }

        match &cmd.kind {
            CommandKind::None | CommandKind::Comment => {
                logs.push(LogEntry::new(LogState::Ignore, String::new()));
            }
            CommandKind::Error { message } => match self.expand_all(message) {
                Ok(message) => logs.push(LogEntry::new(LogState::Error, message)),
                Err(error) => logs.push(entry_from_error(error)),
            },

            CommandKind::Run {
                script,
                section: target,
                in_params,
                out_params,
            } => {
                let request = RunExecRequest {
                    script: script.as_deref(),
                    section: target,
                    in_params,
                    out_params,
                    exec: false,
                    preserve_params: false,
                    as_macro: false,
                };
                if let Err(error) = self.cmd_run_exec(cmd, request) {
                    logs.push(entry_from_error(error));
                }
            }
            CommandKind::Exec {
                script,
                section: target,
                in_params,
            } => {
                let request = RunExecRequest {
                    script: script.as_deref(),
                    section: target,
                    in_params,
                    out_params: &[],
                    exec: true,
                    preserve_params: false,
                    as_macro: false,
                };
                if let Err(error) = self.cmd_run_exec(cmd, request) {
                    logs.push(entry_from_error(error));
                }
            }
            CommandKind::Loop { .. } => {
                if let Err(error) = self.cmd_loop(cmd) {
                    logs.push(entry_from_error(error));
                }
            }
            CommandKind::LoopBreak => self.cmd_loop_break(&mut logs),
            CommandKind::If { condition, link } => {
                if let Err(error) = self.cmd_if(section, cmd, condition, link) {
                    logs.push(entry_from_error(error));
                }
            }
            CommandKind::Else { link } => {
                if let Err(error) = self.cmd_else(section, cmd, link) {
                    logs.push(entry_from_error(error));
                }
            }
            CommandKind::Macro { name, args } => {
                if let Err(error) = self.cmd_macro(section, cmd, name, args) {
                    logs.push(entry_from_error(error));
                }
            }

            CommandKind::Set { var, value, global } => {
                self.cmd_set(var, value, *global, &mut logs);
            }
            CommandKind::AddVariables {
                script,
                section: target,
                global,
            } => {
                self.cmd_add_variables(script.as_deref(), target, *global, &mut logs);
            }
            CommandKind::SetMacro {
                name,
                command,
                global,
            } => {
                self.cmd_set_macro(name, command.as_deref(), *global, &mut logs);
            }
            CommandKind::GetParam { index, dest_var } => {
                self.cmd_get_param(*index, dest_var, &mut logs);
            }
            CommandKind::Exit { message, no_warn } => {
                self.cmd_exit(message, *no_warn, &mut logs);
            }
            CommandKind::Halt { message } => {
                self.cmd_halt(message, &mut logs);
            }

            CommandKind::ErrorOff { lines } => {
                self.cmd_error_off(cmd, lines, &mut logs);
            }
            CommandKind::SetLocal => {
                self.enable_set_local();
                logs.push(LogEntry::new(
                    LogState::Success,
                    format!(
                        "Local variable isolation (depth {}) enabled",
                        self.set_local_stack.len()
                    ),
                ));
            }
            CommandKind::EndLocal => {
                if self.try_exit_isolated_scope() {
                    logs.push(LogEntry::new(
                        LogState::Success,
                        format!(
                            "Local variable isolation (depth {}) disabled",
                            self.set_local_stack.len() + 1
                        ),
                    ));
                } else {
                    logs.push(LogEntry::new(
                        LogState::Error,
                        "[System,EndLocal] must be used with [System,SetLocal]",
                    ));
                }
            }
            CommandKind::OnScriptExit { command } => {
                self.on_script_exit = command.as_deref().cloned();
                logs.push(callback_registration_entry("OnScriptExit", command.is_some()));
            }
            CommandKind::OnBuildExit { command } => {
                self.on_build_exit = command.as_deref().cloned();
                logs.push(callback_registration_entry("OnBuildExit", command.is_some()));
            }

            CommandKind::External { family, op, args } => {
                self.dispatch_external(*family, op, args, &mut logs);
            }
        }

        self.process_error_off(cmd.line_idx, &mut logs);
        if logs.iter().any(|l| l.state == LogState::CriticalError) {
            self.halt.set(HaltCause::Error);
        } else if self.stop_build_on_error
            && logs.iter().any(|l| l.state == LogState::Error)
        {
            self.halt.set(HaltCause::Error);
        }
        self.write_command_logs(cmd, state.depth, logs);

        if section.script_id == self.current_script().id {
            self.progress.bump_approx();
            let key = (section.script_id, section.section_name.to_ascii_lowercase());
            if !self.processed_sections.contains(&key) {
                self.progress.bump_precise();
            }
        }
    }

    fn dispatch_external(
        &mut self,
        family: CommandFamily,
        op: &str,
        args: &[String],
        logs: &mut Vec<LogEntry>,
    ) {
        let mut expanded = Vec::with_capacity(args.len());
        for arg in args {
            match self.expand_all(arg) {
                Ok(value) => expanded.push(value),
                Err(error) => {
                    logs.push(entry_from_error(error));
                    return;
                }
            }
        }
        let handlers = &mut self.handlers;
        let mut ctx = HandlerContext {
            vars: &mut self.vars,
            return_value: &mut self.return_value,
            cancel: self.stop.cancel_token(),
            sub_process: self.stop.sub_process(),
        };
        match handlers.dispatch(&mut ctx, family, op, &expanded) {
            Ok(entries) => logs.extend(entries),
            Err(error) => logs.push(entry_from_error(error)),
        }
    }
}

fn callback_registration_entry(event: &str, registered: bool) -> LogEntry {
    if registered {
        LogEntry::new(
            LogState::Success,
            format!("Callback of event [{event}] registered"),
        )
    } else {
        LogEntry::new(
            LogState::Success,
            format!("Callback of event [{event}] cleared"),
        )
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;
    use crate::engine::runtime_test_support::{
        engine_with, external, main_section_ref, node, recording_engine, script_with_sections,
    };

    #[test]
    fn handler_errors_become_error_entries_and_halt_the_build() {
        let (mut engine, sink) = engine_with(vec![script_with_sections(
            1,
            "main.script",
            vec![("Process", vec![external(0, "FileCopy", &["a", "b"])])],
        )]);
        let section = main_section_ref(&engine);
        let cmd = external(0, "FileCopy", &["a", "b"]);
        engine.execute_command(&section, &cmd);

        assert_eq!(sink.count_state(LogState::Error), 1);
        assert!(engine.halt.build_halt());
        let entry = &sink.snapshot()[0];
        assert!(entry.message.contains("ENGINE_HANDLER_MISSING"));
        assert_eq!(entry.command.as_deref(), Some(cmd.raw.as_str()));
    }

    #[test]
    fn deprecated_commands_warn_but_still_dispatch() {
        let (mut engine, sink, calls) = recording_engine(vec![script_with_sections(
            1,
            "main.script",
            vec![("Process", vec![])],
        )]);
        let section = main_section_ref(&engine);
        let cmd = external(0, "WebGetIfNotExist", &["http://a", "dst"]);
        engine.execute_command(&section, &cmd);

        assert_eq!(sink.count_state(LogState::Warning), 1);
        assert_eq!(calls.lock().expect("calls").as_slice(), ["WebGetIfNotExist"]);
    }

    #[test]
    fn handler_arguments_arrive_fully_expanded() {
        let (mut engine, _sink, calls) = recording_engine(vec![script_with_sections(
            1,
            "main.script",
            vec![("Process", vec![])],
        )]);
        engine.vars.set_value(VarTier::Local, "Src", "from");
        engine.cur_in_params.insert(1, "to".to_string());
        let section = main_section_ref(&engine);
        let cmd = external(0, "Echo", &["%Src%->#1"]);
        engine.execute_command(&section, &cmd);

        let calls = calls.lock().expect("calls");
        assert_eq!(calls.as_slice(), ["Echo"]);
        drop(calls);
        assert_eq!(engine.return_value, "from->to");
    }

    #[test]
    fn progress_only_advances_for_the_current_script() {
        let (mut engine, _sink) = engine_with(vec![
            script_with_sections(1, "main.script", vec![("Process", vec![])]),
            script_with_sections(2, "other.script", vec![("Work", vec![])]),
        ]);
        engine.progress.begin_script(10, 0);
        let cmd = node("// nop", 0, CommandKind::Comment);

        let section = main_section_ref(&engine);
        engine.execute_command(&section, &cmd);
        assert_eq!(engine.progress().script_approx, 1);

        let (foreign, _) = engine
            .resolve_section(Some("other.script"), "Work")
            .expect("resolve");
        engine.execute_command(&foreign, &cmd);
        assert_eq!(engine.progress().script_approx, 1);
    }

    #[test]
    fn user_stop_wins_before_the_command_runs() {
        let (mut engine, sink) = engine_with(vec![script_with_sections(
            1,
            "main.script",
            vec![("Process", vec![])],
        )]);
        engine.stop.request_stop();
        let section = main_section_ref(&engine);
        let cmd = external(0, "FileCopy", &["a", "b"]);
        engine.execute_command(&section, &cmd);

        assert!(engine.halt.user_halt());
        assert_eq!(sink.snapshot().len(), 0);
    }
}
