/// Resolved target of a section run, detached from the script list so the
/// runner can hold it across mutations of engine state.
#[derive(Debug, Clone)]
pub(crate) struct SectionRef {
    script_id: ScriptId,
    script_name: String,
    section_name: String,
    commands: Arc<Vec<CommandNode>>,
}

impl BuildEngine {
    /// `script` of None targets the current script; names compare
    /// case-insensitively. Returns whether the target lives in the current
    /// script alongside the reference.
    fn resolve_section(
        &self,
        script: Option<&str>,
        section: &str,
    ) -> Result<(SectionRef, bool), EngineError> {
        let current = self.current_script();
        let (target, in_current) = match script {
            None => (current, true),
            Some(name) if name.eq_ignore_ascii_case(&current.name) => (current, true),
            Some(name) => {
                let found = self
                    .scripts
                    .iter()
                    .find(|s| s.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| {
                        EngineError::new(
                            "ENGINE_SCRIPT_NOT_FOUND",
                            format!("Script [{name}] is not part of the build."),
                        )
                    })?;
                (found, found.id == current.id)
            }
        };
        let found = target.section(section).ok_or_else(|| {
            EngineError::new(
                "ENGINE_SECTION_NOT_FOUND",
                format!(
                    "Script [{}] does not have section [{}].",
                    target.name, section
                ),
            )
        })?;
        Ok((
            SectionRef {
                script_id: target.id,
                script_name: target.name.clone(),
                section_name: found.name.clone(),
                commands: Arc::clone(&found.commands),
            },
            in_current,
        ))
    }

    /// Runs a section in a fresh frame. Callers expand the in-parameter
    /// dictionary against their own frame beforehand; the return value
    /// resets per section run.
    fn run_section(
        &mut self,
        section: &SectionRef,
        in_params: BTreeMap<usize, String>,
        out_params: Vec<String>,
        opts: LocalStateOptions,
    ) {
        self.push_local_state(opts);
        self.return_value.clear();

        let commands = Arc::clone(&section.commands);
        self.run_commands(section, &commands, in_params, out_params);

        if section.script_id == self.current_script().id {
            self.processed_sections
                .insert((section.script_id, section.section_name.to_ascii_lowercase()));
        }
        self.progress.reconcile();
        self.pop_local_state();
    }

    /// Binds the frame's parameter view and runs the body. The in-parameter
    /// dict stays live for the whole section, so a `Set,#N` write is visible
    /// to every later command of the same frame; nested section runs save
    /// and restore the caller's dict around their own.
    fn run_commands(
        &mut self,
        section: &SectionRef,
        commands: &[CommandNode],
        in_params: BTreeMap<usize, String>,
        out_params: Vec<String>,
    ) {
        let saved_in = std::mem::replace(&mut self.cur_in_params, in_params);
        let saved_out = std::mem::replace(&mut self.cur_out_params, out_params);
        self.run_command_list(section, commands);
        self.cur_in_params = saved_in;
        self.cur_out_params = saved_out;
    }

    /// Shared runner for section bodies and branch links. Stops at the first
    /// halt flag; open scope guards owned by this frame are torn down on the
    /// way out.
    fn run_command_list(&mut self, section: &SectionRef, commands: &[CommandNode]) {
        if commands.is_empty() {
            self.log(
                LogState::Warning,
                format!(
                    "No code in script [{}]'s section [{}]",
                    section.script_name, section.section_name
                ),
            );
        }
        for cmd in commands {
            self.execute_command(section, cmd);
            if self.halt.script_halt() {
                break;
            }
        }

        if self.try_exit_isolated_scope() {
            let depth = self.set_local_stack.len() + 1;
            self.log(
                LogState::Warning,
                format!("Local variable isolation (depth {depth}) implicitly disabled"),
            );
            self.log(
                LogState::Info,
                "Explicit use of [System,EndLocal] is recommended",
            );
        }
        if self.disable_error_off(ErrorOffTrigger::Force) {
            self.log(
                LogState::Warning,
                "Error suppression window implicitly disabled",
            );
        }
    }
}

#[cfg(test)]
mod section_tests {
    use super::*;
    use crate::engine::runtime_test_support::{engine_with, node, script_with_sections};

    #[test]
    fn resolve_section_matches_names_case_insensitively() {
        let (engine, _sink) = engine_with(vec![
            script_with_sections(1, "main.script", vec![("Process", vec![])]),
            script_with_sections(2, "other.script", vec![("Work", vec![])]),
        ]);

        let (found, in_current) = engine
            .resolve_section(None, "process")
            .expect("current script section");
        assert_eq!(found.section_name, "Process");
        assert!(in_current);

        let (found, in_current) = engine
            .resolve_section(Some("OTHER.SCRIPT"), "work")
            .expect("referenced script section");
        assert_eq!(found.script_id, 2);
        assert!(!in_current);

        let error = engine
            .resolve_section(Some("missing.script"), "Process")
            .expect_err("unknown script");
        assert_eq!(error.code, "ENGINE_SCRIPT_NOT_FOUND");
        let error = engine
            .resolve_section(None, "Nope")
            .expect_err("unknown section");
        assert_eq!(error.code, "ENGINE_SECTION_NOT_FOUND");
    }

    #[test]
    fn empty_section_logs_a_warning() {
        let (mut engine, sink) = engine_with(vec![script_with_sections(
            1,
            "main.script",
            vec![("Process", vec![])],
        )]);
        let (target, _) = engine.resolve_section(None, "Process").expect("resolve");
        engine.run_section(&target, BTreeMap::new(), Vec::new(), LocalStateOptions::default());
        assert_eq!(sink.count_state(LogState::Warning), 1);
    }

    #[test]
    fn section_params_reach_the_callee_frame() {
        let (mut engine, _sink) = engine_with(vec![script_with_sections(
            1,
            "main.script",
            vec![(
                "Target",
                vec![node(
                    "Set,%Got%,#1",
                    0,
                    CommandKind::Set {
                        var: "%Got%".to_string(),
                        value: "#1".to_string(),
                        global: false,
                    },
                )],
            )],
        )]);
        let (target, _) = engine.resolve_section(None, "Target").expect("resolve");
        let mut in_params = BTreeMap::new();
        in_params.insert(1, "caller-value".to_string());
        engine.run_section(&target, in_params, Vec::new(), LocalStateOptions::default());
        assert_eq!(engine.vars.get_value("Got"), "caller-value");
    }

    #[test]
    fn in_param_writes_survive_to_later_commands() {
        let (mut engine, _sink) = engine_with(vec![script_with_sections(
            1,
            "main.script",
            vec![
                (
                    "Target",
                    vec![
                        node(
                            "Set,#1,changed",
                            0,
                            CommandKind::Set {
                                var: "#1".to_string(),
                                value: "changed".to_string(),
                                global: false,
                            },
                        ),
                        node(
                            "Run,%ScriptFile%,Callee,ignored",
                            1,
                            CommandKind::Run {
                                script: None,
                                section: "Callee".to_string(),
                                in_params: vec!["ignored".to_string()],
                                out_params: Vec::new(),
                            },
                        ),
                        node(
                            "Set,%Seen%,#1",
                            2,
                            CommandKind::Set {
                                var: "%Seen%".to_string(),
                                value: "#1".to_string(),
                                global: false,
                            },
                        ),
                    ],
                ),
                (
                    "Callee",
                    vec![node(
                        "Set,#1,callee-only",
                        0,
                        CommandKind::Set {
                            var: "#1".to_string(),
                            value: "callee-only".to_string(),
                            global: false,
                        },
                    )],
                ),
            ],
        )]);
        let (target, _) = engine.resolve_section(None, "Target").expect("resolve");
        let mut in_params = BTreeMap::new();
        in_params.insert(1, "original".to_string());
        engine.run_section(&target, in_params, Vec::new(), LocalStateOptions::default());
        // The write to #1 outlives the command boundary, and the callee's
        // own write never reaches the caller's slot.
        assert_eq!(engine.vars.get_value("Seen"), "changed");
    }
}
