#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineLoopState {
    Index(i64),
    Letter(char),
}

impl EngineLoopState {
    fn counter_string(&self) -> String {
        match self {
            EngineLoopState::Index(index) => index.to_string(),
            EngineLoopState::Letter(letter) => letter.to_string(),
        }
    }
}

struct RunExecRequest<'a> {
    script: Option<&'a str>,
    section: &'a str,
    in_params: &'a [String],
    out_params: &'a [String],
    exec: bool,
    /// Macro bodies keep the caller's parameter view instead of binding
    /// fresh in-parameters.
    preserve_params: bool,
    as_macro: bool,
}

struct ExecSnapshot {
    local_vars: BTreeMap<String, String>,
    fixed_vars: BTreeMap<String, String>,
    local_macros: BTreeMap<String, CommandNode>,
}

fn parse_loop_letter(text: &str) -> Result<char, EngineError> {
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) if letter.is_ascii_alphabetic() => Ok(letter),
        _ => Err(EngineError::new(
            "ENGINE_LOOP_RANGE",
            format!("[{text}] is not a valid drive letter"),
        )),
    }
}

impl BuildEngine {
    fn script_environment(
        &self,
        id: ScriptId,
    ) -> Option<(BTreeMap<String, String>, BTreeMap<String, CommandNode>)> {
        self.scripts
            .iter()
            .find(|s| s.id == id)
            .map(|s| (s.variables.clone(), s.local_macros.clone()))
    }

    fn cmd_run_exec(&mut self, cmd: &CommandNode, req: RunExecRequest<'_>) -> Result<(), EngineError> {
        let current = self.peek_local_state();
        let script_name = req.script.map(|s| self.expand_all(s)).transpose()?;
        let section_name = self.expand_all(req.section)?;
        let in_dict = if req.preserve_params {
            self.cur_in_params.clone()
        } else {
            let mut dict = BTreeMap::new();
            for (i, param) in req.in_params.iter().enumerate() {
                dict.insert(i + 1, self.expand_all(param)?);
            }
            dict
        };
        let (target, in_current) = self.resolve_section(script_name.as_deref(), &section_name)?;

        let header = match &script_name {
            Some(name) => format!(
                "Processing [{}]'s section [{}]",
                name, target.section_name
            ),
            None => format!("Processing section [{}]", target.section_name),
        };
        self.write_command_logs(cmd, current.depth, vec![LogEntry::new(LogState::Info, header)]);

        // Exec gets the target script's own variable and macro environment,
        // restored afterwards together with the fixed tier.
        let snapshot = if req.exec {
            let snapshot = ExecSnapshot {
                local_vars: self.vars.get_var_dict(VarTier::Local),
                fixed_vars: self.vars.get_var_dict(VarTier::Fixed),
                local_macros: self.macros.local_dict(),
            };
            self.vars.reset(VarTier::Local);
            self.macros.reset_local();
            if let Some((variables, macros)) = self.script_environment(target.script_id) {
                for (key, value) in variables {
                    self.vars.set_value(VarTier::Local, &key, value);
                }
                self.macros.load_local(&macros);
            }
            Some(snapshot)
        } else {
            None
        };

        let opts = LocalStateOptions {
            is_macro: req.as_macro || current.is_macro,
            ref_script_id: if in_current {
                current.ref_script_id
            } else {
                target.script_id
            },
        };
        self.run_section(&target, in_dict, req.out_params.to_vec(), opts);

        if let Some(snapshot) = snapshot {
            self.vars
                .set_var_dict(VarTier::Local, snapshot.local_vars, None);
            self.vars
                .set_var_dict(VarTier::Fixed, snapshot.fixed_vars, None);
            self.macros.set_local_dict(snapshot.local_macros);
        }
        self.write_command_logs(
            cmd,
            current.depth,
            vec![LogEntry::new(
                LogState::Info,
                format!("End of section [{}]", target.section_name),
            )],
        );
        Ok(())
    }

    fn cmd_loop(&mut self, cmd: &CommandNode) -> Result<(), EngineError> {
        let CommandKind::Loop {
            letter_range,
            script,
            section: target,
            start,
            end,
            in_params,
            out_params,
        } = &cmd.kind
        else {
            return Err(EngineError::new(
                "ENGINE_INTERNAL_DISPATCH",
                "Loop dispatched with a non-loop command.",
            ));
        };

        let current = self.peek_local_state();
        let script_name = script.as_ref().map(|s| self.expand_all(s)).transpose()?;
        let section_name = self.expand_all(target)?;
        let start_str = self.expand_all(start)?;
        let end_str = self.expand_all(end)?;
        let mut expanded_in = Vec::with_capacity(in_params.len());
        for param in in_params {
            expanded_in.push(self.expand_all(param)?);
        }

        let letters = *letter_range
            || (self.compat.allow_letter_in_loop && start_str.parse::<i64>().is_err());
        let values: Vec<EngineLoopState> = if letters {
            let first = parse_loop_letter(&start_str)?;
            let last = parse_loop_letter(&end_str)?;
            if last < first {
                return Err(EngineError::new(
                    "ENGINE_LOOP_RANGE",
                    format!("Loop range [{first}] ~ [{last}] is invalid"),
                ));
            }
            (first as u8..=last as u8)
                .map(|c| EngineLoopState::Letter(c as char))
                .collect()
        } else {
            let first: i64 = start_str.parse().map_err(|_| {
                EngineError::new(
                    "ENGINE_LOOP_RANGE",
                    format!("[{start_str}] is not a valid integer"),
                )
            })?;
            let last: i64 = end_str.parse().map_err(|_| {
                EngineError::new(
                    "ENGINE_LOOP_RANGE",
                    format!("[{end_str}] is not a valid integer"),
                )
            })?;
            if last < first {
                return Err(EngineError::new(
                    "ENGINE_LOOP_RANGE",
                    format!("Loop range [{first}] ~ [{last}] is invalid"),
                ));
            }
            (first..=last).map(EngineLoopState::Index).collect()
        };

        let (target_ref, in_current) = self.resolve_section(script_name.as_deref(), &section_name)?;
        let total = values.len();
        self.write_command_logs(
            cmd,
            current.depth,
            vec![LogEntry::new(
                LogState::Info,
                format!("Loop section [{}] [{total}] times", target_ref.section_name),
            )],
        );

        let opts = LocalStateOptions {
            is_macro: current.is_macro,
            ref_script_id: if in_current {
                current.ref_script_id
            } else {
                target_ref.script_id
            },
        };
        let mut in_dict = BTreeMap::new();
        for (i, value) in expanded_in.iter().enumerate() {
            in_dict.insert(i + 1, value.clone());
        }

        for (i, value) in values.iter().enumerate() {
            if self.halt.script_halt() {
                break;
            }
            self.write_command_logs(
                cmd,
                current.depth,
                vec![LogEntry::new(
                    LogState::Info,
                    format!(
                        "Entering loop with [{}] ({}/{})",
                        value.counter_string(),
                        i + 1,
                        total
                    ),
                )],
            );
            self.loop_stack.push(*value);
            let stack_len = self.loop_stack.len();
            self.run_section(&target_ref, in_dict.clone(), out_params.clone(), opts);
            if self.loop_stack.len() != stack_len {
                // A LoopBreak in the body already removed the counter.
                self.write_command_logs(
                    cmd,
                    current.depth,
                    vec![LogEntry::new(LogState::Info, "Exiting loop")],
                );
                break;
            }
            self.loop_stack.pop();
            self.write_command_logs(
                cmd,
                current.depth,
                vec![LogEntry::new(
                    LogState::Info,
                    format!(
                        "End of loop with [{}] ({}/{})",
                        value.counter_string(),
                        i + 1,
                        total
                    ),
                )],
            );
        }
        Ok(())
    }

    fn cmd_loop_break(&mut self, logs: &mut Vec<LogEntry>) {
        if self.loop_stack.pop().is_some() {
            logs.push(LogEntry::new(LogState::Info, "Breaking loop"));
        } else {
            logs.push(LogEntry::new(LogState::Error, "Loop is not running"));
        }
    }

    fn cmd_if(
        &mut self,
        section: &SectionRef,
        cmd: &CommandNode,
        condition: &Condition,
        link: &[CommandNode],
    ) -> Result<(), EngineError> {
        let depth = self.peek_depth();
        let (met, message) = self.eval_condition(condition)?;
        if met {
            self.write_command_logs(cmd, depth, vec![LogEntry::new(LogState::Success, message)]);
            self.run_branch_link(section, link);
            self.write_command_logs(
                cmd,
                depth,
                vec![LogEntry::new(LogState::Info, "End of CodeBlock")],
            );
            self.else_flag = false;
        } else {
            self.write_command_logs(cmd, depth, vec![LogEntry::new(LogState::Ignore, message)]);
            self.else_flag = true;
        }
        Ok(())
    }

    fn cmd_else(
        &mut self,
        section: &SectionRef,
        cmd: &CommandNode,
        link: &[CommandNode],
    ) -> Result<(), EngineError> {
        let depth = self.peek_depth();
        if self.else_flag {
            self.write_command_logs(
                cmd,
                depth,
                vec![LogEntry::new(LogState::Success, "Else condition met")],
            );
            self.run_branch_link(section, link);
            self.write_command_logs(
                cmd,
                depth,
                vec![LogEntry::new(LogState::Info, "End of CodeBlock")],
            );
            // An Else whose body is exactly one If keeps the flag alive so
            // If-Else-If chains work.
            let meaningful: Vec<&CommandNode> = link
                .iter()
                .filter(|c| !matches!(c.kind, CommandKind::Comment | CommandKind::None))
                .collect();
            let chains =
                meaningful.len() == 1 && matches!(meaningful[0].kind, CommandKind::If { .. });
            if !chains {
                self.else_flag = false;
            }
        } else {
            self.write_command_logs(
                cmd,
                depth,
                vec![LogEntry::new(LogState::Ignore, "Else condition not met")],
            );
        }
        Ok(())
    }

    fn run_branch_link(&mut self, section: &SectionRef, link: &[CommandNode]) {
        if link.len() == 1 {
            if let CommandKind::ErrorOff { .. } = link[0].kind {
                // The window should belong to the frame that owns the If.
                self.error_off_depth_minus_one = true;
            }
        }
        // Links run one frame deeper but share the caller's live parameter
        // view, so a `Set,#N` inside the link updates the section's params.
        let current = self.peek_local_state();
        self.push_local_state(LocalStateOptions {
            is_macro: current.is_macro,
            ref_script_id: current.ref_script_id,
        });
        self.run_command_list(section, link);
        self.pop_local_state();
    }

    fn eval_condition(&mut self, condition: &Condition) -> Result<(bool, String), EngineError> {
        let (value, message) = match &condition.kind {
            ConditionKind::Equal { left, right } => {
                let left = self.expand_all(left)?;
                let right = self.expand_all(right)?;
                let equal = match (left.parse::<i64>(), right.parse::<i64>()) {
                    (Ok(a), Ok(b)) => a == b,
                    _ => left.eq_ignore_ascii_case(&right),
                };
                let verdict = if equal { "is equal to" } else { "is not equal to" };
                (equal, format!("[{left}] {verdict} [{right}]"))
            }
            ConditionKind::Smaller { left, right } => {
                let (a, b) = self.numeric_operands(left, right)?;
                let verdict = if a < b { "is smaller than" } else { "is not smaller than" };
                (a < b, format!("[{a}] {verdict} [{b}]"))
            }
            ConditionKind::Bigger { left, right } => {
                let (a, b) = self.numeric_operands(left, right)?;
                let verdict = if a > b { "is bigger than" } else { "is not bigger than" };
                (a > b, format!("[{a}] {verdict} [{b}]"))
            }
            ConditionKind::ExistVar { key } => {
                let name = trim_percent(key).ok_or_else(|| {
                    EngineError::new(
                        "ENGINE_CONDITION",
                        format!("[{key}] is not a valid variable name"),
                    )
                })?;
                let exists = self.vars.exists(&name);
                let verdict = if exists { "exists" } else { "does not exist" };
                (exists, format!("Variable [%{name}%] {verdict}"))
            }
            ConditionKind::ExistSection { script, section } => {
                let script_name = script.as_ref().map(|s| self.expand_all(s)).transpose()?;
                let section_name = self.expand_all(section)?;
                let exists = self
                    .resolve_section(script_name.as_deref(), &section_name)
                    .is_ok();
                let verdict = if exists { "exists" } else { "does not exist" };
                (exists, format!("Section [{section_name}] {verdict}"))
            }
            ConditionKind::ExistMacro { name } => {
                let name = self.expand_all(name)?;
                let exists = self.macros.contains(&name);
                let verdict = if exists { "exists" } else { "does not exist" };
                (exists, format!("Macro [{name}] {verdict}"))
            }
        };
        Ok((condition.negate != value, message))
    }

    fn numeric_operands(&self, left: &str, right: &str) -> Result<(i64, i64), EngineError> {
        let left = self.expand_all(left)?;
        let right = self.expand_all(right)?;
        let a: i64 = left.parse().map_err(|_| {
            EngineError::new(
                "ENGINE_CONDITION",
                format!("[{left}] is not a valid integer"),
            )
        })?;
        let b: i64 = right.parse().map_err(|_| {
            EngineError::new(
                "ENGINE_CONDITION",
                format!("[{right}] is not a valid integer"),
            )
        })?;
        Ok((a, b))
    }

    fn cmd_macro(
        &mut self,
        section: &SectionRef,
        cmd: &CommandNode,
        name: &str,
        args: &[String],
    ) -> Result<(), EngineError> {
        let Some(body) = self.macros.get(name).cloned() else {
            return Err(EngineError::new(
                "ENGINE_MACRO_NOT_FOUND",
                format!("Invalid command [{name}]"),
            ));
        };
        let depth = self.peek_depth();
        self.write_command_logs(
            cmd,
            depth,
            vec![LogEntry::new(
                LogState::Info,
                format!("Executing macro [{name}]"),
            )],
        );

        let mut params = BTreeMap::new();
        for (i, arg) in args.iter().enumerate() {
            params.insert(i + 1, self.expand_section_params(arg));
        }
        // The caller's parameter view comes back after the macro body.
        let saved_params = std::mem::replace(&mut self.cur_in_params, params);

        let result = match &body.kind {
            CommandKind::Run {
                script,
                section: target,
                in_params,
                out_params,
            } => self.cmd_run_exec(
                &body,
                RunExecRequest {
                    script: script.as_deref(),
                    section: target,
                    in_params,
                    out_params,
                    exec: false,
                    preserve_params: true,
                    as_macro: true,
                },
            ),
            CommandKind::Exec {
                script,
                section: target,
                in_params,
            } => self.cmd_run_exec(
                &body,
                RunExecRequest {
                    script: script.as_deref(),
                    section: target,
                    in_params,
                    out_params: &[],
                    exec: true,
                    preserve_params: true,
                    as_macro: true,
                },
            ),
            _ => {
                let current = self.peek_local_state();
                self.push_local_state(LocalStateOptions {
                    is_macro: true,
                    ref_script_id: current.ref_script_id,
                });
                self.execute_command(section, &body);
                self.pop_local_state();
                Ok(())
            }
        };
        self.cur_in_params = saved_params;
        result
    }
}
