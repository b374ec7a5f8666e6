#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSummary {
    pub halt_reason: HaltReason,
    pub scripts_run: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackEvent {
    ScriptExit,
    BuildExit,
}

impl fmt::Display for CallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackEvent::ScriptExit => write!(f, "OnScriptExit"),
            CallbackEvent::BuildExit => write!(f, "OnBuildExit"),
        }
    }
}

/// Running build moved to a worker thread. The engine is consumed; the
/// handle only exposes stop control and the final summary.
pub struct BuildHandle {
    join_handle: JoinHandle<Result<BuildSummary, EngineError>>,
    stop: StopSignal,
}

impl BuildHandle {
    pub fn force_stop(&self) {
        self.stop.request_stop();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn join(self) -> Result<BuildSummary, EngineError> {
        self.join_handle
            .join()
            .map_err(|_| EngineError::new("ENGINE_INTERNAL_PANIC", "Build thread panicked."))?
    }
}

impl BuildEngine {
    /// Runs the whole build on the calling thread. Holds the process-wide
    /// build slot for the duration.
    pub fn run(&mut self) -> Result<BuildSummary, EngineError> {
        let _token = BuildToken::acquire()?;
        Ok(self.run_inner())
    }

    /// Moves the build to a background thread.
    pub fn spawn(mut self) -> Result<BuildHandle, EngineError> {
        let token = BuildToken::acquire()?;
        let stop = self.stop.clone();
        let join_handle = thread::spawn(move || {
            let _token = token;
            Ok(self.run_inner())
        });
        Ok(BuildHandle { join_handle, stop })
    }

    fn run_inner(&mut self) -> BuildSummary {
        self.finished = false;
        self.current_script_idx = 0;
        self.halt.reset();
        self.progress.begin_build(self.scripts.len());
        let mut scripts_run = 0;

        loop {
            self.ready_run_script();

            let entry = self.entry_section_name();
            match self.resolve_section(None, &entry) {
                Ok((target, _)) => {
                    self.log(LogState::Info, format!("Processing section [{entry}]"));
                    self.run_section(
                        &target,
                        BTreeMap::new(),
                        Vec::new(),
                        LocalStateOptions::default(),
                    );
                }
                Err(_) => {
                    self.log(
                        LogState::Warning,
                        format!(
                            "Script [{}] does not have section [{entry}]",
                            self.current_script().name
                        ),
                    );
                }
            }
            scripts_run += 1;
            self.finish_run_script();

            // The script-exit callback sees a clean slate; the flags come
            // back afterwards so the queue decision is unaffected.
            let snapshot = self.halt.snapshot();
            let event_param = self.halt.event_param();
            self.halt.reset();
            self.run_callback(CallbackEvent::ScriptExit, event_param);
            self.halt.restore(snapshot);

            let single_script_done = match self.run_mode {
                EngineMode::RunOne => true,
                EngineMode::RunMainAndOne => self.current_script_idx != 0,
                EngineMode::RunAll => false,
            };
            let last_script = self.scripts.len() <= self.current_script_idx + 1;

            if last_script || single_script_done || self.halt.build_halt() {
                if self.halt.user_halt() {
                    self.log(LogState::Info, "Build stop requested by user");
                }
                let halt_reason = self.halt.reason();
                let event_param = self.halt.event_param();
                self.halt.reset();
                // The build-exit callback does not restore: the build is over.
                if matches!(self.run_mode, EngineMode::RunAll) || self.test_mode {
                    self.run_callback(CallbackEvent::BuildExit, event_param);
                }
                self.finished = true;
                return BuildSummary {
                    halt_reason,
                    scripts_run,
                };
            }

            self.current_script_idx += 1;
            self.halt.clear_script_exit();
        }
    }

    fn entry_section_name(&self) -> String {
        match self.run_mode {
            EngineMode::RunAll => ENTRY_SECTION.to_string(),
            EngineMode::RunMainAndOne if self.current_script_idx == 0 => ENTRY_SECTION.to_string(),
            _ => self.entry_section.clone(),
        }
    }

    fn ready_run_script(&mut self) {
        self.error_off = None;
        self.error_off_pending = None;
        self.error_off_depth_minus_one = false;
        self.init_local_state_stack();
        self.set_local_stack.clear();
        self.else_flag = false;
        self.loop_stack.clear();
        self.cur_in_params.clear();
        self.cur_out_params.clear();
        self.return_value.clear();
        self.processed_sections.clear();

        let idx = self.current_script_idx;
        let script = self.scripts[idx].clone();
        self.log(LogState::None, LOG_SEPARATOR);
        self.log(
            LogState::Info,
            format!(
                "[{}/{}] Processing script [{}] ({})",
                idx + 1,
                self.scripts.len(),
                script.title,
                script.name
            ),
        );

        self.vars.reset(VarTier::Local);
        self.vars
            .set_value(VarTier::Fixed, "ScriptFile", script.name.clone());
        self.vars
            .set_value(VarTier::Fixed, "ScriptTitle", script.title.clone());
        let is_main = idx == 0 && !matches!(self.run_mode, EngineMode::RunOne);
        let tier = if is_main { VarTier::Global } else { VarTier::Local };
        for (key, value) in &script.variables {
            self.vars.set_value(tier, key, value.clone());
        }
        self.macros.reset_local();
        self.macros.load_local(&script.local_macros);

        self.progress
            .begin_script(script.total_line_count() as u64, idx);
    }

    fn finish_run_script(&mut self) {
        self.log(
            LogState::Info,
            format!("End of script [{}]", self.current_script().name),
        );
        self.log(LogState::None, LOG_SEPARATOR);
    }

    /// Fires one registered exit callback. The event cause arrives as the
    /// first in-parameter of a Run/Exec callback; the registration is
    /// consumed either way.
    fn run_callback(&mut self, event: CallbackEvent, event_param: &str) {
        let callback = match event {
            CallbackEvent::ScriptExit => self.on_script_exit.take(),
            CallbackEvent::BuildExit => self.on_build_exit.take(),
        };
        let Some(mut callback) = callback else {
            return;
        };

        self.log(
            LogState::Info,
            format!("Processing callback of event [{event}]"),
        );
        self.init_local_state_stack();

        match &mut callback.kind {
            CommandKind::Run { in_params, .. } | CommandKind::Exec { in_params, .. } => {
                if in_params.is_empty() {
                    in_params.push(event_param.to_string());
                } else {
                    in_params[0] = event_param.to_string();
                }
            }
            _ => {}
        }

        let current = self.current_script();
        let context = SectionRef {
            script_id: current.id,
            script_name: current.name.clone(),
            section_name: event.to_string(),
            commands: Arc::new(Vec::new()),
        };
        self.execute_command(&context, &callback);

        self.log(LogState::Info, format!("End of callback [{event}]"));
    }
}
