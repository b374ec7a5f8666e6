use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use bsc_core::{
    CommandFamily, CommandKind, CommandNode, Condition, ConditionKind, EngineError, LogEntry,
    LogSink, LogState, NullLogSink, Script, ScriptId, VarOptions, VarTier, VariableStore,
};
use regex::Regex;
use serde::Serialize;

pub const ENTRY_SECTION: &str = "Process";
pub const ENGINE_VERSION: &str = "100";
pub const LOG_SEPARATOR: &str = "------------------------------------------------------------";

/// How many scripts of the queue a run visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Every script in the queue, entry section of each.
    RunAll,
    /// The main script's entry section, then one chosen section of the second script.
    RunMainAndOne,
    /// A single section of a single script.
    RunOne,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompatOptions {
    pub overridable_fixed_variables: bool,
    pub overridable_loop_counter: bool,
    pub allow_letter_in_loop: bool,
    pub disable_extended_section_params: bool,
}

pub struct HandlerContext<'a> {
    pub vars: &'a mut VariableStore,
    pub return_value: &'a mut String,
    pub cancel: CancelToken,
    pub sub_process: SubProcessSlot,
}

/// Executes the non-structural command families (file, registry, text, ...).
/// Entries returned without a command reference are tagged with the current
/// command and depth before they reach the sink.
pub trait CommandHandlerRegistry: Send {
    fn dispatch(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        family: CommandFamily,
        op: &str,
        args: &[String],
    ) -> Result<Vec<LogEntry>, EngineError>;
}

#[derive(Debug, Default)]
pub struct EmptyHandlerRegistry;

impl CommandHandlerRegistry for EmptyHandlerRegistry {
    fn dispatch(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        family: CommandFamily,
        op: &str,
        _args: &[String],
    ) -> Result<Vec<LogEntry>, EngineError> {
        Err(EngineError::new(
            "ENGINE_HANDLER_MISSING",
            format!("No handler registered for [{family:?},{op}]."),
        ))
    }
}

pub struct EngineOptions {
    pub scripts: Vec<Script>,
    pub run_mode: EngineMode,
    /// Entry section for the non-main script in `RunMainAndOne` / `RunOne`.
    pub entry_section: Option<String>,
    pub base_dir: String,
    pub project_title: String,
    pub stop_build_on_error: bool,
    /// Fires the build-exit callback even in single-script modes.
    pub test_mode: bool,
    pub compat: CompatOptions,
    pub log_sink: Option<Arc<dyn LogSink>>,
    pub handlers: Option<Box<dyn CommandHandlerRegistry>>,
}

impl EngineOptions {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts,
            run_mode: EngineMode::RunAll,
            entry_section: None,
            base_dir: String::new(),
            project_title: String::new(),
            stop_build_on_error: true,
            test_mode: false,
            compat: CompatOptions::default(),
            log_sink: None,
            handlers: None,
        }
    }
}

pub struct BuildEngine {
    scripts: Vec<Script>,
    run_mode: EngineMode,
    entry_section: String,
    stop_build_on_error: bool,
    test_mode: bool,
    compat: CompatOptions,
    vars: VariableStore,
    macros: MacroStore,
    handlers: Box<dyn CommandHandlerRegistry>,
    log_sink: Arc<dyn LogSink>,
    stop: StopSignal,

    current_script_idx: usize,
    cur_in_params: BTreeMap<usize, String>,
    cur_out_params: Vec<String>,
    return_value: String,
    processed_sections: BTreeSet<(ScriptId, String)>,
    else_flag: bool,
    loop_stack: Vec<EngineLoopState>,
    halt: HaltFlags,
    local_state_stack: Vec<LocalState>,
    set_local_stack: Vec<SetLocalState>,
    error_off: Option<ErrorOffState>,
    error_off_pending: Option<ErrorOffState>,
    error_off_depth_minus_one: bool,
    on_script_exit: Option<CommandNode>,
    on_build_exit: Option<CommandNode>,
    progress: ProgressTracker,
    finished: bool,
}

impl BuildEngine {
    pub fn new(options: EngineOptions) -> Result<Self, EngineError> {
        if options.scripts.is_empty() {
            return Err(EngineError::new(
                "ENGINE_NO_SCRIPTS",
                "The build queue holds no scripts.",
            ));
        }
        let mut seen = BTreeSet::new();
        for script in &options.scripts {
            if !seen.insert(script.id) {
                return Err(EngineError::new(
                    "ENGINE_SCRIPT_ID_CONFLICT",
                    format!("Script id [{}] is used more than once.", script.id),
                ));
            }
        }

        let mut vars = VariableStore::new(VarOptions {
            overridable_fixed_variables: options.compat.overridable_fixed_variables,
        });
        vars.set_value(
            VarTier::Fixed,
            "BaseDir",
            options.base_dir.trim_end_matches(['\\', '/']),
        );
        vars.set_value(VarTier::Fixed, "ProjectTitle", &options.project_title);
        vars.set_value(VarTier::Fixed, "EngineVersion", ENGINE_VERSION);
        if !matches!(options.run_mode, EngineMode::RunOne) {
            // The main script's variable block seeds the global tier.
            for (key, value) in &options.scripts[0].variables {
                vars.set_value(VarTier::Global, key, value.clone());
            }
        }

        let mut engine = Self {
            scripts: options.scripts,
            run_mode: options.run_mode,
            entry_section: options
                .entry_section
                .unwrap_or_else(|| ENTRY_SECTION.to_string()),
            stop_build_on_error: options.stop_build_on_error,
            test_mode: options.test_mode,
            compat: options.compat,
            vars,
            macros: MacroStore::default(),
            handlers: options
                .handlers
                .unwrap_or_else(|| Box::new(EmptyHandlerRegistry)),
            log_sink: options
                .log_sink
                .unwrap_or_else(|| Arc::new(NullLogSink)),
            stop: StopSignal::default(),
            current_script_idx: 0,
            cur_in_params: BTreeMap::new(),
            cur_out_params: Vec::new(),
            return_value: String::new(),
            processed_sections: BTreeSet::new(),
            else_flag: false,
            loop_stack: Vec::new(),
            halt: HaltFlags::default(),
            local_state_stack: Vec::new(),
            set_local_stack: Vec::new(),
            error_off: None,
            error_off_pending: None,
            error_off_depth_minus_one: false,
            on_script_exit: None,
            on_build_exit: None,
            progress: ProgressTracker::default(),
            finished: false,
        };
        engine.init_local_state_stack();
        Ok(engine)
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn halt_reason(&self) -> HaltReason {
        self.halt.reason()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn variables(&self) -> &VariableStore {
        &self.vars
    }

    pub fn variables_mut(&mut self) -> &mut VariableStore {
        &mut self.vars
    }

    fn current_script(&self) -> &Script {
        let idx = self.current_script_idx.min(self.scripts.len() - 1);
        &self.scripts[idx]
    }

    fn log(&self, state: LogState, message: impl Into<String>) {
        self.log_sink
            .write(LogEntry::new(state, message).at_depth(self.peek_depth()));
    }

    fn write_command_logs(&self, cmd: &CommandNode, depth: usize, logs: Vec<LogEntry>) {
        for mut entry in logs {
            entry.depth = depth;
            if entry.command.is_none() {
                entry.line_idx = Some(cmd.line_idx);
                entry.command = Some(cmd.raw.clone());
            }
            self.log_sink.write(entry);
        }
    }
}
