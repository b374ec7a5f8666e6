#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltCause {
    User,
    Error,
    Command,
    ScriptExit,
}

/// Reported cause of a finished run, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HaltReason {
    User,
    Error,
    HaltCommand,
    ExitCommand,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HaltSnapshot {
    user: bool,
    error: bool,
    command: bool,
    script_exit: bool,
}

/// Sticky halt flags. Setting a cause twice is a no-op; flags only clear
/// through `reset`, `restore` or `clear_script_exit`.
#[derive(Debug, Default)]
pub struct HaltFlags {
    user: bool,
    error: bool,
    command: bool,
    script_exit: bool,
}

impl HaltFlags {
    pub fn set(&mut self, cause: HaltCause) {
        match cause {
            HaltCause::User => self.user = true,
            HaltCause::Error => self.error = true,
            HaltCause::Command => self.command = true,
            HaltCause::ScriptExit => self.script_exit = true,
        }
    }

    /// Stops the current script, including a plain script exit.
    pub fn script_halt(&self) -> bool {
        self.user || self.error || self.command || self.script_exit
    }

    /// Stops the whole queue. A script exit only skips the current script.
    pub fn build_halt(&self) -> bool {
        self.user || self.error || self.command
    }

    pub fn user_halt(&self) -> bool {
        self.user
    }

    pub fn clear_script_exit(&mut self) {
        self.script_exit = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> HaltSnapshot {
        HaltSnapshot {
            user: self.user,
            error: self.error,
            command: self.command,
            script_exit: self.script_exit,
        }
    }

    pub fn restore(&mut self, snapshot: HaltSnapshot) {
        self.user = snapshot.user;
        self.error = snapshot.error;
        self.command = snapshot.command;
        self.script_exit = snapshot.script_exit;
    }

    pub fn reason(&self) -> HaltReason {
        if self.user {
            HaltReason::User
        } else if self.error {
            HaltReason::Error
        } else if self.command {
            HaltReason::HaltCommand
        } else if self.script_exit {
            HaltReason::ExitCommand
        } else {
            HaltReason::None
        }
    }

    /// First in-parameter handed to exit callbacks.
    pub fn event_param(&self) -> &'static str {
        match self.reason() {
            HaltReason::User => "STOP",
            HaltReason::Error => "ERROR",
            HaltReason::HaltCommand | HaltReason::ExitCommand => "COMMAND",
            HaltReason::None => "DONE",
        }
    }
}

/// Kill handle for an external process started by a shell handler.
pub trait KillableChild: Send {
    fn kill(&mut self);
}

#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// At most one tracked child process at a time.
#[derive(Clone, Default)]
pub struct SubProcessSlot {
    inner: Arc<Mutex<Option<Box<dyn KillableChild>>>>,
}

impl SubProcessSlot {
    pub fn track(&self, child: Box<dyn KillableChild>) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = Some(child);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = None;
        }
    }

    pub fn kill_active(&self) {
        if let Ok(mut slot) = self.inner.lock() {
            if let Some(child) = slot.as_mut() {
                child.kill();
            }
            *slot = None;
        }
    }
}

/// Shared stop request surface, safe to hand to another thread. A user stop
/// kills the tracked child process, flips the cancel token for handlers, and
/// raises a one-shot flag the runner polls between commands.
#[derive(Clone, Default)]
pub struct StopSignal {
    user_requested: Arc<AtomicBool>,
    cancel: CancelToken,
    sub_process: SubProcessSlot,
}

impl StopSignal {
    pub fn request_stop(&self) {
        self.sub_process.kill_active();
        self.cancel.cancel();
        self.user_requested.store(true, Ordering::SeqCst);
    }

    /// Consumes the pending request so a later reset of the halt flags does
    /// not re-trip on the same click.
    fn take_user_requested(&self) -> bool {
        self.user_requested.swap(false, Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn sub_process(&self) -> SubProcessSlot {
        self.sub_process.clone()
    }
}

static BUILD_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Process-wide build mutual exclusion. Acquisition fails fast instead of
/// blocking; dropping the token releases the slot.
#[derive(Debug)]
pub struct BuildToken {
    _private: (),
}

impl BuildToken {
    pub fn acquire() -> Result<Self, EngineError> {
        if BUILD_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(Self { _private: () })
        } else {
            Err(EngineError::new(
                "ENGINE_BUILD_RUNNING",
                "Another build is already running.",
            ))
        }
    }
}

impl Drop for BuildToken {
    fn drop(&mut self) {
        BUILD_ACTIVE.store(false, Ordering::SeqCst);
    }
}
