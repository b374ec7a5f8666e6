/// Identity of one frame on the scope stack. Two frames are the same scope
/// only when all three fields match; scope guards are keyed on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalState {
    pub depth: usize,
    pub is_macro: bool,
    /// 0 when the frame runs inside the current script.
    pub ref_script_id: ScriptId,
}

const SENTINEL_STATE: LocalState = LocalState {
    depth: 0,
    is_macro: false,
    ref_script_id: 0,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStateOptions {
    pub is_macro: bool,
    pub ref_script_id: ScriptId,
}

impl BuildEngine {
    fn init_local_state_stack(&mut self) {
        self.local_state_stack.clear();
        self.local_state_stack.push(SENTINEL_STATE);
    }

    fn push_local_state(&mut self, opts: LocalStateOptions) -> usize {
        debug_assert!(
            !self.local_state_stack.is_empty(),
            "scope stack must hold the depth-0 sentinel"
        );
        let depth = self.peek_depth() + 1;
        self.local_state_stack.push(LocalState {
            depth,
            is_macro: opts.is_macro,
            ref_script_id: opts.ref_script_id,
        });
        depth
    }

    fn pop_local_state(&mut self) {
        // The sentinel is never popped.
        if self.local_state_stack.len() > 1 {
            self.local_state_stack.pop();
        }
    }

    fn peek_local_state(&self) -> LocalState {
        self.local_state_stack
            .last()
            .copied()
            .unwrap_or(SENTINEL_STATE)
    }

    fn peek_depth(&self) -> usize {
        self.peek_local_state().depth
    }
}
