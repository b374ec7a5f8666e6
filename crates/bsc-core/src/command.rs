use serde::{Deserialize, Serialize};

/// Handler families of the ~90 externally-implemented commands. The runtime
/// routes every [`CommandKind::External`] node through one registered handler
/// per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandFamily {
    File,
    Registry,
    Text,
    Ini,
    Wim,
    Archive,
    Network,
    Hash,
    Script,
    Interface,
    StringFormat,
    Math,
    List,
    Shell,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConditionKind {
    /// Numeric when both sides parse as integers, case-insensitive string
    /// comparison otherwise.
    Equal { left: String, right: String },
    Smaller { left: String, right: String },
    Bigger { left: String, right: String },
    ExistVar { key: String },
    ExistSection { script: Option<String>, section: String },
    ExistMacro { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub negate: bool,
    pub kind: ConditionKind,
}

impl Condition {
    pub fn new(kind: ConditionKind) -> Self {
        Self {
            negate: false,
            kind,
        }
    }

    pub fn negated(kind: ConditionKind) -> Self {
        Self { negate: true, kind }
    }
}

/// One parsed command. Produced by the external parser; the runtime never
/// sees raw script text except for logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandNode {
    /// Raw source text, carried for log entries only.
    pub raw: String,
    /// Line index within the owning section, starting at 0.
    pub line_idx: usize,
    pub kind: CommandKind,
}

impl CommandNode {
    pub fn new(raw: impl Into<String>, line_idx: usize, kind: CommandKind) -> Self {
        Self {
            raw: raw.into(),
            line_idx,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CommandKind {
    None,
    Comment,
    Error {
        message: String,
    },

    // Branch
    Run {
        /// None targets the current script; Some(name) a referenced script.
        script: Option<String>,
        section: String,
        in_params: Vec<String>,
        out_params: Vec<String>,
    },
    /// Like Run, but with a fresh per-script local variable/macro
    /// environment that is restored afterwards.
    Exec {
        script: Option<String>,
        section: String,
        in_params: Vec<String>,
    },
    Loop {
        letter_range: bool,
        script: Option<String>,
        section: String,
        start: String,
        end: String,
        in_params: Vec<String>,
        out_params: Vec<String>,
    },
    LoopBreak,
    If {
        condition: Condition,
        link: Vec<CommandNode>,
    },
    Else {
        link: Vec<CommandNode>,
    },

    // Control
    Set {
        var: String,
        value: String,
        global: bool,
    },
    AddVariables {
        script: Option<String>,
        section: String,
        global: bool,
    },
    SetMacro {
        name: String,
        /// None deletes the macro.
        command: Option<Box<CommandNode>>,
        global: bool,
    },
    GetParam {
        index: usize,
        dest_var: String,
    },
    Exit {
        message: String,
        no_warn: bool,
    },
    Halt {
        message: String,
    },

    // System compatibility shims
    ErrorOff {
        lines: String,
    },
    SetLocal,
    EndLocal,
    OnScriptExit {
        command: Option<Box<CommandNode>>,
    },
    OnBuildExit {
        command: Option<Box<CommandNode>>,
    },

    /// User-defined macro invocation.
    Macro {
        name: String,
        args: Vec<String>,
    },

    /// Everything else: file, registry, ini, archive, network, hash, UI...
    /// Routed through the per-family handler registry.
    External {
        family: CommandFamily,
        op: String,
        args: Vec<String>,
    },
}

impl CommandKind {
    /// Deprecated ops still executed for compatibility, with a warning.
    pub fn is_deprecated(&self) -> bool {
        match self {
            CommandKind::External { op, .. } => {
                op.eq_ignore_ascii_case("WebGetIfNotExist") || op.eq_ignore_ascii_case("HasUAC")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod command_tests {
    use super::*;

    #[test]
    fn external_node_round_trips_through_serde() {
        let node = CommandNode::new(
            "FileCopy,%SrcDir%\\a.txt,%TargetDir%",
            4,
            CommandKind::External {
                family: CommandFamily::File,
                op: "FileCopy".to_string(),
                args: vec!["%SrcDir%\\a.txt".to_string(), "%TargetDir%".to_string()],
            },
        );
        let json = serde_json::to_string(&node).expect("serialize");
        let back: CommandNode = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, node);
    }

    #[test]
    fn deprecated_ops_are_flagged_case_insensitively() {
        let kind = CommandKind::External {
            family: CommandFamily::Network,
            op: "webgetifnotexist".to_string(),
            args: Vec::new(),
        };
        assert!(kind.is_deprecated());
        assert!(!CommandKind::SetLocal.is_deprecated());
    }
}
