use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::command::CommandNode;

pub type ScriptId = u32;

/// A named, ordered sequence of already-parsed commands. The unit of
/// recursive execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub commands: Arc<Vec<CommandNode>>,
    /// Source line count of the section; drives precise progress. Defaults
    /// to the command count.
    pub line_count: usize,
}

impl Section {
    pub fn new(name: impl Into<String>, commands: Vec<CommandNode>) -> Self {
        let line_count = commands.len();
        Self {
            name: name.into(),
            commands: Arc::new(commands),
            line_count,
        }
    }

    pub fn with_line_count(mut self, line_count: usize) -> Self {
        self.line_count = line_count;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub id: ScriptId,
    /// Tree path of the script within the project, used in log messages.
    pub name: String,
    pub title: String,
    pub sections: BTreeMap<String, Section>,
    /// The script's [Variables] block, imported into the Local tier when the
    /// script starts (Global for the main script).
    pub variables: BTreeMap<String, String>,
    /// Per-script macro definitions, loaded into the local macro dict.
    pub local_macros: BTreeMap<String, CommandNode>,
}

impl Script {
    pub fn new(id: ScriptId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            title: name.clone(),
            name,
            sections: BTreeMap::new(),
            variables: BTreeMap::new(),
            local_macros: BTreeMap::new(),
        }
    }

    pub fn with_section(mut self, section: Section) -> Self {
        self.sections.insert(section.name.clone(), section);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Section lookup is case-insensitive, matching the ini-style source
    /// format.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections
            .get(name)
            .or_else(|| {
                self.sections
                    .values()
                    .find(|section| section.name.eq_ignore_ascii_case(name))
            })
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.section(name).is_some()
    }

    /// Total line count across all sections, used for the per-script
    /// progress ceiling.
    pub fn total_line_count(&self) -> usize {
        self.sections
            .values()
            .map(|section| section.line_count)
            .sum()
    }
}
