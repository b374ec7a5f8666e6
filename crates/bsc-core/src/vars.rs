use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::log::{LogEntry, LogState};

/// Unresolved `%name%` tokens are rewritten as `#$p<name>#$p` and surfaced by
/// the caller as a warning, never as an error.
pub const UNRESOLVED_SENTINEL: &str = "#$p";

const EXPAND_ITERATION_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VarTier {
    Fixed,
    Global,
    Local,
}

impl fmt::Display for VarTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarTier::Fixed => write!(f, "Fixed"),
            VarTier::Global => write!(f, "Global"),
            VarTier::Local => write!(f, "Local"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VarOptions {
    /// Compatibility mode: resolution order Local > Global > Fixed instead
    /// of the standard Fixed > Local > Global.
    pub overridable_fixed_variables: bool,
}

/// Three-tier case-insensitive text key-value store with recursive `%name%`
/// macro expansion. Leaf component; knows nothing about the rest of the
/// runtime.
#[derive(Debug)]
pub struct VariableStore {
    opts: VarOptions,
    fixed: BTreeMap<String, String>,
    global: BTreeMap<String, String>,
    local: BTreeMap<String, String>,
    token_regex: Regex,
}

impl VariableStore {
    pub fn new(opts: VarOptions) -> Self {
        Self {
            opts,
            fixed: BTreeMap::new(),
            global: BTreeMap::new(),
            local: BTreeMap::new(),
            token_regex: Regex::new(r"%([^ %]+)%").expect("static regex must compile"),
        }
    }

    fn normalize(key: &str) -> String {
        key.to_ascii_lowercase()
    }

    fn dict(&self, tier: VarTier) -> &BTreeMap<String, String> {
        match tier {
            VarTier::Fixed => &self.fixed,
            VarTier::Global => &self.global,
            VarTier::Local => &self.local,
        }
    }

    fn dict_mut(&mut self, tier: VarTier) -> &mut BTreeMap<String, String> {
        match tier {
            VarTier::Fixed => &mut self.fixed,
            VarTier::Global => &mut self.global,
            VarTier::Local => &mut self.local,
        }
    }

    pub fn set_value(
        &mut self,
        tier: VarTier,
        key: &str,
        value: impl Into<String>,
    ) -> LogEntry {
        let value = value.into();
        self.dict_mut(tier).insert(Self::normalize(key), value.clone());
        LogEntry::new(
            LogState::Success,
            format!("{} variable [%{}%] set to [{}]", tier, key, value),
        )
    }

    pub fn delete_key(&mut self, tier: VarTier, key: &str) -> bool {
        self.dict_mut(tier).remove(&Self::normalize(key)).is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        let key = Self::normalize(key);
        self.fixed.contains_key(&key)
            || self.local.contains_key(&key)
            || self.global.contains_key(&key)
    }

    pub fn exists_in(&self, tier: VarTier, key: &str) -> bool {
        self.dict(tier).contains_key(&Self::normalize(key))
    }

    fn lookup(&self, normalized_key: &str) -> Option<&String> {
        if self.opts.overridable_fixed_variables {
            self.local
                .get(normalized_key)
                .or_else(|| self.global.get(normalized_key))
                .or_else(|| self.fixed.get(normalized_key))
        } else {
            self.fixed
                .get(normalized_key)
                .or_else(|| self.local.get(normalized_key))
                .or_else(|| self.global.get(normalized_key))
        }
    }

    /// Resolve a key across the tiers. Total: missing keys yield an empty
    /// string, and a value whose expansion is circular falls back to the raw
    /// stored text.
    pub fn get_value(&self, key: &str) -> String {
        self.try_get_value(key).unwrap_or_default()
    }

    pub fn try_get_value(&self, key: &str) -> Option<String> {
        let raw = self.lookup(&Self::normalize(key))?.clone();
        Some(self.expand(&raw).unwrap_or(raw))
    }

    pub fn get_value_of(&self, tier: VarTier, key: &str) -> String {
        match self.dict(tier).get(&Self::normalize(key)) {
            Some(raw) => self.expand(raw).unwrap_or_else(|_| raw.clone()),
            None => String::new(),
        }
    }

    /// Copy of one tier's dictionary, used for scope snapshots.
    pub fn get_var_dict(&self, tier: VarTier) -> BTreeMap<String, String> {
        self.dict(tier).clone()
    }

    /// Atomically swap one tier's dictionary. Keys named in
    /// `keys_to_preserve` keep their current (pre-swap) value — used to keep
    /// section out-parameters alive across an EndLocal restore.
    pub fn set_var_dict(
        &mut self,
        tier: VarTier,
        dict: BTreeMap<String, String>,
        keys_to_preserve: Option<&[String]>,
    ) {
        let mut new_dict: BTreeMap<String, String> = dict
            .into_iter()
            .map(|(key, value)| (Self::normalize(&key), value))
            .collect();

        if let Some(keys) = keys_to_preserve {
            let old_dict = self.dict(tier);
            for key in keys {
                let key = Self::normalize(key);
                if let Some(value) = old_dict.get(&key) {
                    new_dict.insert(key, value.clone());
                }
            }
        }

        *self.dict_mut(tier) = new_dict;
    }

    /// Local and Global tiers can be reset; Fixed persists for the build.
    pub fn reset(&mut self, tier: VarTier) {
        match tier {
            VarTier::Local => self.local.clear(),
            VarTier::Global => self.global.clear(),
            VarTier::Fixed => {}
        }
    }

    /// Repeatedly substitute `%name%` tokens until none remain. Unresolved
    /// names are wrapped in the sentinel pair; exceeding the iteration
    /// ceiling raises the circular-reference condition.
    pub fn expand(&self, text: &str) -> Result<String, EngineError> {
        let mut current = text.to_string();
        let mut iteration = 0usize;

        loop {
            let mut out = String::with_capacity(current.len());
            let mut last = 0usize;
            let mut matched = false;

            for m in self.token_regex.find_iter(&current) {
                matched = true;
                out.push_str(&current[last..m.start()]);
                let name = &current[m.start() + 1..m.end() - 1];
                match self.lookup(&Self::normalize(name)) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str(UNRESOLVED_SENTINEL);
                        out.push_str(name);
                        out.push_str(UNRESOLVED_SENTINEL);
                    }
                }
                last = m.end();
            }

            if !matched {
                return Ok(current);
            }
            out.push_str(&current[last..]);
            current = out;

            iteration += 1;
            if EXPAND_ITERATION_LIMIT < iteration {
                return Err(EngineError::new(
                    "VARS_CIRCULAR_REFERENCE",
                    format!("Circular reference by [{}]", current),
                ));
            }
        }
    }

    /// True when assigning `value` to `key` would create a self-reference,
    /// checked by substring containment on the raw value and on its full
    /// expansion. The sentinel pair is unescaped back to `%` first, since an
    /// indirect cycle ends at the not-yet-assigned key and expands to its
    /// sentinel-wrapped form rather than a literal `%key%`.
    pub fn check_circular_reference(&self, key: &str, value: &str) -> bool {
        let needle = format!("%{}%", Self::normalize(key));
        if value.to_ascii_lowercase().contains(&needle) {
            return true;
        }
        match self.expand(value) {
            Ok(expanded) => expanded
                .replace(UNRESOLVED_SENTINEL, "%")
                .to_ascii_lowercase()
                .contains(&needle),
            Err(_) => true,
        }
    }
}
