fn section_param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#(?:[0-9]+|[oO][0-9]+|[rR]|[cC])").expect("static pattern"))
}

/// `%Name%` → `Name`; rejects empty names and embedded percent signs.
fn trim_percent(key: &str) -> Option<String> {
    let inner = key.strip_prefix('%')?.strip_suffix('%')?;
    if inner.is_empty() || inner.contains('%') {
        return None;
    }
    Some(inner.to_string())
}

/// Where a Set destination writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum VarKeyKind {
    Variable(String),
    InParam(usize),
    OutParam(usize),
    ReturnValue,
    LoopCounter,
    Invalid,
}

fn detect_var_key(key: &str) -> VarKeyKind {
    if let Some(name) = trim_percent(key) {
        return VarKeyKind::Variable(name);
    }
    let Some(body) = key.strip_prefix('#') else {
        return VarKeyKind::Invalid;
    };
    if body.eq_ignore_ascii_case("r") {
        return VarKeyKind::ReturnValue;
    }
    if body.eq_ignore_ascii_case("c") {
        return VarKeyKind::LoopCounter;
    }
    if let Some(digits) = body.strip_prefix(['o', 'O']) {
        if let Ok(index) = digits.parse::<usize>() {
            if index >= 1 {
                return VarKeyKind::OutParam(index);
            }
        }
        return VarKeyKind::Invalid;
    }
    match body.parse::<usize>() {
        Ok(index) if index >= 1 => VarKeyKind::InParam(index),
        _ => VarKeyKind::Invalid,
    }
}

impl BuildEngine {
    /// Substitutes `#N`, `#oN`, `#r` and `#c` from the current frame.
    /// Unknown in-parameters become empty; tokens without a binding (no
    /// running loop, extended params disabled) stay literal.
    fn expand_section_params(&self, text: &str) -> String {
        let regex = section_param_regex();
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for found in regex.find_iter(text) {
            out.push_str(&text[last..found.start()]);
            let token = found.as_str();
            let body = &token[1..];
            let replaced = if body.eq_ignore_ascii_case("r") {
                if self.compat.disable_extended_section_params {
                    None
                } else {
                    Some(self.return_value.clone())
                }
            } else if body.eq_ignore_ascii_case("c") {
                self.loop_stack.last().map(|state| state.counter_string())
            } else if let Some(digits) = body.strip_prefix(['o', 'O']) {
                if self.compat.disable_extended_section_params {
                    None
                } else {
                    digits
                        .parse::<usize>()
                        .ok()
                        .filter(|index| *index >= 1)
                        .and_then(|index| self.cur_out_params.get(index - 1).cloned())
                }
            } else {
                body.parse::<usize>()
                    .ok()
                    .filter(|index| *index >= 1)
                    .map(|index| self.cur_in_params.get(&index).cloned().unwrap_or_default())
            };
            match replaced {
                Some(value) => out.push_str(&value),
                None => out.push_str(token),
            }
            last = found.end();
        }
        out.push_str(&text[last..]);
        out
    }

    /// Section parameters first, then `%var%` expansion.
    fn expand_all(&self, text: &str) -> Result<String, EngineError> {
        self.vars.expand(&self.expand_section_params(text))
    }
}
