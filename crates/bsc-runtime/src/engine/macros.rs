/// Named command aliases. The global dictionary persists for the whole
/// build; the local dictionary is reloaded per script. Lookup prefers the
/// global dictionary, names compare case-insensitively.
#[derive(Debug, Default)]
struct MacroStore {
    global: BTreeMap<String, CommandNode>,
    local: BTreeMap<String, CommandNode>,
}

impl MacroStore {
    fn normalize(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    fn get(&self, name: &str) -> Option<&CommandNode> {
        let key = Self::normalize(name);
        self.global.get(&key).or_else(|| self.local.get(&key))
    }

    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn set(&mut self, name: &str, node: CommandNode, global: bool) {
        let dict = if global { &mut self.global } else { &mut self.local };
        dict.insert(Self::normalize(name), node);
    }

    fn delete(&mut self, name: &str, global: bool) -> bool {
        let dict = if global { &mut self.global } else { &mut self.local };
        dict.remove(&Self::normalize(name)).is_some()
    }

    fn reset_local(&mut self) {
        self.local.clear();
    }

    fn load_local(&mut self, macros: &BTreeMap<String, CommandNode>) {
        for (name, node) in macros {
            self.local.insert(Self::normalize(name), node.clone());
        }
    }

    fn local_dict(&self) -> BTreeMap<String, CommandNode> {
        self.local.clone()
    }

    fn set_local_dict(&mut self, dict: BTreeMap<String, CommandNode>) {
        self.local = dict;
    }
}
