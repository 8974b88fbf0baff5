use std::collections::HashMap;

/// Insertion-ordered string intern table for one encode pass.
///
/// Index 0 is always the empty string, as the pprof wire format requires
/// `string_table[0] == ""`. A table is built fresh for every encode call and
/// never shared across profiles.
#[derive(Debug)]
pub struct StringTable {
    indexes: HashMap<String, i64>,
    strings: Vec<String>,
}

impl StringTable {
    pub fn new() -> Self {
        let mut table = StringTable {
            indexes: HashMap::new(),
            strings: Vec::new(),
        };
        table.index("");
        table
    }

    /// Returns the index for `token`, interning it on first sight.
    pub fn index(&mut self, token: &str) -> i64 {
        if let Some(index) = self.indexes.get(token) {
            return *index;
        }

        let index = self.strings.len() as i64;
        self.indexes.insert(token.to_owned(), index);
        self.strings.push(token.to_owned());
        index
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// All interned strings, in insertion order.
    pub fn into_strings(self) -> Vec<String> {
        self.strings
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}
