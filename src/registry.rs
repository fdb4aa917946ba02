/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;

/// Deduplicated mapping of observed pathnames to dense integer ids.
///
/// Ids are assigned in insertion order starting from 0; every record that
/// names a file refers to a pathname present here.
#[derive(Debug, Default)]
pub struct FilenameRegistry {
    ids: HashMap<String, i32>,
    names: Vec<String>,
}

impl FilenameRegistry {
    pub fn new() -> Self {
        FilenameRegistry::default()
    }

    /// Id for `path`, assigning the next dense id on first sight.
    pub fn intern(&mut self, path: &str) -> i32 {
        if let Some(id) = self.ids.get(path) {
            return *id;
        }
        let id = self.names.len() as i32;
        self.ids.insert(path.to_owned(), id);
        self.names.push(path.to_owned());
        id
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// `(id, path)` pairs in insertion order.
    pub fn iterate(&self) -> impl Iterator<Item = (i32, &str)> {
        self.names.iter().enumerate().map(|(id, name)| (id as i32, name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_deduplicates() {
        let mut registry = FilenameRegistry::new();
        assert_eq!(0, registry.intern("a"));
        assert_eq!(1, registry.intern("b"));
        assert_eq!(0, registry.intern("a"));
        assert_eq!(2, registry.len());
    }

    #[test]
    fn test_ids_are_dense_and_insertion_ordered() {
        let mut registry = FilenameRegistry::new();
        for name in ["x", "y", "z"] {
            registry.intern(name);
        }
        let pairs: Vec<(i32, &str)> = registry.iterate().collect();
        assert_eq!(vec![(0, "x"), (1, "y"), (2, "z")], pairs);
    }
}
