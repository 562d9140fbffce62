use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use regex::Regex;

use crate::error::HarnessError;
use crate::runner::NameResolver;

/// Selects tests by a slash-separated list of regular expressions, one per
/// nesting level, and hands out unique full names.
///
/// `Top/sub` runs when `Top` matches the first element and `sub` the second;
/// levels deeper than the pattern always match. Matching is unanchored.
#[derive(Debug)]
pub struct Matcher {
    filter: Vec<Regex>,
    sub_names: Mutex<HashMap<String, u64>>,
}

impl Matcher {
    /// Build a matcher for `pattern`; an empty pattern selects everything.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Pattern`] if an element is not a valid regex.
    pub fn new(pattern: &str) -> Result<Self, HarnessError> {
        let filter = if pattern.is_empty() {
            Vec::new()
        } else {
            pattern
                .split('/')
                .map(|element| {
                    Regex::new(element).map_err(|source| HarnessError::Pattern {
                        element: element.to_owned(),
                        source,
                    })
                })
                .collect::<Result<_, _>>()?
        };
        Ok(Self {
            filter,
            sub_names: Mutex::new(HashMap::new()),
        })
    }

    /// Whether every element of `name` matches its level of the filter.
    pub fn matches(&self, name: &str) -> bool {
        name.split('/')
            .zip(&self.filter)
            .all(|(element, re)| re.is_match(element))
    }

    /// Reserve a unique full name for `sub` under `parent`. Repeats get a
    /// `#NN` suffix.
    fn unique(&self, parent: &str, sub: &str) -> String {
        let mut names = self.sub_names.lock().unwrap_or_else(PoisonError::into_inner);
        let mut name = if parent.is_empty() {
            sub.to_owned()
        } else {
            format!("{parent}/{sub}")
        };
        let mut empty = sub.is_empty();
        loop {
            let next = names.get(&name).copied();
            match next {
                None if !empty => {
                    names.insert(name.clone(), 1);
                    return name;
                }
                _ => {
                    let next = next.unwrap_or(0);
                    names.insert(name.clone(), next + 1);
                    name = format!("{name}#{next:02}");
                    empty = false;
                }
            }
        }
    }
}

impl NameResolver for Matcher {
    fn full_name(&self, parent: &str, name: &str) -> (String, bool) {
        let full = self.unique(parent, &rewrite(name));
        let ok = self.matches(&full);
        (full, ok)
    }
}

/// Make a subtest name printable: whitespace becomes `_`, other
/// non-printable characters are escaped.
pub fn rewrite(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_whitespace() {
            out.push('_');
        } else if c.is_control() {
            out.extend(c.escape_default());
        } else {
            out.push(c);
        }
    }
    out
}
