//! The search-and-replace modifier.
//!
//! Literal or regex search, first/last/all occurrences, optional full-match
//! anchoring and case-insensitive matching. A non-matching search leaves the
//! value unchanged; search-and-replace never fails a chain.

use regex::Regex;

use crate::error::CompileError;

#[derive(Debug, Clone)]
pub struct SearchReplace {
    mode: Mode,
    replace: String,
    replace_all: bool,
}

#[derive(Debug, Clone)]
enum Mode {
    Literal {
        needle: String,
        case_sensitive: bool,
        full_match: bool,
        from_end: bool,
    },
    Pattern {
        regex: Regex,
        from_end: bool,
    },
}

impl SearchReplace {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn compile(
        search: &str,
        replace: &str,
        regex: bool,
        full_match: bool,
        case_sensitive: bool,
        from_end: bool,
        replace_all: bool,
    ) -> Result<Self, CompileError> {
        let mode = if regex {
            let mut pattern = String::new();
            if !case_sensitive {
                pattern.push_str("(?i)");
            }
            if full_match {
                pattern.push_str(&format!("^(?:{})$", search));
            } else {
                pattern.push_str(search);
            }
            let compiled = Regex::new(&pattern).map_err(|e| CompileError::InvalidRegex {
                pattern: pattern.clone(),
                source: e,
            })?;
            Mode::Pattern { regex: compiled, from_end }
        } else {
            Mode::Literal {
                needle: search.to_string(),
                case_sensitive,
                full_match,
                from_end,
            }
        };
        Ok(Self {
            mode,
            replace: replace.to_string(),
            replace_all,
        })
    }

    pub(crate) fn apply(&self, value: &str) -> String {
        match &self.mode {
            Mode::Literal { needle, case_sensitive, full_match, from_end } => {
                self.apply_literal(value, needle, *case_sensitive, *full_match, *from_end)
            }
            Mode::Pattern { regex, from_end } => {
                if self.replace_all {
                    return regex.replace_all(value, self.replace.as_str()).into_owned();
                }
                if *from_end {
                    return match regex.find_iter(value).last() {
                        Some(m) => {
                            let mut out = String::with_capacity(value.len());
                            out.push_str(&value[..m.start()]);
                            // Re-run on the tail so capture references in the
                            // replacement still expand.
                            out.push_str(
                                &regex.replace(&value[m.start()..], self.replace.as_str()),
                            );
                            out
                        }
                        None => value.to_string(),
                    };
                }
                regex.replace(value, self.replace.as_str()).into_owned()
            }
        }
    }

    fn apply_literal(
        &self,
        value: &str,
        needle: &str,
        case_sensitive: bool,
        full_match: bool,
        from_end: bool,
    ) -> String {
        if needle.is_empty() {
            return value.to_string();
        }
        if full_match {
            let matches = if case_sensitive {
                value == needle
            } else {
                value.eq_ignore_ascii_case(needle)
            };
            return if matches { self.replace.clone() } else { value.to_string() };
        }
        if self.replace_all {
            let mut out = String::with_capacity(value.len());
            let mut rest = value;
            while let Some(pos) = find_literal(rest, needle, case_sensitive, false) {
                out.push_str(&rest[..pos]);
                out.push_str(&self.replace);
                rest = &rest[pos + needle.len()..];
            }
            out.push_str(rest);
            return out;
        }
        match find_literal(value, needle, case_sensitive, from_end) {
            Some(pos) => {
                let mut out = String::with_capacity(value.len());
                out.push_str(&value[..pos]);
                out.push_str(&self.replace);
                out.push_str(&value[pos + needle.len()..]);
                out
            }
            None => value.to_string(),
        }
    }
}

/// Byte offset of the first (or last) occurrence of `needle`.
/// Case-insensitive comparison is ASCII-only, matching header and FQDN use.
fn find_literal(haystack: &str, needle: &str, case_sensitive: bool, from_end: bool) -> Option<usize> {
    if case_sensitive {
        return if from_end { haystack.rfind(needle) } else { haystack.find(needle) };
    }
    if needle.len() > haystack.len() {
        return None;
    }
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    let positions = 0..=haystack.len() - needle.len();
    let matches = |i: &usize| h[*i..*i + n.len()].eq_ignore_ascii_case(n);
    if from_end {
        positions.rev().find(matches)
    } else {
        positions.clone().find(matches)
    }
}
