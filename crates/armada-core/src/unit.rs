//! Unit files and unit names.
//!
//! A unit file is an ordered list of `(section, name, value)` options.
//! Duplicate names are kept in order. The hash of a unit file is the
//! SHA-256 of its canonical serialization, so two files with the same
//! options in the same order always hash the same.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{UnitError, UnitResult};

/// Longest unit name accepted by [`validate_unit_name`].
pub const MAX_UNIT_NAME_LEN: usize = 255;

/// A single `Name=Value` line inside a `[Section]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOption {
    pub section: String,
    pub name: String,
    pub value: String,
}

impl UnitOption {
    pub fn new(section: &str, name: &str, value: &str) -> Self {
        Self {
            section: section.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Parsed unit file. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFile {
    options: Vec<UnitOption>,
}

impl UnitFile {
    pub fn from_options(options: Vec<UnitOption>) -> Self {
        Self { options }
    }

    /// Parse unit file text.
    ///
    /// `#` and `;` start comment lines. A trailing backslash continues the
    /// value on the next line, joined with a single space; comment markers
    /// inside a continuation are data. Lines before the first section
    /// header are ignored.
    pub fn parse(raw: &str) -> UnitResult<Self> {
        let mut parser = Parser::default();
        for (idx, line) in raw.lines().enumerate() {
            parser.feed(idx + 1, line)?;
        }
        parser.finish()
    }

    pub fn options(&self) -> &[UnitOption] {
        &self.options
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// All values for `name` in `section`, in file order.
    pub fn values<'a>(&'a self, section: &'a str, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.options
            .iter()
            .filter(move |o| o.section == section && o.name == name)
            .map(|o| o.value.as_str())
    }

    /// Section → name → values view of the options.
    pub fn contents(&self) -> HashMap<String, HashMap<String, Vec<String>>> {
        let mut contents: HashMap<String, HashMap<String, Vec<String>>> = HashMap::new();
        for opt in &self.options {
            contents
                .entry(opt.section.clone())
                .or_default()
                .entry(opt.name.clone())
                .or_default()
                .push(opt.value.clone());
        }
        contents
    }

    /// The `[Unit] Description=` value, if any.
    pub fn description(&self) -> Option<&str> {
        self.values("Unit", "Description").last()
    }

    /// Canonical text form. Consecutive options of the same section share
    /// one header.
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    /// Hex SHA-256 of [`serialize`](Self::serialize).
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.serialize().as_bytes());
        hex::encode(digest)
    }
}

impl fmt::Display for UnitFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current: Option<&str> = None;
        for opt in &self.options {
            if current != Some(opt.section.as_str()) {
                if current.is_some() {
                    writeln!(f)?;
                }
                writeln!(f, "[{}]", opt.section)?;
                current = Some(opt.section.as_str());
            }
            writeln!(f, "{}={}", opt.name, opt.value)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Parser {
    options: Vec<UnitOption>,
    section: Option<String>,
    pending: String,
    pending_line: usize,
}

impl Parser {
    fn feed(&mut self, lineno: usize, raw: &str) -> UnitResult<()> {
        let line = raw.trim();
        let continuing = !self.pending.is_empty();

        if !continuing && (line.starts_with('#') || line.starts_with(';')) {
            return Ok(());
        }

        if let Some(head) = line.strip_suffix('\\') {
            if !continuing {
                self.pending_line = lineno;
            }
            self.pending.push_str(head.trim_end());
            self.pending.push(' ');
            return Ok(());
        }

        if continuing {
            let mut joined = std::mem::take(&mut self.pending);
            joined.push_str(line);
            let at = self.pending_line;
            return self.line(at, joined.trim());
        }

        self.line(lineno, line)
    }

    fn finish(mut self) -> UnitResult<UnitFile> {
        if !self.pending.is_empty() {
            let joined = std::mem::take(&mut self.pending);
            let at = self.pending_line;
            self.line(at, joined.trim())?;
        }
        Ok(UnitFile {
            options: self.options,
        })
    }

    fn line(&mut self, lineno: usize, line: &str) -> UnitResult<()> {
        if line.is_empty() {
            return Ok(());
        }

        if let Some(rest) = line.strip_prefix('[') {
            let Some(name) = rest.strip_suffix(']') else {
                return Err(UnitError::Parse {
                    line: lineno,
                    reason: "unterminated section header".to_string(),
                });
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(UnitError::Parse {
                    line: lineno,
                    reason: "empty section name".to_string(),
                });
            }
            self.section = Some(name.to_string());
            return Ok(());
        }

        let Some(section) = &self.section else {
            return Ok(());
        };

        let Some((name, value)) = line.split_once('=') else {
            return Err(UnitError::Parse {
                line: lineno,
                reason: format!("expected Key=Value, got {line:?}"),
            });
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(UnitError::Parse {
                line: lineno,
                reason: "empty option name".to_string(),
            });
        }

        self.options
            .push(UnitOption::new(section, name, value.trim()));
        Ok(())
    }
}

/// Validate a unit name: non-empty, has a type suffix, no path separators.
pub fn validate_unit_name(name: &str) -> UnitResult<()> {
    let invalid = || UnitError::InvalidName(name.to_string());
    if name.is_empty() || name.len() > MAX_UNIT_NAME_LEN || name.contains('/') {
        return Err(invalid());
    }
    let info = UnitNameInfo::parse(name).ok_or_else(invalid)?;
    if info.prefix.is_empty() {
        return Err(invalid());
    }
    Ok(())
}

/// Components of a unit name such as `web@8080.service`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitNameInfo {
    /// `web@8080.service`
    pub full_name: String,
    /// `web@8080`
    pub name: String,
    /// `web`
    pub prefix: String,
    /// `8080`, empty when the unit is not a template instance.
    pub instance: String,
    /// `.service`
    pub suffix: String,
}

impl UnitNameInfo {
    /// Split a unit name. Returns `None` when it has no `.suffix`.
    pub fn parse(full_name: &str) -> Option<Self> {
        let dot = full_name.rfind('.')?;
        let (name, suffix) = full_name.split_at(dot);
        if name.is_empty() || suffix.len() < 2 {
            return None;
        }
        let (prefix, instance) = match name.split_once('@') {
            Some((p, i)) => (p, i),
            None => (name, ""),
        };
        Some(Self {
            full_name: full_name.to_string(),
            name: name.to_string(),
            prefix: prefix.to_string(),
            instance: instance.to_string(),
            suffix: suffix.to_string(),
        })
    }

    pub fn is_instance(&self) -> bool {
        !self.instance.is_empty()
    }

    /// `prefix@.suffix`, the template this instance was stamped from.
    pub fn template(&self) -> String {
        format!("{}@{}", self.prefix, self.suffix)
    }

    /// Expand `%n`, `%N`, `%p`, `%i` and `%%` in `value`.
    pub fn expand_specifiers(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut chars = value.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push_str(&self.full_name),
                Some('N') => out.push_str(&self.name),
                Some('p') => out.push_str(&self.prefix),
                Some('i') => out.push_str(&self.instance),
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }
}
