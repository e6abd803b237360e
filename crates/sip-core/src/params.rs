// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use smol_str::SmolStr;

/// Ordered list of `;name[=value]` parameters attached to a header value or URI.
///
/// Order and original spelling are preserved so that a value copied from a
/// request renders back byte-for-byte. Lookups ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Params(Vec<(SmolStr, Option<SmolStr>)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the text following the first `;` (e.g. `branch=z9hG4bK1;rport`).
    pub fn parse(input: &str) -> Self {
        let mut params = Vec::new();
        for part in input.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((name, value)) => params.push((
                    SmolStr::new(name.trim()),
                    Some(SmolStr::new(value.trim())),
                )),
                None => params.push((SmolStr::new(part), None)),
            }
        }
        Self(params)
    }

    /// Returns the value of a parameter. Flag parameters yield `Some("")`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref().map(|v| v.as_str()).unwrap_or(""))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Replaces the value of an existing parameter in place, or appends it.
    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(SmolStr::new);
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(slot) => slot.1 = value,
            None => self.0.push((SmolStr::new(name), value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Option<SmolStr>> {
        let idx = self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_ref().map(|v| v.as_str())))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Params {
    /// Renders every parameter with its leading `;`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}
