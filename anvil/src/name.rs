// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! [`Name`]: the untyped parse result a buildfile statement yields before
//! variable assignment converts it to a typed [`crate::value::Value`] (spec
//! §3 "Name").

use crate::path::Dir;

/// An untyped name, as produced by the buildfile parser: `project%dir/type{value}`
/// with an optional pair separator for two-part names like `foo.hxx{foo .cxx}`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Name {
    pub project: Option<String>,
    pub dir: Dir,
    pub typ: Option<String>,
    pub value: String,
    pub pair: Option<char>,
}

impl Name {
    pub fn simple(value: impl Into<String>) -> Self {
        Self {
            project: None,
            dir: Dir::new("."),
            typ: None,
            value: value.into(),
            pair: None,
        }
    }

    pub fn qualified(typ: impl Into<String>, dir: Dir, value: impl Into<String>) -> Self {
        Self {
            project: None,
            dir,
            typ: Some(typ.into()),
            value: value.into(),
            pair: None,
        }
    }

    pub fn is_a(&self, typ: &str) -> bool {
        self.typ.as_deref() == Some(typ)
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(project) = &self.project {
            write!(f, "{project}%")?;
        }
        write!(f, "{}", self.dir.as_key())?;
        if let Some(typ) = &self.typ {
            write!(f, "{typ}{{{}}}", self.value)
        } else {
            write!(f, "{}", self.value)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_simple_name() {
        let n = Name::simple("foo.o");
        assert_eq!(n.to_string(), "./foo.o");
    }

    #[test]
    fn display_typed_name() {
        let n = Name::qualified("obj", Dir::new("src"), "foo");
        assert_eq!(n.to_string(), "src/obj{foo}");
    }
}
