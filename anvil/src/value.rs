// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Typed [`Value`]s and the `untypify` reversal back to [`Name`]/`Vec<Name>`
//! that variable override composition relies on.

use indexmap::IndexMap;
use std::fmt;

use crate::name::Name;
use crate::path::{Dir, Path};

/// A target triplet, e.g. `x86_64-linux-gnu`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Triplet {
    pub arch: String,
    pub vendor: String,
    pub system: String,
}

impl fmt::Display for Triplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.arch, self.vendor, self.system)
    }
}

impl std::str::FromStr for Triplet {
    type Err = TripletParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');
        let arch = parts.next().ok_or(TripletParseError)?.to_owned();
        let vendor = parts.next().ok_or(TripletParseError)?.to_owned();
        let system = parts.next().ok_or(TripletParseError)?.to_owned();
        Ok(Triplet { arch, vendor, system })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed target triplet, expected arch-vendor-system")]
pub struct TripletParseError;

/// The type tag accompanying a [`Value`], used both for declared-type
/// checking on assignment and for `untypify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TypeTag {
    Bool,
    Int64,
    UInt64,
    String,
    Path,
    Dir,
    AbsDir,
    Name,
    NameList,
    Strings,
    Paths,
    Dirs,
    Triplet,
    ProjectName,
    Json,
    Map,
}

/// A typed value. The `Null` variant is distinct from e.g. an empty string:
/// it is what an unset-but-declared variable reads as.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    String(String),
    Path(Path),
    Dir(Dir),
    AbsDir(Dir),
    Name(Name),
    NameList(Vec<Name>),
    Strings(Vec<String>),
    Paths(Vec<Path>),
    Dirs(Vec<Dir>),
    Triplet(Triplet),
    ProjectName(String),
    Json(serde_json::Value),
    Map(IndexMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_tag(&self) -> Option<TypeTag> {
        Some(match self {
            Value::Null => return None,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int64,
            Value::UInt(_) => TypeTag::UInt64,
            Value::String(_) => TypeTag::String,
            Value::Path(_) => TypeTag::Path,
            Value::Dir(_) => TypeTag::Dir,
            Value::AbsDir(_) => TypeTag::AbsDir,
            Value::Name(_) => TypeTag::Name,
            Value::NameList(_) => TypeTag::NameList,
            Value::Strings(_) => TypeTag::Strings,
            Value::Paths(_) => TypeTag::Paths,
            Value::Dirs(_) => TypeTag::Dirs,
            Value::Triplet(_) => TypeTag::Triplet,
            Value::ProjectName(_) => TypeTag::ProjectName,
            Value::Json(_) => TypeTag::Json,
            Value::Map(_) => TypeTag::Map,
        })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            Value::Strings(s) => Some(s),
            _ => None,
        }
    }

    /// `untypify`: reverse a typed value back to its untyped `Name`
    /// representation(s), the form override composition (`=+`/`+=`)
    /// operates on. This is a total function over every variant, per spec
    /// §3.
    pub fn untypify(&self) -> Vec<Name> {
        match self {
            Value::Null => vec![],
            Value::Bool(b) => vec![Name::simple(b.to_string())],
            Value::Int(i) => vec![Name::simple(i.to_string())],
            Value::UInt(u) => vec![Name::simple(u.to_string())],
            Value::String(s) => vec![Name::simple(s.clone())],
            Value::Path(p) => vec![Name::simple(p.to_string())],
            Value::Dir(d) | Value::AbsDir(d) => vec![Name::simple(d.as_key())],
            Value::Name(n) => vec![n.clone()],
            Value::NameList(ns) => ns.clone(),
            Value::Strings(ss) => ss.iter().cloned().map(Name::simple).collect(),
            Value::Paths(ps) => ps.iter().map(|p| Name::simple(p.to_string())).collect(),
            Value::Dirs(ds) => ds.iter().map(|d| Name::simple(d.as_key())).collect(),
            Value::Triplet(t) => vec![Name::simple(t.to_string())],
            Value::ProjectName(p) => vec![Name::simple(p.clone())],
            Value::Json(j) => vec![Name::simple(j.to_string())],
            Value::Map(m) => m.keys().cloned().map(Name::simple).collect(),
        }
    }

    /// Coerce a list of untyped names back into a typed value of the given
    /// tag, the counterpart of `untypify` used when composing an override
    /// back onto an original.
    pub fn typify(names: &[Name], tag: TypeTag) -> Result<Value, TypeError> {
        let joined = || names.iter().map(|n| n.value.clone()).collect::<Vec<_>>();
        Ok(match tag {
            TypeTag::Bool => {
                let one = single(names, tag)?;
                Value::Bool(one.value.parse().map_err(|_| TypeError::Coerce(tag))?)
            }
            TypeTag::Int64 => {
                let one = single(names, tag)?;
                Value::Int(one.value.parse().map_err(|_| TypeError::Coerce(tag))?)
            }
            TypeTag::UInt64 => {
                let one = single(names, tag)?;
                Value::UInt(one.value.parse().map_err(|_| TypeError::Coerce(tag))?)
            }
            TypeTag::String => Value::String(single(names, tag)?.value.clone()),
            TypeTag::Path => Value::Path(Path::new(single(names, tag)?.value.clone())),
            TypeTag::Dir => Value::Dir(Dir::new(single(names, tag)?.value.clone())),
            TypeTag::AbsDir => {
                let dir = Dir::new(single(names, tag)?.value.clone());
                if !dir.is_absolute() {
                    return Err(TypeError::NotAbsolute);
                }
                Value::AbsDir(dir)
            }
            TypeTag::Name => Value::Name(single(names, tag)?.clone()),
            TypeTag::NameList => Value::NameList(names.to_vec()),
            TypeTag::Strings => Value::Strings(joined()),
            TypeTag::Paths => Value::Paths(names.iter().map(|n| Path::new(n.value.clone())).collect()),
            TypeTag::Dirs => Value::Dirs(names.iter().map(|n| Dir::new(n.value.clone())).collect()),
            TypeTag::Triplet => {
                let one = single(names, tag)?;
                Value::Triplet(one.value.parse().map_err(|_| TypeError::Coerce(tag))?)
            }
            TypeTag::ProjectName => Value::ProjectName(single(names, tag)?.value.clone()),
            TypeTag::Json => {
                let one = single(names, tag)?;
                Value::Json(serde_json::from_str(&one.value).map_err(|_| TypeError::Coerce(tag))?)
            }
            TypeTag::Map => return Err(TypeError::Coerce(tag)),
        })
    }
}

fn single(names: &[Name], tag: TypeTag) -> Result<&Name, TypeError> {
    match names {
        [one] => Ok(one),
        _ => Err(TypeError::Arity(tag)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    #[error("{0} expects exactly one value")]
    Arity(TypeTag),
    #[error("value is not a directory path")]
    NotAbsolute,
    #[error("could not coerce names to {0}")]
    Coerce(TypeTag),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn untypify_strings_roundtrips_through_typify() {
        let v = Value::Strings(vec!["-O2".into(), "-g".into()]);
        let names = v.untypify();
        let back = Value::typify(&names, TypeTag::Strings).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn untypify_null_is_empty() {
        assert_eq!(Value::Null.untypify(), vec![]);
    }

    #[test]
    fn triplet_parses() {
        let t: Triplet = "x86_64-unknown-linux".parse().unwrap();
        assert_eq!(t.to_string(), "x86_64-unknown-linux");
    }

    #[test]
    fn abs_dir_rejects_relative() {
        let names = vec![Name::simple("rel/path")];
        let err = Value::typify(&names, TypeTag::AbsDir).unwrap_err();
        assert!(matches!(err, TypeError::NotAbsolute));
    }
}
