//! Declarative argument schemas and the structural verifier.
//!
//! A [TypeDef] describes what an endpoint accepts (or returns); [verify]
//! checks a received value against it. The algebra is closed: anything
//! (`Any`), nothing (`Void`), a single kinded value, a positional tuple,
//! or a named record. A nil value is equivalent to an absent one.

use rmpv::Value;

/// Value kinds the verifier distinguishes. Integers and doubles share the
/// `Number` kind. Nil has no kind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Bool,
    Number,
    String,
    Binary,
    List,
    Map,
}

pub fn kind_of(v: &Value) -> Option<Kind> {
    match v {
        Value::Boolean(_) => Some(Kind::Bool),
        Value::Integer(_) | Value::F32(_) | Value::F64(_) => Some(Kind::Number),
        Value::String(_) => Some(Kind::String),
        Value::Binary(_) => Some(Kind::Binary),
        Value::Array(_) => Some(Kind::List),
        Value::Map(_) => Some(Kind::Map),
        _ => None,
    }
}

/// A single positional argument.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ArgDef {
    pub kind: Kind,
    pub required: bool,
}

/// A named record field.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ParamDef {
    pub name: String,
    pub kind: Kind,
    pub required: bool,
}

#[derive(Clone, PartialEq, Debug)]
pub enum TypeDef {
    /// Accept anything, verification always passes.
    Any,
    /// Accept nil, an empty list, or an empty map.
    Void,
    /// A single value of the given kind.
    Arg(ArgDef),
    /// A positional tuple, length-exact.
    List(Vec<ArgDef>),
    /// A named record. Required names must exist, present values must
    /// kind-match.
    Map(Vec<ParamDef>),
}

pub const BOOL: ArgDef = ArgDef { kind: Kind::Bool, required: true };
pub const BOOL_OPT: ArgDef = ArgDef { kind: Kind::Bool, required: false };
pub const NUMBER: ArgDef = ArgDef { kind: Kind::Number, required: true };
pub const NUMBER_OPT: ArgDef = ArgDef { kind: Kind::Number, required: false };
pub const STRING: ArgDef = ArgDef { kind: Kind::String, required: true };
pub const STRING_OPT: ArgDef = ArgDef { kind: Kind::String, required: false };

pub fn arg(kind: Kind, required: bool) -> ArgDef {
    ArgDef { kind, required }
}

pub fn list<I: IntoIterator<Item = ArgDef>>(args: I) -> TypeDef {
    TypeDef::List(args.into_iter().collect())
}

pub fn map<I: IntoIterator<Item = ParamDef>>(params: I) -> TypeDef {
    TypeDef::Map(params.into_iter().collect())
}

pub fn param(name: &str, kind: Kind, required: bool) -> ParamDef {
    ParamDef { name: name.to_string(), kind, required }
}

impl From<ArgDef> for TypeDef {
    #[inline]
    fn from(d: ArgDef) -> Self {
        TypeDef::Arg(d)
    }
}

/// Structural check of a value against a definition. Runs on arguments
/// before dispatch and on single-function results before the response is
/// built.
pub fn verify(value: Option<&Value>, def: &TypeDef) -> bool {
    let value = value.filter(|v| !v.is_nil());
    match def {
        TypeDef::Any => true,
        TypeDef::Void => match value {
            None => true,
            Some(Value::Array(items)) => items.is_empty(),
            Some(Value::Map(entries)) => entries.is_empty(),
            Some(_) => false,
        },
        TypeDef::Arg(d) => verify_arg(value, d),
        TypeDef::List(defs) => match value {
            None => defs.is_empty(),
            Some(Value::Array(items)) => {
                if items.len() != defs.len() {
                    return false;
                }
                items
                    .iter()
                    .zip(defs.iter())
                    .all(|(item, d)| verify_arg(Some(item).filter(|v| !v.is_nil()), d))
            }
            Some(_) => false,
        },
        TypeDef::Map(params) => match value {
            None => params.is_empty(),
            Some(Value::Map(entries)) => params.iter().all(|p| {
                let found = entries
                    .iter()
                    .find(|(k, _)| k.as_str() == Some(p.name.as_str()))
                    .map(|(_, v)| v)
                    .filter(|v| !v.is_nil());
                match found {
                    None => !p.required,
                    Some(v) => kind_of(v) == Some(p.kind),
                }
            }),
            Some(_) => false,
        },
    }
}

fn verify_arg(v: Option<&Value>, def: &ArgDef) -> bool {
    match v {
        None => !def.required,
        Some(v) => kind_of(v) == Some(def.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any() {
        assert!(verify(None, &TypeDef::Any));
        assert!(verify(Some(&Value::from(1i64)), &TypeDef::Any));
        assert!(verify(Some(&Value::Nil), &TypeDef::Any));
    }

    #[test]
    fn test_void_law() {
        // Void accepts exactly nil, the empty list, and the empty map
        assert!(verify(None, &TypeDef::Void));
        assert!(verify(Some(&Value::Nil), &TypeDef::Void));
        assert!(verify(Some(&Value::Array(vec![])), &TypeDef::Void));
        assert!(verify(Some(&Value::Map(vec![])), &TypeDef::Void));
        assert!(!verify(Some(&Value::from(0i64)), &TypeDef::Void));
        assert!(!verify(Some(&Value::Array(vec![Value::Nil])), &TypeDef::Void));
        assert!(!verify(Some(&Value::from("")), &TypeDef::Void));
    }

    #[test]
    fn test_single_arg() {
        let required: TypeDef = STRING.into();
        assert!(verify(Some(&Value::from("x")), &required));
        assert!(!verify(Some(&Value::from(1i64)), &required));
        assert!(!verify(None, &required));

        let optional: TypeDef = STRING_OPT.into();
        assert!(verify(None, &optional));
        assert!(verify(Some(&Value::from("x")), &optional));
        assert!(!verify(Some(&Value::from(true)), &optional));

        // integers and doubles share the Number kind
        let num: TypeDef = NUMBER.into();
        assert!(verify(Some(&Value::from(2i64)), &num));
        assert!(verify(Some(&Value::from(2.5f64)), &num));
    }

    #[test]
    fn test_list_exact_length() {
        let def = list([STRING, STRING]);
        let ok = Value::Array(vec![Value::from("Alex"), Value::from("Shu")]);
        assert!(verify(Some(&ok), &def));
        let short = Value::Array(vec![Value::from("Alex")]);
        assert!(!verify(Some(&short), &def));
        let long = Value::Array(vec![Value::from("a"), Value::from("b"), Value::from("c")]);
        assert!(!verify(Some(&long), &def));
        let wrong = Value::Array(vec![Value::from("Alex"), Value::from(1i64)]);
        assert!(!verify(Some(&wrong), &def));
        assert!(!verify(None, &def));
        assert!(verify(None, &list([])));

        let with_opt = list([STRING, NUMBER_OPT]);
        let holey = Value::Array(vec![Value::from("Alex"), Value::Nil]);
        assert!(verify(Some(&holey), &with_opt));
    }

    #[test]
    fn test_map_params() {
        let def = map([param("name", Kind::String, true), param("age", Kind::Number, false)]);
        let full = Value::Map(vec![
            (Value::from("name"), Value::from("Bob")),
            (Value::from("age"), Value::from(42i64)),
        ]);
        assert!(verify(Some(&full), &def));
        // optional absent passes
        let partial = Value::Map(vec![(Value::from("name"), Value::from("Bob"))]);
        assert!(verify(Some(&partial), &def));
        // required absent fails
        let missing = Value::Map(vec![(Value::from("age"), Value::from(42i64))]);
        assert!(!verify(Some(&missing), &def));
        // present but wrong kind fails
        let wrong = Value::Map(vec![
            (Value::from("name"), Value::from(1i64)),
            (Value::from("age"), Value::from(42i64)),
        ]);
        assert!(!verify(Some(&wrong), &def));
        // not a map at all
        assert!(!verify(Some(&Value::from("Bob")), &def));
    }
}
