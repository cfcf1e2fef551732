//! Shared code-synthesis machinery: the per-run `Codegen` driver, function
//! argument helpers, and the directive dump used by `show`.

pub mod clear;
pub mod format;
pub mod parse;
pub mod structure;

use std::cell::RefCell;
use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{Builtin, FuncArg, Member, Type, TypeId, TypeKind};
use crate::table::TypeTable;
use crate::tpl::BlockAssembler;
use crate::writer::CodeWriter;

pub(crate) const T_IF_CONDITION_SINGLE: &str = "
if (${condition})
    ${body}
";

pub(crate) const T_IF_CONDITION_MULTI: &str = "
if (${condition}) {
    ${body}
}
";

pub(crate) const T_LOOP_SINGLE: &str = "
if (def->${counter} > 0) {
    size_t i;
    for (i = 0; i < def->${counter}; i++)
        ${body}
}
";

pub(crate) const T_LOOP_MULTI: &str = "
if (def->${counter} > 0) {
    size_t i;
    for (i = 0; i < def->${counter}; i++) {
        ${body}
    }
}
";

/// One synthesis pass over a frozen type table. The cache memoizes each
/// type's "has any content" predicate, which format emission shares between
/// a type and the aggregates embedding it.
pub struct Codegen<'a> {
    pub table: &'a TypeTable,
    pub(crate) check_cache: RefCell<HashMap<TypeId, Option<String>>>,
}

impl<'a> Codegen<'a> {
    pub fn new(table: &'a TypeTable) -> Codegen<'a> {
        Codegen {
            table,
            check_cache: RefCell::new(HashMap::new()),
        }
    }

    /// Emit all four artifact kinds, each kind over the whole table before
    /// the next, so destinations group structure, clear, parse, format.
    pub fn run(&self, writer: &mut CodeWriter) -> Result<()> {
        for id in self.table.ids() {
            let atype = self.table.expect(id)?;
            if matches!(atype.kind, TypeKind::Struct | TypeKind::Enum) {
                structure::emit(self, writer, atype)?;
            }
        }
        for id in self.table.ids() {
            let atype = self.table.expect(id)?;
            if atype.kind == TypeKind::Struct {
                clear::emit(self, writer, atype)?;
            }
        }
        for id in self.table.ids() {
            let atype = self.table.expect(id)?;
            if atype.kind == TypeKind::Struct {
                parse::emit(self, writer, atype)?;
            }
        }
        for id in self.table.ids() {
            let atype = self.table.expect(id)?;
            if atype.kind == TypeKind::Struct {
                format::emit(self, writer, atype)?;
            }
        }
        Ok(())
    }

    /// Name an unpack type exposes its artifacts under: its parent's.
    pub(crate) fn exposed_name(&self, atype: &Type) -> Result<String> {
        if !atype.unpack {
            return Ok(atype.name.clone());
        }
        let parent = atype.parent.ok_or_else(|| {
            Error::internal(format!(
                "unpack is set on a direct child of a rule at '{}'",
                atype.location
            ))
        })?;
        Ok(self.table.expect(parent)?.name.clone())
    }
}

/// Continuation alignment for a function's argument list.
pub fn align(funcname: &str) -> String {
    " ".repeat(funcname.len() + 1)
}

/// Token a boolean member renders when true and matches on parse. The
/// member override wins over the type's, falling back to the literal the
/// grammar fixed, then to "yes".
pub(crate) fn true_token(member: &Member, mtype: &Type) -> String {
    if !member.truevalue.is_empty() {
        return member.truevalue.clone();
    }
    if !mtype.truevalue.is_empty() {
        return mtype.truevalue.clone();
    }
    match mtype.values.first() {
        Some(value) => value.clone(),
        None => "yes".to_string(),
    }
}

/// Render extra formal parameters from `args` directives: an explicit
/// ctype, or a table type's C mapping.
pub fn formal_args(args: &[FuncArg], table: &TypeTable) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for arg in args {
        let (ctype, gap) = if !arg.ctype.is_empty() {
            (arg.ctype.clone(), " ")
        } else {
            let atype = table.expect_by_location(&arg.type_location)?;
            match atype.kind {
                TypeKind::Builtin(_) => (atype.proto(false), atype.gap()),
                TypeKind::Struct => (atype.name.clone(), " "),
                other => {
                    return Err(Error::internal(format!(
                        "argument '{}' has unsupported type {}",
                        arg.name,
                        other.label()
                    )));
                }
            }
        };
        let name = if arg.pointer {
            format!("*{}", arg.name)
        } else {
            arg.name.clone()
        };
        lines.push(format!("{ctype}{gap}{name}"));
    }
    Ok(lines)
}

/// Actual parameters for a call into a type with extra formal `args`:
/// member-site values win, pointers pass through by name, scalars get a
/// neutral default.
pub fn actual_args(
    formal: &[FuncArg],
    actual: &[FuncArg],
    table: &TypeTable,
) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for arg in formal {
        let supplied = actual
            .iter()
            .find(|a| a.name == arg.name)
            .map(|a| a.value.clone())
            .filter(|v| !v.is_empty());
        if let Some(value) = supplied {
            out.push(value);
        } else if arg.pointer {
            out.push(arg.name.clone());
        } else {
            let atype = table.expect_by_location(&arg.type_location)?;
            let neutral = match atype.kind {
                TypeKind::Builtin(
                    Builtin::Bool | Builtin::BoolYesNo | Builtin::BoolOnOff,
                ) => "false",
                _ => "0",
            };
            out.push(neutral.to_string());
        }
    }
    Ok(out)
}

// ---- directive dump (`show`) ----

/// Drop empty/false/null leaves so the dump only says what was decided.
fn prune(value: &Value) -> Option<Value> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::Array(items) => {
            let kept: Vec<Value> = items.iter().filter_map(prune).collect();
            (!kept.is_empty()).then_some(Value::Array(kept))
        }
        Value::Object(map) => {
            let kept: serde_json::Map<String, Value> = map
                .iter()
                .filter_map(|(k, v)| prune(v).map(|v| (k.clone(), v)))
                .collect();
            (!kept.is_empty()).then(|| Value::Object(kept))
        }
        other => Some(other.clone()),
    }
}

fn compact_member(member: &Member, table: &TypeTable) -> String {
    let mut obj = serde_json::Map::new();
    obj.insert("id".into(), member.id.clone().into());
    if member.name != member.id {
        obj.insert("name".into(), member.name.clone().into());
    }
    if let Some(mtype) = table.get(member.type_id) {
        obj.insert(
            "type".into(),
            format!("{}:{}", mtype.kind.label(), mtype.id.short()).into(),
        );
    }
    let mut rest = serde_json::to_value(member).unwrap_or_default();
    if let Value::Object(map) = &mut rest {
        map.remove("id");
        map.remove("name");
        map.remove("type");
        map.remove("tag");
        for (key, value) in map.iter() {
            if let Some(kept) = prune(value) {
                obj.insert(key.clone(), kept);
            }
        }
    }
    serde_json::to_string(&Value::Object(obj)).unwrap_or_default()
}

/// The resolved directive payload in its comment frame, the way `show`
/// prints it.
pub fn dump_directive(atype: &Type, table: &TypeTable) -> String {
    let mut lines = BlockAssembler::new();
    lines.push(format!("\"id\": \"{}\"", atype.id));
    lines.push(format!("\"meta\": \"{}\"", atype.kind.label()));
    lines.push(format!(
        "\"location\": {}",
        Value::String(atype.location.clone())
    ));
    if !atype.name.is_empty() {
        lines.push(format!("\"name\": {}", Value::String(atype.name.clone())));
    }
    for (key, value) in &atype.payload {
        if matches!(key.as_str(), "id" | "meta" | "location" | "name" | "members") {
            continue;
        }
        if key == "values" && !atype.values.is_empty() {
            continue;
        }
        if let Some(kept) = prune(value) {
            lines.push(format!("\"{key}\": {kept}"));
        }
    }
    if !atype.values.is_empty() {
        let values = Value::Array(atype.values.iter().cloned().map(Into::into).collect());
        lines.push(format!("\"values\": {values}"));
    }
    if !atype.members.is_empty() {
        let rows: Vec<String> = atype
            .members
            .iter()
            .map(|m| format!("    {}", compact_member(m, table)))
            .collect();
        lines.push(format!("\"members\": [\n{}\n  ]", rows.join(",\n")));
    }

    let items = lines.output(",\n");
    let indented: Vec<String> = items
        .lines()
        .map(|l| {
            if l.is_empty() {
                String::new()
            } else {
                format!("  {l}")
            }
        })
        .collect();
    format!("<!-- VIRT:DIRECTIVE {{\n{}\n}} -->", indented.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MemberTag;

    #[test]
    fn actual_args_fill_defaults() {
        let table = TypeTable::new();
        let formal = vec![
            FuncArg {
                name: "flags".into(),
                type_location: "UInt".into(),
                ..Default::default()
            },
            FuncArg {
                name: "partial".into(),
                type_location: "Bool.yes_no".into(),
                ..Default::default()
            },
            FuncArg {
                name: "opaque".into(),
                pointer: true,
                ..Default::default()
            },
        ];
        let supplied = vec![FuncArg {
            name: "flags".into(),
            value: "VIR_NET_PARSE_ALL".into(),
            ..Default::default()
        }];
        let args = actual_args(&formal, &supplied, &table).unwrap();
        assert_eq!(args, vec!["VIR_NET_PARSE_ALL", "false", "opaque"]);
    }

    #[test]
    fn formal_args_use_the_builtin_gap() {
        let table = TypeTable::new();
        let args = vec![
            FuncArg {
                name: "hostname".into(),
                type_location: "String".into(),
                ..Default::default()
            },
            FuncArg {
                name: "count".into(),
                type_location: "UInt".into(),
                ..Default::default()
            },
        ];
        let lines = formal_args(&args, &table).unwrap();
        assert_eq!(lines, vec!["char *hostname", "unsigned int count"]);
    }

    #[test]
    fn dump_frames_the_directive() {
        let mut table = TypeTable::new();
        let string = table.get_by_location("String").unwrap().id;
        let member =
            Member::from_payload(string, "mode", MemberTag::Attribute, &Default::default())
                .unwrap();
        let ctx = {
            let mut c = crate::directive::Ctx::root("net.rng");
            c.define = "forward".into();
            c.nodepath = vec![("forward".into(), ".element".into())];
            c
        };
        let tid = table
            .register(TypeKind::Struct, &ctx, vec![member], vec![])
            .unwrap();
        let dump = dump_directive(table.get(tid).unwrap(), &table);
        assert!(dump.starts_with("<!-- VIRT:DIRECTIVE {"));
        assert!(dump.contains("\"meta\": \"Struct\""));
        assert!(dump.contains("\"location\": \"/net.rng/forward.define/forward.element\""));
        assert!(dump.contains("String:"));
        assert!(dump.ends_with("} -->"));
    }
}
