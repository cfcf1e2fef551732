//! The resolved type model: builtins, members, aggregate types, and the
//! homogeneous node lists the grammar walker trades in.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use xxhash_rust::xxh64::xxh64;

use crate::directive::{deep_merge, Payload};
use crate::error::{Error, Result};
use crate::table::TypeTable;

// ---- type identity ----

/// Content-derived type id: a 64-bit hash of the type's location string.
/// Stable across runs and hosts, so generated artifacts never churn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TypeId(u64);

impl TypeId {
    pub fn of(location: &str) -> TypeId {
        TypeId(xxh64(location.as_bytes(), 0))
    }

    pub fn hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    /// Leftmost 8 hex digits, the form shown by `list` and accepted as a
    /// partial id.
    pub fn short(&self) -> String {
        self.hex()[..8].to_string()
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ---- builtins ----

/// Scalar leaf types with fixed C mappings. `Chars`/`UChars` are inline
/// buffers, everything else is a plain scalar or pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    PVoid,
    String,
    ConstString,
    Bool,
    BoolYesNo,
    BoolOnOff,
    Chars,
    UChars,
    Int,
    UInt,
    ULong,
    ULongLegacy,
    U8,
    U32,
    Time,
}

impl Builtin {
    pub const ALL: &'static [Builtin] = &[
        Builtin::PVoid,
        Builtin::String,
        Builtin::ConstString,
        Builtin::Bool,
        Builtin::BoolYesNo,
        Builtin::BoolOnOff,
        Builtin::Chars,
        Builtin::UChars,
        Builtin::Int,
        Builtin::UInt,
        Builtin::ULong,
        Builtin::ULongLegacy,
        Builtin::U8,
        Builtin::U32,
        Builtin::Time,
    ];

    /// Canonical name, also the builtin's location string.
    pub fn name(self) -> &'static str {
        match self {
            Builtin::PVoid => "PVoid",
            Builtin::String => "String",
            Builtin::ConstString => "ConstString",
            Builtin::Bool => "Bool",
            Builtin::BoolYesNo => "Bool.yes_no",
            Builtin::BoolOnOff => "Bool.on_off",
            Builtin::Chars => "Chars",
            Builtin::UChars => "UChars",
            Builtin::Int => "Int",
            Builtin::UInt => "UInt",
            Builtin::ULong => "ULong",
            Builtin::ULongLegacy => "ULongLegacy",
            Builtin::U8 => "U8",
            Builtin::U32 => "U32",
            Builtin::Time => "Time",
        }
    }

    /// Resolve a canonical name, a camelized RELAX-NG datatype, or one of
    /// the datatype aliases.
    pub fn parse(name: &str) -> Option<Builtin> {
        for b in Builtin::ALL {
            if b.name() == name {
                return Some(*b);
            }
        }
        match name {
            "Integer" => Some(Builtin::Int),
            "UnsignedInt" | "PositiveInteger" => Some(Builtin::UInt),
            "UnsignedLong" => Some(Builtin::ULong),
            _ => None,
        }
    }

    pub fn ctype(self) -> &'static str {
        match self {
            Builtin::PVoid => "void *",
            Builtin::String => "char *",
            Builtin::ConstString => "const char *",
            Builtin::Bool | Builtin::BoolYesNo | Builtin::BoolOnOff => "bool",
            Builtin::Chars => "char",
            Builtin::UChars => "unsigned char",
            Builtin::Int => "int",
            Builtin::UInt => "unsigned int",
            Builtin::ULong => "unsigned long long",
            Builtin::ULongLegacy => "unsigned long",
            Builtin::U8 => "uint8_t",
            Builtin::U32 => "uint32_t",
            Builtin::Time => "time_t",
        }
    }

    /// Separator between the C type and the field name. Pointer ctypes
    /// already end with `*` and take none.
    pub fn gap(self) -> &'static str {
        match self {
            Builtin::PVoid | Builtin::String | Builtin::ConstString => "",
            _ => " ",
        }
    }

    /// printf layout used when the member is formatted as an attribute.
    pub fn fmt(self) -> &'static str {
        match self {
            Builtin::Int => "%d",
            Builtin::UInt | Builtin::U8 | Builtin::U32 => "%u",
            Builtin::ULong => "%llu",
            Builtin::ULongLegacy => "%lu",
            _ => "%s",
        }
    }

    /// String-to-value conversion template, where one exists. Slots:
    /// `${mdvar}` raw string variable, `${name}` target field.
    pub fn conv(self) -> Option<&'static str> {
        match self {
            Builtin::Chars => Some("virStrcpyStatic(def->${name}, ${name}Str)"),
            Builtin::UChars => Some("virStrcpyStatic((char *)def->${name}, ${mdvar})"),
            Builtin::Int => Some("virStrToLong_i(${mdvar}, NULL, 0, &def->${name})"),
            Builtin::UInt => Some("virStrToLong_uip(${mdvar}, NULL, 0, &def->${name})"),
            Builtin::ULong => Some("virStrToLong_ullp(${mdvar}, NULL, 0, &def->${name})"),
            Builtin::ULongLegacy => Some("virStrToLong_ulp(${mdvar}, NULL, 0, &def->${name})"),
            Builtin::U8 => Some("virStrToLong_u8p(${mdvar}, NULL, 0, &def->${name})"),
            Builtin::U32 => Some("virStrToLong_uip(${mdvar}, NULL, 0, &def->${name})"),
            Builtin::Time => Some("virStrToTime(${mdvar}, &def->${name})"),
            _ => None,
        }
    }

    /// Boolean token pair rendered on format and compared on parse.
    pub fn tokens(self) -> Option<(&'static str, &'static str)> {
        match self {
            Builtin::BoolYesNo => Some(("yes", "no")),
            Builtin::BoolOnOff => Some(("on", "off")),
            _ => None,
        }
    }
}

// ---- member model ----

/// Grammar position a member was derived from. `Virtual` members come from
/// struct-level directives and have no wire representation of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberTag {
    Attribute,
    Element,
    #[default]
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hint {
    New,
    Unpack,
    Pack,
    Union,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FuncArg {
    pub name: String,
    #[serde(rename = "type")]
    pub type_location: String,
    pub ctype: String,
    pub pointer: bool,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseOpts {
    pub disable: bool,
    pub default: String,
    pub instname: String,
    pub post: bool,
    pub args: Vec<FuncArg>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOpts {
    pub disable: bool,
    pub nocheck: bool,
    pub precheck: String,
    pub fmt: String,
    /// Feature-bitmask gate: `FLAG` ANDs onto the inclusion guard,
    /// `%FLAG` replaces it, `!FLAG` negates the test, `_ALWAYS_` drops
    /// the guard entirely.
    pub flag: String,
    pub args: Vec<FuncArg>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeclareOpts {
    pub comment: String,
}

/// One field of an aggregate type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Member {
    /// Serialized tag or attribute name.
    pub id: String,
    /// C field name; defaults to the id.
    pub name: String,
    pub tag: MemberTag,
    #[serde(skip)]
    pub type_id: TypeId,
    #[serde(rename = "type")]
    pub type_location: String,
    pub hint: Option<Hint>,
    pub more: bool,
    pub opt: bool,
    pub pointer: bool,
    pub specified: bool,
    /// Token rendered for a plain Bool when true ("yes" unless overridden).
    pub truevalue: String,
    pub parse: ParseOpts,
    pub format: FormatOpts,
    pub declare: DeclareOpts,
}

impl Member {
    /// Build a member from a grammar node's merged directive payload.
    /// Unknown (type-level) keys in the payload are ignored here.
    pub fn from_payload(
        type_id: TypeId,
        id: &str,
        tag: MemberTag,
        payload: &Payload,
    ) -> Result<Member> {
        let mut member: Member = serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| Error::internal(format!("member '{id}': {e}")))?;
        member.id = id.to_string();
        member.name = member.id.clone();
        member.tag = tag;
        member.type_id = type_id;
        Ok(member)
    }

    /// Apply a struct-level member override: deep merge at the JSON level,
    /// then re-materialize. The type binding never changes here.
    pub fn merged(&self, payload: &Payload) -> Result<Member> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| Error::internal(format!("member '{}': {e}", self.id)))?;
        if let Value::Object(obj) = &mut value {
            deep_merge(obj, payload);
        }
        let mut merged: Member = serde_json::from_value(value)
            .map_err(|e| Error::internal(format!("member '{}': {e}", self.id)))?;
        merged.type_id = self.type_id;
        Ok(merged)
    }
}

// ---- aggregate types ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Builtin(Builtin),
    Struct,
    Enum,
    Constant,
}

impl TypeKind {
    pub fn parse(name: &str) -> Option<TypeKind> {
        match name {
            "Struct" => Some(TypeKind::Struct),
            "Enum" => Some(TypeKind::Enum),
            "Constant" => Some(TypeKind::Constant),
            _ => Builtin::parse(name).map(TypeKind::Builtin),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TypeKind::Builtin(b) => b.name(),
            TypeKind::Struct => "Struct",
            TypeKind::Enum => "Enum",
            TypeKind::Constant => "Constant",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureOpts {
    pub output: String,
    /// Enum default value name (ordinal zero).
    pub default: String,
    /// Array length expression for `Chars`/`UChars` buffers.
    pub size: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearOpts {
    pub name: String,
    pub output: String,
    pub disable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseFuncOpts {
    pub name: String,
    pub output: String,
    /// Node-relative reads only; drop the XPath context argument.
    pub noctxt: bool,
    /// Thread an instance name through for error messages.
    pub instname: bool,
    /// Pass the enclosing definition as `parentdef`.
    pub parent: bool,
    /// Invoke a hand-written `<name>Post` hook after the generated body.
    pub post: bool,
    /// Post hook does not receive the temp variables.
    pub notmpvars: bool,
    pub args: Vec<FuncArg>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatFuncOpts {
    pub name: String,
    pub output: String,
    /// Member ids in emission order; unlisted members keep traversal order.
    pub order: Vec<String>,
    /// Suppress the all-elements-empty self-close short circuit.
    pub noshorthand: bool,
    pub args: Vec<FuncArg>,
}

/// A resolved type: a builtin instance, a Struct, an Enum, or a Constant
/// awaiting promotion. Immutable once the walk completes, except for the
/// parent links mended afterwards.
#[derive(Debug, Clone)]
pub struct Type {
    pub id: TypeId,
    pub kind: TypeKind,
    pub location: String,
    /// C type name. Empty for anonymous builtin instances.
    pub name: String,
    /// Grammar document and rule the type derives from.
    pub rng: String,
    pub define: String,
    pub values: Vec<String>,
    pub members: Vec<Member>,
    pub unpack: bool,
    pub pack: bool,
    /// Union field name when the type backs a tagged-union choice.
    pub union_name: String,
    pub namespace: bool,
    pub truevalue: String,
    pub structure: StructureOpts,
    pub clearfunc: ClearOpts,
    pub parsefunc: ParseFuncOpts,
    pub formatfunc: FormatFuncOpts,
    /// Resolved directive payload, kept verbatim for `show`.
    pub payload: Payload,
    /// Owning aggregate, filled in by parent mending.
    pub parent: Option<TypeId>,
}

impl Type {
    pub fn builtin(&self) -> Option<Builtin> {
        match self.kind {
            TypeKind::Builtin(b) => Some(b),
            _ => None,
        }
    }

    /// Anonymous builtins declare through their fixed ctype; named types
    /// through the name.
    pub fn anonymous_builtin(&self) -> Option<Builtin> {
        match self.kind {
            TypeKind::Builtin(b) if self.name.is_empty() => Some(b),
            _ => None,
        }
    }

    /// Fixed C type for unnamed scalar leaves. Constants declare as plain
    /// bool flags.
    fn anon_ctype(&self) -> Option<&'static str> {
        if !self.name.is_empty() {
            return None;
        }
        match self.kind {
            TypeKind::Builtin(b) => Some(b.ctype()),
            TypeKind::Constant => Some("bool"),
            _ => None,
        }
    }

    pub fn pointer_decl(&self) -> String {
        match self.anon_ctype() {
            Some(ctype) => format!("{ctype}*"),
            None => format!("{}Ptr", self.name),
        }
    }

    pub fn proto(&self, pointer: bool) -> String {
        if let Some(ctype) = self.anon_ctype() {
            return ctype.to_string();
        }
        if self.kind == TypeKind::Struct && pointer {
            return format!("{}Ptr", self.name);
        }
        self.name.clone()
    }

    pub fn gap(&self) -> &'static str {
        match self.anon_ctype() {
            Some(ctype) if ctype.ends_with('*') => "",
            Some(_) => " ",
            None => " ",
        }
    }

    pub fn clear_name(&self) -> Option<String> {
        if !self.clearfunc.name.is_empty() {
            return Some(self.clearfunc.name.clone());
        }
        if self.name.is_empty() {
            return None;
        }
        Some(format!("{}Clear", self.name))
    }

    pub fn parse_name(&self) -> String {
        if !self.parsefunc.name.is_empty() {
            return self.parsefunc.name.clone();
        }
        format!("{}ParseXML", self.name)
    }

    pub fn format_name(&self) -> String {
        if !self.formatfunc.name.is_empty() {
            return self.formatfunc.name.clone();
        }
        format!("{}FormatBuf", self.name)
    }

    /// Pack and union types only exist embedded in their host.
    pub fn embedded_only(&self) -> bool {
        self.pack || !self.union_name.is_empty()
    }
}

// ---- node lists ----

/// What a grammar subtree evaluates to.
#[derive(Debug, Clone)]
pub enum Node {
    Member(Member),
    Type(TypeId),
    Value(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Member,
    Builtin,
    Enum,
    Constant,
    Struct,
    Value,
}

impl NodeKind {
    fn label(self) -> &'static str {
        match self {
            NodeKind::Member => "Member",
            NodeKind::Builtin => "Builtin",
            NodeKind::Enum => "Enum",
            NodeKind::Constant => "Constant",
            NodeKind::Struct => "Struct",
            NodeKind::Value => "Value",
        }
    }
}

/// Homogeneous evaluation result of a subtree. Pushing enforces the
/// homogeneity invariant and performs member/builtin coalescing.
#[derive(Debug, Clone, Default)]
pub struct NodeList {
    nodes: Vec<Node>,
}

impl NodeList {
    pub fn new() -> NodeList {
        NodeList::default()
    }

    pub fn single(node: Node) -> NodeList {
        NodeList { nodes: vec![node] }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Node> {
        self.nodes.iter_mut()
    }

    fn kind_of(node: &Node, table: &TypeTable) -> Result<NodeKind> {
        Ok(match node {
            Node::Member(_) => NodeKind::Member,
            Node::Value(_) => NodeKind::Value,
            Node::Type(tid) => match table.expect(*tid)?.kind {
                TypeKind::Builtin(_) => NodeKind::Builtin,
                TypeKind::Enum => NodeKind::Enum,
                TypeKind::Constant => NodeKind::Constant,
                TypeKind::Struct => NodeKind::Struct,
            },
        })
    }

    pub fn uniform(&self, table: &TypeTable) -> Result<Option<NodeKind>> {
        match self.nodes.first() {
            Some(node) => Ok(Some(Self::kind_of(node, table)?)),
            None => Ok(None),
        }
    }

    pub fn push(&mut self, node: Node, table: &mut TypeTable, site: &str) -> Result<()> {
        let kind = Self::kind_of(&node, table)?;
        let Some(uniform) = self.uniform(table)? else {
            self.nodes.push(node);
            return Ok(());
        };
        if uniform != kind {
            return Err(Error::directive(
                format!("node list mixes {} and {}", uniform.label(), kind.label()),
                site,
            ));
        }

        match (&node, uniform) {
            (Node::Member(incoming), NodeKind::Member) => {
                for cur in &mut self.nodes {
                    let Node::Member(cur) = cur else { unreachable!() };
                    if cur.id == incoming.id && cur.more == incoming.more {
                        if cur.name == incoming.name {
                            cur.opt = cur.opt || incoming.opt;
                            return Ok(());
                        }
                    }
                }
                self.nodes.push(node);
            }
            (Node::Type(incoming), NodeKind::Builtin) => {
                let incoming = *incoming;
                if self.nodes.len() != 1 {
                    return Err(Error::internal(format!(
                        "several builtin alternatives at {site}"
                    )));
                }
                let Node::Type(cur) = self.nodes[0] else { unreachable!() };
                if cur == incoming {
                    return Ok(());
                }
                // String always loses to the more specific builtin.
                let cur_is_string =
                    table.expect(cur)?.builtin() == Some(Builtin::String);
                let incoming_is_string =
                    table.expect(incoming)?.builtin() == Some(Builtin::String);
                if cur_is_string && !incoming_is_string {
                    table.remove(cur);
                    self.nodes[0] = Node::Type(incoming);
                } else {
                    table.remove(incoming);
                }
            }
            _ => self.nodes.push(node),
        }
        Ok(())
    }

    pub fn extend(&mut self, other: NodeList, table: &mut TypeTable, site: &str) -> Result<()> {
        for node in other.nodes {
            self.push(node, table, site)?;
        }
        Ok(())
    }

    pub fn only_one(&self) -> Result<&Node> {
        match self.nodes.as_slice() {
            [node] => Ok(node),
            _ => Err(Error::internal(format!(
                "expected exactly one node, got {}",
                self.nodes.len()
            ))),
        }
    }

    pub fn into_members(self) -> Result<Vec<Member>> {
        self.nodes
            .into_iter()
            .map(|node| match node {
                Node::Member(m) => Ok(m),
                _ => Err(Error::internal("expected a member node")),
            })
            .collect()
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }
}

impl IntoIterator for NodeList {
    type Item = Node;
    type IntoIter = std::vec::IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

/// Replace every member whose type is an unpack Struct by that Struct's own
/// flattened members. Reaches a fixed point in one pass.
pub fn flatten_members(members: &[Member], table: &TypeTable) -> Result<Vec<Member>> {
    let mut ret: Vec<Member> = Vec::new();
    for member in members {
        let mtype = table.expect(member.type_id)?;
        if mtype.kind == TypeKind::Struct && mtype.unpack {
            for inner in flatten_members(&mtype.members, table)? {
                coalesce_member(&mut ret, inner);
            }
        } else {
            coalesce_member(&mut ret, member.clone());
        }
    }
    Ok(ret)
}

/// Same-id, same-arity members fold into one (`opt` is OR-ed).
pub fn coalesce_member(list: &mut Vec<Member>, incoming: Member) {
    for cur in list.iter_mut() {
        if cur.id == incoming.id && cur.more == incoming.more && cur.name == incoming.name {
            cur.opt = cur.opt || incoming.opt;
            return;
        }
    }
    list.push(incoming);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_ids_are_run_stable() {
        let a = TypeId::of("/net.rng/mtu.define/mtu.element");
        let b = TypeId::of("/net.rng/mtu.define/mtu.element");
        assert_eq!(a, b);
        assert_eq!(a.hex().len(), 16);
        assert_eq!(a.short(), a.hex()[..8]);
        assert_ne!(a, TypeId::of("/net.rng/mtu.define"));
    }

    #[test]
    fn builtin_aliases_resolve() {
        assert_eq!(Builtin::parse("UnsignedInt"), Some(Builtin::UInt));
        assert_eq!(Builtin::parse("PositiveInteger"), Some(Builtin::UInt));
        assert_eq!(Builtin::parse("Integer"), Some(Builtin::Int));
        assert_eq!(Builtin::parse("UnsignedLong"), Some(Builtin::ULong));
        assert_eq!(Builtin::parse("Bool.on_off"), Some(Builtin::BoolOnOff));
        assert_eq!(Builtin::parse("bogus"), None);
    }

    #[test]
    fn builtin_descriptors() {
        assert_eq!(Builtin::String.ctype(), "char *");
        assert_eq!(Builtin::String.gap(), "");
        assert_eq!(Builtin::UInt.fmt(), "%u");
        assert!(Builtin::UInt.conv().unwrap().contains("virStrToLong_uip"));
        assert_eq!(Builtin::BoolYesNo.tokens(), Some(("yes", "no")));
        assert_eq!(Builtin::String.conv(), None);
    }

    #[test]
    fn member_from_payload_ignores_type_level_keys() {
        let payload = json!({
            "opt": true,
            "pointer": true,
            "parse": { "default": "0" },
            "parsefunc": { "noctxt": true }
        });
        let member = Member::from_payload(
            TypeId::of("UInt"),
            "mtu",
            MemberTag::Element,
            payload.as_object().unwrap(),
        )
        .unwrap();
        assert_eq!(member.name, "mtu");
        assert!(member.opt && member.pointer);
        assert_eq!(member.parse.default, "0");
        assert_eq!(member.tag, MemberTag::Element);
    }

    #[test]
    fn merged_override_keeps_type_binding() {
        let tid = TypeId::of("String");
        let base = Member::from_payload(
            tid,
            "mode",
            MemberTag::Attribute,
            &Default::default(),
        )
        .unwrap();
        let over = json!({ "name": "fwdMode", "specified": true });
        let merged = base.merged(over.as_object().unwrap()).unwrap();
        assert_eq!(merged.name, "fwdMode");
        assert_eq!(merged.id, "mode");
        assert!(merged.specified);
        assert_eq!(merged.type_id, tid);
    }
}
