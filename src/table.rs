//! Content-addressed type table: every aggregate or scalar instance the
//! walker discovers, keyed by the hash of its derivation location.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::directive::{Ctx, Payload};
use crate::error::{Error, Result};
use crate::model::{
    coalesce_member, Builtin, ClearOpts, FormatFuncOpts, Hint, Member, MemberTag,
    ParseFuncOpts, StructureOpts, Type, TypeId, TypeKind,
};

/// Type-level directive keys, pulled out of a merged payload. Member-level
/// keys that happen to be present are ignored here.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TypeDirective {
    name: String,
    location: String,
    unpack: bool,
    pack: bool,
    union: String,
    namespace: bool,
    truevalue: String,
    values: Vec<String>,
    members: Vec<Payload>,
    structure: StructureOpts,
    clearfunc: ClearOpts,
    parsefunc: ParseFuncOpts,
    formatfunc: FormatFuncOpts,
}

impl TypeDirective {
    fn from_payload(payload: &Payload, location: &str) -> Result<TypeDirective> {
        serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| Error::directive(format!("bad type directive: {e}"), location))
    }
}

#[derive(Debug, Default)]
pub struct TypeTable {
    types: IndexMap<TypeId, Type>,
}

impl TypeTable {
    /// A fresh table, pre-seeded with the builtin set (each builtin's
    /// location is its own name).
    pub fn new() -> TypeTable {
        let mut table = TypeTable::default();
        for b in Builtin::ALL {
            table.seed(TypeKind::Builtin(*b), b.name());
        }
        table.seed(TypeKind::Constant, "Constant");
        table
    }

    fn seed(&mut self, kind: TypeKind, location: &str) {
        let id = TypeId::of(location);
        self.types.insert(
            id,
            Type {
                id,
                kind,
                location: location.to_string(),
                name: String::new(),
                rng: String::new(),
                define: String::new(),
                values: Vec::new(),
                members: Vec::new(),
                unpack: false,
                pack: false,
                union_name: String::new(),
                namespace: false,
                truevalue: String::new(),
                structure: Default::default(),
                clearfunc: Default::default(),
                parsefunc: Default::default(),
                formatfunc: Default::default(),
                payload: Payload::new(),
                parent: None,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Type> {
        self.types.values()
    }

    pub fn ids(&self) -> Vec<TypeId> {
        self.types.keys().copied().collect()
    }

    pub fn get(&self, id: TypeId) -> Option<&Type> {
        self.types.get(&id)
    }

    pub fn get_mut(&mut self, id: TypeId) -> Option<&mut Type> {
        self.types.get_mut(&id)
    }

    pub fn expect(&self, id: TypeId) -> Result<&Type> {
        self.get(id)
            .ok_or_else(|| Error::internal(format!("unknown type id {id}")))
    }

    pub fn remove(&mut self, id: TypeId) {
        self.types.shift_remove(&id);
    }

    pub fn get_by_location(&self, location: &str) -> Option<&Type> {
        self.types.values().find(|t| t.location == location)
    }

    pub fn expect_by_location(&self, location: &str) -> Result<&Type> {
        self.get_by_location(location)
            .ok_or_else(|| Error::resolution(format!("bad type location '{location}'")))
    }

    /// Resolve a leftmost-hex-digits prefix. No match or several matches
    /// are both fatal; the latter lists the candidates.
    pub fn get_by_partial_id(&self, prefix: &str) -> Result<&Type> {
        let hits: Vec<&Type> = self
            .types
            .values()
            .filter(|t| t.id.hex().starts_with(prefix))
            .collect();
        match hits.as_slice() {
            [] => Err(Error::resolution(format!("bad type id '{prefix}'"))),
            [one] => Ok(one),
            several => {
                let ids: Vec<String> = several.iter().map(|t| t.id.short()).collect();
                Err(Error::resolution(format!(
                    "several candidates [{}] for id '{prefix}'",
                    ids.join(", ")
                )))
            }
        }
    }

    /// Register (or merge) a type derived at the context's location.
    pub fn register(
        &mut self,
        kind: TypeKind,
        ctx: &Ctx,
        members: Vec<Member>,
        values: Vec<String>,
    ) -> Result<TypeId> {
        let atype = self.create_type(kind, ctx, members, values)?;
        let id = atype.id;

        if self.types.contains_key(&id) {
            self.merge(id, atype, ctx)?;
        } else {
            let short = id.short();
            for existing in self.types.keys() {
                if existing.hex().starts_with(&short) {
                    return Err(Error::resolution(format!(
                        "short id {short} of '{}' collides with {existing}",
                        atype.location
                    )));
                }
            }
            self.types.insert(id, atype);
        }
        Ok(id)
    }

    fn merge(&mut self, id: TypeId, incoming: Type, ctx: &Ctx) -> Result<()> {
        let existing = self.types.get_mut(&id).expect("merge target");
        match (existing.kind, incoming.kind) {
            (TypeKind::Constant, TypeKind::Constant) => {
                // Two literal alternatives at one spot make an Enum.
                existing.kind = TypeKind::Enum;
                existing.values.extend(incoming.values);
                if existing.name.is_empty() {
                    existing.name = if incoming.name.is_empty() {
                        let mut name = ctx.fullname();
                        if !name.ends_with("Type") {
                            name.push_str("Type");
                        }
                        name
                    } else {
                        incoming.name
                    };
                }
            }
            (TypeKind::Enum, TypeKind::Constant) => {
                existing.values.extend(incoming.values);
            }
            (TypeKind::Struct, TypeKind::Struct) => {
                for member in incoming.members {
                    coalesce_member(&mut existing.members, member);
                }
            }
            (TypeKind::Builtin(a), TypeKind::Builtin(b)) if a == b => {}
            (a, b) => {
                return Err(Error::resolution(format!(
                    "cannot merge {} into {} at '{}'",
                    b.label(),
                    a.label(),
                    existing.location
                )));
            }
        }
        Ok(())
    }

    fn create_type(
        &self,
        kind: TypeKind,
        ctx: &Ctx,
        mut members: Vec<Member>,
        mut values: Vec<String>,
    ) -> Result<Type> {
        let directive = TypeDirective::from_payload(&ctx.payload, &ctx.location())?;
        let location = if directive.location.is_empty() {
            ctx.location()
        } else {
            directive.location.clone()
        };

        let mut name = directive.name.clone();
        match kind {
            TypeKind::Struct => {
                if name.is_empty() {
                    name = format!("{}Def", ctx.fullname());
                }
                members = self.apply_member_overrides(members, &directive, &location)?;
            }
            TypeKind::Enum => {
                if name.is_empty() {
                    name = ctx.fullname();
                    if !name.ends_with("Type") {
                        name.push_str("Type");
                    }
                }
                if !directive.values.is_empty() {
                    values = directive.values.clone();
                }
            }
            TypeKind::Constant => {
                if !directive.values.is_empty() {
                    values = directive.values.clone();
                }
            }
            TypeKind::Builtin(_) => {}
        }

        Ok(Type {
            id: TypeId::of(&location),
            kind,
            location,
            name,
            rng: ctx.rng.clone(),
            define: ctx.define.clone(),
            values,
            members,
            unpack: directive.unpack,
            pack: directive.pack,
            union_name: directive.union,
            namespace: directive.namespace,
            truevalue: directive.truevalue,
            structure: directive.structure,
            clearfunc: directive.clearfunc,
            parsefunc: directive.parsefunc,
            formatfunc: directive.formatfunc,
            payload: ctx.payload.clone(),
            parent: None,
        })
    }

    /// Fold struct-level `members` directives into the traversal-produced
    /// list: matching ids deep-merge, everything else appends as a virtual
    /// member (which must name its type by location).
    fn apply_member_overrides(
        &self,
        mut members: Vec<Member>,
        directive: &TypeDirective,
        location: &str,
    ) -> Result<Vec<Member>> {
        for over in &directive.members {
            let type_override = match over.get("type").and_then(Value::as_str) {
                Some(loc) => Some(self.expect_by_location(loc)?.id),
                None => None,
            };

            let key = over
                .get("id")
                .or_else(|| over.get("name"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::directive("member override without id or name", location)
                })?;

            if let Some(child) = members.iter_mut().find(|m| m.id == key) {
                let mut merged = child.merged(over)?;
                if let Some(tid) = type_override {
                    merged.type_id = tid;
                }
                if merged.hint.is_none() {
                    let mtype = self.expect(merged.type_id)?;
                    if mtype.unpack {
                        merged.hint = Some(Hint::Unpack);
                    } else if mtype.pack {
                        merged.hint = Some(Hint::Pack);
                    }
                }
                *child = merged;
            } else {
                let tid = type_override.ok_or_else(|| {
                    Error::directive(
                        format!("new member '{key}' needs a type location"),
                        location,
                    )
                })?;
                let mut fresh = Member::from_payload(tid, key, MemberTag::Virtual, over)?;
                fresh.hint = Some(Hint::New);
                members.push(fresh);
            }
        }
        Ok(members)
    }

    /// Record every member Struct's owning aggregate. A membership that
    /// crosses into another defining rule gets no parent; unpack structs
    /// forward their own parent downwards.
    pub fn mend_parents(&mut self) {
        let roots: Vec<TypeId> = self
            .types
            .values()
            .filter(|t| t.kind == TypeKind::Struct && !t.unpack)
            .map(|t| t.id)
            .collect();
        for root in roots {
            let children: Vec<TypeId> = self.types[&root]
                .members
                .iter()
                .map(|m| m.type_id)
                .collect();
            for child in children {
                self.mend_one(child, Some(root), 0);
            }
        }
    }

    fn mend_one(&mut self, id: TypeId, parent: Option<TypeId>, depth: usize) {
        // Shared aggregates are revisited; cap the depth so a recursive
        // grammar cannot wedge the pass.
        if depth > 64 {
            return;
        }
        let Some(atype) = self.get(id) else { return };
        if atype.kind != TypeKind::Struct {
            return;
        }
        let define = atype.define.clone();
        let parent = parent.filter(|p| {
            self.get(*p).map(|t| t.define == define).unwrap_or(false)
        });

        let atype = self.types.get_mut(&id).expect("mend target");
        atype.parent = parent;
        let next = if atype.unpack { parent } else { Some(id) };
        let children: Vec<TypeId> = atype.members.iter().map(|m| m.type_id).collect();
        for child in children {
            self.mend_one(child, next, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_at(define: &str, segs: &[(&str, &str)], payload: Value) -> Ctx {
        let mut ctx = Ctx::root("net.rng");
        ctx.define = define.to_string();
        ctx.nodepath = segs
            .iter()
            .map(|(n, s)| (n.to_string(), s.to_string()))
            .collect();
        if let Value::Object(obj) = payload {
            ctx.payload = obj;
        }
        ctx
    }

    #[test]
    fn seeds_every_builtin_by_name() {
        let table = TypeTable::new();
        let s = table.get_by_location("String").unwrap();
        assert_eq!(s.kind, TypeKind::Builtin(Builtin::String));
        assert!(table.get_by_location("Bool.on_off").is_some());
        assert!(table.get_by_location("Constant").is_some());
    }

    #[test]
    fn reregistering_a_location_is_idempotent_for_builtins() {
        let mut table = TypeTable::new();
        let ctx = ctx_at("mtu", &[("size", ".data")], json!({}));
        let a = table
            .register(TypeKind::Builtin(Builtin::UInt), &ctx, vec![], vec![])
            .unwrap();
        let b = table
            .register(TypeKind::Builtin(Builtin::UInt), &ctx, vec![], vec![])
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn constants_at_one_spot_promote_to_enum() {
        let mut table = TypeTable::new();
        let ctx = ctx_at("state", &[("state", ".attribute")], json!({}));
        let id = table
            .register(TypeKind::Constant, &ctx, vec![], vec!["up".to_string()])
            .unwrap();
        table
            .register(TypeKind::Constant, &ctx, vec![], vec!["down".to_string()])
            .unwrap();
        let atype = table.get(id).unwrap();
        assert_eq!(atype.kind, TypeKind::Enum);
        assert_eq!(atype.values, vec!["up", "down"]);
    }

    #[test]
    fn struct_merge_coalesces_members() {
        let mut table = TypeTable::new();
        let string = table.get_by_location("String").unwrap().id;
        let ctx = ctx_at("dns", &[("host", ".element")], json!({}));
        let mk = |id: &str, opt: bool| {
            let mut m =
                Member::from_payload(string, id, MemberTag::Attribute, &Payload::new())
                    .unwrap();
            m.opt = opt;
            m
        };
        let tid = table
            .register(TypeKind::Struct, &ctx, vec![mk("ip", false)], vec![])
            .unwrap();
        table
            .register(
                TypeKind::Struct,
                &ctx,
                vec![mk("ip", true), mk("hostname", false)],
                vec![],
            )
            .unwrap();
        let atype = table.get(tid).unwrap();
        assert_eq!(atype.members.len(), 2);
        assert!(atype.members[0].opt, "opt is OR-ed across merges");
        assert_eq!(atype.name, "virHostDef");
    }

    #[test]
    fn member_overrides_merge_and_append() {
        let mut table = TypeTable::new();
        let string = table.get_by_location("String").unwrap().id;
        let payload = json!({
            "members": [
                { "id": "mode", "name": "fwdMode", "specified": true },
                { "name": "leftover", "type": "PVoid" }
            ]
        });
        let ctx = ctx_at("forward", &[("forward", ".element")], payload);
        let base =
            Member::from_payload(string, "mode", MemberTag::Attribute, &Payload::new())
                .unwrap();
        let tid = table
            .register(TypeKind::Struct, &ctx, vec![base], vec![])
            .unwrap();
        let atype = table.get(tid).unwrap();
        assert_eq!(atype.members[0].name, "fwdMode");
        assert!(atype.members[0].specified);
        assert_eq!(atype.members[1].id, "leftover");
        assert_eq!(atype.members[1].hint, Some(Hint::New));
        assert_eq!(atype.members[1].tag, MemberTag::Virtual);
    }

    #[test]
    fn partial_id_lookup_rejects_ambiguity() {
        let table = TypeTable::new();
        let full = table.get_by_location("UInt").unwrap().id;
        assert_eq!(
            table.get_by_partial_id(&full.short()).unwrap().location,
            "UInt"
        );
        assert!(table.get_by_partial_id("").is_err());
        assert!(table.get_by_partial_id("zzzz").is_err());
    }

    #[test]
    fn flatten_reaches_a_fixed_point() {
        use crate::model::flatten_members;

        let mut table = TypeTable::new();
        let string = table.get_by_location("String").unwrap().id;
        let inner_ctx = ctx_at(
            "bridge",
            &[("inner", ".element")],
            json!({ "unpack": true }),
        );
        let leaf =
            Member::from_payload(string, "name", MemberTag::Attribute, &Payload::new())
                .unwrap();
        let inner = table
            .register(TypeKind::Struct, &inner_ctx, vec![leaf], vec![])
            .unwrap();

        let wrapper =
            Member::from_payload(inner, "inner", MemberTag::Element, &Payload::new())
                .unwrap();
        let flat = flatten_members(&[wrapper], &table).unwrap();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].id, "name");
        let again = flatten_members(&flat, &table).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, "name");
    }
}
