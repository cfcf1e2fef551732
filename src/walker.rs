//! Recursive-descent walk over RELAX-NG grammar documents. Each handler
//! evaluates one node kind into a homogeneous `NodeList`; aggregate types
//! fall out of `element`/`attribute`/`choice` sites and land in the table.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::Value;

use crate::directive::{deep_merge, Ctx, Pending, DIRECTIVE_HEAD};
use crate::error::{Error, Result};
use crate::model::{Hint, Member, MemberTag, Node, NodeKind, NodeList, TypeKind};
use crate::schema::SchemaDoc;
use crate::table::TypeTable;
use crate::terms;
use crate::xml::{self, XKid, XNode};

/// Resolution state of a named rule. `InProgress` marks the window between
/// first use and completion; a self-reference inside that window evaluates
/// to the empty list instead of recursing forever.
#[derive(Debug, Clone)]
enum RuleState {
    Unvisited,
    InProgress,
    Resolved(NodeList),
}

#[derive(Debug, Clone)]
struct Rule {
    node: XNode,
    ctx: Ctx,
    state: RuleState,
}

/// One generation run: the directive schema, the type table being filled,
/// and the rule registry shared across all loaded grammar documents.
pub struct Session {
    grammar_dir: PathBuf,
    schema: SchemaDoc,
    pub table: TypeTable,
    defines: IndexMap<String, Rule>,
    touches: Vec<String>,
    loaded: Vec<String>,
    start: Option<(XNode, Ctx)>,
}

impl Session {
    pub fn new(grammar_dir: impl Into<PathBuf>, schema: SchemaDoc) -> Session {
        Session {
            grammar_dir: grammar_dir.into(),
            schema,
            table: TypeTable::new(),
            defines: IndexMap::new(),
            touches: Vec::new(),
            loaded: Vec::new(),
            start: None,
        }
    }

    /// Process every entry grammar, then mend the parent links.
    pub fn run(&mut self, entries: &[String]) -> Result<()> {
        for entry in entries {
            self.process_document(entry)?;
        }
        self.table.mend_parents();
        Ok(())
    }

    pub fn process_document(&mut self, rng: &str) -> Result<()> {
        if self.loaded.iter().any(|l| l == rng) {
            return Ok(());
        }
        self.loaded.push(rng.to_string());
        let path: PathBuf = self.grammar_dir.join(rng);
        let root = xml::load(Path::new(&path))?;
        self.process_root(&root, rng)
    }

    /// Walk a parsed grammar document. Public so grammars can be fed from
    /// strings as well as files.
    pub fn process_root(&mut self, root: &XNode, rng: &str) -> Result<()> {
        if root.tag != "grammar" {
            return Err(Error::resolution(format!(
                "'{rng}' is not a grammar document (root <{}>)",
                root.tag
            )));
        }

        // Each document gets its own pending-start slot; includes nest.
        let outer_start = self.start.take();

        let mut ctx = Ctx::root(rng);
        self.traverse(root, &mut ctx)?;

        if let Some((start_node, mut start_ctx)) = self.start.take() {
            let touches = std::mem::take(&mut self.touches);
            for name in touches {
                self.force_rule(&name)?;
            }
            self.traverse(&start_node, &mut start_ctx)?;
        }

        self.start = outer_start;
        Ok(())
    }

    /// Force an eagerly-marked rule as if a bare use site existed.
    fn force_rule(&mut self, name: &str) -> Result<()> {
        let mut use_ctx = Ctx::default();
        use_ctx.id = name.to_string();
        use_ctx.tag = "ref".to_string();
        self.op_ref(&mut use_ctx)?;
        Ok(())
    }

    fn traverse(&mut self, node: &XNode, ctx: &mut Ctx) -> Result<NodeList> {
        let mut pending = Pending::default();
        let mut nodes = NodeList::new();

        for kid in &node.kids {
            match kid {
                XKid::Comment(text) => {
                    let line = text.trim();
                    if let Some(body) = line.strip_prefix(DIRECTIVE_HEAD) {
                        pending.collect(body, ctx)?;
                    }
                }
                XKid::Node(el) => {
                    if el.attr("ns").is_some_and(|ns| !ns.is_empty()) {
                        continue;
                    }
                    self.verify_payload(&pending.payload, ctx)?;
                    let mut child = ctx.child(
                        &el.tag,
                        el.attr("name").unwrap_or_default(),
                        el.attr("type"),
                        std::mem::take(&mut pending),
                    );
                    let produced = self.dispatch(el, &mut child, ctx)?;
                    let site = ctx.location();
                    nodes.extend(produced, &mut self.table, &site)?;
                }
            }
        }
        Ok(nodes)
    }

    fn verify_payload(&self, payload: &crate::directive::Payload, ctx: &Ctx) -> Result<()> {
        let location = ctx.location();
        self.schema
            .verify(payload, self.schema.type_properties(), &location)?;
        if let Some(Value::Array(entries)) = payload.get("members") {
            for entry in entries {
                let Value::Object(map) = entry else {
                    return Err(Error::directive("member entry must be an object", &location));
                };
                self.schema
                    .verify(map, self.schema.member_properties(), &location)?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, el: &XNode, ctx: &mut Ctx, parent: &mut Ctx) -> Result<NodeList> {
        match el.tag.as_str() {
            "start" => {
                self.start = Some((el.clone(), ctx.clone()));
                Ok(NodeList::new())
            }
            "include" => {
                let href = el.attr("href").unwrap_or_default();
                if href.is_empty() {
                    return Err(Error::directive("include without href", ctx.location()));
                }
                self.process_document(href)?;
                Ok(NodeList::new())
            }
            "define" => self.op_define(el, ctx),
            "ref" => self.op_ref(ctx),
            "element" => self.op_element(el, ctx),
            "attribute" => self.op_attribute(el, ctx),
            "optional" => self.flagged(el, ctx, false, true, true),
            "group" => self.flagged(el, ctx, false, true, true),
            "zeroOrMore" => self.flagged(el, ctx, true, true, false),
            "oneOrMore" => self.flagged(el, ctx, true, false, false),
            "interleave" => self.traverse(el, ctx),
            "choice" => self.op_choice(el, ctx),
            "data" => self.op_data(el, ctx),
            "value" => Ok(NodeList::single(Node::Value(el.text.clone()))),
            "text" | "empty" | "param" => Ok(NodeList::new()),
            "anyName" => {
                parent.rename("_Any_");
                Ok(NodeList::new())
            }
            "name" => {
                parent.rename(&el.text);
                Ok(NodeList::new())
            }
            other => Err(Error::resolution(format!(
                "unsupported grammar node <{other}> at {}",
                ctx.location()
            ))),
        }
    }

    /// `optional` / `group` / `zeroOrMore` / `oneOrMore` only adjust member
    /// flags, never type identity.
    fn flagged(
        &mut self,
        el: &XNode,
        ctx: &mut Ctx,
        more: bool,
        opt: bool,
        members_only: bool,
    ) -> Result<NodeList> {
        let mut nodes = self.traverse(el, ctx)?;
        if members_only
            && !nodes.is_empty()
            && nodes.uniform(&self.table)? != Some(NodeKind::Member)
        {
            return Err(Error::directive(
                format!("<{}> must wrap member-producing nodes", el.tag),
                ctx.location(),
            ));
        }
        for node in nodes.iter_mut() {
            if let Node::Member(m) = node {
                m.more = m.more || more;
                m.opt = m.opt || opt;
            }
        }
        Ok(nodes)
    }

    fn op_define(&mut self, el: &XNode, ctx: &mut Ctx) -> Result<NodeList> {
        let name = member_id(ctx);
        if name.is_empty() {
            return Err(Error::directive("define without a name", ctx.location()));
        }
        if ctx
            .payload
            .shift_remove("TOUCH")
            .is_some_and(|v| v == Value::Bool(true))
        {
            self.touches.push(name.clone());
        }

        let mut rule_ctx = ctx.clone();
        rule_ctx.define = name.clone();
        rule_ctx.nodepath.clear();

        if self.defines.contains_key(&name) {
            return Err(Error::resolution(format!("duplicate rule '{name}'")));
        }
        self.defines.insert(
            name,
            Rule {
                node: el.clone(),
                ctx: rule_ctx,
                state: RuleState::Unvisited,
            },
        );
        Ok(NodeList::new())
    }

    fn op_ref(&mut self, use_ctx: &mut Ctx) -> Result<NodeList> {
        let name = member_id(use_ctx);
        let Some(rule) = self.defines.get(&name) else {
            return Err(Error::resolution(format!("cannot find rule '{name}'")));
        };

        let preserve = use_ctx.preserve.is_some();
        if !preserve {
            match &rule.state {
                RuleState::Resolved(nodes) => return Ok(nodes.clone()),
                RuleState::InProgress => return Ok(NodeList::new()),
                RuleState::Unvisited => {}
            }
        } else if matches!(rule.state, RuleState::InProgress) {
            return Ok(NodeList::new());
        }

        let rule_node = rule.node.clone();
        let rule_ctx = rule.ctx.clone();
        let prev_state = rule.state.clone();
        self.defines[&name].state = RuleState::InProgress;

        // A preserved use re-derives the rule body at the use site (the
        // use-site environment and payload win); a plain use evaluates the
        // rule in its own environment, rule directives winning.
        let mut eval_ctx = if preserve {
            let mut ctx = use_ctx.clone();
            ctx.nodepath.pop();
            let mut payload = rule_ctx.payload.clone();
            deep_merge(&mut payload, &use_ctx.payload);
            ctx.payload = payload;
            let mut preserved = rule_ctx.preserve_table.clone();
            preserved.extend(ctx.preserve_table.clone());
            ctx.preserve_table = preserved;
            ctx
        } else {
            let mut ctx = rule_ctx.clone();
            let mut payload = use_ctx.payload.clone();
            deep_merge(&mut payload, &rule_ctx.payload);
            ctx.payload = payload;
            let mut preserved = use_ctx.preserve_table.clone();
            preserved.extend(ctx.preserve_table.clone());
            ctx.preserve_table = preserved;
            ctx
        };

        let mut nodes = self.traverse(&rule_node, &mut eval_ctx)?;

        if eval_ctx.payload.get("pack") == Some(&Value::Bool(true)) {
            // Pack the member run into a pseudo Struct exposed as one member.
            let members = nodes.into_members()?;
            let tid = self
                .table
                .register(TypeKind::Struct, &eval_ctx, members, vec![])?;
            let id = member_id(&eval_ctx);
            let member =
                Member::from_payload(tid, &id, MemberTag::Element, &eval_ctx.payload)?;
            nodes = NodeList::single(Node::Member(member));
        }

        self.defines[&name].state = if preserve {
            prev_state
        } else {
            RuleState::Resolved(nodes.clone())
        };
        Ok(nodes)
    }

    fn op_element(&mut self, el: &XNode, ctx: &mut Ctx) -> Result<NodeList> {
        let mut tid = self.table.expect_by_location("String")?.id;
        let nodes = self.traverse(el, ctx)?;
        match nodes.uniform(&self.table)? {
            None => {}
            Some(NodeKind::Member) => {
                tid = self
                    .table
                    .register(TypeKind::Struct, ctx, nodes.into_members()?, vec![])?;
            }
            Some(NodeKind::Builtin) => {
                let Node::Type(inner) = nodes.only_one()? else { unreachable!() };
                tid = *inner;
            }
            Some(other) => {
                return Err(Error::directive(
                    format!("element body evaluates to {other:?}"),
                    ctx.location(),
                ));
            }
        }
        let id = member_id(ctx);
        let member = Member::from_payload(tid, &id, MemberTag::Element, &ctx.payload)?;
        Ok(NodeList::single(Node::Member(member)))
    }

    fn op_attribute(&mut self, el: &XNode, ctx: &mut Ctx) -> Result<NodeList> {
        let mut tid = self.table.expect_by_location("String")?.id;
        let nodes = self.traverse(el, ctx)?;
        if !nodes.is_empty() {
            let node = nodes.only_one()?;
            match node {
                Node::Value(literal) => {
                    // A fixed literal derives a Constant (or the directive's
                    // forced kind) so alternatives can promote to an Enum.
                    let kind = match ctx.payload.get("meta").and_then(Value::as_str) {
                        Some(meta) => TypeKind::parse(meta).ok_or_else(|| {
                            Error::directive(
                                format!("unknown meta '{meta}'"),
                                ctx.location(),
                            )
                        })?,
                        None => TypeKind::Constant,
                    };
                    let mut reg_ctx = ctx.clone();
                    reg_ctx
                        .payload
                        .insert("values".into(), Value::Array(vec![literal.clone().into()]));
                    tid = self
                        .table
                        .register(kind, &reg_ctx, vec![], vec![literal.clone()])?;
                }
                Node::Type(inner) => {
                    let kind = self.table.expect(*inner)?.kind;
                    if !matches!(kind, TypeKind::Builtin(_) | TypeKind::Enum) {
                        return Err(Error::directive(
                            format!("attribute body evaluates to {}", kind.label()),
                            ctx.location(),
                        ));
                    }
                    tid = *inner;
                }
                Node::Member(_) => {
                    return Err(Error::directive(
                        "attribute body evaluates to a member",
                        ctx.location(),
                    ));
                }
            }
        }
        let id = member_id(ctx);
        let member = Member::from_payload(tid, &id, MemberTag::Attribute, &ctx.payload)?;
        Ok(NodeList::single(Node::Member(member)))
    }

    fn op_choice(&mut self, el: &XNode, ctx: &mut Ctx) -> Result<NodeList> {
        let nodes = self.traverse(el, ctx)?;
        if nodes.uniform(&self.table)? == Some(NodeKind::Value) {
            let values: Vec<String> = nodes
                .into_nodes()
                .into_iter()
                .map(|n| match n {
                    Node::Value(v) => v,
                    _ => unreachable!(),
                })
                .collect();
            let tid = self.table.register(TypeKind::Enum, ctx, vec![], values)?;
            return Ok(NodeList::single(Node::Type(tid)));
        }

        let union = ctx
            .payload
            .get("union")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !union.is_empty() {
            let members = nodes.into_members()?;
            let tid = self.table.register(TypeKind::Struct, ctx, members, vec![])?;
            let mut member =
                Member::from_payload(tid, &union, MemberTag::Element, &ctx.payload)?;
            member.hint = Some(Hint::Union);
            return Ok(NodeList::single(Node::Member(member)));
        }
        Ok(nodes)
    }

    fn op_data(&mut self, el: &XNode, ctx: &mut Ctx) -> Result<NodeList> {
        let kind_name = match ctx.payload.get("meta").and_then(Value::as_str) {
            Some(meta) => meta.to_string(),
            None => terms::camelize(el.attr("type").unwrap_or_default()),
        };
        let kind = TypeKind::parse(&kind_name).ok_or_else(|| {
            Error::directive(format!("unknown datatype '{kind_name}'"), ctx.location())
        })?;
        let tid = self.table.register(kind, ctx, vec![], vec![])?;
        Ok(NodeList::single(Node::Type(tid)))
    }
}

/// Effective node id: the directive override if present, else the `name`
/// attribute recorded on the context.
fn member_id(ctx: &Ctx) -> String {
    ctx.payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| ctx.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Builtin;

    fn session() -> Session {
        Session::new("/nonexistent", SchemaDoc::bundled())
    }

    fn grammar(body: &str) -> XNode {
        let doc = format!(
            "<grammar xmlns=\"http://relaxng.org/ns/structure/1.0\">{body}</grammar>"
        );
        xml::parse(&doc).unwrap()
    }

    #[test]
    fn attribute_with_data_child_adopts_the_builtin() {
        let mut s = session();
        let root = grammar(
            r#"
            <define name="mtu">
              <element name="mtu">
                <attribute name="size"><data type="unsignedInt"/></attribute>
              </element>
            </define>
            <start><ref name="mtu"/></start>
            "#,
        );
        s.process_root(&root, "net.rng").unwrap();
        let def = s.table.get_by_location("/net.rng/mtu.define/mtu.element").unwrap();
        assert_eq!(def.kind, TypeKind::Struct);
        assert_eq!(def.members.len(), 1);
        let size = s.table.get(def.members[0].type_id).unwrap();
        assert_eq!(size.kind, TypeKind::Builtin(Builtin::UInt));
    }

    #[test]
    fn literal_alternatives_promote_to_enum() {
        let mut s = session();
        let root = grammar(
            r#"
            <define name="link">
              <element name="link">
                <optional>
                  <attribute name="state">
                    <choice><value>up</value><value>down</value></choice>
                  </attribute>
                </optional>
              </element>
            </define>
            <start><ref name="link"/></start>
            "#,
        );
        s.process_root(&root, "net.rng").unwrap();
        let def = s.table.get_by_location("/net.rng/link.define/link.element").unwrap();
        let state = s.table.get(def.members[0].type_id).unwrap();
        assert_eq!(state.kind, TypeKind::Enum);
        assert_eq!(state.values, vec!["up", "down"]);
        assert!(def.members[0].opt);
    }

    #[test]
    fn zero_or_more_marks_sequences() {
        let mut s = session();
        let root = grammar(
            r#"
            <define name="dns">
              <element name="dns">
                <zeroOrMore>
                  <element name="forwarder"><text/></element>
                </zeroOrMore>
              </element>
            </define>
            <start><ref name="dns"/></start>
            "#,
        );
        s.process_root(&root, "net.rng").unwrap();
        let def = s.table.get_by_location("/net.rng/dns.define/dns.element").unwrap();
        let fwd = &def.members[0];
        assert!(fwd.more && fwd.opt);
        let ftype = s.table.get(fwd.type_id).unwrap();
        assert_eq!(ftype.kind, TypeKind::Builtin(Builtin::String));
    }

    #[test]
    fn self_reference_yields_an_empty_list() {
        let mut s = session();
        let root = grammar(
            r#"
            <define name="nest">
              <element name="nest">
                <attribute name="id"><text/></attribute>
                <optional><ref name="nest"/></optional>
              </element>
            </define>
            <start><ref name="nest"/></start>
            "#,
        );
        s.process_root(&root, "net.rng").unwrap();
        let def = s.table.get_by_location("/net.rng/nest.define/nest.element").unwrap();
        // The inner use resolved to nothing; only the attribute survives.
        assert_eq!(def.kind, TypeKind::Struct);
        assert_eq!(def.members.len(), 1);
        assert_eq!(def.members[0].id, "id");
    }

    #[test]
    fn duplicate_rule_is_fatal() {
        let mut s = session();
        let root = grammar(
            r#"
            <define name="a"><text/></define>
            <define name="a"><empty/></define>
            "#,
        );
        let err = s.process_root(&root, "net.rng").unwrap_err();
        assert!(err.to_string().contains("duplicate rule 'a'"));
    }

    #[test]
    fn union_choice_packs_members() {
        let mut s = session();
        let root = grammar(
            r#"
            <define name="addr">
              <element name="address">
                <!-- VIRT:DIRECTIVE { "union": "u" } -->
                <choice>
                  <attribute name="ipv4"><text/></attribute>
                  <attribute name="ipv6"><text/></attribute>
                </choice>
              </element>
            </define>
            <start><ref name="addr"/></start>
            "#,
        );
        s.process_root(&root, "net.rng").unwrap();
        let def = s
            .table
            .get_by_location("/net.rng/addr.define/address.element")
            .unwrap();
        assert_eq!(def.members.len(), 1);
        let u = &def.members[0];
        assert_eq!(u.id, "u");
        assert_eq!(u.hint, Some(Hint::Union));
        let utype = s.table.get(u.type_id).unwrap();
        assert_eq!(utype.members.len(), 2);
        assert!(!utype.union_name.is_empty());
    }

    #[test]
    fn preserved_rule_rederives_per_use_site() {
        let mut s = session();
        let root = grammar(
            r#"
            <define name="ip">
              <element name="ip">
                <attribute name="address"><text/></attribute>
              </element>
            </define>
            <define name="net">
              <element name="net">
                <element name="src">
                  <!-- VIRT:DIRECTIVE { "PRESERVE": "src-ip" } -->
                  <ref name="ip"/>
                </element>
                <element name="dst">
                  <!-- VIRT:DIRECTIVE { "PRESERVE": "dst-ip" } -->
                  <ref name="ip"/>
                </element>
              </element>
            </define>
            <start><ref name="net"/></start>
            "#,
        );
        s.process_root(&root, "net.rng").unwrap();

        // Each use site derives its own aggregate under its own path.
        let src = s
            .table
            .get_by_location("/net.rng/net.define/net.element/src.element/ip.element")
            .unwrap();
        let dst = s
            .table
            .get_by_location("/net.rng/net.define/net.element/dst.element/ip.element")
            .unwrap();
        assert_ne!(src.id, dst.id);
        assert_eq!(src.kind, TypeKind::Struct);
        assert_eq!(dst.kind, TypeKind::Struct);
        assert_eq!(src.members[0].id, "address");

        // The rule itself was never resolved in place.
        assert!(s
            .table
            .get_by_location("/net.rng/ip.define/ip.element")
            .is_none());
    }
}
