//! Parse-function synthesis: one `<name>ParseXML` per aggregate, reading
//! attributes and child elements into the C structure with per-member
//! defaulting, validation reports and cleanup on failure.

use crate::emit::{
    actual_args, align, formal_args, true_token, Codegen, T_IF_CONDITION_MULTI,
    T_IF_CONDITION_SINGLE,
};
use crate::error::{Error, Result};
use crate::model::{Builtin, Member, MemberTag, Type, TypeKind};
use crate::terms;
use crate::tpl::{dedup, indent, render, singleline, BlockAssembler};
use crate::writer::{CodeWriter, Ext, Kind};

const T_SET_DEFAULT_VALUE: &str = "def->${name} = ${default};";
const T_READ_XML_BY_XPATH: &str = "${mdvar} = ${xfuncname}(${xpath}, ctxt);";
const T_READ_ATTR_BY_PROP: &str = "${mdvar} = virXMLPropString(curnode, \"${oname}\");";
const T_READ_ELEM_BY_PROP: &str = "${mdvar} = virXMLChildNode(curnode, \"${oname}\");";

const T_READ_NODES: &str = "${number} = virXMLChildNodeSet(curnode, \"${oname}\", &nodes);";
const T_READ_NODES_CTXT: &str = "${number} = virXPathNodeSet(\"./${oname}\", ctxt, &nodes);";

const T_PARSE_MEMBER_MORE: &str = "
if (${number} > 0) {
    size_t i;
    xmlNodePtr node;

    if (VIR_ALLOC_N(def->${name}, ${number}) < 0)
        goto error;

    for (i = 0; i < ${number}; i++) {
        node = nodes[i];
        ${item}
    }
    def->${counter} = ${number};
    VIR_FREE(nodes);
} else if (${number} < 0) {
    virReportError(VIR_ERR_XML_ERROR, \"%s\",
                   _(\"Invalid ${oname} element found.\"));
    goto error;
}${report_missing}
";

const T_REPORT_INVALID_WITH_INSTANCE: &str = "
    virReportError(VIR_ERR_XML_ERROR,
                   _(\"Invalid '${oname}' setting '%s' in '%s'\"),
                   ${mdvar}, instanceName);
";

const T_REPORT_INVALID_WITHOUT_INSTANCE: &str = "
    virReportError(VIR_ERR_XML_ERROR,
                   _(\"Invalid '${oname}' setting '%s'\"),
                   ${mdvar});
";

const T_CHECK_INVALID_ERROR: &str = "
if (${tmpl}) {
    ${report_err}
    goto error;
}
";

const T_REPORT_MISSING_WITH_INSTANCE: &str = "
    virReportError(VIR_ERR_XML_ERROR,
                   _(\"Missing '${oname}' setting in '%s'\"),
                   instanceName);
";

const T_REPORT_MISSING_WITHOUT_INSTANCE: &str = "
    virReportError(VIR_ERR_XML_ERROR, \"%s\",
                   _(\"Missing '${oname}' setting\"));
";

const T_MISSING_ERROR: &str = "
{
    ${report_err}
    goto error;
}
";

const T_ALLOC_MEMORY: &str = "
if (VIR_ALLOC(def->${name}) < 0)
    goto error;
";

const T_STRUCT_ASSIGNMENT_TEMPLATE: &str = "
if (${funcname}(${mdvar}, ${amp}${refname}${args}) < 0)
    goto error;
";

const T_POST_PARSE_MEMBER: &str = "
if (${funcname}Post(name, ${amp}def->${name}, NULL) < 0)
    goto error;
";

const T_PARSE_FUNC_DECL: &str = "
int
${funcname}(${formal_args});
";

const T_PARSE_FUNC_IMPL: &str = "
int
${funcname}(${formal_args})
{
    ${declare_vars}

    ${body}

    ${end}

 error:
    ${cleanup_vars}
    ${typename}Clear(def);
    return -1;
}
";

const T_PARSE_FUNC_POST_INVOKE: &str = "
if (${funcname}Post(${actual_args}) < 0)
    goto error;
";

const T_NAMESPACE_PARSE: &str = "
if (xmlopt)
    def->ns = xmlopt->ns;
if (def->ns.parse) {
    if (virXMLNamespaceRegister(ctxt, &def->ns) < 0)
        goto error;
    if ((def->ns.parse)(ctxt, &def->namespaceData) < 0)
        goto error;
}
";

fn invalid_report(atype: &Type, oname: &str, mdvar: &str) -> String {
    let tmpl = if atype.parsefunc.instname {
        T_REPORT_INVALID_WITH_INSTANCE
    } else {
        T_REPORT_INVALID_WITHOUT_INSTANCE
    };
    render(tmpl, &[("oname", oname), ("mdvar", mdvar)])
}

fn missing_report(atype: &Type, oname: &str) -> String {
    let tmpl = if atype.parsefunc.instname {
        T_REPORT_MISSING_WITH_INSTANCE
    } else {
        T_REPORT_MISSING_WITHOUT_INSTANCE
    };
    render(tmpl, &[("oname", oname)])
}

fn make_xpath(member: &Member, mtype: &Type) -> String {
    if member.tag == MemberTag::Attribute {
        return format!("\"string(./@{})\"", member.id);
    }
    if mtype.kind == TypeKind::Struct {
        return format!("\"./{}\"", member.id);
    }
    format!("\"string(./{}[1])\"", member.id)
}

fn set_default(member: &Member, name: &str) -> Option<String> {
    if member.parse.default.is_empty() {
        return None;
    }
    Some(render(
        T_SET_DEFAULT_VALUE,
        &[("name", name), ("default", member.parse.default.as_str())],
    ))
}

fn read_xml(member: &Member, mtype: &Type, mdvar: &str, xpath: &str) -> String {
    match member.tag {
        MemberTag::Attribute => render(
            T_READ_ATTR_BY_PROP,
            &[("mdvar", mdvar), ("oname", member.id.as_str())],
        ),
        MemberTag::Element
            if mtype.kind == TypeKind::Struct && mtype.parsefunc.noctxt =>
        {
            render(
                T_READ_ELEM_BY_PROP,
                &[("mdvar", mdvar), ("oname", member.id.as_str())],
            )
        }
        _ => {
            let xfuncname = if mtype.kind == TypeKind::Struct {
                "virXPathNode"
            } else {
                "virXPathString"
            };
            render(
                T_READ_XML_BY_XPATH,
                &[("mdvar", mdvar), ("xfuncname", xfuncname), ("xpath", xpath)],
            )
        }
    }
}

/// The assignment block for one member, typed by its target: Struct
/// recursion, Enum lookup, boolean token compare, numeric conversion or a
/// plain strdup.
fn assign_value(
    cg: &Codegen,
    member: &Member,
    mtype: &Type,
    atype: &Type,
    name: &str,
    mdvar: &str,
    pack: Option<&Member>,
) -> Result<Option<String>> {
    let mut refname = format!("def->{name}");
    if mtype.unpack && pack.is_none() {
        refname = "def".to_string();
    }
    let builtin = mtype.builtin();

    let tmpl: Option<String> = if mtype.kind == TypeKind::Struct {
        let funcname = mtype.parse_name();
        let mut t = String::new();
        if member.pointer {
            t.push_str(T_ALLOC_MEMORY);
        }
        t.push_str(T_STRUCT_ASSIGNMENT_TEMPLATE);
        if member.parse.post {
            t.push_str(T_POST_PARSE_MEMBER);
        }

        let mut args: Vec<String> = Vec::new();
        if !mtype.parsefunc.noctxt {
            args.push("ctxt".to_string());
        }
        if mtype.parsefunc.instname {
            if !member.parse.instname.is_empty() {
                args.push(member.parse.instname.clone());
            } else {
                args.push("instanceName".to_string());
            }
        }
        if mtype.parsefunc.parent {
            args.push("def".to_string());
        }
        args.extend(actual_args(&mtype.parsefunc.args, &member.parse.args, cg.table)?);
        let mut args = args.join(", ");
        if !args.is_empty() {
            args = format!(", {args}");
        }

        let amp = if refname == "def" || member.pointer { "" } else { "&" };
        Some(render(
            &t,
            &[
                ("funcname", funcname.as_str()),
                ("args", args.as_str()),
                ("amp", amp),
                ("mdvar", mdvar),
            ],
        ))
    } else if mtype.kind == TypeKind::Enum {
        Some(format!(
            "(def->${{name}} = {}FromString({mdvar})) <= 0",
            mtype.name
        ))
    } else if (mtype.kind == TypeKind::Constant
        && mtype.values.first().map(String::as_str) == Some("yes"))
        || builtin == Some(Builtin::BoolYesNo)
    {
        Some("virStringParseYesNo(${mdvar}, &def->${name}) < 0".to_string())
    } else if (mtype.kind == TypeKind::Constant
        && mtype.values.first().map(String::as_str) == Some("on"))
        || builtin == Some(Builtin::BoolOnOff)
    {
        Some("virStringParseOnOff(${mdvar}, &def->${name}) < 0".to_string())
    } else if mtype.kind == TypeKind::Constant || builtin == Some(Builtin::Bool) {
        let token = true_token(member, mtype);
        Some(format!(
            "virStrToBool(${{mdvar}}, \"{token}\", &def->${{name}}) < 0"
        ))
    } else if !mtype.name.is_empty() || !mtype.parsefunc.name.is_empty() {
        let funcname = mtype.parse_name();
        let aof = match builtin {
            Some(Builtin::Chars | Builtin::UChars) => "",
            _ => "&",
        };
        Some(format!("{funcname}(${{mdvar}}, {aof}def->${{name}}) < 0"))
    } else if builtin == Some(Builtin::String) {
        Some("def->${name} = g_strdup(${mdvar});".to_string())
    } else {
        builtin.and_then(Builtin::conv).map(|conv| format!("{conv} < 0"))
    };

    let Some(mut tmpl) = tmpl else {
        return Ok(None);
    };

    // Everything but a raw string copy can fail and reports the setting.
    if mdvar.ends_with("Str")
        && !(builtin == Some(Builtin::String) && mtype.name.is_empty())
    {
        tmpl = render(
            T_CHECK_INVALID_ERROR,
            &[
                ("tmpl", tmpl.as_str()),
                ("report_err", invalid_report(atype, &member.id, mdvar).as_str()),
            ],
        );
    }

    let mut ret = render(
        &tmpl,
        &[
            ("refname", refname.as_str()),
            ("name", name),
            ("oname", member.id.as_str()),
            ("mdvar", mdvar),
        ],
    );
    if member.specified && !member.more {
        ret.push_str(&format!("\ndef->{name}_specified = true;"));
    }
    Ok(Some(ret))
}

fn assign_on_condition(
    cg: &Codegen,
    member: &Member,
    mtype: &Type,
    atype: &Type,
    name: &str,
    mdvar: &str,
    pack: Option<&Member>,
) -> Result<Option<String>> {
    let Some(block) = assign_value(cg, member, mtype, atype, name, mdvar, pack)? else {
        return Ok(None);
    };

    if member.opt {
        let ret = if singleline(&block) {
            render(
                T_IF_CONDITION_SINGLE,
                &[("condition", mdvar), ("body", block.as_str())],
            )
        } else {
            render(
                T_IF_CONDITION_MULTI,
                &[("condition", mdvar), ("body", indent(&block, 1).as_str())],
            )
        };
        return Ok(Some(ret));
    }

    let tmpl = format!("if (${{mdvar}} == NULL) {}", T_MISSING_ERROR.trim());
    let mut ret = render(
        &tmpl,
        &[
            ("mdvar", mdvar),
            ("report_err", missing_report(atype, &member.id).as_str()),
        ],
    );
    ret.push_str("\n\n");
    ret.push_str(&block);
    Ok(Some(ret))
}

fn parse_member(
    cg: &Codegen,
    member: &Member,
    atype: &Type,
    tmpvars: &mut Vec<String>,
    pack: Option<&Member>,
) -> Result<Option<String>> {
    if member.parse.disable {
        return Ok(None);
    }
    let mtype = cg.table.expect(member.type_id)?;

    // A packed or union type parses through its real members.
    if mtype.embedded_only() {
        let mut block = BlockAssembler::new();
        for child in &mtype.members {
            block.push_opt(parse_member(cg, child, atype, tmpvars, Some(member))?);
        }
        return Ok(Some(block.output("\n\n")));
    }

    if member.tag == MemberTag::Virtual || member.id == "_Any_" {
        return Ok(None);
    }

    if member.more {
        if member.tag != MemberTag::Element {
            return Err(Error::internal(format!(
                "sequence member '{}' is not an element",
                member.id
            )));
        }
        let node_num = format!("n{}Nodes", terms::upper_initial(&member.id));
        tmpvars.push(node_num.clone());
        tmpvars.push("nodes".to_string());

        let (seqname, counter) = match pack {
            Some(p) => (terms::pluralize(&p.name), terms::counter_name(&p.name)),
            None => (
                terms::pluralize(&member.name),
                terms::counter_name(&member.name),
            ),
        };
        let name = format!("{seqname}[i]");
        let mut report_missing = String::new();
        if !member.opt {
            report_missing = format!(
                " else {}",
                render(
                    T_MISSING_ERROR,
                    &[("report_err", missing_report(atype, &member.id).as_str())],
                )
            );
        }

        let item = if mtype.kind != TypeKind::Struct {
            format!("def->{name} = virXMLNodeContentString(node);")
        } else {
            assign_value(cg, member, mtype, atype, &name, "node", pack)?.ok_or_else(
                || {
                    Error::internal(format!(
                        "no assignment for sequence member '{}'",
                        member.id
                    ))
                },
            )?
        };

        let read = if atype.parsefunc.noctxt {
            T_READ_NODES
        } else {
            T_READ_NODES_CTXT
        };
        let tmpl = format!("{read}{T_PARSE_MEMBER_MORE}");
        return Ok(Some(render(
            &tmpl,
            &[
                ("name", seqname.as_str()),
                ("counter", counter.as_str()),
                ("number", node_num.as_str()),
                ("item", indent(&item, 2).as_str()),
                ("report_missing", report_missing.as_str()),
                ("oname", member.id.as_str()),
            ],
        )));
    }

    let name = match pack {
        Some(p) => {
            let arrow = if p.pointer { "->" } else { "." };
            format!("{}{arrow}{}", p.name, member.name)
        }
        None => member.name.clone(),
    };

    let mdvar = format!(
        "{}{}",
        member.name,
        if mtype.kind == TypeKind::Struct { "Node" } else { "Str" }
    );
    tmpvars.push(mdvar.clone());
    let xpath = make_xpath(member, mtype);

    let mut blocks = BlockAssembler::new();
    blocks.push_opt(set_default(member, &name));
    blocks.push(read_xml(member, mtype, &mdvar, &xpath));
    blocks.push_opt(assign_on_condition(
        cg, member, mtype, atype, &name, &mdvar, pack,
    )?);
    Ok(Some(blocks.output("\n")))
}

fn handle_tmpvars(tmpvars: &[String], noctxt: bool) -> (String, String) {
    let mut heads = Vec::new();
    let mut tails = Vec::new();
    for var in dedup(tmpvars.to_vec()) {
        if var == "nodes" {
            heads.push("xmlNodePtr *nodes = NULL;".to_string());
            tails.push("VIR_FREE(nodes);".to_string());
        } else if var.ends_with("Str") {
            heads.push(format!("g_autofree char *{var} = NULL;"));
        } else if var.ends_with("Node") {
            heads.push(format!("xmlNodePtr {var} = NULL;"));
        } else {
            heads.push(format!("int {var} = 0;"));
        }
    }
    if !noctxt {
        heads.push("xmlNodePtr save = ctxt->node;".to_string());
        heads.push("ctxt->node = curnode;".to_string());
        tails.insert(0, "ctxt->node = save;".to_string());
    }
    (heads.join("\n"), tails.join("\n"))
}

pub(super) fn emit(cg: &Codegen, writer: &mut CodeWriter, atype: &Type) -> Result<()> {
    if atype.embedded_only() {
        return Ok(());
    }

    let parsefunc = &atype.parsefunc;
    let funcname = atype.parse_name();
    let alignment = align(&funcname);
    let typename = cg.exposed_name(atype)?;

    let mut formal: Vec<String> = vec![
        "xmlNodePtr curnode".to_string(),
        format!("{typename}Ptr def"),
    ];
    let mut actual: Vec<String> = vec!["curnode".to_string(), "def".to_string()];

    if !parsefunc.noctxt {
        formal.push("xmlXPathContextPtr ctxt".to_string());
        actual.push("ctxt".to_string());
    }
    if parsefunc.instname {
        formal.push("const char *instanceName".to_string());
        actual.push("instanceName".to_string());
    }
    if parsefunc.parent {
        let parent = atype.parent.ok_or_else(|| {
            Error::internal(format!(
                "parentdef requested without an owning aggregate at '{}'",
                atype.location
            ))
        })?;
        formal.push(format!("{}Ptr parentdef", cg.table.expect(parent)?.name));
        actual.push("parentdef".to_string());
    }
    if atype.namespace {
        formal.push("virNetworkXMLOptionPtr xmlopt".to_string());
        actual.push("xmlopt".to_string());
    }
    formal.extend(formal_args(&parsefunc.args, cg.table)?);
    actual.extend(parsefunc.args.iter().map(|arg| arg.name.clone()));

    let mut tmpvars: Vec<String> = Vec::new();
    let mut blocks = BlockAssembler::new();
    for member in &atype.members {
        blocks.push_opt(parse_member(cg, member, atype, &mut tmpvars, None)?);
    }

    let connector = format!(",\n{alignment}");
    let joined = formal.join(&connector);
    let mut decl = render(
        T_PARSE_FUNC_DECL,
        &[("funcname", funcname.as_str()), ("formal_args", joined.as_str())],
    );

    if parsefunc.post {
        if !parsefunc.notmpvars {
            for var in &tmpvars {
                if var.ends_with("Str")
                    || var.ends_with("Node")
                    || (var.ends_with("Nodes") && var.starts_with('n'))
                {
                    actual.push(var.clone());
                }
            }
        }
        blocks.push(render(
            T_PARSE_FUNC_POST_INVOKE,
            &[
                ("funcname", funcname.as_str()),
                ("actual_args", actual.join(", ").as_str()),
            ],
        ));

        if !parsefunc.notmpvars {
            for var in &tmpvars {
                if var.ends_with("Str") {
                    formal.push(format!("const char *{var}"));
                } else if var.ends_with("Node") {
                    formal.push(format!("xmlNodePtr {var}"));
                } else if var.ends_with("Nodes") && var.starts_with('n') {
                    formal.push(format!("int {var}"));
                }
            }
        }
        let post_connector = format!(",\n{alignment}    ");
        let post_funcname = format!("{funcname}Post");
        decl.push('\n');
        decl.push_str(&render(
            T_PARSE_FUNC_DECL,
            &[
                ("funcname", post_funcname.as_str()),
                ("formal_args", formal.join(&post_connector).as_str()),
            ],
        ));
    }

    writer.write(cg.table, atype, Kind::Parse, Ext::H, &decl);

    if atype.namespace {
        blocks.push(T_NAMESPACE_PARSE.trim());
    }

    let (declare_vars, cleanup_vars) = handle_tmpvars(&tmpvars, parsefunc.noctxt);
    let mut end = String::new();
    if !parsefunc.noctxt {
        end.push_str("ctxt->node = save;\n");
    }
    end.push_str("return 0;");

    let imp = render(
        T_PARSE_FUNC_IMPL,
        &[
            ("funcname", funcname.as_str()),
            ("typename", typename.as_str()),
            ("formal_args", joined.as_str()),
            ("declare_vars", indent(&declare_vars, 1).as_str()),
            ("body", indent(&blocks.output("\n\n"), 1).as_str()),
            ("end", indent(&end, 1).as_str()),
            ("cleanup_vars", indent(&cleanup_vars, 1).as_str()),
        ],
    );
    writer.write(cg.table, atype, Kind::Parse, Ext::C, &imp);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::Ctx;
    use crate::table::TypeTable;

    fn site(define: &str, segments: &[(&str, &str)]) -> Ctx {
        let mut ctx = Ctx::root("network.rng");
        ctx.define = define.to_string();
        ctx.nodepath = segments
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect();
        ctx
    }

    fn interface(table: &mut TypeTable) -> crate::model::TypeId {
        let uint = table.get_by_location("UInt").unwrap().id;
        let string = table.get_by_location("String").unwrap().id;
        let mut mtu =
            Member::from_payload(uint, "mtu", MemberTag::Attribute, &Default::default())
                .unwrap();
        mtu.opt = true;
        let name =
            Member::from_payload(string, "name", MemberTag::Attribute, &Default::default())
                .unwrap();
        let ctx = site("interface", &[("interface", ".element")]);
        table
            .register(TypeKind::Struct, &ctx, vec![mtu, name], vec![])
            .unwrap()
    }

    #[test]
    fn optional_numeric_attribute_guards_its_conversion() {
        let mut table = TypeTable::new();
        let id = interface(&mut table);
        let cg = Codegen::new(&table);
        let atype = cg.table.get(id).unwrap();

        let mut tmpvars = Vec::new();
        let code = parse_member(&cg, &atype.members[0], atype, &mut tmpvars, None)
            .unwrap()
            .unwrap();
        assert!(code.contains("mtuStr = virXMLPropString(curnode, \"mtu\");"));
        assert!(code.contains("if (mtuStr) {"));
        assert!(code.contains("virStrToLong_uip(mtuStr, NULL, 0, &def->mtu) < 0"));
        assert!(code.contains("Invalid 'mtu' setting"));
        assert_eq!(tmpvars, vec!["mtuStr".to_string()]);
    }

    #[test]
    fn required_string_reports_when_missing() {
        let mut table = TypeTable::new();
        let id = interface(&mut table);
        let cg = Codegen::new(&table);
        let atype = cg.table.get(id).unwrap();

        let mut tmpvars = Vec::new();
        let code = parse_member(&cg, &atype.members[1], atype, &mut tmpvars, None)
            .unwrap()
            .unwrap();
        assert!(code.contains("if (nameStr == NULL) {"));
        assert!(code.contains("Missing 'name' setting"));
        assert!(code.contains("def->name = g_strdup(nameStr);"));
    }

    #[test]
    fn tmpvars_dedup_and_restore_the_context_node() {
        let vars = vec![
            "mtuStr".to_string(),
            "nodes".to_string(),
            "mtuStr".to_string(),
        ];
        let (heads, tails) = handle_tmpvars(&vars, false);
        assert_eq!(heads.matches("mtuStr").count(), 1);
        assert!(heads.contains("g_autofree char *mtuStr = NULL;"));
        assert!(heads.contains("xmlNodePtr *nodes = NULL;"));
        assert!(heads.contains("ctxt->node = curnode;"));
        assert_eq!(tails, "ctxt->node = save;\nVIR_FREE(nodes);");
    }

    #[test]
    fn sequence_members_count_and_allocate() {
        let mut table = TypeTable::new();
        let string = table.get_by_location("String").unwrap().id;
        let mut route =
            Member::from_payload(string, "route", MemberTag::Element, &Default::default())
                .unwrap();
        route.more = true;
        route.opt = true;
        let ctx = site("network", &[("network", ".element")]);
        let id = table
            .register(TypeKind::Struct, &ctx, vec![route], vec![])
            .unwrap();
        let cg = Codegen::new(&table);
        let atype = cg.table.get(id).unwrap();

        let mut tmpvars = Vec::new();
        let code = parse_member(&cg, &atype.members[0], atype, &mut tmpvars, None)
            .unwrap()
            .unwrap();
        assert!(code.contains("nRouteNodes = virXPathNodeSet(\"./route\", ctxt, &nodes);"));
        assert!(code.contains("VIR_ALLOC_N(def->routes, nRouteNodes)"));
        assert!(code.contains("def->routes[i] = virXMLNodeContentString(node);"));
        assert!(code.contains("def->nroutes = nRouteNodes;"));
        assert!(!code.contains("Missing"));
        assert_eq!(tmpvars, vec!["nRouteNodes".to_string(), "nodes".to_string()]);
    }
}
