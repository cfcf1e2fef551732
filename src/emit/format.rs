//! Format-function synthesis: one `<name>FormatBuf` per aggregate, writing
//! attributes into the opening tag and child elements inside it, each member
//! gated by its inclusion guard.

use crate::emit::{
    actual_args, align, formal_args, true_token, Codegen, T_IF_CONDITION_MULTI,
    T_IF_CONDITION_SINGLE, T_LOOP_MULTI, T_LOOP_SINGLE,
};
use crate::error::{Error, Result};
use crate::model::{Builtin, FuncArg, Hint, Member, MemberTag, Type, TypeId, TypeKind};
use crate::terms;
use crate::tpl::{dedup, indent, render, singleline, BlockAssembler};
use crate::writer::{CodeWriter, Ext, Kind};

const T_FORMAT_FUNC_DECL: &str = "
int
${funcname}(${formal_args});
";

const T_FORMAT_FUNC_IMPL: &str = "
int
${funcname}(${formal_args})
{
    if (!def)
        return 0;

    ${format_members}

    return 0;
}
";

const T_FORMAT_ELEMENTS: &str = "
virBufferAddLit(buf, \">\\n\");

virBufferAdjustIndent(buf, 2);

${elements}

virBufferAdjustIndent(buf, -2);
virBufferAsprintf(buf, \"</%s>\\n\", name);
";

const T_FORMAT_SHORTHAND: &str = "
if (!(${checks})) {
    virBufferAddLit(buf, \"/>\\n\");
    return 0;
}
";

const T_FORMAT_MEMBER_OF_ENUM: &str = "
const char *str = ${fullname}ToString(${var});
if (!str) {
    virReportError(VIR_ERR_INTERNAL_ERROR,
                   _(\"Unknown ${oname} type %d\"),
                   ${var});
    return -1;
}
virBufferAsprintf(buf, \"${layout}\", str);
";

const T_FORMAT_PRECHECK_DECLARE: &str = "
bool
${funcname}(${formal_args});
";

const T_NAMESPACE_FORMAT_BEGIN: &str = "
if (def->namespaceData && def->ns.format)
    virXMLNamespaceFormatNS(buf, &def->ns);
";

const T_NAMESPACE_FORMAT_END: &str = "
if (def->namespaceData && def->ns.format) {
    if ((def->ns.format)(buf, def->namespaceData) < 0)
        return -1;
}
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Require {
    Attribute,
    Element,
}

/// The "has any content" predicate of a type, an OR over its member guards.
/// Memoized so a host embedding an unpack type reuses the nested result
/// whatever the emission order.
fn content_check(cg: &Codegen, id: TypeId) -> Result<Option<String>> {
    if let Some(cached) = cg.check_cache.borrow().get(&id).cloned() {
        return Ok(cached);
    }
    cg.check_cache.borrow_mut().insert(id, None);
    let atype = cg.table.expect(id)?;
    let outcome = build(cg, atype)?;
    cg.check_cache.borrow_mut().insert(id, outcome.all_checks.clone());
    Ok(outcome.all_checks)
}

fn make_var(member: &Member, mtype: &Type, pack: Option<&Member>) -> String {
    if mtype.unpack && pack.is_none() {
        return "def".to_string();
    }
    let mut curname = member.name.clone();
    if member.more {
        curname = format!("{}[i]", terms::pluralize(&member.name));
    }

    let var = if let Some(p) = pack {
        let mut packname = p.name.clone();
        if p.more {
            packname = format!("{}[i]", terms::pluralize(&p.name));
        }
        if p.hint == Some(Hint::Union) {
            packname
        } else {
            let arrow = if p.pointer { "->" } else { "." };
            format!("{packname}{arrow}{curname}")
        }
    } else {
        curname
    };
    let mut var = format!("def->{var}");

    if mtype.kind == TypeKind::Struct {
        if !member.pointer {
            var = format!("&{var}");
        }
    } else if mtype.kind != TypeKind::Enum && !mtype.name.is_empty() {
        var = format!("&{var}");
    }
    var
}

fn check_for_member(cg: &Codegen, member: &Member, var: &str) -> Result<Option<String>> {
    let mtype = cg.table.expect(member.type_id)?;

    let ret = if member.pointer {
        Some(var.to_string())
    } else if member.specified {
        let specified = format!("{var}_specified");
        Some(
            specified
                .strip_prefix('&')
                .unwrap_or(&specified)
                .to_string(),
        )
    } else if matches!(mtype.builtin(), Some(Builtin::Chars | Builtin::UChars)) {
        Some(format!("{var}[0]"))
    } else if mtype.kind == TypeKind::Enum {
        Some(var.to_string())
    } else if matches!(mtype.kind, TypeKind::Builtin(_) | TypeKind::Constant) {
        if mtype.name.is_empty() {
            Some(var.to_string())
        } else {
            Some(format!("{}Check({var})", mtype.name))
        }
    } else {
        None
    };
    Ok(ret)
}

fn precheck_declare(
    cg: &Codegen,
    funcname: &str,
    var: &str,
    mtype: &Type,
    atype: &Type,
) -> Result<String> {
    let typename = if mtype.unpack {
        cg.exposed_name(mtype)?
    } else {
        mtype.proto(false)
    };
    let parentname = if atype.unpack {
        cg.exposed_name(atype)?
    } else {
        atype.proto(false)
    };
    let asterisk = if mtype.unpack || var.starts_with('&') { "*" } else { "" };

    let mut args = vec![
        format!("const {typename} {asterisk}def"),
        format!("const {parentname} *parent"),
    ];
    args.extend(formal_args(&atype.formatfunc.args, cg.table)?);
    let joined = args.join(&format!(",\n{}", align(funcname)));
    Ok(render(
        T_FORMAT_PRECHECK_DECLARE,
        &[("funcname", funcname), ("formal_args", joined.as_str())],
    ))
}

/// Inclusion guard for one member: explicit precheck callback, the nested
/// content check for unpack types, or the member's own truthiness; a
/// `format.flag` gate ANDs onto (or replaces) the result.
fn check_on_condition(
    cg: &Codegen,
    member: &Member,
    mtype: &Type,
    var: &str,
    atype: &Type,
    ret_decls: &mut Vec<String>,
) -> Result<Option<String>> {
    if member.format.nocheck {
        return Ok(None);
    }

    let base = if !member.format.precheck.is_empty() {
        let names: Vec<&str> = atype
            .formatfunc
            .args
            .iter()
            .map(|arg| arg.name.as_str())
            .collect();
        let mut args = names.join(", ");
        if !args.is_empty() {
            args = format!(", {args}");
        }
        let precheck = &member.format.precheck;
        ret_decls.push(precheck_declare(cg, precheck, var, mtype, atype)?);
        Some(format!("{precheck}({var}, def{args})"))
    } else if mtype.unpack {
        content_check(cg, mtype.id)?
    } else if member.more {
        None
    } else {
        check_for_member(cg, member, var)?
    };

    if member.format.flag.is_empty() {
        return Ok(base);
    }
    let mut flag = member.format.flag.as_str();
    if flag == "_ALWAYS_" {
        return Ok(None);
    }
    let exclusive = flag.starts_with('%');
    if exclusive {
        flag = &flag[1..];
    }
    let reverse = flag.starts_with('!');
    if reverse {
        flag = &flag[1..];
    }
    let mut cond = format!("(virXMLFlag(opaque) & {flag})");
    if reverse {
        cond = format!("!{cond}");
    }
    match base {
        Some(base) if !exclusive => Ok(Some(format!("{base} && {cond}"))),
        _ => Ok(Some(cond)),
    }
}

fn handle_more(
    member: &Member,
    pack: Option<&Member>,
    code: &str,
    ret_checks: &mut Vec<String>,
) -> String {
    let code = indent(code, 2);
    let counter = match pack {
        Some(p) => terms::counter_name(&p.name),
        None => terms::counter_name(&member.name),
    };
    ret_checks.push(format!("def->{counter}"));
    let tmpl = if singleline(&code) { T_LOOP_SINGLE } else { T_LOOP_MULTI };
    render(tmpl, &[("counter", counter.as_str()), ("body", code.as_str())])
}

fn format_code(
    cg: &Codegen,
    member: &Member,
    mtype: &Type,
    layout: &str,
    var: &str,
) -> Result<String> {
    let mut tmpl = String::from("${funcname}(buf, \"${layout}\", ${var}${args})");
    let mut layout = layout.to_string();
    let mut var = var.to_string();
    let mut args: Vec<String> = Vec::new();
    let mut funcname = String::from("virBufferAsprintf");
    let mut has_return = false;
    let builtin = mtype.builtin();

    if mtype.kind == TypeKind::Struct {
        funcname = mtype.format_name();
        args.extend(actual_args(&mtype.formatfunc.args, &member.format.args, cg.table)?);
        has_return = true;
    } else if mtype.kind == TypeKind::Enum {
        tmpl = render(
            T_FORMAT_MEMBER_OF_ENUM,
            &[("fullname", mtype.name.as_str()), ("oname", member.id.as_str())],
        );
    } else if !mtype.name.is_empty() || !mtype.formatfunc.name.is_empty() {
        funcname = mtype.format_name();
        has_return = true;
    } else if matches!(
        builtin,
        Some(Builtin::String | Builtin::Chars | Builtin::UChars)
    ) {
        funcname = "virBufferEscapeString".to_string();
    } else if builtin == Some(Builtin::Time) {
        funcname = "virTimeFormatBuf".to_string();
    } else if matches!(
        builtin,
        Some(Builtin::Bool | Builtin::BoolYesNo | Builtin::BoolOnOff)
    ) {
        let token = true_token(member, mtype);
        var = match builtin {
            Some(Builtin::BoolYesNo) => format!("{var} ? \"yes\" : \"no\""),
            Some(Builtin::BoolOnOff) => format!("{var} ? \"on\" : \"off\""),
            _ => match token.as_str() {
                "yes" => format!("{var} ? \"yes\" : \"no\""),
                "on" => format!("{var} ? \"on\" : \"off\""),
                other => format!("{var} ? \"{other}\" : \"\""),
            },
        };
    } else if mtype.kind == TypeKind::Constant {
        tmpl = String::from("virBufferAddLit(buf, \"${layout}\")");
        let value = mtype.values.first().map(String::as_str).unwrap_or("yes");
        layout = format!(" {}='{}'", member.id, value);
    }

    let mut argstr = args.join(", ");
    if !argstr.is_empty() {
        argstr = format!(", {argstr}");
    }

    let mut code = render(
        &tmpl,
        &[
            ("funcname", funcname.as_str()),
            ("layout", layout.as_str()),
            ("var", var.as_str()),
            ("args", argstr.as_str()),
        ],
    );
    if has_return {
        code.push_str(" < 0");
        code = render(
            T_IF_CONDITION_SINGLE,
            &[("condition", code.as_str()), ("body", "return -1;")],
        );
    } else if mtype.kind != TypeKind::Enum {
        code.push(';');
    }
    Ok(code)
}

fn attr_code(
    cg: &Codegen,
    member: &Member,
    mtype: &Type,
    var: &str,
) -> Result<Option<String>> {
    if member.tag != MemberTag::Attribute {
        return Ok(None);
    }
    let fmt = if !member.format.fmt.is_empty() {
        member.format.fmt.clone()
    } else if let Some(b) = mtype.builtin() {
        b.fmt().to_string()
    } else {
        "%s".to_string()
    };
    let layout = format!(" {}='{}'", member.id, fmt);
    format_code(cg, member, mtype, &layout, var).map(Some)
}

fn elem_code(
    cg: &Codegen,
    member: &Member,
    mtype: &Type,
    var: &str,
) -> Result<Option<String>> {
    if member.tag == MemberTag::Attribute {
        return Ok(None);
    }
    let tag = &member.id;
    let layout = if mtype.kind != TypeKind::Struct {
        format!("<{tag}>%s</{tag}>\\n")
    } else {
        tag.clone()
    };
    format_code(cg, member, mtype, &layout, var).map(Some)
}

fn format_member(
    cg: &Codegen,
    member: &Member,
    require: Require,
    ret_checks: &mut Vec<String>,
    ret_decls: &mut Vec<String>,
    atype: &Type,
    pack: Option<&Member>,
) -> Result<Option<String>> {
    if member.format.disable {
        return Ok(None);
    }
    let mtype = cg.table.expect(member.type_id)?;

    // A packed or union type formats through its real members; its guard is
    // the OR of theirs.
    if mtype.embedded_only() {
        let mut checks = Vec::new();
        let mut block = BlockAssembler::new();
        for child in &mtype.members {
            block.push_opt(format_member(
                cg,
                child,
                require,
                &mut checks,
                ret_decls,
                atype,
                Some(member),
            )?);
        }
        let checks = dedup(checks);
        if !checks.is_empty() {
            ret_checks.push(checks.join(" || "));
        }
        if block.is_empty() {
            return Ok(None);
        }
        return Ok(Some(block.output("\n\n")));
    }

    if member.tag == MemberTag::Virtual {
        return Ok(None);
    }

    let var = make_var(member, mtype, pack);
    let ret = match require {
        Require::Attribute => attr_code(cg, member, mtype, &var)?,
        Require::Element => elem_code(cg, member, mtype, &var)?,
    };
    let Some(mut ret) = ret else {
        return Ok(None);
    };

    let checks = check_on_condition(cg, member, mtype, &var, atype, ret_decls)?;
    if let Some(checks) = &checks {
        ret = indent(&ret, 1);
        ret = if singleline(&ret) {
            render(
                T_IF_CONDITION_SINGLE,
                &[("condition", checks.as_str()), ("body", ret.as_str())],
            )
        } else {
            render(
                T_IF_CONDITION_MULTI,
                &[("condition", checks.as_str()), ("body", ret.as_str())],
            )
        };
    }

    if member.more {
        return Ok(Some(handle_more(member, pack, &ret, ret_checks)));
    }

    if let Some(mut checks) = checks {
        if checks.contains("&&") || checks.contains("||") {
            checks = format!("({checks})");
        }
        ret_checks.push(checks);
    }
    Ok(Some(ret))
}

fn reorder(members: &[Member], order: &[String]) -> Result<Vec<Member>> {
    if order.is_empty() {
        return Ok(members.to_vec());
    }
    let mut ret = Vec::new();
    for mid in order {
        let found = members.iter().find(|m| &m.id == mid).ok_or_else(|| {
            Error::resolution(format!("unknown member '{mid}' in format order"))
        })?;
        ret.push(found.clone());
    }
    if order.len() < members.len() {
        for member in members {
            if !order.contains(&member.id) {
                ret.push(member.clone());
            }
        }
    }
    Ok(ret)
}

struct Outcome {
    code: String,
    all_checks: Option<String>,
    prechecks: Vec<String>,
}

fn build(cg: &Codegen, atype: &Type) -> Result<Outcome> {
    let mut prechecks = Vec::new();
    let members = reorder(&atype.members, &atype.formatfunc.order)?;

    let mut attrs: Vec<String> = Vec::new();
    let mut elems: Vec<String> = Vec::new();
    let mut check_attrs: Vec<String> = Vec::new();
    let mut check_elems: Vec<String> = Vec::new();
    for member in &members {
        if let Some(attr) = format_member(
            cg,
            member,
            Require::Attribute,
            &mut check_attrs,
            &mut prechecks,
            atype,
            None,
        )? {
            attrs.push(attr);
        }
        if let Some(elem) = format_member(
            cg,
            member,
            Require::Element,
            &mut check_elems,
            &mut prechecks,
            atype,
            None,
        )? {
            elems.push(elem);
        }
    }

    let mut all_checks = None;
    let mut out = BlockAssembler::new();
    if check_attrs.len() == attrs.len() && check_elems.len() == elems.len() {
        let mut combined = check_attrs.clone();
        combined.extend(check_elems.iter().cloned());
        let checks = combined.join(" || ");
        if !checks.is_empty() {
            out.push(render(
                T_IF_CONDITION_SINGLE,
                &[
                    ("condition", format!("!({checks})").as_str()),
                    ("body", "return 0;"),
                ],
            ));
            all_checks = Some(checks);
        }
    }

    out.push("virBufferAsprintf(buf, \"<%s\", name);");
    if atype.namespace {
        out.push(T_NAMESPACE_FORMAT_BEGIN.trim());
    }
    let has_attrs = !attrs.is_empty();
    out.extend(attrs);

    if !elems.is_empty() {
        if !atype.formatfunc.noshorthand
            && has_attrs
            && check_elems.len() == elems.len()
            && !check_elems.is_empty()
        {
            let checks = check_elems.join(" || ");
            out.push(render(T_FORMAT_SHORTHAND, &[("checks", checks.as_str())]));
        }
        let mut elements = elems.join("\n\n");
        if atype.namespace {
            elements.push_str("\n\n");
            elements.push_str(T_NAMESPACE_FORMAT_END.trim());
        }
        out.push(render(T_FORMAT_ELEMENTS, &[("elements", elements.as_str())]));
    } else {
        out.push("virBufferAddLit(buf, \"/>\\n\");");
    }

    Ok(Outcome {
        code: out.output("\n\n"),
        all_checks,
        prechecks,
    })
}

pub(super) fn emit(cg: &Codegen, writer: &mut CodeWriter, atype: &Type) -> Result<()> {
    if atype.embedded_only() {
        return Ok(());
    }

    let funcname = atype.format_name();
    let typename = cg.exposed_name(atype)?;
    let alignment = align(&funcname);

    let mut args: Vec<FuncArg> = vec![
        FuncArg {
            name: "buf".to_string(),
            ctype: "virBufferPtr".to_string(),
            ..Default::default()
        },
        FuncArg {
            name: "name".to_string(),
            ctype: "const char".to_string(),
            pointer: true,
            ..Default::default()
        },
        FuncArg {
            name: "def".to_string(),
            ctype: format!("const {typename}"),
            pointer: true,
            ..Default::default()
        },
    ];
    args.extend(atype.formatfunc.args.iter().cloned());
    let formal = formal_args(&args, cg.table)?;
    let joined = formal.join(&format!(",\n{alignment}"));

    let outcome = build(cg, atype)?;
    cg.check_cache
        .borrow_mut()
        .insert(atype.id, outcome.all_checks.clone());

    let mut decl = render(
        T_FORMAT_FUNC_DECL,
        &[("funcname", funcname.as_str()), ("formal_args", joined.as_str())],
    );
    if !outcome.prechecks.is_empty() {
        decl.push_str("\n\n");
        decl.push_str(&dedup(outcome.prechecks.clone()).join("\n\n"));
    }
    writer.write(cg.table, atype, Kind::Format, Ext::H, &decl);

    let imp = render(
        T_FORMAT_FUNC_IMPL,
        &[
            ("funcname", funcname.as_str()),
            ("formal_args", joined.as_str()),
            ("format_members", indent(&outcome.code, 1).as_str()),
        ],
    );
    writer.write(cg.table, atype, Kind::Format, Ext::C, &imp);
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

    #[test]
    fn numeric_attribute_renders_with_its_printf_layout() {
        let mut table = TypeTable::new();
        let uint = table.get_by_location("UInt").unwrap().id;
        let mtu =
            Member::from_payload(uint, "mtu", MemberTag::Attribute, &Default::default())
                .unwrap();
        let ctx = site("interface", &[("interface", ".element")]);
        let id = table
            .register(TypeKind::Struct, &ctx, vec![mtu], vec![])
            .unwrap();
        let cg = Codegen::new(&table);
        let atype = cg.table.get(id).unwrap();

        let mut checks = Vec::new();
        let mut decls = Vec::new();
        let code = format_member(
            &cg,
            &atype.members[0],
            Require::Attribute,
            &mut checks,
            &mut decls,
            atype,
            None,
        )
        .unwrap()
        .unwrap();
        assert!(code.contains("if (def->mtu)"));
        assert!(code.contains("virBufferAsprintf(buf, \" mtu='%u'\", def->mtu);"));
        assert_eq!(checks, vec!["def->mtu".to_string()]);
    }

    #[test]
    fn enum_members_report_unknown_values() {
        let mut table = TypeTable::new();
        let enum_ctx = site("state", &[("state", ".attribute")]);
        let enum_id = table
            .register(
                TypeKind::Enum,
                &enum_ctx,
                vec![],
                vec!["up".to_string(), "down".to_string()],
            )
            .unwrap();
        let state =
            Member::from_payload(enum_id, "state", MemberTag::Attribute, &Default::default())
                .unwrap();
        let ctx = site("interface", &[("interface", ".element")]);
        let id = table
            .register(TypeKind::Struct, &ctx, vec![state], vec![])
            .unwrap();
        let cg = Codegen::new(&table);
        let atype = cg.table.get(id).unwrap();

        let mut checks = Vec::new();
        let mut decls = Vec::new();
        let code = format_member(
            &cg,
            &atype.members[0],
            Require::Attribute,
            &mut checks,
            &mut decls,
            atype,
            None,
        )
        .unwrap()
        .unwrap();
        assert!(code.contains("virStateTypeToString(def->state)"));
        assert!(code.contains("Unknown state type %d"));
        assert!(code.contains("virBufferAsprintf(buf, \" state='%s'\", str);"));
    }

    #[test]
    fn flag_gates_replace_or_extend_the_guard() {
        let mut table = TypeTable::new();
        let uint = table.get_by_location("UInt").unwrap().id;
        let mut mtu =
            Member::from_payload(uint, "mtu", MemberTag::Attribute, &Default::default())
                .unwrap();
        mtu.format.flag = "VIR_NET_FORMAT_INACTIVE".to_string();
        let ctx = site("interface", &[("interface", ".element")]);
        let id = table
            .register(TypeKind::Struct, &ctx, vec![mtu], vec![])
            .unwrap();
        let cg = Codegen::new(&table);
        let atype = cg.table.get(id).unwrap();
        let mtype = cg.table.expect(atype.members[0].type_id).unwrap();

        let mut decls = Vec::new();
        let gate = check_on_condition(
            &cg,
            &atype.members[0],
            mtype,
            "def->mtu",
            atype,
            &mut decls,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            gate,
            "def->mtu && (virXMLFlag(opaque) & VIR_NET_FORMAT_INACTIVE)"
        );

        let mut exclusive = atype.members[0].clone();
        exclusive.format.flag = "%!VIR_NET_FORMAT_INACTIVE".to_string();
        let gate = check_on_condition(&cg, &exclusive, mtype, "def->mtu", atype, &mut decls)
            .unwrap()
            .unwrap();
        assert_eq!(gate, "!(virXMLFlag(opaque) & VIR_NET_FORMAT_INACTIVE)");
    }

    #[test]
    fn boolean_members_render_their_token_pair() {
        let mut table = TypeTable::new();
        let yesno = table.get_by_location("Bool.yes_no").unwrap().id;
        let member =
            Member::from_payload(yesno, "autostart", MemberTag::Attribute, &Default::default())
                .unwrap();
        let cg = Codegen::new(&table);
        let mtype = cg.table.expect(yesno).unwrap();

        let code = format_code(&cg, &member, mtype, " autostart='%s'", "def->autostart")
            .unwrap();
        assert_eq!(
            code,
            "virBufferAsprintf(buf, \" autostart='%s'\", def->autostart ? \"yes\" : \"no\");"
        );
    }
}
