//! Clear-function synthesis: release owned storage and zero the structure
//! field by field, nested aggregates through their own clear functions.

use crate::emit::{Codegen, T_LOOP_MULTI, T_LOOP_SINGLE};
use crate::error::Result;
use crate::model::{flatten_members, Builtin, Member, Type, TypeKind};
use crate::terms;
use crate::tpl::{indent, render, singleline, BlockAssembler};
use crate::writer::{CodeWriter, Ext, Kind};

const T_CLEAR_FUNC_IMPL: &str = "
void
${funcname}(${typename}Ptr def)
{
    if (!def)
        return;

    ${body}
}
";

const T_CLEAR_FUNC_DECL: &str = "
void
${funcname}(${typename}Ptr def);
";

const T_CLEAR_NAMESPACE: &str = "
if (def->namespaceData && def->ns.free)
    (def->ns.free)(def->namespaceData);
";

fn clear_member(cg: &Codegen, member: &Member) -> Result<String> {
    let mtype = cg.table.expect(member.type_id)?;
    let name = if member.more {
        format!("def->{}[i]", terms::pluralize(&member.name))
    } else {
        format!("def->{}", member.name)
    };

    let mut code = String::new();
    let funcname = mtype.clear_name().filter(|_| mtype.kind != TypeKind::Enum);
    if let Some(funcname) = funcname {
        let amp = if member.pointer { "" } else { "&" };
        code = format!("{funcname}({amp}{name});");
        if member.pointer {
            code.push_str(&format!("\nVIR_FREE({name});"));
        }
    } else if mtype.builtin() == Some(Builtin::String) {
        code = format!("VIR_FREE({name});");
    } else if matches!(mtype.builtin(), Some(Builtin::Chars | Builtin::UChars)) {
        code = format!("memset({name}, 0, sizeof({name}));");
    } else if !member.more {
        code = format!("{name} = 0;");
    }

    if member.more {
        if !code.is_empty() {
            let plural = terms::pluralize(&member.name);
            let counter = terms::counter_name(&member.name);
            code = if singleline(&code) {
                render(
                    T_LOOP_SINGLE,
                    &[("counter", counter.as_str()), ("body", code.as_str())],
                )
            } else {
                render(
                    T_LOOP_MULTI,
                    &[("counter", counter.as_str()), ("body", indent(&code, 2).as_str())],
                )
            };
            code.push_str(&format!("\nVIR_FREE(def->{plural});\ndef->{counter} = 0;"));
        }
    } else if member.specified {
        code.push_str(&format!("\n{name}_specified = false;"));
    }

    Ok(code)
}

pub(super) fn emit(cg: &Codegen, writer: &mut CodeWriter, atype: &Type) -> Result<()> {
    // An unpack type's fields are cleared by the host's function.
    if atype.unpack || atype.clearfunc.disable {
        return Ok(());
    }
    let funcname = match atype.clear_name() {
        Some(funcname) => funcname,
        None => return Ok(()),
    };

    let mut blocks = BlockAssembler::new();
    for member in flatten_members(&atype.members, cg.table)? {
        blocks.push(clear_member(cg, &member)?);
    }
    if atype.namespace {
        blocks.push(T_CLEAR_NAMESPACE.trim());
    }

    let decl = render(
        T_CLEAR_FUNC_DECL,
        &[("funcname", funcname.as_str()), ("typename", atype.name.as_str())],
    );
    let imp = render(
        T_CLEAR_FUNC_IMPL,
        &[
            ("funcname", funcname.as_str()),
            ("typename", atype.name.as_str()),
            ("body", indent(&blocks.output("\n\n"), 1).as_str()),
        ],
    );

    writer.write(cg.table, atype, Kind::Clear, Ext::H, &decl);
    writer.write(cg.table, atype, Kind::Clear, Ext::C, &imp);
    Ok(())
}
