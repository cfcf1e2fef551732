//! Structure synthesis: the C typedef for a Struct, the enum declaration
//! plus `VIR_ENUM_IMPL` table for an Enum.

use crate::emit::{align, Codegen};
use crate::error::{Error, Result};
use crate::model::{flatten_members, Builtin, Member, Type, TypeKind};
use crate::terms;
use crate::tpl::{indent, render, BlockAssembler};
use crate::writer::{CodeWriter, Ext, Kind};

const T_STRUCT_STRUCTURE: &str = "
typedef struct _${fullname} ${fullname};
typedef ${fullname} *${fullname}Ptr;
struct _${fullname} {
    ${members}
};
";

const T_ENUM_STRUCTURE_DECL: &str = "
typedef enum {
    ${caps_shortname}_${default} = 0,
    ${values}
    ${caps_shortname}_LAST,
} ${fullname};

VIR_ENUM_DECL(${shortname});
";

const T_ENUM_STRUCTURE_IMPL: &str = "
VIR_ENUM_IMPL(${shortname},
${indentation}${caps_shortname}_LAST,
${indentation}${array},
);
";

fn declare_member(cg: &Codegen, member: &Member) -> Result<String> {
    let mtype = cg.table.expect(member.type_id)?;

    let suffix = match mtype.builtin() {
        Some(Builtin::Chars | Builtin::UChars) => format!("[{}]", mtype.structure.size),
        _ => String::new(),
    };
    let comment = if member.declare.comment.is_empty() {
        String::new()
    } else {
        format!(" /* {} */", member.declare.comment)
    };
    let declare = |type_decl: &str, asterisk: bool, gap: &str, name: &str| {
        let asterisk = if asterisk { "*" } else { "" };
        format!("{type_decl}{gap}{asterisk}{name}{suffix};{comment}")
    };

    let mut code = String::new();
    if member.more {
        code.push_str(&format!(
            "size_t {};\n",
            terms::counter_name(&member.name)
        ));
        code.push_str(&declare(
            &mtype.pointer_decl(),
            member.pointer,
            mtype.gap(),
            &terms::pluralize(&member.name),
        ));
    } else {
        code.push_str(&declare(
            &mtype.proto(member.pointer),
            false,
            mtype.gap(),
            &member.name,
        ));
        if member.specified {
            code.push_str(&format!("\nbool {}_specified;", member.name));
        }
    }
    Ok(code)
}

fn member_block(cg: &Codegen, atype: &Type) -> Result<String> {
    let mut blocks = BlockAssembler::new();
    for member in flatten_members(&atype.members, cg.table)? {
        blocks.push(declare_member(cg, &member)?);
    }
    if atype.namespace {
        blocks.push("void *namespaceData;");
        blocks.push("virXMLNamespace ns;");
    }
    Ok(blocks.output("\n"))
}

pub(super) fn emit(cg: &Codegen, writer: &mut CodeWriter, atype: &Type) -> Result<()> {
    // An unpack type contributes its raw member block to the host typedef.
    if atype.unpack {
        writer.write(cg.table, atype, Kind::Structure, Ext::H, &member_block(cg, atype)?);
        return Ok(());
    }

    match atype.kind {
        TypeKind::Struct => {
            let members = indent(&member_block(cg, atype)?, 1);
            let decl = render(
                T_STRUCT_STRUCTURE,
                &[("fullname", atype.name.as_str()), ("members", members.as_str())],
            );
            writer.write(cg.table, atype, Kind::Structure, Ext::H, &decl);
        }
        TypeKind::Enum => {
            if atype.name.is_empty() {
                return Err(Error::internal(format!(
                    "anonymous enum at '{}'",
                    atype.location
                )));
            }
            let shortname = atype.name.strip_suffix("Type").unwrap_or(&atype.name);
            let caps = terms::allcaps(shortname);
            let default = if atype.structure.default.is_empty() {
                "none"
            } else {
                &atype.structure.default
            };

            let mut values: Vec<String> = vec![default.to_string()];
            values.extend(atype.values.iter().cloned());
            let items: Vec<String> = values
                .iter()
                .map(|v| format!("{caps}_{}", terms::allcaps(v).replace('.', "")))
                .collect();

            let listed = format!("{},", items[1..].join(",\n"));
            let decl = render(
                T_ENUM_STRUCTURE_DECL,
                &[
                    ("shortname", shortname),
                    ("caps_shortname", caps.as_str()),
                    ("fullname", atype.name.as_str()),
                    ("default", terms::allcaps(default).as_str()),
                    ("values", indent(&listed, 1).as_str()),
                ],
            );
            writer.write(cg.table, atype, Kind::Structure, Ext::H, &decl);

            let array = values
                .iter()
                .map(|v| format!("\"{v}\""))
                .collect::<Vec<_>>()
                .join(", ");
            let imp = render(
                T_ENUM_STRUCTURE_IMPL,
                &[
                    ("shortname", shortname),
                    ("caps_shortname", caps.as_str()),
                    ("indentation", align("VIR_ENUM_IMPL").as_str()),
                    ("array", array.as_str()),
                ],
            );
            writer.write(cg.table, atype, Kind::Structure, Ext::C, &imp);
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::Ctx;
    use crate::model::MemberTag;
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
    fn struct_fields_follow_their_builtins() {
        let mut table = TypeTable::new();
        let uint = table.get_by_location("UInt").unwrap().id;
        let string = table.get_by_location("String").unwrap().id;

        let mtu =
            Member::from_payload(uint, "mtu", MemberTag::Attribute, &Default::default())
                .unwrap();
        let mut links =
            Member::from_payload(string, "link", MemberTag::Element, &Default::default())
                .unwrap();
        links.more = true;
        let mut mac =
            Member::from_payload(string, "mac", MemberTag::Attribute, &Default::default())
                .unwrap();
        mac.specified = true;

        let ctx = site("interface", &[("interface", ".element")]);
        let id = table
            .register(TypeKind::Struct, &ctx, vec![mtu, links, mac], vec![])
            .unwrap();
        let cg = Codegen::new(&table);
        let block = member_block(&cg, cg.table.get(id).unwrap()).unwrap();

        assert!(block.contains("unsigned int mtu;"));
        assert!(block.contains("size_t nlinks;"));
        assert!(block.contains("char **links;"));
        assert!(block.contains("char *mac;"));
        assert!(block.contains("bool mac_specified;"));
    }

    #[test]
    fn enum_values_get_capitalized_items() {
        let mut table = TypeTable::new();
        let ctx = site("state", &[("state", ".attribute")]);
        let id = table
            .register(
                TypeKind::Enum,
                &ctx,
                vec![],
                vec!["up".to_string(), "down".to_string()],
            )
            .unwrap();
        let atype = table.get(id).unwrap();
        assert_eq!(atype.name, "virStateType");

        let shortname = atype.name.strip_suffix("Type").unwrap();
        assert_eq!(shortname, "virState");
        assert_eq!(terms::allcaps(shortname), "VIR_STATE");
    }
}
