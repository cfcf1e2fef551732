//! Template substrate for code synthesis: templates are parsed once into an
//! ordered list of literal/placeholder fragments and rendered against a name
//! → text table. Unresolved placeholders survive verbatim, so a template can
//! be rendered in stages (function name first, member variables later).

use std::fmt::Write as _;

#[derive(Debug, Clone)]
enum Frag {
    Lit(String),
    Slot(String),
}

#[derive(Debug, Clone)]
pub struct Template {
    frags: Vec<Frag>,
}

impl Template {
    pub fn new(src: &str) -> Self {
        let mut frags = Vec::new();
        let mut lit = String::new();
        let bytes = src.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                if let Some(end) = src[i + 2..].find('}') {
                    if !lit.is_empty() {
                        frags.push(Frag::Lit(std::mem::take(&mut lit)));
                    }
                    frags.push(Frag::Slot(src[i + 2..i + 2 + end].to_string()));
                    i += end + 3;
                    continue;
                }
            }
            let ch = src[i..].chars().next().unwrap();
            lit.push(ch);
            i += ch.len_utf8();
        }
        if !lit.is_empty() {
            frags.push(Frag::Lit(lit));
        }
        Template { frags }
    }

    /// Substitute known slots, keep unknown ones, trim the result.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut out = String::new();
        for frag in &self.frags {
            match frag {
                Frag::Lit(s) => out.push_str(s),
                Frag::Slot(name) => match vars.iter().find(|(k, _)| k == name) {
                    Some((_, v)) => out.push_str(v),
                    None => {
                        let _ = write!(out, "${{{name}}}");
                    }
                },
            }
        }
        out.trim().to_string()
    }
}

pub fn render(src: &str, vars: &[(&str, &str)]) -> String {
    Template::new(src).render(vars)
}

pub fn singleline(code: &str) -> bool {
    !code.trim().contains('\n')
}

/// Indent every continuation line by `count` levels of four spaces. The
/// first line stays flush because rendered blocks land after template
/// indentation of their own.
pub fn indent(block: &str, count: usize) -> String {
    if block.is_empty() {
        return String::new();
    }
    let pad = " ".repeat(4 * count);
    let lines: Vec<String> = block
        .trim()
        .split('\n')
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect();
    lines.join("\n").trim().to_string()
}

/// Collects non-empty text blocks and joins them on demand.
#[derive(Debug, Clone, Default)]
pub struct BlockAssembler {
    blocks: Vec<String>,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: impl Into<String>) {
        let block = block.into();
        if !block.is_empty() {
            self.blocks.push(block);
        }
    }

    pub fn push_opt(&mut self, block: Option<String>) {
        if let Some(block) = block {
            self.push(block);
        }
    }

    pub fn extend(&mut self, blocks: impl IntoIterator<Item = String>) {
        for block in blocks {
            self.push(block);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn output(&self, connector: &str) -> String {
        self.blocks.join(connector)
    }
}

/// Order-preserving dedup; guard lists are tiny.
pub fn dedup(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_and_trims() {
        assert_eq!(
            render("\n${a} = ${b};\n", &[("a", "x"), ("b", "1500")]),
            "x = 1500;"
        );
    }

    #[test]
    fn unknown_slots_survive_for_later_passes() {
        let first = render("${funcname}(${mdvar})", &[("funcname", "parse")]);
        assert_eq!(first, "parse(${mdvar})");
        assert_eq!(render(&first, &[("mdvar", "node")]), "parse(node)");
    }

    #[test]
    fn indent_skips_first_line_and_blanks() {
        let block = "if (x) {\n    y;\n\n}";
        assert_eq!(indent(block, 1), "if (x) {\n        y;\n\n    }");
    }

    #[test]
    fn assembler_drops_empty_blocks() {
        let mut blocks = BlockAssembler::new();
        blocks.push("a");
        blocks.push("");
        blocks.push("b");
        assert_eq!(blocks.output("\n\n"), "a\n\nb");
    }
}
