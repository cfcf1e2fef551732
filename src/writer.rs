//! Routes generated artifacts to their destinations: preview on stdout for
//! `show`, batched `.generated.h`/`.generated.c` files for `generate`.

use std::fs;
use std::path::PathBuf;

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::model::{Type, TypeId};
use crate::table::TypeTable;
use crate::terms;

/// Artifact kinds, selected on the command line as `s`/`c`/`p`/`f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Structure,
    Clear,
    Parse,
    Format,
}

impl Kind {
    pub fn label(self) -> &'static str {
        match self {
            Kind::Structure => "structure",
            Kind::Clear => "clearfunc",
            Kind::Parse => "parsefunc",
            Kind::Format => "formatfunc",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KindSet {
    pub structure: bool,
    pub clear: bool,
    pub parse: bool,
    pub format: bool,
}

impl KindSet {
    /// Parse a `-k` selector. `None` selects nothing (a dry run).
    pub fn from_spec(spec: Option<&str>) -> Result<KindSet> {
        let mut set = KindSet::default();
        for c in spec.unwrap_or_default().chars() {
            match c {
                's' => set.structure = true,
                'c' => set.clear = true,
                'p' => set.parse = true,
                'f' => set.format = true,
                other => {
                    return Err(Error::resolution(format!(
                        "unknown kind '{other}' (expected s, c, p or f)"
                    )));
                }
            }
        }
        Ok(set)
    }

    pub fn contains(&self, kind: Kind) -> bool {
        match kind {
            Kind::Structure => self.structure,
            Kind::Clear => self.clear,
            Kind::Parse => self.parse,
            Kind::Format => self.format,
        }
    }

    pub fn any(&self) -> bool {
        self.structure || self.clear || self.parse || self.format
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ext {
    H,
    C,
}

impl Ext {
    fn suffix(self) -> &'static str {
        match self {
            Ext::H => ".h",
            Ext::C => ".c",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Mode {
    /// Print the selected type's artifacts instead of writing files.
    Show { target: TypeId },
    Generate,
}

pub struct CodeWriter {
    output_dir: PathBuf,
    kinds: KindSet,
    mode: Mode,
    batches: IndexMap<PathBuf, String>,
}

impl CodeWriter {
    pub fn new(output_dir: impl Into<PathBuf>, kinds: KindSet, mode: Mode) -> CodeWriter {
        CodeWriter {
            output_dir: output_dir.into(),
            kinds,
            mode,
            batches: IndexMap::new(),
        }
    }

    fn routing<'t>(atype: &'t Type, kind: Kind) -> &'t str {
        match kind {
            Kind::Structure => &atype.structure.output,
            Kind::Clear => &atype.clearfunc.output,
            Kind::Parse => &atype.parsefunc.output,
            Kind::Format => &atype.formatfunc.output,
        }
    }

    pub fn write(
        &mut self,
        table: &TypeTable,
        atype: &Type,
        kind: Kind,
        ext: Ext,
        content: &str,
    ) {
        if !self.kinds.contains(kind) {
            return;
        }

        match &self.mode {
            Mode::Show { target } => {
                if *target != atype.id {
                    return;
                }
                if ext == Ext::H {
                    let mut info = terms::upper_initial(kind.label());
                    if atype.unpack {
                        let parent = atype
                            .parent
                            .and_then(|p| table.get(p))
                            .map(|p| p.name.as_str())
                            .unwrap_or("?");
                        info += &format!(" (Unpack: expose to \"{parent}\".)");
                    } else if Self::routing(atype, kind).is_empty() {
                        info += &format!(" (Disabled: NO OUTPUT for \"{}\".)", kind.label());
                    }
                    println!("\n###### {info} ######");
                    println!("\n[.h]");
                } else {
                    println!("\n[.c]");
                }
                println!("\n{content}");
            }
            Mode::Generate => {
                let routing = Self::routing(atype, kind);
                if routing.is_empty() {
                    return;
                }
                let path = self
                    .output_dir
                    .join(format!("{routing}.generated{}", ext.suffix()));
                let separator = match ext {
                    Ext::H => "\n",
                    Ext::C => "\n\n",
                };
                let batch = self
                    .batches
                    .entry(path)
                    .or_insert_with(|| Self::file_head(routing, ext));
                batch.push_str(separator);
                batch.push_str(content);
                batch.push('\n');
            }
        }
    }

    fn file_head(routing: &str, ext: Ext) -> String {
        let basename = routing.rsplit('/').next().unwrap_or(routing);
        let mut head = String::from("/* Generated by rng2c */\n\n");
        match ext {
            Ext::H => {
                head.push_str("#pragma once\n\n");
                head.push_str("#include \"internal.h\"\n");
                head.push_str("#include \"virxml.h\"\n");
            }
            Ext::C => {
                head.push_str("#include <config.h>\n");
                head.push_str(&format!("#include \"{basename}.h\"\n"));
                head.push_str("#include \"viralloc.h\"\n");
                head.push_str("#include \"virerror.h\"\n");
                head.push_str("#include \"virstring.h\"\n\n");
                head.push_str("#define VIR_FROM_THIS VIR_FROM_NONE\n");
            }
        }
        head
    }

    /// Flush every batched destination to disk.
    pub fn complete(&mut self) -> Result<()> {
        for (path, content) in self.batches.drain(..) {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, content)?;
        }
        Ok(())
    }

    /// Destinations written so far, for the generate summary.
    pub fn destinations(&self) -> Vec<PathBuf> {
        self.batches.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_specs_parse() {
        let all = KindSet::from_spec(Some("scpf")).unwrap();
        assert!(all.structure && all.clear && all.parse && all.format);
        let none = KindSet::from_spec(None).unwrap();
        assert!(!none.any());
        let some = KindSet::from_spec(Some("sp")).unwrap();
        assert!(some.contains(Kind::Structure) && some.contains(Kind::Parse));
        assert!(!some.contains(Kind::Clear));
        assert!(KindSet::from_spec(Some("x")).is_err());
    }

    #[test]
    fn header_banner_names_the_companion_header() {
        let head = CodeWriter::file_head("conf/network_conf", Ext::C);
        assert!(head.contains("#include \"network_conf.h\""));
        assert!(head.contains("#define VIR_FROM_THIS"));
        let hh = CodeWriter::file_head("conf/network_conf", Ext::H);
        assert!(hh.contains("#pragma once"));
    }
}
