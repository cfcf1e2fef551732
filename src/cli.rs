//! Command line surface: list / show / generate over annotated grammars.

use std::env;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use crate::emit::{self, Codegen};
use crate::model::{Builtin, Type, TypeKind};
use crate::schema::SchemaDoc;
use crate::table::TypeTable;
use crate::walker::Session;
use crate::writer::{CodeWriter, KindSet, Mode};

/// generate C structure, clear, parse and format code from annotated RELAX-NG grammars
#[derive(Parser, Debug)]
pub struct CommandLineInterface {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// process the grammars and list every type in the table
    List(ListArgs),
    /// preview the directive and the generated code of one type
    Show(ShowArgs),
    /// write the batched .generated.h/.generated.c files
    Generate(GenerateArgs),
}

#[derive(Args, Debug, Clone)]
struct ListArgs {
    #[command(flatten)]
    grammars: GrammarSettings,
}

#[derive(Args, Debug, Clone)]
struct ShowArgs {
    /// target type: a 'grammar/define' location, a builtin name, or a (partial) type id
    target: String,

    #[command(flatten)]
    grammars: GrammarSettings,

    /// code kinds to preview, any combination of s, c, p and f
    #[arg(short)]
    kinds: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct GenerateArgs {
    #[command(flatten)]
    grammars: GrammarSettings,

    /// code kinds to write, any combination of s, c, p and f (dry run if omitted)
    #[arg(short)]
    kinds: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct GrammarSettings {
    /// grammar documents to process, relative to RNG2C_GRAMMAR_DIR
    #[arg(num_args = 1.., required = true)]
    entries: Vec<String>,
}

/// Directory contract shared by every subcommand: both variables must be
/// set at startup, even for the subcommands that never write.
#[derive(Debug)]
struct Environment {
    grammar_dir: PathBuf,
    output_dir: PathBuf,
}

impl Environment {
    fn load() -> Result<Environment> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Environment> {
        let grammar_dir = lookup("RNG2C_GRAMMAR_DIR")
            .ok_or_else(|| anyhow!("RNG2C_GRAMMAR_DIR is not set"))?;
        let output_dir = lookup("RNG2C_OUTPUT_DIR")
            .ok_or_else(|| anyhow!("RNG2C_OUTPUT_DIR is not set"))?;
        Ok(Environment {
            grammar_dir: grammar_dir.into(),
            output_dir: output_dir.into(),
        })
    }
}

impl GrammarSettings {
    fn process(&self, environment: &Environment) -> Result<Session> {
        let schema_path = environment.grammar_dir.join("schema.json");
        let schema = if schema_path.exists() {
            SchemaDoc::load(&schema_path)?
        } else {
            SchemaDoc::bundled()
        };
        let mut session = Session::new(&environment.grammar_dir, schema);
        session.run(&self.entries)?;
        Ok(session)
    }
}

/// Accept a location, a builtin name, a full id or an id prefix.
fn resolve_target<'t>(table: &'t TypeTable, target: &str) -> Result<&'t Type> {
    if target.contains('/') || Builtin::parse(target).is_some() || target == "Constant" {
        return Ok(table.expect_by_location(target)?);
    }
    Ok(table.get_by_partial_id(target)?)
}

impl CommandLineInterface {
    pub fn load() -> Self {
        Self::parse()
    }

    pub fn run(&self) -> Result<()> {
        let environment = Environment::load()?;
        match &self.cmd {
            Command::List(args) => {
                let session = args.grammars.process(&environment)?;
                println!("{}", format!("{:<8}  {:<9}  {}", "SHORT_ID", "META", "LOCATION").bold());
                for atype in session.table.iter() {
                    println!("{:<8}  {:<9}  {}", atype.id.short(), atype.kind.label(), atype.location);
                }
                Ok(())
            }
            Command::Show(args) => {
                let session = args.grammars.process(&environment)?;
                let table = &session.table;
                let atype = resolve_target(table, &args.target)?;

                println!("\n{}\n", "###### Directive ######".bold());
                println!("{}", emit::dump_directive(atype, table));

                let builtin_ctype = match atype.kind {
                    TypeKind::Builtin(builtin) if atype.name.is_empty() => {
                        Some(builtin.ctype().to_string())
                    }
                    TypeKind::Constant if atype.name.is_empty() => Some("bool".to_string()),
                    TypeKind::Builtin(_) | TypeKind::Constant => Some(atype.name.clone()),
                    _ => None,
                };
                if let Some(ctype) = builtin_ctype {
                    println!("\n{}\n", "###### Builtin details ######".bold());
                    println!("ctype: {ctype}");
                }

                let kinds = KindSet::from_spec(args.kinds.as_deref())?;
                if kinds.any() {
                    let target = atype.id;
                    let mut writer = CodeWriter::new(PathBuf::new(), kinds, Mode::Show { target });
                    Codegen::new(table).run(&mut writer)?;
                }
                Ok(())
            }
            Command::Generate(args) => {
                println!("{}", "###### rng2c: start code generation ######".bold());
                let kinds = KindSet::from_spec(args.kinds.as_deref())?;
                if !kinds.any() {
                    println!("{}", "[dry run]: pass -k to write the selected kinds".yellow());
                }
                let started = Instant::now();
                let session = args.grammars.process(&environment)?;
                let mut writer =
                    CodeWriter::new(environment.output_dir.clone(), kinds, Mode::Generate);
                Codegen::new(&session.table).run(&mut writer)?;
                for path in writer.destinations() {
                    println!("  {}", path.display().to_string().green());
                }
                writer.complete()?;

                let elapsed = started.elapsed().as_micros();
                println!("{}", format!("###### rng2c: elapse {elapsed}(us) ######").bold());
                Ok(())
            }
        }
    }
}
