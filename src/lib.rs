//! C code generation from directive-annotated RELAX-NG grammars.
//!
//! The grammars double as the single source of truth for the XML
//! documents they describe: JSON directive comments embedded in the
//! rules drive the generation of the C struct declarations and of the
//! matching clear, parse and format functions.

pub mod cli;
pub mod directive;
pub mod emit;
pub mod error;
pub mod model;
pub mod schema;
pub mod table;
pub mod terms;
pub mod tpl;
pub mod walker;
pub mod writer;
pub mod xml;
