//! Artifact compiler for Larder recipes.
//!
//! Turns native, shell, query and statistical recipe artifacts into uniform
//! [`ProgramDescriptor`]s: the registration header is located, the payload is
//! sliced out, and the `args` map is compiled into [`ArgumentRule`]s over a
//! closed [`Expression`] language.
//!
//! # Example
//! ```
//! use larder_parse::{compile_artifact, Dialect, RawArtifact};
//!
//! let text = "###+\n# @register(REG, MakeDir)\n###+\nmkdir -p {path}\n";
//! let artifact = RawArtifact::new(text, Dialect::Shell, "mkdir.sh");
//! let descriptors = compile_artifact(&artifact).unwrap();
//! assert_eq!(descriptors[0].constraint_name, "MakeDir");
//! assert_eq!(descriptors[0].body, "mkdir -p {path}");
//! assert_eq!(descriptors[0].entrypoint, "@register(REG, MakeDir)");
//! ```

pub mod ast;
pub mod body;
pub mod call;
pub mod compiler;
pub mod expression;
pub mod header;
pub mod rules;

pub use ast::*;
pub use body::{slice_block, slice_body};
pub use call::{parse_registration, Registration, Segment};
pub use compiler::{compile_artifact, ArtifactCompiler, CompileOptions};
pub use expression::compile_rule;
pub use header::{extract_header, HeaderSpan};
pub use larder_types::Dialect;
pub use rules::compile_argument_rules;
