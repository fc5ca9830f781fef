//! Append-only per-run artifact tree.

mod writer;

pub use writer::{Frontmatter, ReportWriter, ReportWriterFactory, split_frontmatter};
