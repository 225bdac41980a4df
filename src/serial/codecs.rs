/// Newline delimited lines.
pub mod lines;
