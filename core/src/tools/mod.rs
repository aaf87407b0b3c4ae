mod create_file;
mod glob;
mod grep;
mod str_replace;
mod view;

pub use create_file::create_file;
pub use glob::GlobParams;
pub use glob::glob;
pub use grep::GrepParams;
pub use grep::grep;
pub use str_replace::str_replace;
pub use view::ViewResult;
pub use view::view;

use std::fmt::Write as _;

/// `cat -n` style gutter shared by `view` output and edit snippets.
pub(crate) fn push_numbered_line(out: &mut String, lineno: u64, line: &str) {
    let _ = writeln!(out, "{lineno:6}\t{line}");
}
