//! Terminal rendering of dependency trees and pass/fail markers.

use std::fmt::Write as _;

use crate::orchestrator::DependencyNode;

/// Characters used to draw trees and status markers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Glyphs {
    /// Branch to a child that has later siblings.
    pub branch: &'static str,
    /// Branch to the last child.
    pub last: &'static str,
    /// Horizontal arm between branch and label.
    pub arm: &'static str,
    /// Vertical continuation for deeper levels.
    pub pipe: &'static str,
    /// Success marker.
    pub pass: &'static str,
    /// Failure marker.
    pub fail: &'static str,
}

impl Glyphs {
    /// Box-drawing characters and check marks.
    #[must_use]
    pub const fn unicode() -> Self {
        Self {
            branch: "\u{251c}",
            last: "\u{2514}",
            arm: "\u{2500}",
            pipe: "\u{2502}",
            pass: "\u{2713}",
            fail: "\u{2718}",
        }
    }

    /// Plain ASCII fallback.
    #[must_use]
    pub const fn ascii() -> Self {
        Self {
            branch: "|",
            last: "\\",
            arm: "-",
            pipe: "|",
            pass: "PASS",
            fail: "FAIL",
        }
    }

    /// Pick glyphs from locale variables.
    ///
    /// `lookup` is queried for `LC_ALL`, `LC_CTYPE` and `LANG` in that order;
    /// the first non-empty value decides. Unicode is used only when its
    /// encoding is UTF-8.
    pub fn detect(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let locale = ["LC_ALL", "LC_CTYPE", "LANG"]
            .into_iter()
            .filter_map(&lookup)
            .find(|v| !v.is_empty());
        let utf8 = locale
            .as_deref()
            .and_then(|l| l.split_once('.'))
            .map(|(_, enc)| enc.split('@').next().unwrap_or(enc))
            .is_some_and(|enc| {
                enc.eq_ignore_ascii_case("utf-8") || enc.eq_ignore_ascii_case("utf8")
            });
        if utf8 { Self::unicode() } else { Self::ascii() }
    }

    /// Marker for a pass or a fail.
    #[must_use]
    pub const fn status(&self, passed: bool) -> &'static str {
        if passed { self.pass } else { self.fail }
    }
}

/// Render a tree: the root on its own line, then one indented line per
/// descendant.
#[must_use]
pub fn render(root: &DependencyNode, glyphs: &Glyphs) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", root.port);
    render_children(&root.children, glyphs, &mut String::new(), &mut out);
    out
}

fn render_children(
    children: &[DependencyNode],
    glyphs: &Glyphs,
    prefix: &mut String,
    out: &mut String,
) {
    let last = children.len().saturating_sub(1);
    for (i, child) in children.iter().enumerate() {
        let is_last = i == last;
        let branch = if is_last { glyphs.last } else { glyphs.branch };
        let _ = writeln!(out, " {prefix}{branch}{}{}", glyphs.arm, child.port);

        let len = prefix.len();
        if is_last {
            prefix.push_str("   ");
        } else {
            let _ = write!(prefix, " {} ", glyphs.pipe);
        }
        render_children(&child.children, glyphs, prefix, out);
        prefix.truncate(len);
    }
}
