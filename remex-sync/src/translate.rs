//! Local → remote path translation.
//!
//! A local path maps to a path relative to the remote Area cwd:
//!
//! | local                         | remote (separator `/`)        |
//! |-------------------------------|-------------------------------|
//! | `<cwd>/src/a.txt`             | `src/a.txt`                   |
//! | `/etc/x.txt`                  | `_ABS/etc/x.txt`              |
//! | `C:\foo\bar.txt`              | `_ABS/C/foo/bar.txt`          |
//! | `\\server\share\f`            | `_ABS/REMOTE/server/share/f`  |
//!
//! Path shape (drive letter, UNC, POSIX) is decided from the text itself so a
//! Windows path is translated the same way on any host.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Namespace for files that live outside the Source cwd.
pub const ABS_PREFIX: &str = "_ABS";
/// Sub-namespace for UNC paths.
pub const UNC_PREFIX: &str = "REMOTE";

const SEPARATORS: &[char] = &['/', '\\'];

/// Substrings of free text that look like absolute OS paths.
///
/// Group 1 is the path; the optional leading character is context (start of
/// text, whitespace, quote, `=`, `:` ...) and is kept as is. A path must not
/// follow a word character, `.`, or a separator, so relative paths and URLs
/// are left alone.
static PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:^|[^\w./\\])((?:[A-Za-z]:[\\/]|\\\\[^\\/\s"';:,|<>*?]|/[^/\s"';:,|<>*?])[^\s"';:,|<>*?]*)"#,
    )
    .expect("path pattern is valid")
});

/// Shape of a local path string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathShape {
    /// `\\server\share\...`
    Unc,
    /// `C:\...` or `C:/...`
    Drive,
    /// `/...`
    Posix,
    /// Anything else.
    Relative,
}

impl PathShape {
    pub fn of(path: &str) -> Self {
        let bytes = path.as_bytes();
        if path.starts_with("\\\\") {
            PathShape::Unc
        } else if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
            PathShape::Drive
        } else if path.starts_with('/') {
            PathShape::Posix
        } else {
            PathShape::Relative
        }
    }

    pub fn is_absolute(self) -> bool {
        !matches!(self, PathShape::Relative)
    }

    fn is_windows(self) -> bool {
        matches!(self, PathShape::Unc | PathShape::Drive)
    }
}

/// Translate an absolute local path into its remote Area-relative form.
///
/// `cwd` is the Source's working directory (absolute, in local form),
/// `local_separator` the local host convention, and `remote_separator` the
/// Sink's.
pub fn remote_path(
    local: &str,
    cwd: &str,
    local_separator: char,
    remote_separator: char,
) -> String {
    let shape = PathShape::of(local);
    let windows = shape.is_windows() || (shape == PathShape::Relative && local_separator == '\\');

    let raw = match strip_cwd(local, cwd, local_separator) {
        Some("") => return ".".to_string(),
        Some(suffix) => suffix.to_string(),
        None => match shape {
            PathShape::Unc => format!("{ABS_PREFIX}\\{UNC_PREFIX}\\{}", &local[2..]),
            PathShape::Drive => format!("{ABS_PREFIX}\\{}{}", &local[..1], &local[2..]),
            PathShape::Posix => format!("{ABS_PREFIX}{local}"),
            PathShape::Relative => local.to_string(),
        },
    };

    translate_separators(&raw, windows, remote_separator)
}

/// Rewrite every path-shaped substring of `text` with `to_remote`.
///
/// Returns the input unchanged (borrowed) when nothing matched.
pub fn rewrite_paths<'t>(text: &'t str, mut to_remote: impl FnMut(&str) -> String) -> Cow<'t, str> {
    PATH_PATTERN.replace_all(text, |caps: &Captures<'_>| {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            return caps[0].to_string();
        };
        let lead = &whole.as_str()[..path.start() - whole.start()];
        format!("{lead}{}", to_remote(path.as_str()))
    })
}

fn strip_cwd<'a>(local: &'a str, cwd: &str, local_separator: char) -> Option<&'a str> {
    let cwd = cwd.trim_end_matches(SEPARATORS);
    if cwd.is_empty() {
        return None;
    }
    let rest = local.strip_prefix(cwd)?;
    if rest.is_empty() {
        return Some("");
    }
    if rest.starts_with(local_separator) || rest.starts_with('/') {
        Some(rest.trim_start_matches(SEPARATORS))
    } else {
        // `/work/app` must not claim `/work/apple`.
        None
    }
}

fn translate_separators(path: &str, windows: bool, remote_separator: char) -> String {
    path.chars()
        .map(|c| match c {
            '\\' if windows => remote_separator,
            '/' => remote_separator,
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/work/app/src/a.txt", '/', "src/a.txt")]
    #[case("/work/app", '/', ".")]
    #[case("/etc/x.txt", '/', "_ABS/etc/x.txt")]
    #[case("/etc/x.txt", '\\', "_ABS\\etc\\x.txt")]
    #[case("C:\\foo\\bar.txt", '/', "_ABS/C/foo/bar.txt")]
    #[case("C:\\foo\\bar.txt", '\\', "_ABS\\C\\foo\\bar.txt")]
    #[case("\\\\server\\share\\f.txt", '/', "_ABS/REMOTE/server/share/f.txt")]
    #[case("/work/apple/x", '/', "_ABS/work/apple/x")]
    fn translates_local_paths(#[case] local: &str, #[case] remote_sep: char, #[case] expected: &str) {
        assert_eq!(remote_path(local, "/work/app", '/', remote_sep), expected);
    }

    #[test]
    fn posix_backslash_in_name_survives_posix_remote() {
        assert_eq!(
            remote_path("/tmp/odd\\name", "/work", '/', '/'),
            "_ABS/tmp/odd\\name"
        );
    }

    #[rstest]
    #[case("C:\\foo\\bar.txt", PathShape::Drive)]
    #[case("c:/foo", PathShape::Drive)]
    #[case("\\\\srv\\x", PathShape::Unc)]
    #[case("/etc", PathShape::Posix)]
    #[case("src/x", PathShape::Relative)]
    fn classifies_shapes(#[case] path: &str, #[case] shape: PathShape) {
        assert_eq!(PathShape::of(path), shape);
    }

    fn found(text: &str) -> Vec<String> {
        let mut seen = Vec::new();
        let _ = rewrite_paths(text, |p| {
            seen.push(p.to_string());
            p.to_string()
        });
        seen
    }

    #[test]
    fn finds_paths_in_free_text() {
        assert_eq!(found("cat /etc/x.txt"), vec!["/etc/x.txt"]);
        assert_eq!(found("C:\\foo\\bar.txt"), vec!["C:\\foo\\bar.txt"]);
        assert_eq!(found("-cp /a.jar:/b.jar"), vec!["/a.jar", "/b.jar"]);
        assert_eq!(found("--out=/tmp/o 'x' \"/q/r\""), vec!["/tmp/o", "/q/r"]);
    }

    #[test]
    fn leaves_relative_paths_and_urls_alone() {
        assert!(found("src/main.rs").is_empty());
        assert!(found("see http://example.com/a/b").is_empty());
        assert!(found("a / b").is_empty());
    }

    #[test]
    fn unchanged_text_is_borrowed() {
        let text = "no paths here";
        assert!(matches!(rewrite_paths(text, |p| p.to_string()), Cow::Borrowed(_)));
    }

    #[test]
    fn rewrite_keeps_leading_context() {
        let out = rewrite_paths("-Dfile=/etc/x.txt", |p| format!("_ABS{p}"));
        assert_eq!(out, "-Dfile=_ABS/etc/x.txt");
    }
}
