//! Path canonicalization.
//!
//! Lexically simplifies paths like "foo/./bar" to "foo/bar" without touching
//! the disk.  These paths show up due to variable expansion in particular.
//!
//! On Windows, backslash separators are rewritten to forward slashes and the
//! positions of the original backslashes are recorded in a bit vector (bit i
//! set means the i-th slash of the canonical path was a backslash), so the
//! original spelling can be reconstructed for display and command lines.

use anyhow::bail;

/// Paths are capped at this many components, mostly to bound the bookkeeping.
const MAX_COMPONENTS: usize = 60;

/// Canonicalize `path`.  `backslashes` selects the Windows behavior where
/// `\` is also a separator; the returned u64 is the slash-bit vector and is
/// always zero otherwise.
pub fn canon_path_ex(path: &str, backslashes: bool) -> anyhow::Result<(String, u64)> {
    if path.is_empty() {
        bail!("empty path");
    }
    let bytes = path.as_bytes();
    let is_sep = |c: u8| c == b'/' || (backslashes && c == b'\\');

    // Gather components as (start, end, trailing separator byte).
    // "." components drop out; ".." pops the previous component when there is
    // one to pop.
    let mut components: Vec<(usize, usize, Option<u8>)> = Vec::new();
    let mut leading_sep = None;
    let mut i = 0;
    if is_sep(bytes[0]) {
        leading_sep = Some(bytes[0]);
        i = 1;
    }
    while i < bytes.len() {
        if is_sep(bytes[i]) {
            // Collapse runs of separators.
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !is_sep(bytes[i]) {
            i += 1;
        }
        let sep = bytes.get(i).copied();
        match &bytes[start..i] {
            b"." => {}
            b".." => match components.last() {
                Some(&(s, e, _)) if &bytes[s..e] != b".." => {
                    components.pop();
                }
                _ => {
                    if leading_sep.is_some() && components.is_empty() {
                        bail!("path {:?} escapes the filesystem root", path);
                    }
                    components.push((start, i, sep));
                }
            },
            _ => components.push((start, i, sep)),
        }
        if components.len() > MAX_COMPONENTS {
            bail!("too many path components in {:?}", path);
        }
        if sep.is_some() {
            i += 1;
        }
    }

    let mut out = String::with_capacity(path.len());
    let mut slash_bits = 0u64;
    let mut sep_count = 0;
    let mut push_sep = |sep: u8, out: &mut String| {
        if sep == b'\\' && sep_count < 64 {
            slash_bits |= 1 << sep_count;
        }
        sep_count += 1;
        out.push('/');
    };
    if let Some(sep) = leading_sep {
        push_sep(sep, &mut out);
    }
    for &(start, end, sep) in &components {
        out.push_str(&path[start..end]);
        // A component's recorded separator always prints; this is what keeps
        // the trailing slash in cases like "foo/." => "foo/".
        if let Some(sep) = sep {
            push_sep(sep, &mut out);
        }
    }
    if out.is_empty() {
        out.push('.');
    }
    Ok((out, slash_bits))
}

/// Canonicalize a path using the host platform's separator rules.
pub fn canon_path(path: &str) -> anyhow::Result<(String, u64)> {
    canon_path_ex(path, cfg!(windows))
}

/// Rewrite the canonical `path`'s slashes back to the separators recorded in
/// `slash_bits`, recovering the original spelling.
pub fn decanonicalize_path(path: &str, slash_bits: u64) -> String {
    if slash_bits == 0 {
        return path.to_owned();
    }
    let mut result = String::with_capacity(path.len());
    let mut slash = 0;
    for c in path.chars() {
        if c == '/' {
            result.push(if slash < 64 && slash_bits & (1 << slash) != 0 {
                '\\'
            } else {
                '/'
            });
            slash += 1;
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn assert_canon(input: &str, want: &str) {
        let (got, _) = canon_path_ex(input, false).unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn noop() {
        assert_canon("foo", "foo");
        assert_canon("foo/bar", "foo/bar");
    }

    #[test]
    fn dot() {
        assert_canon("./foo", "foo");
        assert_canon("foo/.", "foo/");
        assert_canon("foo/./bar", "foo/bar");
        assert_canon("./", ".");
        assert_canon("./.", ".");
        assert_canon("././", ".");
        assert_canon(".", ".");
    }

    #[test]
    fn not_dot() {
        assert_canon("t/.hidden", "t/.hidden");
        assert_canon("t/.._lib.c.o", "t/.._lib.c.o");
    }

    #[test]
    fn slash() {
        assert_canon("/foo", "/foo");
        assert_canon("foo//bar", "foo/bar");
    }

    #[test]
    fn parent() {
        assert_canon("foo/../bar", "bar");
        assert_canon("/foo/../bar", "/bar");
        assert_canon("../foo", "../foo");
        assert_canon("../foo/../bar", "../bar");
        assert_canon("../../bar", "../../bar");
        assert_canon("./../foo", "../foo");
        assert_canon("foo/..", ".");
        assert_canon("foo/../", ".");
        assert_canon("foo/../../", "../");
        assert_canon("foo/../../bar", "../bar");
    }

    #[test]
    fn mixed_components() {
        assert_canon("a/./b//c/../d", "a/b/d");
    }

    #[test]
    fn empty_path_is_an_error() {
        assert!(canon_path_ex("", false).is_err());
    }

    #[test]
    fn absolute_escape_is_an_error() {
        assert!(canon_path_ex("/..", false).is_err());
        assert!(canon_path_ex("/foo/../../bar", false).is_err());
    }

    #[test]
    fn backslashes_record_slash_bits() {
        let (path, bits) = canon_path_ex("foo\\bar/baz", true).unwrap();
        assert_eq!(path, "foo/bar/baz");
        assert_eq!(bits, 0b1);

        let (path, bits) = canon_path_ex("foo/bar\\baz", true).unwrap();
        assert_eq!(path, "foo/bar/baz");
        assert_eq!(bits, 0b10);

        let (path, bits) = canon_path_ex("a\\b\\.\\c", true).unwrap();
        assert_eq!(path, "a/b/c");
        assert_eq!(bits, 0b11);
    }

    #[test]
    fn decanonicalize() {
        assert_eq!(decanonicalize_path("foo/bar/baz", 0b1), "foo\\bar/baz");
        assert_eq!(decanonicalize_path("foo/bar", 0), "foo/bar");
        assert_eq!(decanonicalize_path("a/b/c", 0b110), "a/b\\c");
    }
}
