//! Provide methods for handling the URIs and identifiers that appear in catalogs.
//!
//! RFC 3986 resolution is delegated to [`url::Url`]. Bases that `Url` cannot
//! join against (`classpath:` resources, `jar:` archive members) are merged
//! textually here.
//!
//! References:
//! - XML Catalogs, OASIS Standard V1.1, 7 October 2005, section 6
//!   (identifier normalization and URN unwrapping).
//! - RFC 3986, section 5.2 (relative reference resolution).

use std::{
    borrow::Cow,
    path::{Path, PathBuf},
};

use url::Url;

/// The prefix of public identifiers encoded as URNs.
pub const URN_PUBID: &str = "urn:publicid:";
const CLASSPATH: &str = "classpath:";

fn to_hexdigit(c: u8) -> char {
    (if c < 10 { c + b'0' } else { c - 10 + b'A' }) as char
}

// `scheme = ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )`
//
// Single letter schemes are rejected so that Windows drive letters are not
// mistaken for absolute URIs.
fn scheme_len(uri: &str) -> Option<usize> {
    let colon = uri.find(':')?;
    let scheme = &uri.as_bytes()[..colon];
    (scheme.len() > 1
        && scheme[0].is_ascii_alphabetic()
        && scheme[1..]
            .iter()
            .all(|&c| c.is_ascii_alphanumeric() || c == b'+' || c == b'-' || c == b'.'))
    .then_some(colon)
}

/// Check if `uri` carries a scheme.
pub fn is_absolute(uri: &str) -> bool {
    scheme_len(uri).is_some()
}

/// Computes the final URI of the reference `href` using `base`.
///
/// An absolute `href` is returned untouched. Returns `None` if `base` is not
/// absolute or the reference cannot be resolved.
///
/// # Examples
/// ```
/// use xmlresolver::uri::resolve;
///
/// assert_eq!(
///     resolve("file:///etc/xml/catalog.xml", "docbook/catalog.xml").as_deref(),
///     Some("file:///etc/xml/docbook/catalog.xml")
/// );
/// assert_eq!(
///     resolve("classpath:org/example/catalog.xml", "schema.xsd").as_deref(),
///     Some("classpath:org/example/schema.xsd")
/// );
/// assert_eq!(resolve("relative/catalog.xml", "a.dtd"), None);
/// ```
pub fn resolve(base: &str, href: &str) -> Option<String> {
    if is_absolute(href) {
        return Some(href.to_owned());
    }
    if !is_absolute(base) {
        return None;
    }
    match Url::parse(base) {
        Ok(url) if !url.cannot_be_a_base() => url.join(href).ok().map(String::from),
        _ => merge_opaque(base, href),
    }
}

/// Resolve against bases such as `classpath:org/x/catalog.xml` or
/// `jar:file:///x.zip!/catalog.xml`, which have no hierarchical part that
/// RFC 3986 would recognize.
fn merge_opaque(base: &str, href: &str) -> Option<String> {
    let base = base.split_once('#').map_or(base, |(base, _)| base);
    if href.is_empty() {
        return Some(base.to_owned());
    }
    if let Some(fragment) = href.strip_prefix('#') {
        return Some(format!("{base}#{fragment}"));
    }
    let (prefix, path) = match base.find("!/") {
        Some(pos) => base.split_at(pos + 1),
        None => base.split_at(scheme_len(base)? + 1),
    };
    let merged = if href.starts_with('/') {
        href.to_owned()
    } else if let Some(pos) = path.rfind('/') {
        format!("{}{href}", &path[..=pos])
    } else {
        href.to_owned()
    };
    let path = if prefix == CLASSPATH {
        merged.trim_start_matches('/')
    } else {
        &merged
    };
    Some(format!("{prefix}{}", normalize_uri_path(path)))
}

/// Applies the dot-segment removal of RFC 3986, section 5.2.4, to a path.
///
/// Leading slashes are preserved. If `path` is not modified, it is returned
/// borrowed.
pub fn normalize_uri_path(path: &str) -> Cow<'_, str> {
    let rest = path.trim_start_matches('/');
    let head = &path[..path.len() - rest.len()];
    if rest.is_empty() {
        return Cow::Borrowed(path);
    }

    let mut segments: Vec<&str> = vec![];
    let mut parts = rest.split('/').peekable();
    while let Some(seg) = parts.next() {
        let last = parts.peek().is_none();
        match seg {
            "." => {
                if last {
                    segments.push("");
                }
            }
            ".." => {
                if segments.last().is_some_and(|&s| s != "..") {
                    segments.pop();
                } else {
                    segments.push("..");
                }
                if last {
                    segments.push("");
                }
            }
            "" if !last => {}
            seg => segments.push(seg),
        }
    }

    let joined = segments.join("/");
    if joined == rest {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(format!("{head}{joined}"))
    }
}

/// Normalizes a system identifier or URI reference.
///
/// Every byte of the UTF-8 encoding that is a control character, a space, a
/// non-ASCII byte or one of `"<>\^`{|}` is percent-encoded. Existing escapes
/// are kept as they are.
pub fn normalize_uri(uri: &str) -> Cow<'_, str> {
    let must_escape =
        |c: u8| c <= 0x20 || c >= 0x7F || b"\"<>\\^`{|}".contains(&c);
    if !uri.bytes().any(must_escape) {
        return Cow::Borrowed(uri);
    }
    let mut ret = String::with_capacity(uri.len() + 8);
    for c in uri.bytes() {
        if must_escape(c) {
            ret.push('%');
            ret.push(to_hexdigit(c >> 4));
            ret.push(to_hexdigit(c & 0x0F));
        } else {
            ret.push(c as char);
        }
    }
    Cow::Owned(ret)
}

/// Drops the redundant leading slashes of a `classpath:/` URI.
///
/// `classpath:/a/b` and `classpath:a/b` name the same resource. Normalization
/// is idempotent.
pub fn normalize_classpath(uri: &str) -> Cow<'_, str> {
    match uri.strip_prefix(CLASSPATH) {
        Some(rest) if rest.starts_with('/') => {
            Cow::Owned(format!("{CLASSPATH}{}", rest.trim_start_matches('/')))
        }
        _ => Cow::Borrowed(uri),
    }
}

/// Computes the key under which two URIs are compared during catalog
/// matching.
///
/// With `merge_https`, `http:` is mapped to `https:` so that the two schemes
/// compare equal. The mapping only goes in that direction.
pub fn comparison_key(uri: &str, merge_https: bool) -> Cow<'_, str> {
    let uri = normalize_classpath(uri);
    if merge_https {
        if let Some(rest) = uri.strip_prefix("http:") {
            return Cow::Owned(format!("https:{rest}"));
        }
    }
    uri
}

/// Normalizes the Public Identifier
///
/// Leading and trailing whitespace is removed and every other run of
/// whitespace is collapsed into a single space.
///
/// If `public_id` is already normalized, it is returned borrowed.
pub fn normalize_public(public_id: &str) -> Cow<'_, str> {
    let is_blank = |c: char| matches!(c, ' ' | '\t' | '\n' | '\r');
    if !public_id.starts_with(is_blank)
        && !public_id.ends_with(is_blank)
        && !public_id.contains(['\t', '\n', '\r'])
        && !public_id.contains("  ")
    {
        return Cow::Borrowed(public_id);
    }
    Cow::Owned(
        public_id
            .split(is_blank)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn strip_urn_pubid(urn: &str) -> Option<&str> {
    urn.get(..URN_PUBID.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(URN_PUBID))
        .map(|_| &urn[URN_PUBID.len()..])
}

/// Check if `id` is a public identifier encoded as a `urn:publicid:` URN.
pub fn is_urn_pubid(id: &str) -> bool {
    strip_urn_pubid(id).is_some()
}

/// Expand the URN into the equivalent Public Identifier.
///
/// Returns `None` if `urn` is not a `urn:publicid:` URN.
///
/// # Examples
/// ```
/// use xmlresolver::uri::unwrap_urn;
///
/// assert_eq!(
///     unwrap_urn("urn:publicid:-:OASIS:DTD+DocBook+XML+V4.5:EN").as_deref(),
///     Some("-//OASIS//DTD DocBook XML V4.5//EN")
/// );
/// ```
pub fn unwrap_urn(urn: &str) -> Option<String> {
    let urn = strip_urn_pubid(urn)?.as_bytes();
    let mut res = Vec::with_capacity(urn.len());
    let mut i = 0;
    while i < urn.len() {
        match urn[i] {
            b'+' => res.push(b' '),
            b':' => res.extend_from_slice(b"//"),
            b';' => res.extend_from_slice(b"::"),
            b'%' => {
                let escaped = urn
                    .get(i + 1..i + 3)
                    .map(|hex| [hex[0].to_ascii_uppercase(), hex[1].to_ascii_uppercase()]);
                let decoded = match escaped {
                    Some([b'2', b'B']) => Some(b'+'),
                    Some([b'3', b'A']) => Some(b':'),
                    Some([b'2', b'F']) => Some(b'/'),
                    Some([b'3', b'B']) => Some(b';'),
                    Some([b'2', b'7']) => Some(b'\''),
                    Some([b'3', b'F']) => Some(b'?'),
                    Some([b'2', b'3']) => Some(b'#'),
                    Some([b'2', b'5']) => Some(b'%'),
                    _ => None,
                };
                if let Some(decoded) = decoded {
                    res.push(decoded);
                    i += 3;
                    continue;
                }
                res.push(b'%');
            }
            c => res.push(c),
        }
        i += 1;
    }
    String::from_utf8(res).ok()
}

/// Encode a Public Identifier as a `urn:publicid:` URN. This is the inverse of
/// [`unwrap_urn`] for normalized public identifiers.
pub fn wrap_public_id(public_id: &str) -> String {
    let public_id = normalize_public(public_id);
    let mut ret = String::from(URN_PUBID);
    let mut chars = public_id.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'/') => {
                chars.next();
                ret.push(':');
            }
            ':' if chars.peek() == Some(&':') => {
                chars.next();
                ret.push(';');
            }
            ' ' => ret.push('+'),
            '+' => ret.push_str("%2B"),
            ':' => ret.push_str("%3A"),
            '/' => ret.push_str("%2F"),
            ';' => ret.push_str("%3B"),
            '\'' => ret.push_str("%27"),
            '?' => ret.push_str("%3F"),
            '#' => ret.push_str("%23"),
            '%' => ret.push_str("%25"),
            c => ret.push(c),
        }
    }
    ret
}

/// Split `jar:<archive>!/<member>` into the archive URI and the member path.
pub fn split_jar(uri: &str) -> Option<(&str, &str)> {
    uri.strip_prefix("jar:")?.split_once("!/")
}

/// Constructs a `file:` URI expressing an absolute filesystem path.
pub fn path_to_uri(path: &Path) -> Option<String> {
    Url::from_file_path(path).ok().map(String::from)
}

/// Constructs a `file:` URI for a directory. The result ends with a slash so
/// that relative references resolve inside the directory.
pub fn directory_to_uri(path: &Path) -> Option<String> {
    Url::from_directory_path(path).ok().map(String::from)
}

/// The current working directory as a `file:` URI.
pub fn cwd_uri() -> Option<String> {
    std::env::current_dir()
        .ok()
        .and_then(|dir| directory_to_uri(&dir))
}

/// The filesystem path named by a `file:` URI.
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri)
        .ok()
        .filter(|url| url.scheme() == "file")?
        .to_file_path()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_hierarchical_test() {
        const CASES: &[(&str, &str, &str)] = &[
            ("file:///etc/xml/catalog", "a.dtd", "file:///etc/xml/a.dtd"),
            ("file:///etc/xml/catalog", "../b/c.dtd", "file:///etc/b/c.dtd"),
            ("http://example.org/a/b.xml", "/c.xml", "http://example.org/c.xml"),
            ("http://example.org/a/b.xml", "https://x.org/y", "https://x.org/y"),
        ];
        for &(base, href, expected) in CASES {
            assert_eq!(resolve(base, href).as_deref(), Some(expected), "{base} + {href}");
        }
    }

    #[test]
    fn resolve_opaque_test() {
        assert_eq!(
            resolve("jar:file:///lib/x.zip!/cat/catalog.xml", "../dtd/a.dtd").as_deref(),
            Some("jar:file:///lib/x.zip!/dtd/a.dtd")
        );
        assert_eq!(
            resolve("classpath:org/x/catalog.xml", "/y/z.xsd").as_deref(),
            Some("classpath:y/z.xsd")
        );
        assert_eq!(resolve("catalog.xml", "a.dtd"), None);
    }

    #[test]
    fn absolute_test() {
        assert!(is_absolute("urn:publicid:foo"));
        assert!(is_absolute("classpath:a"));
        assert!(!is_absolute("C:\\xml\\catalog.xml"));
        assert!(!is_absolute("dir/catalog.xml"));
    }

    #[test]
    fn normalize_uri_path_test() {
        assert_eq!(normalize_uri_path("/a/b/../c/./d"), "/a/c/d");
        assert_eq!(normalize_uri_path("a/b/.."), "a/");
        assert_eq!(normalize_uri_path("../x"), "../x");
        assert!(matches!(normalize_uri_path("/a/b"), Cow::Borrowed(_)));
    }

    #[test]
    fn normalize_uri_test() {
        assert_eq!(
            normalize_uri("http://example.org/a b<c>.dtd"),
            "http://example.org/a%20b%3Cc%3E.dtd"
        );
        assert_eq!(normalize_uri("file:///caf\u{e9}"), "file:///caf%C3%A9");
        assert!(matches!(normalize_uri("file:///a%20b"), Cow::Borrowed(_)));
    }

    #[test]
    fn classpath_normalization_is_idempotent() {
        let once = normalize_classpath("classpath:/a/b");
        assert_eq!(once, "classpath:a/b");
        assert_eq!(normalize_classpath(&once), once);
        assert_eq!(
            comparison_key("classpath:/a/b", false),
            comparison_key("classpath:a/b", false)
        );
        assert_eq!(normalize_classpath("classpath:///a"), "classpath:a");
    }

    #[test]
    fn comparison_key_merges_http_into_https() {
        assert_eq!(comparison_key("http://x.org/a", true), "https://x.org/a");
        assert_eq!(comparison_key("https://x.org/a", true), "https://x.org/a");
        assert_eq!(comparison_key("http://x.org/a", false), "http://x.org/a");
    }

    #[test]
    fn normalize_public_test() {
        assert_eq!(
            normalize_public("  -//OASIS//DTD\tDocBook\n XML//EN "),
            "-//OASIS//DTD DocBook XML//EN"
        );
        assert!(matches!(normalize_public("-//A//B//EN"), Cow::Borrowed(_)));
    }

    #[test]
    fn urn_test() {
        assert_eq!(
            unwrap_urn("URN:PUBLICID:ISO%2FIEC+10179%3A1996:DTD+DSSSL+Architecture:EN").as_deref(),
            Some("ISO/IEC 10179:1996//DTD DSSSL Architecture//EN")
        );
        assert_eq!(unwrap_urn("urn:x:foo"), None);
        assert_eq!(unwrap_urn("urn:publicid:a;b%zz").as_deref(), Some("a::b%zz"));

        let public_id = "ISO/IEC 10179:1996//DTD DSSSL Architecture//EN";
        let urn = wrap_public_id(public_id);
        assert_eq!(urn, "urn:publicid:ISO%2FIEC+10179%3A1996:DTD+DSSSL+Architecture:EN");
        assert_eq!(unwrap_urn(&urn).as_deref(), Some(public_id));
    }

    #[test]
    fn jar_and_file_uri_test() {
        assert_eq!(
            split_jar("jar:file:///x.zip!/a/b.xml"),
            Some(("file:///x.zip", "a/b.xml"))
        );
        assert_eq!(split_jar("file:///x.zip"), None);
        assert_eq!(
            uri_to_path("file:///tmp/a%20b.xml"),
            Some(PathBuf::from("/tmp/a b.xml"))
        );
        assert_eq!(uri_to_path("http://x.org/a.xml"), None);
    }
}
