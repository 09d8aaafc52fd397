//! A deliberately permissive URL splitter: split `scheme://authority/path`
//! into three plain strings with no percent-decoding and no validation
//! beyond the split itself.

/// The three slices a raw URL string decomposes into. Missing parts are the
/// empty string, never absent -- callers never have to unwrap an `Option`
/// just to print a URL back out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub scheme: String,
    pub authority: String,
    pub path: String,
}

impl std::fmt::Display for UrlParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[scheme: {}, authority: {}, path: {}]",
            self.scheme, self.authority, self.path
        )
    }
}

/// Split `url` the way `(^(?P<scheme>[a-zA-Z]*):)?(//(?P<authority>[^/]*))?(?P<path>/?.*)?`
/// would: an optional all-alphabetic scheme up to the first `:`, an optional
/// `//`-prefixed authority up to the next `/`, and everything else as path.
pub fn parse(url: &str) -> UrlParts {
    let mut rest = url;

    let scheme = match rest.find(':') {
        Some(idx) if rest[..idx].chars().all(|c| c.is_ascii_alphabetic()) && idx > 0 => {
            let scheme = rest[..idx].to_string();
            rest = &rest[idx + 1..];
            scheme
        }
        _ => String::new(),
    };

    let authority = match rest.strip_prefix("//") {
        Some(after_slashes) => {
            let end = after_slashes.find('/').unwrap_or(after_slashes.len());
            let authority = after_slashes[..end].to_string();
            rest = &after_slashes[end..];
            authority
        }
        None => String::new(),
    };

    UrlParts {
        scheme,
        authority,
        path: rest.to_string(),
    }
}

/// Collapse `.`/`..` segments and strip leading/trailing `/`, the way
/// a Unix-style `normpath` followed by stripping leading/trailing slashes.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// `^[A-Za-z0-9_\-()=+!,;:@&*$.~]*$` -- the allow-list a leaf name must
/// satisfy before `fixURI` will accept it.
pub fn is_legal_leaf_name(name: &str) -> bool {
    name.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || matches!(
                c,
                '_' | '-' | '(' | ')' | '=' | '+' | '!' | ',' | ';' | ':' | '@' | '&' | '*' | '$' | '.' | '~'
            )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_scheme_authority_path() {
        let parts = parse("vos://cadc.nrc.ca!vospace/demo/hello.txt");
        assert_eq!(parts.scheme, "vos");
        assert_eq!(parts.authority, "cadc.nrc.ca!vospace");
        assert_eq!(parts.path, "/demo/hello.txt");
    }

    #[test]
    fn missing_scheme_and_authority_are_empty_not_absent() {
        let parts = parse("just/a/path");
        assert_eq!(parts.scheme, "");
        assert_eq!(parts.authority, "");
        assert_eq!(parts.path, "just/a/path");
    }

    #[test]
    fn authority_without_trailing_path_is_whole_remainder() {
        let parts = parse("https://example.com");
        assert_eq!(parts.authority, "example.com");
        assert_eq!(parts.path, "");
    }

    #[test]
    fn normalize_path_collapses_dot_segments() {
        assert_eq!(normalize_path("/a/./b/../c/"), "a/c");
        assert_eq!(normalize_path("///"), "");
    }

    #[test]
    fn leaf_name_allow_list() {
        assert!(is_legal_leaf_name("hello_world-v1.0(final)=+!,;:@&*$~"));
        assert!(!is_legal_leaf_name("hello world"));
        assert!(!is_legal_leaf_name("slash/inside"));
    }
}
