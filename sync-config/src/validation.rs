//! Cookie bundle parsing and the `x.com` → `.twitter.com` domain rewrite.

use serde::Deserialize;

/// One cookie entry as it appears in `SOURCE_COOKIES_JSON`: either a
/// serialized `Name=Value; Domain=…; Path=…;` string or an object.
#[derive(Debug, Clone)]
pub struct CookieEntry {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCookieEntry {
    Serialized(String),
    Object(RawCookieObject),
}

#[derive(Debug, Deserialize)]
struct RawCookieObject {
    #[serde(alias = "key")]
    name: Option<String>,
    value: String,
    domain: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CookieNormalizationReport {
    pub domain_rewrites: usize,
}

/// Parse `SOURCE_COOKIES_JSON`, rewriting `x.com`/`.x.com` domains to
/// `.twitter.com` and counting how many entries were rewritten.
pub fn parse_cookie_bundle(
    raw: &str,
) -> Result<(Vec<CookieEntry>, CookieNormalizationReport), serde_json::Error> {
    let entries: Vec<RawCookieEntry> = serde_json::from_str(raw)?;
    let mut report = CookieNormalizationReport::default();
    let mut out = Vec::with_capacity(entries.len());

    for entry in entries {
        let (name, value, domain, path) = match entry {
            RawCookieEntry::Serialized(s) => parse_serialized_cookie(&s),
            RawCookieEntry::Object(o) => (o.name.unwrap_or_default(), o.value, o.domain, o.path),
        };
        let domain = domain.map(|d| {
            let (rewritten, did_rewrite) = normalize_cookie_domain(&d);
            if did_rewrite {
                report.domain_rewrites += 1;
            }
            rewritten
        });
        out.push(CookieEntry {
            name,
            value,
            domain,
            path,
        });
    }

    Ok((out, report))
}

/// Rewrite `x.com` / `.x.com` to `.twitter.com`. Returns the (possibly
/// unchanged) domain plus whether a rewrite happened.
pub fn normalize_cookie_domain(domain: &str) -> (String, bool) {
    match domain {
        "x.com" | ".x.com" => (".twitter.com".to_string(), true),
        other => (other.to_string(), false),
    }
}

fn parse_serialized_cookie(s: &str) -> (String, String, Option<String>, Option<String>) {
    let mut name = String::new();
    let mut value = String::new();
    let mut domain = None;
    let mut path = None;

    for (i, part) in s.split(';').enumerate() {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if let Some((n, v)) = part.split_once('=') {
                name = n.trim().to_string();
                value = v.trim().to_string();
            }
            continue;
        }
        if let Some((k, v)) = part.split_once('=') {
            match k.trim().to_ascii_lowercase().as_str() {
                "domain" => domain = Some(v.trim().to_string()),
                "path" => path = Some(v.trim().to_string()),
                _ => {}
            }
        }
    }

    (name, value, domain, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_x_dot_com_domains() {
        let (out, report) = parse_cookie_bundle(
            r#"[{"name":"auth_token","value":"tok","domain":"x.com"},{"name":"ct0","value":"csrf","domain":".x.com"}]"#,
        )
        .unwrap();
        assert_eq!(report.domain_rewrites, 2);
        assert_eq!(out[0].domain.as_deref(), Some(".twitter.com"));
        assert_eq!(out[1].domain.as_deref(), Some(".twitter.com"));
    }

    #[test]
    fn leaves_other_domains_untouched() {
        let (out, report) = parse_cookie_bundle(
            r#"[{"name":"auth_token","value":"tok","domain":".twitter.com"}]"#,
        )
        .unwrap();
        assert_eq!(report.domain_rewrites, 0);
        assert_eq!(out[0].domain.as_deref(), Some(".twitter.com"));
    }

    #[test]
    fn parses_serialized_cookie_strings() {
        let (out, _) = parse_cookie_bundle(
            r#"["auth_token=abc123; Domain=x.com; Path=/"]"#,
        )
        .unwrap();
        assert_eq!(out[0].name, "auth_token");
        assert_eq!(out[0].value, "abc123");
        assert_eq!(out[0].domain.as_deref(), Some(".twitter.com"));
        assert_eq!(out[0].path.as_deref(), Some("/"));
    }
}
