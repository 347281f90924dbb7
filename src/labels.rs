//! Upstream port label grammar
//!
//! The upstream label accepts, in order of precedence:
//!
//! ```text
//! {{ upstreams <digits> }}   template form, whitespace inside the braces is free
//! <digits>                   bare port
//! ```
//!
//! Anything else, including a missing label, resolves to [`DEFAULT_UPSTREAM_PORT`].
//!
//! Hostname labels are normalized to lowercase without a trailing dot and must
//! consist of DNS label characters, since they are written verbatim into the
//! generated engine configuration.

/// Port used when the upstream label is absent or unparseable
pub const DEFAULT_UPSTREAM_PORT: u16 = 80;

const TEMPLATE_KEYWORD: &str = "upstreams";

/// Resolve the upstream port from the label value
pub fn parse_port(label: Option<&str>) -> u16 {
    let Some(value) = label else {
        return DEFAULT_UPSTREAM_PORT;
    };

    parse_template(value)
        .or_else(|| parse_number(value.trim()))
        .unwrap_or(DEFAULT_UPSTREAM_PORT)
}

/// Match `{{ upstreams <digits> }}` anywhere in the value
fn parse_template(value: &str) -> Option<u16> {
    let start = value.find("{{")?;
    let rest = &value[start + 2..];
    let end = rest.find("}}")?;
    let inner = rest[..end].trim();
    let digits = inner.strip_prefix(TEMPLATE_KEYWORD)?;
    parse_number(digits.trim())
}

/// Normalize a hostname label value; `None` when it cannot be routed
pub fn normalize_hostname(value: &str) -> Option<String> {
    let host = value.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host.len() > 253 {
        return None;
    }
    let valid = host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    });
    valid.then_some(host)
}

fn parse_number(digits: &str) -> Option<u16> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match digits.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_form() {
        assert_eq!(parse_port(Some("{{upstreams 3001}}")), 3001);
        assert_eq!(parse_port(Some("{{ upstreams 3001 }}")), 3001);
        assert_eq!(parse_port(Some("{{   upstreams\t8081}}")), 8081);
        assert_eq!(parse_port(Some("http://{{upstreams 9000}}")), 9000);
    }

    #[test]
    fn test_bare_port() {
        assert_eq!(parse_port(Some("8080")), 8080);
        assert_eq!(parse_port(Some(" 8080 ")), 8080);
    }

    #[test]
    fn test_defaults_to_80() {
        assert_eq!(parse_port(None), 80);
        assert_eq!(parse_port(Some("")), 80);
        assert_eq!(parse_port(Some("{{upstreams }}")), 80);
        assert_eq!(parse_port(Some("{{upstreams abc}}")), 80);
        assert_eq!(parse_port(Some("{{backends 3001}}")), 80);
        assert_eq!(parse_port(Some("{{upstreams 3001")), 80);
        assert_eq!(parse_port(Some("port-8080")), 80);
        assert_eq!(parse_port(Some("-1")), 80);
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("App.Local"), Some("app.local".to_string()));
        assert_eq!(normalize_hostname(" app.local. "), Some("app.local".to_string()));
        assert_eq!(normalize_hostname("my_svc.internal"), Some("my_svc.internal".to_string()));
        assert_eq!(normalize_hostname(""), None);
        assert_eq!(normalize_hostname("   "), None);
        assert_eq!(normalize_hostname("a..b"), None);
        assert_eq!(normalize_hostname("-bad.local"), None);
        assert_eq!(normalize_hostname("app.local; include /etc/passwd"), None);
    }

    #[test]
    fn test_out_of_range_ports_default() {
        assert_eq!(parse_port(Some("0")), 80);
        assert_eq!(parse_port(Some("70000")), 80);
        assert_eq!(parse_port(Some("{{upstreams 99999}}")), 80);
    }
}
