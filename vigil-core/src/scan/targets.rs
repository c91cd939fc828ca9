//! Target normalization and classification.

use url::Url;

/// Targets partitioned by whether they already name a port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitTargets {
    pub with_port: Vec<String>,
    pub host_only: Vec<String>,
}

impl SplitTargets {
    pub fn is_empty(&self) -> bool {
        self.with_port.is_empty() && self.host_only.is_empty()
    }
}

/// Reduce a raw target to `host` or `host:port`.
///
/// `http(s)://` URLs are reduced to their authority exactly as written, so an
/// explicit default port survives (`https://a:443/x` becomes `a:443`). Anything
/// else is returned trimmed.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if has_http_scheme(trimmed)
        && let Some(authority) = authority_of(trimmed)
    {
        return authority.to_string();
    }
    trimmed.to_string()
}

pub fn has_http_scheme(target: &str) -> bool {
    target.starts_with("http://") || target.starts_with("https://")
}

fn authority_of(target: &str) -> Option<&str> {
    let parsed = Url::parse(target).ok()?;
    parsed.host_str().filter(|host| !host.is_empty())?;

    let rest = target.split_once("://")?.1;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let authority = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    (!authority.is_empty()).then_some(authority)
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(target: &str) -> Option<(&str, u16)> {
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        (host, tail.strip_prefix(':')?)
    } else {
        let (host, port) = target.split_once(':')?;
        if port.contains(':') {
            return None;
        }
        (host, port)
    };
    if host.is_empty() || port.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host, port))
}

pub fn is_host_port(target: &str) -> bool {
    target.contains(':') && split_host_port(target).is_some()
}

/// Normalize every raw target and partition the survivors. Empty entries are
/// dropped; duplicates are kept.
pub fn split_targets<S: AsRef<str>>(raw: &[S]) -> SplitTargets {
    let mut split = SplitTargets::default();
    for target in raw {
        let normalized = normalize(target.as_ref());
        if normalized.is_empty() {
            continue;
        }
        if is_host_port(&normalized) {
            split.with_port.push(normalized);
        } else {
            split.host_only.push(normalized);
        }
    }
    split
}
