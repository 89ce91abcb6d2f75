use anyhow::bail;
use std::fmt;

/// One upstream origin the proxy can forward to.
///
/// Immutable after construction. Identity is scheme + lowercased host +
/// normalized port; the base path is a forwarding detail and takes no part
/// in identity comparisons.
#[derive(Debug, Clone)]
pub struct Target {
    scheme: String,
    host: String,
    port: u16,
    base_path: String,
    /// Pre-computed "host:port" — avoids a `format!()` allocation on every
    /// request when building outbound URIs, probe URLs, and log fields.
    authority: String,
}

impl Target {
    /// Parse an origin URL like `http://10.0.0.5:9000/api`.
    ///
    /// Only `http` and `https` schemes are accepted. A missing port is
    /// normalized to the scheme default (80 / 443); a trailing slash on the
    /// base path is dropped so path joining always inserts exactly one.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let Some((scheme, rest)) = raw.split_once("://") else {
            bail!("target '{}' is missing a scheme", raw);
        };
        let scheme = scheme.to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            bail!("target '{}' has unsupported scheme '{}'", raw, scheme);
        }

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            bail!("target '{}' is missing a host", raw);
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => {
                let port: u16 = match p.parse() {
                    Ok(port) => port,
                    Err(_) => bail!("target '{}' has invalid port '{}'", raw, p),
                };
                (h, port)
            }
            _ => (authority, default_port(&scheme)),
        };
        let host = host.to_ascii_lowercase();
        if host.is_empty() {
            bail!("target '{}' is missing a host", raw);
        }

        let base_path = path.trim_end_matches('/').to_string();
        let authority = format!("{}:{}", host, port);

        Ok(Self {
            scheme,
            host,
            port,
            base_path,
            authority,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// The cached "host:port" string. Zero allocation.
    #[inline]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Join the target's base path with a request path using exactly one
    /// slash between segments.
    pub fn join_path(&self, path: &str) -> String {
        let trimmed = path.trim_start_matches('/');
        if self.base_path.is_empty() {
            format!("/{}", trimmed)
        } else if trimmed.is_empty() {
            self.base_path.clone()
        } else {
            format!("{}/{}", self.base_path, trimmed)
        }
    }

    /// Full outbound URL for a request path and raw query.
    pub fn url_for(&self, path: &str, query: Option<&str>) -> String {
        let joined = self.join_path(path);
        let mut url =
            String::with_capacity(self.scheme.len() + 3 + self.authority.len() + joined.len() + 8);
        url.push_str(&self.scheme);
        url.push_str("://");
        url.push_str(&self.authority);
        url.push_str(&joined);
        if let Some(q) = query {
            if !q.is_empty() {
                url.push('?');
                url.push_str(q);
            }
        }
        url
    }
}

fn default_port(scheme: &str) -> u16 {
    if scheme == "https" {
        443
    } else {
        80
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        // Host is lowercased and the port normalized at construction, so a
        // field compare is the identity rule.
        self.scheme == other.scheme && self.host == other.host && self.port == other.port
    }
}

impl Eq for Target {}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_port() {
        let t = Target::parse("http://backend.local").unwrap();
        assert_eq!(t.scheme(), "http");
        assert_eq!(t.host(), "backend.local");
        assert_eq!(t.port(), 80);
        assert_eq!(t.authority(), "backend.local:80");
        assert_eq!(t.base_path(), "");

        let t = Target::parse("https://backend.local").unwrap();
        assert_eq!(t.port(), 443);
    }

    #[test]
    fn test_parse_explicit_port_and_base_path() {
        let t = Target::parse("http://10.0.0.5:9000/api/").unwrap();
        assert_eq!(t.port(), 9000);
        assert_eq!(t.base_path(), "/api");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Target::parse("backend.local:80").is_err());
        assert!(Target::parse("ftp://backend.local").is_err());
        assert!(Target::parse("http://").is_err());
        assert!(Target::parse("http://host:99999").is_err());
    }

    #[test]
    fn test_identity_ignores_base_path() {
        let a = Target::parse("http://Backend.Local/api").unwrap();
        let b = Target::parse("http://backend.local:80/other").unwrap();
        assert_eq!(a, b);

        let c = Target::parse("https://backend.local").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_join_path_single_slash() {
        let bare = Target::parse("http://h").unwrap();
        assert_eq!(bare.join_path("/users"), "/users");
        assert_eq!(bare.join_path("users"), "/users");
        assert_eq!(bare.join_path(""), "/");

        let based = Target::parse("http://h/api").unwrap();
        assert_eq!(based.join_path("/users"), "/api/users");
        assert_eq!(based.join_path(""), "/api");
    }

    #[test]
    fn test_url_for() {
        let t = Target::parse("http://h:8081/v1").unwrap();
        assert_eq!(
            t.url_for("/users", Some("page=2")),
            "http://h:8081/v1/users?page=2"
        );
        assert_eq!(t.url_for("/users", None), "http://h:8081/v1/users");
        assert_eq!(t.url_for("/users", Some("")), "http://h:8081/v1/users");
    }
}
