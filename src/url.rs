//! Coordinator connection URLs.
//!
//! A coordinator URL names the server ensemble, an optional set of digest
//! credentials, and the chroot path under which the election group lives:
//!
//! ```text
//! zk://[user:pass@]host:port[,host:port...]/path
//! ```
//!
//! The path defaults to `/` when omitted; whether a bare `/` chroot is
//! acceptable is decided by the caller (the election backend factory
//! rejects it, since electing leaders directly under the root is almost
//! always a misconfiguration).

use crate::client::Authentication;
use crate::constants::URL_SCHEME;
use crate::error::{Error, Result};

/// A parsed `zk://` connection URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorUrl {
    /// Comma separated `host:port` pairs.
    pub servers: String,
    /// Chroot path, always beginning with `/`.
    pub path: String,
    /// Digest credentials embedded in the URL, if any.
    pub auth: Option<Authentication>,
}

impl CoordinatorUrl {
    /// Parse a `zk://` URL.
    pub fn parse(input: &str) -> Result<CoordinatorUrl> {
        let rest = input.strip_prefix(URL_SCHEME).ok_or_else(|| {
            Error::InvalidUrl(format!("expected '{URL_SCHEME}' scheme in '{input}'"))
        })?;

        let (authority, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        };

        let (auth, servers) = match authority.rfind('@') {
            Some(at) => {
                let credentials = &authority[..at];
                if !credentials.contains(':') {
                    return Err(Error::InvalidUrl(format!(
                        "credentials in '{input}' must be of the form user:pass"
                    )));
                }
                (
                    Some(Authentication::digest(credentials)),
                    &authority[at + 1..],
                )
            }
            None => (None, authority),
        };

        if servers.is_empty() {
            return Err(Error::InvalidUrl(format!(
                "no coordinator servers in '{input}'"
            )));
        }
        for server in servers.split(',') {
            let (host, port) = server.split_once(':').ok_or_else(|| {
                Error::InvalidUrl(format!("server '{server}' is not of the form host:port"))
            })?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(Error::InvalidUrl(format!(
                    "server '{server}' is not of the form host:port"
                )));
            }
        }

        // Normalize a trailing slash so "/elect/" and "/elect" name the
        // same chroot; the root path stays "/".
        let path = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };
        let path = if path.is_empty() { "/" } else { path };

        Ok(CoordinatorUrl {
            servers: servers.to_string(),
            path: path.to_string(),
            auth,
        })
    }
}

impl std::fmt::Display for CoordinatorUrl {
    /// Formats the URL with the password masked, safe for logging.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{URL_SCHEME}")?;
        if let Some(auth) = &self.auth {
            let user = auth
                .credentials
                .split_once(':')
                .map(|(user, _)| user)
                .unwrap_or("");
            write!(f, "{user}:****@")?;
        }
        write!(f, "{}{}", self.servers, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DIGEST_SCHEME;

    #[test]
    fn test_parse_single_server() {
        let url = CoordinatorUrl::parse("zk://zk1.example.com:2181/elect").unwrap();
        assert_eq!(url.servers, "zk1.example.com:2181");
        assert_eq!(url.path, "/elect");
        assert!(url.auth.is_none());
    }

    #[test]
    fn test_parse_ensemble() {
        let url = CoordinatorUrl::parse("zk://a:2181,b:2181,c:2181/svc/leader").unwrap();
        assert_eq!(url.servers, "a:2181,b:2181,c:2181");
        assert_eq!(url.path, "/svc/leader");
    }

    #[test]
    fn test_parse_credentials() {
        let url = CoordinatorUrl::parse("zk://jeff:secret@a:2181/elect").unwrap();
        let auth = url.auth.unwrap();
        assert_eq!(auth.scheme, DIGEST_SCHEME);
        assert_eq!(auth.credentials, "jeff:secret");
        assert_eq!(url.servers, "a:2181");
    }

    #[test]
    fn test_parse_defaults_to_root_path() {
        let url = CoordinatorUrl::parse("zk://a:2181").unwrap();
        assert_eq!(url.path, "/");

        let url = CoordinatorUrl::parse("zk://a:2181/").unwrap();
        assert_eq!(url.path, "/");
    }

    #[test]
    fn test_parse_trims_trailing_slash() {
        let url = CoordinatorUrl::parse("zk://a:2181/elect/").unwrap();
        assert_eq!(url.path, "/elect");
    }

    #[test]
    fn test_parse_rejects_missing_scheme() {
        assert!(matches!(
            CoordinatorUrl::parse("a:2181/elect"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty_servers() {
        assert!(matches!(
            CoordinatorUrl::parse("zk:///elect"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_parse_rejects_server_without_port() {
        assert!(matches!(
            CoordinatorUrl::parse("zk://justahost/elect"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(
            CoordinatorUrl::parse("zk://host:notaport/elect"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_parse_rejects_malformed_credentials() {
        assert!(matches!(
            CoordinatorUrl::parse("zk://justauser@a:2181/elect"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_display_masks_password() {
        let url = CoordinatorUrl::parse("zk://jeff:secret@a:2181/elect").unwrap();
        let shown = url.to_string();
        assert!(shown.contains("jeff:****@"));
        assert!(!shown.contains("secret"));
        assert!(shown.ends_with("a:2181/elect"));
    }

    #[test]
    fn test_display_round_trips_without_auth() {
        let url = CoordinatorUrl::parse("zk://a:2181,b:2181/elect").unwrap();
        assert_eq!(url.to_string(), "zk://a:2181,b:2181/elect");
    }
}
