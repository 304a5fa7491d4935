use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

/// Where and how a resource is served. The variant selects the backend
/// transport; the payload carries everything that backend needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ResourceAddress {
    #[default]
    None,
    /// static file on the local filesystem
    Local(FileAddress),
    /// pipe the request body through a spawned filter program
    Pipe(CgiAddress),
    Cgi(CgiAddress),
    FastCgi(CgiAddress),
    Was(CgiAddress),
    Http(HttpAddress),
    /// local HTTP child process
    Lhttp(LhttpAddress),
    /// file below an NFS mount, served through the read cache
    Nfs(NfsAddress),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FileAddress {
    pub path: String,
    pub content_type: Option<String>,
    pub document_root: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CgiAddress {
    /// executable (or FastCGI/WAS socket path when `address_list` is
    /// empty and `path` names a unix socket)
    pub path: String,
    pub args: Vec<String>,
    pub interpreter: Option<String>,
    pub action: Option<String>,
    pub script_name: Option<String>,
    pub path_info: Option<String>,
    pub query_string: Option<String>,
    pub document_root: Option<String>,
    /// remote FastCGI/WAS workers; empty means local child process
    pub address_list: Vec<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct HttpAddress {
    pub https: bool,
    /// value for the Host header
    pub host_and_port: String,
    /// path (+ optional query string)
    pub path: String,
    pub addresses: Vec<SocketAddr>,
}

impl HttpAddress {
    pub fn query_string(&self) -> Option<&str> {
        self.path.split_once('?').map(|(_, q)| q)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct LhttpAddress {
    pub path: String,
    pub args: Vec<String>,
    pub host_and_port: Option<String>,
    pub uri: String,
    /// parallel connections per child
    pub concurrency: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NfsAddress {
    pub server: String,
    pub export: String,
    pub path: String,
    pub content_type: Option<String>,
}

impl ResourceAddress {
    /// A stable content-derived identifier, suitable as a cache-key
    /// component.
    pub fn id(&self) -> String {
        let mut hasher = twox_hash::XxHash64::with_seed(0);
        self.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self, ResourceAddress::None)
    }

    /// Whether this backend type can be clustered over several remote
    /// socket addresses.
    pub fn address_list(&self) -> Option<&[SocketAddr]> {
        match self {
            ResourceAddress::Http(a) => Some(&a.addresses),
            ResourceAddress::FastCgi(a) | ResourceAddress::Was(a) if !a.address_list.is_empty() => {
                Some(&a.address_list)
            }
            _ => None,
        }
    }

    pub fn has_query_string(&self) -> bool {
        match self {
            ResourceAddress::Http(a) => a.path.contains('?'),
            ResourceAddress::Cgi(a)
            | ResourceAddress::FastCgi(a)
            | ResourceAddress::Was(a)
            | ResourceAddress::Pipe(a) => a.query_string.is_some(),
            _ => false,
        }
    }

    /// Rewrite the path/URI tail: where the current value ends with
    /// `old_suffix`, substitute `new_suffix`. This is the re-substitution
    /// step behind cached BASE translations.
    pub fn replace_tail(&self, old_suffix: &str, new_suffix: &str) -> Option<ResourceAddress> {
        fn swap(value: &str, old: &str, new: &str) -> Option<String> {
            let stem = value.strip_suffix(old)?;
            let mut out = String::with_capacity(stem.len() + new.len());
            out.push_str(stem);
            out.push_str(new);
            Some(out)
        }

        match self {
            ResourceAddress::Local(a) => {
                let mut a = a.clone();
                a.path = swap(&a.path, old_suffix, new_suffix)?;
                Some(ResourceAddress::Local(a))
            }
            ResourceAddress::Nfs(a) => {
                let mut a = a.clone();
                a.path = swap(&a.path, old_suffix, new_suffix)?;
                Some(ResourceAddress::Nfs(a))
            }
            ResourceAddress::Http(a) => {
                let mut a = a.clone();
                a.path = swap(&a.path, old_suffix, new_suffix)?;
                Some(ResourceAddress::Http(a))
            }
            ResourceAddress::Lhttp(a) => {
                let mut a = a.clone();
                a.uri = swap(&a.uri, old_suffix, new_suffix)?;
                Some(ResourceAddress::Lhttp(a))
            }
            ResourceAddress::Cgi(a)
            | ResourceAddress::FastCgi(a)
            | ResourceAddress::Was(a)
            | ResourceAddress::Pipe(a) => {
                let mut b = a.clone();
                b.path_info = match &a.path_info {
                    Some(pi) => Some(swap(pi, old_suffix, new_suffix)?),
                    None => return None,
                };
                Some(match self {
                    ResourceAddress::Cgi(_) => ResourceAddress::Cgi(b),
                    ResourceAddress::FastCgi(_) => ResourceAddress::FastCgi(b),
                    ResourceAddress::Was(_) => ResourceAddress::Was(b),
                    _ => ResourceAddress::Pipe(b),
                })
            }
            ResourceAddress::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_and_distinguishes() {
        let a = ResourceAddress::Local(FileAddress {
            path: "/srv/www/index.html".into(),
            ..Default::default()
        });
        let b = ResourceAddress::Local(FileAddress {
            path: "/srv/www/other.html".into(),
            ..Default::default()
        });
        assert_eq!(a.id(), a.clone().id());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 16);
    }

    #[test]
    fn replace_tail_on_file_path() {
        let a = ResourceAddress::Local(FileAddress {
            path: "/srv/www/articles/one.html".into(),
            ..Default::default()
        });
        let b = a.replace_tail("one.html", "two.html").unwrap();
        match b {
            ResourceAddress::Local(f) => assert_eq!(f.path, "/srv/www/articles/two.html"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn query_string_detection() {
        let a = ResourceAddress::Http(HttpAddress {
            path: "/search?q=x".into(),
            ..Default::default()
        });
        assert!(a.has_query_string());
        let b = ResourceAddress::Http(HttpAddress {
            path: "/search".into(),
            ..Default::default()
        });
        assert!(!b.has_query_string());
    }
}
