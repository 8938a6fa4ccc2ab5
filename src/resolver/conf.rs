//! Reading resolv.conf style configuration.
//!
//! The resolver understands the directives a stub resolver cares about:
//! `nameserver`, `domain`, `search`, and the `ndots`, `timeout`, and
//! `attempts` options. Which directives actually take effect is selected
//! with [`ConfFlags`], so callers can, say, take the nameservers from the
//! file but keep their own search list. Everything else in the file is
//! ignored.

use std::io::Read;
use std::path::Path;
use std::{error, fmt, fs, io};
use tracing::debug;
use super::Resolver;

/// resolv.conf files larger than this are rejected.
const MAX_CONF_SIZE: u64 = 65535;

//------------ ConfFlags -----------------------------------------------------

/// Which groups of directives a configuration pass may apply.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConfFlags {
    /// Apply `nameserver` defaults when the file provides none.
    pub nameservers: bool,

    /// Apply `domain`, `search`, and `ndots`.
    pub search: bool,

    /// Apply `timeout` and `attempts`.
    pub misc: bool,
}

impl ConfFlags {
    /// Apply everything.
    pub const ALL: ConfFlags = ConfFlags {
        nameservers: true,
        search: true,
        misc: true,
    };

    /// Apply only nameserver handling.
    pub const NAMESERVERS: ConfFlags = ConfFlags {
        nameservers: true,
        search: false,
        misc: false,
    };

    /// Apply only search list handling.
    pub const SEARCH: ConfFlags = ConfFlags {
        nameservers: false,
        search: true,
        misc: false,
    };
}

//------------ Parsing -------------------------------------------------------

impl Resolver {
    /// Configures the resolver from a resolv.conf style file.
    ///
    /// A missing or empty file is not an error: the defaults apply
    /// instead, which add `127.0.0.1` as a nameserver and derive the
    /// search list from the local host name, each gated by the matching
    /// flag.
    pub async fn parse_resolv_conf(
        &self,
        flags: ConfFlags,
        path: impl AsRef<Path>,
    ) -> Result<(), ConfError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "parsing resolv.conf");
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => {
                self.conf_defaults(flags).await;
                return Ok(());
            }
            Err(err) => return Err(ConfError::Open(err)),
        };
        let len = file.metadata().map_err(ConfError::Stat)?.len();
        if len == 0 {
            self.conf_defaults(flags).await;
            return Ok(());
        }
        if len > MAX_CONF_SIZE {
            return Err(ConfError::TooLarge);
        }
        let mut data = Vec::with_capacity(len as usize);
        file.read_to_end(&mut data).map_err(ConfError::Read)?;
        let text = String::from_utf8_lossy(&data);

        self.apply_conf(&text, flags).await;

        if flags.nameservers && self.count_nameservers() == 0 {
            let _ = self.add_nameserver_str("127.0.0.1").await;
        }
        let search_empty = {
            let core = self.0.core.lock().expect("poisoned");
            core.search.domains.is_empty()
        };
        if flags.search && search_empty {
            self.search_from_hostname();
        }
        Ok(())
    }

    /// Applies the directives found in `text`.
    pub(crate) async fn apply_conf(&self, text: &str, flags: ConfFlags) {
        for line in text.lines() {
            let mut words = line.split_whitespace();
            match words.next() {
                Some("nameserver") => {
                    if let Some(addr) = words.next() {
                        let _ = self.add_nameserver_str(addr).await;
                    }
                }
                Some("domain") if flags.search => {
                    if let Some(domain) = words.next() {
                        self.search_clear();
                        self.search_add(domain);
                    }
                }
                Some("search") if flags.search => {
                    self.search_clear();
                    for domain in words {
                        self.search_add(domain);
                    }
                }
                Some("options") => {
                    for option in words {
                        self.apply_conf_option(option, flags);
                    }
                }
                _ => {}
            }
        }
    }

    fn apply_conf_option(&self, option: &str, flags: ConfFlags) {
        let (name, value) = match option.split_once(':') {
            Some((name, value)) => (name, value),
            None => return,
        };
        let value: u32 = match value.parse() {
            Ok(value) => value,
            Err(_) => return,
        };
        match name {
            "ndots" if flags.search => {
                debug!(ndots = value, "setting ndots");
                self.set_ndots(value);
            }
            "timeout" if flags.misc => {
                debug!(timeout = value, "setting timeout");
                self.set_timeout(std::time::Duration::from_secs(value.into()));
            }
            "attempts" if flags.misc => {
                let value = value.min(255);
                debug!(attempts = value, "setting attempts");
                self.set_max_retransmits(value);
            }
            _ => {}
        }
    }

    /// The configuration used when no file is available.
    async fn conf_defaults(&self, flags: ConfFlags) {
        if flags.search {
            self.search_from_hostname();
        }
        if flags.nameservers {
            let _ = self.add_nameserver_str("127.0.0.1").await;
        }
    }

    /// Derives the search list from the local host name.
    ///
    /// Everything after the first dot of the host name becomes the single
    /// search domain. A host name without a dot leaves the list empty.
    fn search_from_hostname(&self) {
        self.search_clear();
        if let Some(domain) = hostname().as_deref().and_then(|name| {
            name.split_once('.').map(|(_, domain)| domain.to_owned())
        }) {
            self.search_add(&domain);
        }
    }
}

/// Returns the local host name, if it can be determined.
fn hostname() -> Option<String> {
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(name) = fs::read_to_string(path) {
            let name = name.trim();
            if !name.is_empty() {
                return Some(name.to_owned());
            }
        }
    }
    None
}

//------------ ConfError -----------------------------------------------------

/// Reading a configuration file failed.
///
/// The numeric codes returned by [`code`][Self::code] are a published
/// contract. Code 4 was an out-of-memory condition in the classic evdns
/// interface and cannot occur here.
#[derive(Debug)]
pub enum ConfError {
    /// The file exists but could not be opened.
    Open(io::Error),

    /// The file's metadata could not be read.
    Stat(io::Error),

    /// The file is larger than a resolv.conf has any business being.
    TooLarge,

    /// Reading the file failed part way.
    Read(io::Error),
}

impl ConfError {
    /// Returns the published numeric code for this error.
    pub fn code(&self) -> u32 {
        match *self {
            ConfError::Open(_) => 1,
            ConfError::Stat(_) => 2,
            ConfError::TooLarge => 3,
            ConfError::Read(_) => 5,
        }
    }
}

impl fmt::Display for ConfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConfError::Open(ref err) => write!(f, "failed to open file: {}", err),
            ConfError::Stat(ref err) => write!(f, "failed to stat file: {}", err),
            ConfError::TooLarge => f.write_str("file too large"),
            ConfError::Read(ref err) => write!(f, "short read from file: {}", err),
        }
    }
}

impl error::Error for ConfError {}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn directives_apply() {
        let resolver = Resolver::new();
        let text = "# comment\n\
                    nameserver 127.0.0.1\n\
                    nameserver 127.0.0.2\n\
                    nameserver 127.0.0.1\n\
                    search a.example b.example\n\
                    options ndots:3 timeout:7 attempts:300\n\
                    bogus directive ignored\n";
        resolver.apply_conf(text, ConfFlags::ALL).await;

        // The duplicate nameserver was dropped.
        assert_eq!(resolver.count_nameservers(), 2);

        let core = resolver.0.core.lock().unwrap();
        let domains: Vec<&str> = core.search.domains.iter().map(AsRef::as_ref).collect();
        assert_eq!(domains, ["a.example", "b.example"]);
        assert_eq!(core.search.ndots, 3);
        assert_eq!(core.limits.timeout, std::time::Duration::from_secs(7));
        // Attempts are capped at 255.
        assert_eq!(core.limits.max_retransmits, 255);
    }

    #[tokio::test]
    async fn domain_replaces_search_list() {
        let resolver = Resolver::new();
        resolver.search_add("old.example");
        resolver
            .apply_conf("domain new.example\n", ConfFlags::ALL)
            .await;
        let core = resolver.0.core.lock().unwrap();
        let domains: Vec<&str> = core.search.domains.iter().map(AsRef::as_ref).collect();
        assert_eq!(domains, ["new.example"]);
    }

    #[tokio::test]
    async fn flags_gate_directives() {
        let resolver = Resolver::new();
        let text = "search a.example\noptions ndots:5 timeout:9\n";
        resolver.apply_conf(text, ConfFlags::NAMESERVERS).await;
        let core = resolver.0.core.lock().unwrap();
        assert!(core.search.domains.is_empty());
        assert_eq!(core.search.ndots, 1);
        assert_eq!(core.limits.timeout, std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_file_uses_defaults() {
        let resolver = Resolver::new();
        resolver
            .parse_resolv_conf(ConfFlags::NAMESERVERS, "/definitely/not/a/resolv.conf")
            .await
            .unwrap();
        assert_eq!(resolver.count_nameservers(), 1);
    }

    #[test]
    fn error_codes_are_published_contract() {
        let not_found = || io::Error::new(io::ErrorKind::NotFound, "x");
        assert_eq!(ConfError::Open(not_found()).code(), 1);
        assert_eq!(ConfError::Stat(not_found()).code(), 2);
        assert_eq!(ConfError::TooLarge.code(), 3);
        assert_eq!(ConfError::Read(not_found()).code(), 5);
    }
}
