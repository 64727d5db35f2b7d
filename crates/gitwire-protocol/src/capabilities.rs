//! Capability sets exchanged during the protocol handshake.

use bitflags::bitflags;
use std::collections::BTreeMap;
use std::fmt;

bitflags! {
    /// Fetch-relevant capabilities summarised as a bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Features: u32 {
        /// Shallow clones and `deepen <n>`.
        const SHALLOW = 1 << 0;
        /// Partial clone filters.
        const FILTER = 1 << 1;
        /// `deepen-since`.
        const DEEPEN_SINCE = 1 << 2;
        /// `deepen-not`.
        const DEEPEN_NOT = 1 << 3;
        /// `deepen-relative`.
        const DEEPEN_RELATIVE = 1 << 4;
        /// Thin packs that reference objects the client has.
        const THIN_PACK = 1 << 5;
        /// Annotated tags pointing at fetched objects are included.
        const INCLUDE_TAG = 1 << 6;
        /// Offset deltas in the pack.
        const OFS_DELTA = 1 << 7;
        /// 1000-byte side-band frames.
        const SIDE_BAND = 1 << 8;
        /// 65520-byte side-band frames.
        const SIDE_BAND_64K = 1 << 9;
        /// `multi_ack_detailed` acknowledgements.
        const MULTI_ACK_DETAILED = 1 << 10;
        /// Server may send the pack without a final `done`.
        const NO_DONE = 1 << 11;
        /// Server waits for `done` before sending the pack.
        const WAIT_FOR_DONE = 1 << 12;
        /// Wants may name refs instead of ids.
        const REF_IN_WANT = 1 << 13;
    }
}

/// A set of capabilities, each with an optional value.
///
/// `symref` is the one capability that legitimately appears more than once;
/// its values are stored joined by spaces and exploded by [`Capabilities::symrefs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    caps: BTreeMap<String, Option<String>>,
}

impl Capabilities {
    /// Creates an empty capability set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a v1 capability list (`a b=c d`).
    pub fn parse(s: &str) -> Self {
        let mut caps = Self::new();
        for cap in s.split_whitespace() {
            caps.add_raw(cap);
        }
        caps
    }

    /// Adds a capability in `key[=value]` form.
    pub fn add_raw(&mut self, raw: &str) {
        match raw.split_once('=') {
            Some((key, value)) => self.insert(key, Some(value)),
            None => self.insert(raw, None),
        }
    }

    /// Adds a capability. Repeated `symref` values accumulate; any other
    /// repeated key is replaced.
    pub fn insert(&mut self, key: &str, value: Option<&str>) {
        if key == "symref" {
            if let (Some(Some(existing)), Some(value)) = (self.caps.get_mut(key), value) {
                existing.push(' ');
                existing.push_str(value);
                return;
            }
        }
        self.caps
            .insert(key.to_string(), value.map(str::to_string));
    }

    /// Returns true if the capability is present.
    pub fn supports(&self, key: &str) -> bool {
        self.caps.contains_key(key)
    }

    /// Returns the value of a capability, if present and valued.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.caps.get(key).and_then(|v| v.as_deref())
    }

    /// Returns the space-separated sub-features of a v2 command capability
    /// such as `fetch=shallow filter`.
    pub fn values_of(&self, key: &str) -> Vec<&str> {
        self.get(key)
            .map(|v| v.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// Returns `(ref, target)` pairs from every `symref=ref:target` entry.
    pub fn symrefs(&self) -> Vec<(&str, &str)> {
        self.values_of("symref")
            .into_iter()
            .filter_map(|pair| pair.split_once(':'))
            .collect()
    }

    /// Returns the number of capabilities.
    pub fn len(&self) -> usize {
        self.caps.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    /// Iterates over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.caps.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Narrows this (client-proposed) set to the keys the server advertised.
    ///
    /// The client's values are kept, so `agent=` stays the client's agent.
    pub fn intersect(&self, server: &Capabilities) -> Capabilities {
        Capabilities {
            caps: self
                .caps
                .iter()
                .filter(|(k, _)| server.supports(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Summarises v1 capabilities as [`Features`].
    pub fn features_v1(&self) -> Features {
        let mut features = Features::empty();
        for (name, flag) in [
            ("shallow", Features::SHALLOW),
            ("filter", Features::FILTER),
            ("deepen-since", Features::DEEPEN_SINCE),
            ("deepen-not", Features::DEEPEN_NOT),
            ("deepen-relative", Features::DEEPEN_RELATIVE),
            ("thin-pack", Features::THIN_PACK),
            ("include-tag", Features::INCLUDE_TAG),
            ("ofs-delta", Features::OFS_DELTA),
            ("side-band", Features::SIDE_BAND),
            ("side-band-64k", Features::SIDE_BAND_64K),
            ("multi_ack_detailed", Features::MULTI_ACK_DETAILED),
            ("no-done", Features::NO_DONE),
        ] {
            if self.supports(name) {
                features |= flag;
            }
        }
        features
    }

    /// Summarises the sub-features of the v2 `fetch` command as [`Features`].
    ///
    /// In v2, `shallow` covers every deepen variant, and thin packs, tag
    /// following and offset deltas need no capability, so only the listed
    /// sub-features are reported.
    pub fn features_v2(&self) -> Features {
        let mut features = Features::empty();
        for value in self.values_of("fetch") {
            features |= match value {
                "shallow" => Features::SHALLOW,
                "filter" => Features::FILTER,
                "wait-for-done" => Features::WAIT_FOR_DONE,
                "ref-in-want" => Features::REF_IN_WANT,
                _ => Features::empty(),
            };
        }
        features
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in self.iter() {
            let values: Vec<&str> = match (key, value) {
                ("symref", Some(v)) => v.split(' ').collect(),
                (_, Some(v)) => vec![v],
                (_, None) => Vec::new(),
            };
            if values.is_empty() {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(key)?;
                first = false;
            }
            for v in values {
                if !first {
                    f.write_str(" ")?;
                }
                write!(f, "{key}={v}")?;
                first = false;
            }
        }
        Ok(())
    }
}

impl<'a> FromIterator<&'a str> for Capabilities {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut caps = Capabilities::new();
        for raw in iter {
            caps.add_raw(raw);
        }
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_parse() {
        let caps = Capabilities::parse("multi_ack side-band-64k ofs-delta agent=git/2.43.0");
        assert!(caps.supports("multi_ack"));
        assert!(caps.supports("side-band-64k"));
        assert!(caps.supports("ofs-delta"));
        assert!(!caps.supports("thin-pack"));
        assert_eq!(caps.get("agent"), Some("git/2.43.0"));
        assert_eq!(caps.get("ofs-delta"), None);
        assert_eq!(caps.len(), 4);
    }

    #[test]
    fn test_symrefs_accumulate() {
        let caps = Capabilities::parse("symref=HEAD:refs/heads/main symref=refs/remotes/o/HEAD:refs/remotes/o/main");
        assert_eq!(
            caps.symrefs(),
            vec![
                ("HEAD", "refs/heads/main"),
                ("refs/remotes/o/HEAD", "refs/remotes/o/main")
            ]
        );
        assert_eq!(
            caps.to_string(),
            "symref=HEAD:refs/heads/main symref=refs/remotes/o/HEAD:refs/remotes/o/main"
        );
    }

    #[test]
    fn test_intersect_keeps_client_values() {
        let client: Capabilities = ["report-status", "ofs-delta", "delete-refs", "agent=gitwire/0.1.0"]
            .into_iter()
            .collect();
        let server = Capabilities::parse("report-status delete-refs side-band-64k agent=git/2.43.0");

        let negotiated = client.intersect(&server);
        assert_eq!(
            negotiated.to_string(),
            "agent=gitwire/0.1.0 delete-refs report-status"
        );
        assert!(!negotiated.supports("ofs-delta"));
    }

    #[test]
    fn test_features_v1() {
        let caps = Capabilities::parse("shallow side-band-64k ofs-delta thin-pack no-done");
        assert_eq!(
            caps.features_v1(),
            Features::SHALLOW
                | Features::SIDE_BAND_64K
                | Features::OFS_DELTA
                | Features::THIN_PACK
                | Features::NO_DONE
        );
    }

    #[test]
    fn test_features_v2() {
        let mut caps = Capabilities::new();
        caps.add_raw("ls-refs");
        caps.add_raw("fetch=shallow filter");
        assert!(caps.supports("fetch"));
        assert_eq!(caps.features_v2(), Features::SHALLOW | Features::FILTER);
        assert_eq!(caps.values_of("fetch"), vec!["shallow", "filter"]);
    }

    #[test]
    fn test_empty_display() {
        assert_eq!(Capabilities::new().to_string(), "");
        assert!(Capabilities::new().is_empty());
    }
}
