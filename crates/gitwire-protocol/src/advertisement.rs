//! Parsing of the initial server advertisement and protocol version detection.

use crate::capabilities::{Capabilities, Features};
use crate::pktline::{PktLine, PktLineReader};
use crate::{GitError, Result};
use gitwire_object::ObjectId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;

/// Placeholder ref name used by servers that have capabilities but no refs.
const NO_REFS: &str = "capabilities^{}";

/// Smart protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProtocolVersion {
    /// The original protocol, also used for version 0.
    V1,
    /// Command based protocol with explicit sections.
    #[default]
    V2,
}

impl ProtocolVersion {
    /// Numeric version.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Value of the `GIT_PROTOCOL` environment variable / `Git-Protocol` header.
    pub fn git_protocol(self) -> String {
        format!("version={}", self.as_u8())
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 | 1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(format!("unsupported protocol version {other}")),
        }
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(version: ProtocolVersion) -> Self {
        version.as_u8()
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// A remote reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ref {
    /// Object the ref points to.
    pub id: ObjectId,
    /// Full ref name, e.g. `refs/heads/main` or `HEAD`.
    pub name: String,
    /// Target of a symbolic ref, e.g. `refs/heads/main` for `HEAD`.
    pub symref_target: Option<String>,
    /// Object an annotated tag ultimately points to.
    pub peeled: Option<ObjectId>,
}

impl Ref {
    /// Creates a direct ref.
    pub fn new(id: ObjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            symref_target: None,
            peeled: None,
        }
    }

    /// Parses a v2 `ls-refs` line:
    /// `<oid> <refname>[ symref-target:<target>][ peeled:<oid>]`.
    pub fn parse_v2(line: &str) -> Result<Self> {
        let mut parts = line.split(' ');
        let (Some(id), Some(name)) = (parts.next(), parts.next()) else {
            return Err(GitError::Protocol(format!("malformed ref line {line:?}")));
        };
        // Unborn HEAD is advertised with the literal id "unborn".
        let id = if id == "unborn" {
            ObjectId::null()
        } else {
            parse_id(id)?
        };
        let mut r = Ref::new(id, name);
        for attribute in parts {
            if let Some(target) = attribute.strip_prefix("symref-target:") {
                r.symref_target = Some(target.to_string());
            } else if let Some(peeled) = attribute.strip_prefix("peeled:") {
                r.peeled = Some(parse_id(peeled)?);
            }
        }
        Ok(r)
    }
}

/// Parses a hex object id appearing on the wire.
pub(crate) fn parse_id(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex).map_err(|_| GitError::Protocol(format!("invalid object id {hex:?}")))
}

/// The initial advertisement a server sends on connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Protocol version the server speaks.
    pub version: ProtocolVersion,
    /// Advertised capabilities.
    pub capabilities: Capabilities,
    /// Refs (v1 only; v2 lists refs with `ls-refs`).
    pub refs: Vec<Ref>,
    /// Shallow boundary commits of the remote repository (v1 only).
    pub shallows: Vec<ObjectId>,
}

impl Advertisement {
    /// Reads and parses an advertisement, detecting the protocol version from
    /// the first line.
    pub fn read<R: Read>(reader: &mut PktLineReader<R>) -> Result<Self> {
        let mut first = reader.read_line()?;
        if first.as_str() == Some("version 2") {
            return Self::read_v2(reader);
        }
        if first.as_str() == Some("version 1") {
            first = reader.read_line()?;
        }
        Self::read_v1(reader, first)
    }

    /// Parses a v2 capability advertisement following the `version 2` line.
    fn read_v2<R: Read>(reader: &mut PktLineReader<R>) -> Result<Self> {
        let mut capabilities = Capabilities::new();
        for pkt in reader.read_until_flush()? {
            capabilities.add_raw(pkt.as_text()?);
        }
        tracing::debug!(capabilities = %capabilities, "v2 capability advertisement");
        Ok(Self {
            version: ProtocolVersion::V2,
            capabilities,
            refs: Vec::new(),
            shallows: Vec::new(),
        })
    }

    /// Parses a v1 ref advertisement starting with `first`.
    fn read_v1<R: Read>(reader: &mut PktLineReader<R>, first: PktLine) -> Result<Self> {
        let mut advertisement = Self {
            version: ProtocolVersion::V1,
            capabilities: Capabilities::new(),
            refs: Vec::new(),
            shallows: Vec::new(),
        };
        // A bare flush is what a server without refs or capabilities sends.
        if first.is_flush() {
            return Ok(advertisement);
        }

        let data = first
            .data()
            .ok_or_else(|| GitError::Protocol("unexpected delimiter in advertisement".to_string()))?;
        let (head, caps) = match data.iter().position(|&b| b == 0) {
            Some(nul) => (&data[..nul], &data[nul + 1..]),
            None => (&data[..], &b""[..]),
        };
        let caps = std::str::from_utf8(caps)
            .map_err(|_| GitError::Protocol("capabilities are not valid UTF-8".to_string()))?;
        advertisement.capabilities = Capabilities::parse(caps.trim_end_matches('\n'));

        let head = std::str::from_utf8(head)
            .map_err(|_| GitError::Protocol("ref line is not valid UTF-8".to_string()))?
            .trim_end_matches('\n');
        let (id, name) = split_ref_line(head)?;
        if name == NO_REFS {
            if !id.is_null() {
                return Err(GitError::Protocol(format!(
                    "{NO_REFS} advertised with non-zero id {id}"
                )));
            }
        } else {
            advertisement.push_v1_ref(id, name);
        }

        loop {
            let pkt = reader.read_line()?;
            if pkt.is_flush() {
                break;
            }
            let line = pkt.as_text()?;
            if let Some(shallow) = line.strip_prefix("shallow ") {
                advertisement.shallows.push(parse_id(shallow)?);
                continue;
            }
            let (id, name) = split_ref_line(line)?;
            advertisement.push_v1_ref(id, name);
        }

        for (name, target) in advertisement.capabilities.symrefs() {
            if let Some(r) = advertisement.refs.iter_mut().find(|r| r.name == name) {
                r.symref_target = Some(target.to_string());
            }
        }

        tracing::debug!(
            refs = advertisement.refs.len(),
            capabilities = %advertisement.capabilities,
            "v1 ref advertisement"
        );
        Ok(advertisement)
    }

    /// Adds a v1 ref, attaching `<name>^{}` lines to the preceding ref.
    fn push_v1_ref(&mut self, id: ObjectId, name: &str) {
        if let Some(base) = name.strip_suffix("^{}") {
            if let Some(previous) = self.refs.last_mut().filter(|r| r.name == base) {
                previous.peeled = Some(id);
                return;
            }
        }
        self.refs.push(Ref::new(id, name));
    }

    /// Capability summary appropriate for the advertised version.
    pub fn features(&self) -> Features {
        match self.version {
            ProtocolVersion::V1 => self.capabilities.features_v1(),
            ProtocolVersion::V2 => self.capabilities.features_v2(),
        }
    }

    /// Looks up a ref by full name.
    pub fn find_ref(&self, name: &str) -> Option<&Ref> {
        self.refs.iter().find(|r| r.name == name)
    }
}

/// Splits `<oid> <refname>`.
fn split_ref_line(line: &str) -> Result<(ObjectId, &str)> {
    let (id, name) = line
        .split_once(' ')
        .ok_or_else(|| GitError::Protocol(format!("malformed ref line {line:?}")))?;
    if name.is_empty() {
        return Err(GitError::Protocol(format!("malformed ref line {line:?}")));
    }
    Ok((parse_id(id)?, name))
}
