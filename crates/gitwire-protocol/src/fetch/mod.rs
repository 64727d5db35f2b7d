//! Fetch sessions.
//!
//! A [`FetchSession`] lists refs and negotiates a packfile with an
//! upload-pack service. The protocol version is detected from the
//! advertisement and the matching implementation is picked once, when the
//! session starts; every later call goes through the [`FetchProtocol`] trait.

mod v1;
mod v2;

use crate::advertisement::{Advertisement, ProtocolVersion, Ref};
use crate::capabilities::{Capabilities, Features};
use crate::config::ClientConfig;
use crate::context::Context;
use crate::error::ResultExt;
use crate::pktline::{PktLine, PktLineReader};
use crate::sideband::{ProgressSink, SideBandReader};
use crate::transport::{Connection, Transport};
use crate::{GitError, Result};
use gitwire_object::ObjectId;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

/// What to fetch and how much history to include.
#[derive(Default)]
pub struct FetchRequest {
    /// Objects to fetch. At least one is required.
    pub wants: Vec<ObjectId>,
    /// Objects the client already has.
    pub haves: Vec<ObjectId>,
    /// More `have` rounds follow; do not send `done` yet.
    pub have_more: bool,
    /// Commits that are shallow boundaries in the client repository.
    pub shallows: Vec<ObjectId>,
    /// Limit history to this many commits from the wants.
    pub depth: Option<u32>,
    /// Count `depth` from the current shallow boundary instead of the wants.
    pub deepen_relative: bool,
    /// Exclude commits older than this Unix timestamp.
    pub since: Option<i64>,
    /// Exclude history reachable from these revisions.
    pub excludes: Vec<String>,
    /// Partial clone filter, e.g. `blob:none`.
    pub filter: Option<String>,
    /// Receives the remote's progress messages; without one the remote is
    /// asked not to send any.
    pub progress: Option<ProgressSink>,
    /// Allow deltas against objects the client has.
    pub thin_pack: bool,
    /// Include annotated tags pointing at fetched objects.
    pub include_tag: bool,
}

impl FetchRequest {
    /// Creates a request for `wants` with no further options.
    pub fn new(wants: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            wants: wants.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Returns true if the request limits history in any way.
    pub fn deepens(&self) -> bool {
        self.depth.is_some() || self.since.is_some() || !self.excludes.is_empty()
    }

    /// Checks the request on its own and against the server's features.
    /// Nothing is sent for a request that fails here.
    pub(crate) fn validate(&self, version: ProtocolVersion, features: Features) -> Result<()> {
        if self.wants.is_empty() {
            return Err(GitError::InvalidRequest("no objects requested".to_string()));
        }
        let deepen_kinds = [self.depth.is_some(), self.since.is_some(), !self.excludes.is_empty()]
            .into_iter()
            .filter(|set| *set)
            .count();
        if deepen_kinds > 1 {
            return Err(GitError::InvalidRequest(
                "only one of depth, since and exclude can be used".to_string(),
            ));
        }
        if self.depth == Some(0) {
            return Err(GitError::InvalidRequest("depth must be positive".to_string()));
        }
        if self.deepen_relative && self.depth.is_none() {
            return Err(GitError::InvalidRequest("deepen-relative needs a depth".to_string()));
        }
        if let Some(filter) = &self.filter {
            if filter.is_empty() || filter.contains(char::is_whitespace) {
                return Err(GitError::InvalidRequest(format!("invalid filter {filter:?}")));
            }
        }

        let mut required = Vec::new();
        match version {
            ProtocolVersion::V1 => {
                if self.depth.is_some() || !self.shallows.is_empty() {
                    required.push((Features::SHALLOW, "shallow"));
                }
                if self.since.is_some() {
                    required.push((Features::DEEPEN_SINCE, "deepen-since"));
                }
                if !self.excludes.is_empty() {
                    required.push((Features::DEEPEN_NOT, "deepen-not"));
                }
                if self.deepen_relative {
                    required.push((Features::DEEPEN_RELATIVE, "deepen-relative"));
                }
                if self.thin_pack {
                    required.push((Features::THIN_PACK, "thin-pack"));
                }
                if self.include_tag {
                    required.push((Features::INCLUDE_TAG, "include-tag"));
                }
            }
            // v2 servers offer every deepen variant under `shallow`, and
            // thin packs and tag following unconditionally.
            ProtocolVersion::V2 => {
                if self.deepens() || !self.shallows.is_empty() {
                    required.push((Features::SHALLOW, "shallow"));
                }
            }
        }
        if self.filter.is_some() {
            required.push((Features::FILTER, "filter"));
        }

        for (flag, name) in required {
            if !features.contains(flag) {
                return Err(GitError::MissingCapability(name.to_string()));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("wants", &self.wants)
            .field("haves", &self.haves)
            .field("have_more", &self.have_more)
            .field("shallows", &self.shallows)
            .field("depth", &self.depth)
            .field("deepen_relative", &self.deepen_relative)
            .field("since", &self.since)
            .field("excludes", &self.excludes)
            .field("filter", &self.filter)
            .field("progress", &self.progress.is_some())
            .field("thin_pack", &self.thin_pack)
            .field("include_tag", &self.include_tag)
            .finish()
    }
}

/// How the server acknowledged a `have`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// The object is common to both sides.
    Common,
    /// The server has found enough common objects to send a pack.
    Ready,
    /// v1 `continue`: common, keep sending haves.
    Continue,
    /// v1 final acknowledgement; the packfile follows.
    Final,
}

/// One acknowledged object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// The acknowledged object.
    pub id: ObjectId,
    /// What the acknowledgement means.
    pub status: AckStatus,
}

/// A change to the client's shallow boundary requested by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShallowUpdate {
    /// The commit becomes a shallow boundary.
    Shallow(ObjectId),
    /// The commit is no longer a shallow boundary.
    Unshallow(ObjectId),
}

impl ShallowUpdate {
    /// Parses `shallow <oid>` or `unshallow <oid>`.
    pub(crate) fn parse(line: &str) -> Option<Result<Self>> {
        if let Some(id) = line.strip_prefix("shallow ") {
            return Some(crate::advertisement::parse_id(id).map(Self::Shallow));
        }
        line.strip_prefix("unshallow ")
            .map(|id| crate::advertisement::parse_id(id).map(Self::Unshallow))
    }
}

/// The pack data of a fetch response.
///
/// Reads yield the raw pack bytes from side-band channel 1. Progress text on
/// channel 2 goes to the request's progress sink, and a fatal message on
/// channel 3 fails the read with a remote error.
pub struct Packfile {
    reader: SideBandReader<Box<dyn Connection>>,
}

impl Packfile {
    pub(crate) fn new(reader: PktLineReader<Box<dyn Connection>>, progress: Option<ProgressSink>) -> Self {
        Self {
            reader: SideBandReader::new(reader, progress),
        }
    }

    /// Returns true once the whole pack has been read.
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }

    /// Releases the connection, reporting errors of the remote side.
    pub fn close(self) -> Result<()> {
        if let Some(message) = self.reader.fatal_error() {
            return Err(GitError::Remote(message.to_string()));
        }
        self.reader.into_inner().into_inner().close()
    }
}

impl Read for Packfile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for Packfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packfile")
            .field("finished", &self.reader.is_finished())
            .finish()
    }
}

/// The outcome of a negotiation round.
#[derive(Debug, Default)]
pub struct FetchResponse {
    /// The pack, absent when the round ended without one (`have_more`).
    pub packfile: Option<Packfile>,
    /// Acknowledged objects in the order received.
    pub acks: Vec<Ack>,
    /// The server is ready to send a pack.
    pub ready: bool,
    /// Shallow boundary changes to apply.
    pub shallow_updates: Vec<ShallowUpdate>,
}

/// A version of the fetch protocol.
pub trait FetchProtocol: Send {
    /// Protocol version spoken.
    fn version(&self) -> ProtocolVersion;

    /// Capabilities the server advertised.
    fn capabilities(&self) -> &Capabilities;

    /// Fetch-relevant features the server supports.
    fn features(&self) -> Features;

    /// Lists refs, optionally restricted to names starting with one of
    /// `prefixes`.
    fn list_refs(&mut self, ctx: &Context, prefixes: &[&str]) -> Result<Vec<Ref>>;

    /// Runs one negotiation round.
    fn negotiate(&mut self, ctx: &Context, request: FetchRequest) -> Result<FetchResponse>;
}

/// A fetch conversation with one remote.
pub struct FetchSession {
    protocol: Box<dyn FetchProtocol>,
    remote: String,
}

impl FetchSession {
    /// Starts a session from an already read upload-pack advertisement.
    pub fn new(transport: Arc<dyn Transport>, advertisement: Arc<Advertisement>, config: &ClientConfig) -> Self {
        let remote = transport.url().to_string();
        let protocol: Box<dyn FetchProtocol> = match advertisement.version {
            ProtocolVersion::V1 => Box::new(v1::ProtocolV1::new(transport, advertisement, config)),
            ProtocolVersion::V2 => Box::new(v2::ProtocolV2::new(transport, advertisement, config)),
        };
        tracing::debug!(remote = %remote, version = %protocol.version(), "fetch session started");
        Self { protocol, remote }
    }

    /// Protocol version of this session.
    pub fn version(&self) -> ProtocolVersion {
        self.protocol.version()
    }

    /// Capabilities the server advertised.
    pub fn capabilities(&self) -> &Capabilities {
        self.protocol.capabilities()
    }

    /// Fetch-relevant features the server supports.
    pub fn features(&self) -> Features {
        self.protocol.features()
    }

    /// Lists the remote's refs, optionally restricted by name prefix.
    pub fn list_refs(&mut self, ctx: &Context, prefixes: &[&str]) -> Result<Vec<Ref>> {
        self.protocol
            .list_refs(ctx, prefixes)
            .with_session("ls-refs", &self.remote)
    }

    /// Negotiates a packfile for `request`.
    pub fn negotiate(&mut self, ctx: &Context, request: FetchRequest) -> Result<FetchResponse> {
        self.protocol
            .negotiate(ctx, request)
            .with_session("fetch", &self.remote)
    }
}

impl fmt::Debug for FetchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchSession")
            .field("remote", &self.remote)
            .field("version", &self.protocol.version())
            .finish()
    }
}

/// Reads a line of text, failing on flush, delim or end of stream.
pub(crate) fn read_text<R: Read>(reader: &mut PktLineReader<R>) -> Result<String> {
    let pkt = reader.read_line()?;
    Ok(pkt.as_text()?.trim_end_matches('\n').to_string())
}

/// Reads a packet, returning its text or the bare flush/delim.
pub(crate) fn read_packet<R: Read>(reader: &mut PktLineReader<R>) -> Result<Packet> {
    match reader.read_line()? {
        PktLine::Flush => Ok(Packet::Flush),
        PktLine::Delim => Ok(Packet::Delim),
        pkt => Ok(Packet::Text(pkt.as_text()?.trim_end_matches('\n').to_string())),
    }
}

/// A decoded response packet.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Packet {
    Text(String),
    Flush,
    Delim,
}

/// Parses `ACK <oid>[ <status>]`.
pub(crate) fn parse_ack(line: &str) -> Result<Option<Ack>> {
    let Some(rest) = line.strip_prefix("ACK ") else {
        return Ok(None);
    };
    let (id, status) = match rest.split_once(' ') {
        Some((id, status)) => (id, status),
        None => (rest, ""),
    };
    let status = match status {
        "" => AckStatus::Final,
        "common" => AckStatus::Common,
        "ready" => AckStatus::Ready,
        "continue" => AckStatus::Continue,
        other => return Err(GitError::Protocol(format!("unknown ACK status {other:?}"))),
    };
    Ok(Some(Ack {
        id: crate::advertisement::parse_id(id)?,
        status,
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::Service;
    use parking_lot::Mutex;
    use std::io::{Cursor, Write};

    /// Serves canned responses, one per exchange, and records the requests.
    pub(crate) struct Scripted {
        responses: Mutex<Vec<Vec<u8>>>,
        requests: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Scripted {
        pub(crate) fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                requests: Arc::default(),
            }
        }

        pub(crate) fn requests(&self) -> Vec<Vec<u8>> {
            self.requests.lock().clone()
        }

        /// Request `n` as text lines, with flush and delim shown as `0000` and `0001`.
        pub(crate) fn request_lines(&self, n: usize) -> Vec<String> {
            let raw = self.requests.lock()[n].clone();
            let mut reader = PktLineReader::new(raw.as_slice());
            let mut lines = Vec::new();
            while let Some(pkt) = reader.read().unwrap() {
                lines.push(match pkt {
                    PktLine::Flush => "0000".to_string(),
                    PktLine::Delim => "0001".to_string(),
                    data => data.as_str().unwrap().trim_end().to_string(),
                });
            }
            lines
        }
    }

    struct ScriptedConnection {
        response: Cursor<Vec<u8>>,
        request: Vec<u8>,
        requests: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Read for ScriptedConnection {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.response.read(buf)
        }
    }

    impl Write for ScriptedConnection {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.request.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Connection for ScriptedConnection {
        fn end_request(&mut self) -> Result<()> {
            self.requests.lock().push(std::mem::take(&mut self.request));
            Ok(())
        }

        fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    impl Transport for Scripted {
        fn url(&self) -> &str {
            "scripted://remote"
        }

        fn advertise_refs(&self, _: &Context, _: Service, _: ProtocolVersion) -> Result<Box<dyn Read + Send>> {
            Err(GitError::Transport("no advertisement scripted".to_string()))
        }

        fn upload_pack(&self, _: &Context, _: ProtocolVersion) -> Result<Box<dyn Connection>> {
            self.connect()
        }

        fn receive_pack(&self, _: &Context) -> Result<Box<dyn Connection>> {
            self.connect()
        }
    }

    impl Scripted {
        fn connect(&self) -> Result<Box<dyn Connection>> {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(GitError::Transport("no response scripted".to_string()));
            }
            Ok(Box::new(ScriptedConnection {
                response: Cursor::new(responses.remove(0)),
                request: Vec::new(),
                requests: Arc::clone(&self.requests),
            }))
        }
    }

    pub(crate) fn pkts(lines: &[PktLine]) -> Vec<u8> {
        lines.iter().flat_map(|l| l.encode()).collect()
    }

    pub(crate) fn text(s: &str) -> PktLine {
        PktLine::from_string(&format!("{s}\n"))
    }

    fn id(n: u8) -> ObjectId {
        ObjectId::from_bytes([n; 20])
    }

    #[test]
    fn test_request_needs_wants() {
        let err = FetchRequest::default()
            .validate(ProtocolVersion::V2, Features::all())
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid request: no objects requested");
    }

    #[test]
    fn test_one_deepen_kind() {
        let mut request = FetchRequest::new([id(1)]);
        request.depth = Some(1);
        request.since = Some(1_700_000_000);
        assert!(request.validate(ProtocolVersion::V2, Features::all()).is_err());
        request.since = None;
        assert!(request.validate(ProtocolVersion::V2, Features::all()).is_ok());
        request.depth = Some(0);
        assert!(request.validate(ProtocolVersion::V2, Features::all()).is_err());
    }

    #[test]
    fn test_missing_capabilities_rejected_v1() {
        let base = Features::SIDE_BAND_64K | Features::OFS_DELTA;
        let cases: [(fn(&mut FetchRequest), &str); 6] = [
            (|r| r.depth = Some(1), "shallow"),
            (|r| r.since = Some(0), "deepen-since"),
            (|r| r.excludes = vec!["v1.0".into()], "deepen-not"),
            (|r| r.filter = Some("blob:none".into()), "filter"),
            (|r| r.include_tag = true, "include-tag"),
            (|r| r.thin_pack = true, "thin-pack"),
        ];
        for (apply, capability) in cases {
            let mut request = FetchRequest::new([id(1)]);
            apply(&mut request);
            match request.validate(ProtocolVersion::V1, base) {
                Err(GitError::MissingCapability(name)) => assert_eq!(name, capability),
                other => panic!("expected missing {capability}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_v2_needs_only_shallow_and_filter() {
        let mut request = FetchRequest::new([id(1)]);
        request.thin_pack = true;
        request.include_tag = true;
        assert!(request.validate(ProtocolVersion::V2, Features::empty()).is_ok());

        request.excludes = vec!["main".into()];
        assert!(matches!(
            request.validate(ProtocolVersion::V2, Features::FILTER),
            Err(GitError::MissingCapability(_))
        ));
        assert!(request.validate(ProtocolVersion::V2, Features::SHALLOW).is_ok());
    }

    #[test]
    fn test_parse_ack() {
        let hex = "ce013625030ba8dba906f756967f9e9ca394464a";
        let ack = parse_ack(&format!("ACK {hex}")).unwrap().unwrap();
        assert_eq!(ack.status, AckStatus::Final);
        let ack = parse_ack(&format!("ACK {hex} ready")).unwrap().unwrap();
        assert_eq!(ack.status, AckStatus::Ready);
        assert!(parse_ack("NAK").unwrap().is_none());
        assert!(parse_ack(&format!("ACK {hex} maybe")).is_err());
        assert!(parse_ack("ACK nothex").is_err());
    }

    #[test]
    fn test_shallow_update_parse() {
        let hex = "ce013625030ba8dba906f756967f9e9ca394464a";
        let id = ObjectId::from_hex(hex).unwrap();
        assert_eq!(
            ShallowUpdate::parse(&format!("shallow {hex}")).unwrap().unwrap(),
            ShallowUpdate::Shallow(id)
        );
        assert_eq!(
            ShallowUpdate::parse(&format!("unshallow {hex}")).unwrap().unwrap(),
            ShallowUpdate::Unshallow(id)
        );
        assert!(ShallowUpdate::parse("ACK x").is_none());
    }
}
