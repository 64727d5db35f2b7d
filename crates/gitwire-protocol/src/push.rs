//! Push sessions against a receive-pack service.
//!
//! A push sends ref update commands, then (unless every command is a
//! delete) exactly one packfile with the objects the remote needs, and
//! finally reads the remote's status report.

use crate::advertisement::{Advertisement, ProtocolVersion, Ref};
use crate::capabilities::Capabilities;
use crate::config::ClientConfig;
use crate::context::Context;
use crate::error::ResultExt;
use crate::pack::PackBuilder;
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::transport::{Connection, Transport};
use crate::{GitError, Result};
use gitwire_object::ObjectId;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// A ref update command from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCommand {
    /// Reference name.
    pub name: String,
    /// Value the remote ref must have now (zeros for create).
    pub old: ObjectId,
    /// New value (zeros for delete).
    pub new: ObjectId,
}

impl PushCommand {
    /// Creates a command updating `name` from `old` to `new`.
    pub fn new(name: impl Into<String>, old: ObjectId, new: ObjectId) -> Self {
        Self {
            name: name.into(),
            old,
            new,
        }
    }

    /// Checks if this is a create command.
    pub fn is_create(&self) -> bool {
        self.old.is_null()
    }

    /// Checks if this is a delete command.
    pub fn is_delete(&self) -> bool {
        self.new.is_null()
    }

    fn validate(&self) -> Result<()> {
        if self.is_create() && self.is_delete() {
            return Err(GitError::InvalidRequest(format!(
                "{}: old and new ids are both zero",
                self.name
            )));
        }
        if self.name.is_empty() || self.name.contains(|c: char| c.is_whitespace() || c == '\0') {
            return Err(GitError::InvalidRequest(format!("invalid ref name {:?}", self.name)));
        }
        Ok(())
    }
}

impl fmt::Display for PushCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.old, self.new, self.name)
    }
}

/// Outcome of one ref update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefStatus {
    /// The ref was updated.
    Ok,
    /// The remote refused the update, with its reason.
    Rejected(String),
}

/// The `report-status` response to a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// Why the remote could not unpack the pack, if it failed.
    pub unpack_error: Option<String>,
    /// Per-ref results in the order reported.
    pub refs: Vec<(String, RefStatus)>,
}

impl StatusReport {
    /// Reads a report: `unpack <status>`, then `ok <ref>` / `ng <ref> <msg>`
    /// lines until flush.
    pub fn read<R: Read>(reader: &mut PktLineReader<R>) -> Result<Self> {
        let first = reader.read_line()?;
        let unpack = first
            .as_text()?
            .trim_end_matches('\n')
            .strip_prefix("unpack ")
            .ok_or_else(|| GitError::Protocol("status report must start with `unpack`".to_string()))?;
        let unpack_error = match unpack.trim() {
            "" => return Err(GitError::Protocol("empty unpack status".to_string())),
            "ok" => None,
            error => Some(error.to_string()),
        };

        let mut refs = Vec::new();
        loop {
            let line = match reader.read_line()? {
                PktLine::Flush => break,
                pkt => pkt.as_text()?.trim_end_matches('\n').to_string(),
            };
            if let Some(name) = line.strip_prefix("ok ") {
                refs.push((name.to_string(), RefStatus::Ok));
            } else if let Some(rest) = line.strip_prefix("ng ") {
                let (name, reason) = rest.split_once(' ').unwrap_or((rest, "failed"));
                refs.push((name.to_string(), RefStatus::Rejected(reason.to_string())));
            } else {
                return Err(GitError::Protocol(format!("unexpected status line {line:?}")));
            }
        }
        Ok(Self { unpack_error, refs })
    }

    /// Returns true if the pack was unpacked and every ref was updated.
    pub fn is_ok(&self) -> bool {
        self.unpack_error.is_none() && self.refs.iter().all(|(_, s)| *s == RefStatus::Ok)
    }

    /// Status of one ref, if it was reported.
    pub fn status(&self, name: &str) -> Option<&RefStatus> {
        self.refs.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Turns a report with failures into [`GitError::PushRejected`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(GitError::PushRejected(self))
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut failures = Vec::new();
        if let Some(error) = &self.unpack_error {
            failures.push(format!("unpack failed: {error}"));
        }
        for (name, status) in &self.refs {
            if let RefStatus::Rejected(reason) = status {
                failures.push(format!("{name} rejected: {reason}"));
            }
        }
        if failures.is_empty() {
            f.write_str("all refs updated")
        } else {
            f.write_str(&failures.join("; "))
        }
    }
}

/// A push conversation with one remote.
///
/// Call [`PushSession::write_commands`] once, write the pack through the
/// [`Write`] impl (or [`PushSession::write_pack`]) when any command needs
/// one, then [`PushSession::close`].
pub struct PushSession {
    reader: PktLineReader<Box<dyn Connection>>,
    advertisement: Advertisement,
    remote: String,
    agent: String,
    commands: Option<Vec<PushCommand>>,
    report_status: bool,
    needs_pack: bool,
    pack_bytes: u64,
}

impl PushSession {
    /// Opens a receive-pack exchange and reads the ref advertisement.
    pub fn open(ctx: &Context, transport: Arc<dyn Transport>, config: &ClientConfig) -> Result<Self> {
        let remote = transport.url().to_string();
        let open = || -> Result<Self> {
            let mut reader = PktLineReader::new(transport.receive_pack(ctx)?);
            let advertisement = Advertisement::read(&mut reader)?;
            if advertisement.version != ProtocolVersion::V1 {
                return Err(GitError::Protocol(format!(
                    "receive-pack advertised protocol {}",
                    advertisement.version
                )));
            }
            tracing::debug!(remote = %remote, refs = advertisement.refs.len(), "push session started");
            Ok(Self {
                reader,
                advertisement,
                remote: remote.clone(),
                agent: config.agent.clone(),
                commands: None,
                report_status: false,
                needs_pack: false,
                pack_bytes: 0,
            })
        };
        open().with_session("receive-pack", &remote)
    }

    /// Refs the remote advertised.
    pub fn refs(&self) -> &[Ref] {
        &self.advertisement.refs
    }

    /// Capabilities the remote advertised.
    pub fn capabilities(&self) -> &Capabilities {
        &self.advertisement.capabilities
    }

    /// Sends the ref update commands. Only one batch can be sent.
    pub fn write_commands(&mut self, commands: &[PushCommand]) -> Result<()> {
        self.send_commands(commands).with_session("push", &self.remote)
    }

    fn send_commands(&mut self, commands: &[PushCommand]) -> Result<()> {
        if self.commands.is_some() {
            return Err(GitError::InvalidRequest("commands were already sent".to_string()));
        }
        let server = &self.advertisement.capabilities;
        for command in commands {
            command.validate()?;
            if command.is_delete() && !server.supports("delete-refs") {
                return Err(GitError::MissingCapability("delete-refs".to_string()));
            }
        }

        let mut wanted = Capabilities::new();
        for cap in ["report-status", "ofs-delta", "delete-refs"] {
            wanted.insert(cap, None);
        }
        wanted.insert("agent", Some(&self.agent));
        let caps = wanted.intersect(server);

        let mut out = PktLineWriter::new(Vec::new());
        for (i, command) in commands.iter().enumerate() {
            if i == 0 {
                out.write_line(&format!("{command}\0{caps}"))?;
            } else {
                out.write_line(&command.to_string())?;
            }
        }
        out.flush_pkt()?;
        self.reader.inner_mut().write_all(&out.into_inner())?;

        self.report_status = caps.supports("report-status");
        self.needs_pack = commands.iter().any(|c| !c.is_delete());
        tracing::debug!(
            commands = commands.len(),
            needs_pack = self.needs_pack,
            capabilities = %caps,
            "push commands sent"
        );
        self.commands = Some(commands.to_vec());
        Ok(())
    }

    /// Builds and sends the pack from `builder`, returning its checksum.
    pub fn write_pack(&mut self, builder: PackBuilder) -> Result<ObjectId> {
        builder.write_to(&mut *self).with_session("push", &self.remote)
    }

    /// Finishes the push and returns the remote's status report, if
    /// `report-status` was negotiated.
    ///
    /// A report with failures is returned as [`GitError::PushRejected`].
    pub fn close(mut self) -> Result<Option<StatusReport>> {
        let remote = self.remote.clone();
        self.finish()
            .and_then(|report| {
                self.reader.into_inner().close()?;
                report.map(StatusReport::into_result).transpose()
            })
            .with_session("push", &remote)
    }

    fn finish(&mut self) -> Result<Option<StatusReport>> {
        if self.commands.is_none() {
            self.send_commands(&[])?;
        }
        if self.needs_pack && self.pack_bytes == 0 {
            return Err(GitError::InvalidRequest(
                "the ref updates need a packfile but none was written".to_string(),
            ));
        }
        self.reader.inner_mut().flush()?;
        self.reader.inner_mut().end_request()?;

        let sent = self.commands.as_ref().is_some_and(|c| !c.is_empty());
        let report = if self.report_status && sent {
            let report = StatusReport::read(&mut self.reader)?;
            tracing::debug!(ok = report.is_ok(), refs = report.refs.len(), "status report");
            Some(report)
        } else {
            None
        };
        Ok(report)
    }
}

impl Write for PushSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.needs_pack {
            return Err(GitError::InvalidRequest(
                "pack data is only sent after a create or update command".to_string(),
            )
            .into());
        }
        let n = self.reader.inner_mut().write(buf)?;
        self.pack_bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.reader.inner_mut().flush()
    }
}

impl fmt::Debug for PushSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSession")
            .field("remote", &self.remote)
            .field("commands", &self.commands)
            .field("pack_bytes", &self.pack_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::tests::{pkts, text, Scripted};
    use gitwire_object::GitObject;
    use pretty_assertions::assert_eq;

    const A: &str = "1111111111111111111111111111111111111111";
    const B: &str = "2222222222222222222222222222222222222222";

    fn id(hex: &str) -> ObjectId {
        ObjectId::from_hex(hex).unwrap()
    }

    fn advertisement(caps: &str) -> Vec<u8> {
        let mut out = PktLine::from_string(&format!("{A} refs/heads/main\0{caps}\n")).encode();
        out.extend(PktLine::Flush.encode());
        out
    }

    fn session(caps: &str, report: &[PktLine]) -> (PushSession, Arc<Scripted>) {
        let mut response = advertisement(caps);
        response.extend(pkts(report));
        let transport = Arc::new(Scripted::new(vec![response]));
        let session = PushSession::open(&Context::new(), transport.clone(), &ClientConfig::default()).unwrap();
        (session, transport)
    }

    fn read_report(lines: &[PktLine]) -> Result<StatusReport> {
        let raw = pkts(lines);
        StatusReport::read(&mut PktLineReader::new(raw.as_slice()))
    }

    #[test]
    fn test_status_report_ok() {
        let report = read_report(&[text("unpack ok"), text("ok refs/heads/main"), PktLine::Flush]).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.status("refs/heads/main"), Some(&RefStatus::Ok));
    }

    #[test]
    fn test_status_report_rejected() {
        let report = read_report(&[
            text("unpack ok"),
            text("ng refs/heads/main reject"),
            PktLine::Flush,
        ])
        .unwrap();
        assert!(!report.is_ok());
        assert_eq!(
            report.status("refs/heads/main"),
            Some(&RefStatus::Rejected("reject".to_string()))
        );
        let err = report.into_result().unwrap_err();
        assert!(err.is_remote());
        assert_eq!(err.to_string(), "remote: refs/heads/main rejected: reject");
    }

    #[test]
    fn test_status_report_unpack_failure() {
        let report = read_report(&[text("unpack index-pack abnormal exit"), PktLine::Flush]).unwrap();
        assert_eq!(report.unpack_error.as_deref(), Some("index-pack abnormal exit"));
        assert!(read_report(&[text("unpack "), PktLine::Flush]).is_err());
        assert!(read_report(&[text("ok refs/heads/main"), PktLine::Flush]).is_err());
    }

    #[test]
    fn test_command_validation() {
        let both_zero = PushCommand::new("refs/heads/main", ObjectId::null(), ObjectId::null());
        assert!(both_zero.validate().is_err());
        let create = PushCommand::new("refs/heads/new", ObjectId::null(), id(B));
        assert!(create.is_create() && !create.is_delete());
        assert!(create.validate().is_ok());
        assert!(PushCommand::new("bad name", id(A), id(B)).validate().is_err());
    }

    #[test]
    fn test_push_update() {
        let (mut push, transport) = session(
            "report-status delete-refs side-band-64k ofs-delta agent=git/2.45.0",
            &[text("unpack ok"), text("ok refs/heads/main"), PktLine::Flush],
        );
        assert_eq!(push.refs()[0].id, id(A));

        let blob = GitObject::blob(b"pushed".to_vec());
        let command = PushCommand::new("refs/heads/main", id(A), blob.id);
        push.write_commands(std::slice::from_ref(&command)).unwrap();
        let mut builder = PackBuilder::new();
        builder.add(blob);
        push.write_pack(builder).unwrap();
        let report = push.close().unwrap().unwrap();
        assert!(report.is_ok());

        let request = &transport.requests()[0];
        let expected = format!(
            "{command}\0agent={} delete-refs ofs-delta report-status",
            crate::config::DEFAULT_AGENT
        );
        let mut reader = PktLineReader::new(request.as_slice());
        assert_eq!(reader.read_line().unwrap().as_str().unwrap(), expected);
        assert!(reader.read_line().unwrap().is_flush());
        assert_eq!(&reader.into_inner()[..4], b"PACK");
    }

    #[test]
    fn test_agent_only_sent_when_advertised() {
        let (mut push, transport) = session(
            "report-status ofs-delta",
            &[text("unpack ok"), text("ok refs/heads/main"), PktLine::Flush],
        );
        let blob = GitObject::blob(b"no agent".to_vec());
        let command = PushCommand::new("refs/heads/main", ObjectId::null(), blob.id);
        push.write_commands(std::slice::from_ref(&command)).unwrap();
        let mut builder = PackBuilder::new();
        builder.add(blob);
        push.write_pack(builder).unwrap();
        push.close().unwrap();

        let request = &transport.requests()[0];
        let mut reader = PktLineReader::new(request.as_slice());
        assert_eq!(
            reader.read_line().unwrap().as_str().unwrap(),
            format!("{command}\0ofs-delta report-status")
        );
    }

    #[test]
    fn test_delete_needs_capability() {
        let (mut push, transport) = session("report-status", &[]);
        let delete = PushCommand::new("refs/heads/main", id(A), ObjectId::null());
        let err = push.write_commands(&[delete]).unwrap_err();
        assert!(matches!(err.root(), GitError::MissingCapability(c) if c == "delete-refs"));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_delete_sends_no_pack() {
        let (mut push, _) = session(
            "report-status delete-refs",
            &[text("unpack ok"), text("ok refs/heads/main"), PktLine::Flush],
        );
        push.write_commands(&[PushCommand::new("refs/heads/main", id(A), ObjectId::null())])
            .unwrap();
        assert!(push.write_all(b"PACK").is_err());
        assert!(push.close().unwrap().is_some());
    }

    #[test]
    fn test_missing_pack() {
        let (mut push, _) = session("report-status", &[]);
        push.write_commands(&[PushCommand::new("refs/heads/main", id(A), id(B))])
            .unwrap();
        let err = push.close().unwrap_err();
        assert!(matches!(err.root(), GitError::InvalidRequest(_)));
    }

    #[test]
    fn test_commands_sent_once() {
        let (mut push, _) = session("report-status", &[]);
        push.write_commands(&[]).unwrap();
        assert!(push.write_commands(&[]).is_err());
    }

    #[test]
    fn test_rejection_surfaces() {
        let (mut push, _) = session(
            "report-status",
            &[text("unpack ok"), text("ng refs/heads/main non-fast-forward"), PktLine::Flush],
        );
        push.write_commands(&[PushCommand::new("refs/heads/main", id(A), id(B))])
            .unwrap();
        push.write_all(b"PACK....").unwrap();
        match push.close().unwrap_err().root() {
            GitError::PushRejected(report) => assert_eq!(report.refs.len(), 1),
            other => panic!("expected a rejection, got {other:?}"),
        }
    }
}
