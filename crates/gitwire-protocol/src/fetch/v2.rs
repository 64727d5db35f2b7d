//! Protocol v2: `ls-refs` and `fetch` commands.

use super::{parse_ack, read_packet, AckStatus, FetchProtocol, FetchRequest, FetchResponse, Packet, Packfile, ShallowUpdate};
use crate::advertisement::{Advertisement, ProtocolVersion, Ref};
use crate::capabilities::{Capabilities, Features};
use crate::config::ClientConfig;
use crate::context::Context;
use crate::pktline::{PktLineReader, PktLineWriter};
use crate::transport::{Connection, Transport};
use crate::{GitError, Result};
use std::io::Write;
use std::sync::Arc;

pub(crate) struct ProtocolV2 {
    transport: Arc<dyn Transport>,
    advertisement: Arc<Advertisement>,
    agent: String,
}

impl ProtocolV2 {
    pub(crate) fn new(transport: Arc<dyn Transport>, advertisement: Arc<Advertisement>, config: &ClientConfig) -> Self {
        Self {
            transport,
            advertisement,
            agent: config.agent.clone(),
        }
    }

    /// Starts a command request: `command=`, `agent=` and the delimiter.
    fn command(&self, command: &str) -> Result<PktLineWriter<Vec<u8>>> {
        if !self.advertisement.capabilities.supports(command) {
            return Err(GitError::MissingCapability(command.to_string()));
        }
        let mut writer = PktLineWriter::new(Vec::new());
        writer.write_line(&format!("command={command}"))?;
        if self.advertisement.capabilities.supports("agent") {
            writer.write_line(&format!("agent={}", self.agent))?;
        }
        if let Some(format) = self.advertisement.capabilities.get("object-format") {
            writer.write_line(&format!("object-format={format}"))?;
        }
        writer.delim_pkt()?;
        Ok(writer)
    }

    /// Sends a finished request and returns a reader for the response.
    fn send(&self, ctx: &Context, request: PktLineWriter<Vec<u8>>) -> Result<PktLineReader<Box<dyn Connection>>> {
        let mut conn = self.transport.upload_pack(ctx, ProtocolVersion::V2)?;
        conn.write_all(&request.into_inner())?;
        conn.flush()?;
        conn.end_request()?;
        Ok(PktLineReader::new(conn))
    }
}

impl FetchProtocol for ProtocolV2 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V2
    }

    fn capabilities(&self) -> &Capabilities {
        &self.advertisement.capabilities
    }

    fn features(&self) -> Features {
        self.advertisement.capabilities.features_v2()
    }

    fn list_refs(&mut self, ctx: &Context, prefixes: &[&str]) -> Result<Vec<Ref>> {
        let mut request = self.command("ls-refs")?;
        request.write_line("symrefs")?;
        request.write_line("peel")?;
        for prefix in prefixes {
            request.write_line(&format!("ref-prefix {prefix}"))?;
        }
        request.flush_pkt()?;
        tracing::debug!(prefixes = ?prefixes, "ls-refs");

        let mut reader = self.send(ctx, request)?;
        let mut refs = Vec::new();
        loop {
            match read_packet(&mut reader)? {
                Packet::Text(line) => refs.push(Ref::parse_v2(&line)?),
                Packet::Flush => break,
                Packet::Delim => {
                    return Err(GitError::Protocol("unexpected delimiter in ls-refs response".to_string()))
                }
            }
        }
        reader.into_inner().close()?;
        tracing::debug!(refs = refs.len(), "ls-refs done");
        Ok(refs)
    }

    fn negotiate(&mut self, ctx: &Context, mut request: FetchRequest) -> Result<FetchResponse> {
        request.validate(ProtocolVersion::V2, self.features())?;

        let mut out = self.command("fetch")?;
        for want in &request.wants {
            out.write_line(&format!("want {want}"))?;
        }
        for have in &request.haves {
            out.write_line(&format!("have {have}"))?;
        }
        if !request.have_more {
            out.write_line("done")?;
        }
        out.write_line("ofs-delta")?;
        if request.thin_pack {
            out.write_line("thin-pack")?;
        }
        if request.include_tag {
            out.write_line("include-tag")?;
        }
        if request.progress.is_none() {
            out.write_line("no-progress")?;
        }
        for shallow in &request.shallows {
            out.write_line(&format!("shallow {shallow}"))?;
        }
        if let Some(depth) = request.depth {
            out.write_line(&format!("deepen {depth}"))?;
            if request.deepen_relative {
                out.write_line("deepen-relative")?;
            }
        }
        if let Some(since) = request.since {
            out.write_line(&format!("deepen-since {since}"))?;
        }
        for exclude in &request.excludes {
            out.write_line(&format!("deepen-not {exclude}"))?;
        }
        if let Some(filter) = &request.filter {
            out.write_line(&format!("filter {filter}"))?;
        }
        out.flush_pkt()?;
        tracing::debug!(
            wants = request.wants.len(),
            haves = request.haves.len(),
            done = !request.have_more,
            "sending fetch"
        );

        let mut reader = self.send(ctx, out)?;
        let mut response = FetchResponse::default();
        loop {
            let section = match read_packet(&mut reader)? {
                Packet::Text(section) => section,
                other => {
                    return Err(GitError::Protocol(format!(
                        "expected a section header, got {other:?}"
                    )))
                }
            };
            tracing::trace!(section = %section, "fetch response section");
            let end = match section.as_str() {
                "acknowledgments" => read_section(&mut reader, |line| {
                    if line == "NAK" {
                        return Ok(());
                    }
                    if line == "ready" {
                        response.ready = true;
                        return Ok(());
                    }
                    match parse_ack(line)? {
                        Some(mut ack) => {
                            if ack.status == AckStatus::Final {
                                ack.status = AckStatus::Common;
                            }
                            response.acks.push(ack);
                            Ok(())
                        }
                        None => Err(GitError::Protocol(format!("unexpected acknowledgment {line:?}"))),
                    }
                })?,
                "shallow-info" => read_section(&mut reader, |line| match ShallowUpdate::parse(line) {
                    Some(update) => {
                        response.shallow_updates.push(update?);
                        Ok(())
                    }
                    None => Err(GitError::Protocol(format!("unexpected shallow-info line {line:?}"))),
                })?,
                // Not requested; skipped if a server sends them anyway.
                "wanted-refs" | "packfile-uris" => read_section(&mut reader, |_| Ok(()))?,
                "packfile" => {
                    tracing::debug!(acks = response.acks.len(), "receiving packfile");
                    response.packfile = Some(Packfile::new(reader, request.progress.take()));
                    return Ok(response);
                }
                other => return Err(GitError::Protocol(format!("unknown section {other:?}"))),
            };

            if end == Packet::Flush {
                reader.into_inner().close()?;
                if !request.have_more {
                    return Err(GitError::NoPackfile);
                }
                tracing::debug!(acks = response.acks.len(), ready = response.ready, "negotiation round done");
                return Ok(response);
            }
        }
    }
}

/// Feeds the lines of a section to `handle`, returning the delim or flush
/// that ended it.
fn read_section<R, F>(reader: &mut PktLineReader<R>, mut handle: F) -> Result<Packet>
where
    R: std::io::Read,
    F: FnMut(&str) -> Result<()>,
{
    loop {
        match read_packet(reader)? {
            Packet::Text(line) => handle(&line)?,
            end => return Ok(end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::tests::{pkts, text, Scripted};
    use crate::pktline::PktLine;
    use crate::sideband::CHANNEL_DATA;
    use gitwire_object::ObjectId;
    use pretty_assertions::assert_eq;
    use std::io::Read;

    fn protocol(caps: &[&str], responses: Vec<Vec<u8>>) -> (ProtocolV2, Arc<Scripted>) {
        let transport = Arc::new(Scripted::new(responses));
        let advertisement = Arc::new(Advertisement {
            version: ProtocolVersion::V2,
            capabilities: caps.iter().copied().collect(),
            refs: Vec::new(),
            shallows: Vec::new(),
        });
        let config = ClientConfig {
            agent: "gitwire/test".to_string(),
            ..ClientConfig::default()
        };
        (ProtocolV2::new(transport.clone(), advertisement, &config), transport)
    }

    const A: &str = "1111111111111111111111111111111111111111";
    const B: &str = "2222222222222222222222222222222222222222";

    #[test]
    fn test_ls_refs() {
        let response = pkts(&[
            text(&format!("{A} HEAD symref-target:refs/heads/main")),
            text(&format!("{A} refs/heads/main")),
            text(&format!("{B} refs/tags/v1 peeled:{A}")),
            PktLine::Flush,
        ]);
        let (mut v2, transport) = protocol(&["agent=git/2.45", "ls-refs", "fetch"], vec![response]);
        let refs = v2.list_refs(&Context::new(), &["refs/heads/", "HEAD"]).unwrap();

        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].symref_target.as_deref(), Some("refs/heads/main"));
        assert_eq!(refs[2].peeled, Some(ObjectId::from_hex(A).unwrap()));
        assert_eq!(
            transport.request_lines(0),
            vec![
                "command=ls-refs",
                "agent=gitwire/test",
                "0001",
                "symrefs",
                "peel",
                "ref-prefix refs/heads/",
                "ref-prefix HEAD",
                "0000",
            ]
        );
    }

    #[test]
    fn test_ls_refs_requires_command() {
        let (mut v2, transport) = protocol(&["fetch"], vec![]);
        assert!(matches!(
            v2.list_refs(&Context::new(), &[]),
            Err(GitError::MissingCapability(c)) if c == "ls-refs"
        ));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_fetch_request_and_packfile() {
        let mut frame = vec![CHANNEL_DATA];
        frame.extend_from_slice(b"PACKDATA");
        let response = pkts(&[
            text("shallow-info"),
            text(&format!("shallow {A}")),
            PktLine::Delim,
            text("packfile"),
            PktLine::from_string("\x02Counting objects\n"),
            PktLine::Data(frame),
            PktLine::Flush,
        ]);
        let (mut v2, transport) = protocol(&["ls-refs", "fetch=shallow filter"], vec![response]);

        let mut request = FetchRequest::new([ObjectId::from_hex(A).unwrap()]);
        request.haves = vec![ObjectId::from_hex(B).unwrap()];
        request.depth = Some(1);
        request.filter = Some("blob:none".to_string());
        request.thin_pack = true;
        let response = v2.negotiate(&Context::new(), request).unwrap();

        assert_eq!(
            response.shallow_updates,
            vec![ShallowUpdate::Shallow(ObjectId::from_hex(A).unwrap())]
        );
        let mut pack = Vec::new();
        response.packfile.unwrap().read_to_end(&mut pack).unwrap();
        assert_eq!(pack, b"PACKDATA");

        assert_eq!(
            transport.request_lines(0),
            vec![
                "command=fetch".to_string(),
                "0001".to_string(),
                format!("want {A}"),
                format!("have {B}"),
                "done".to_string(),
                "ofs-delta".to_string(),
                "thin-pack".to_string(),
                "no-progress".to_string(),
                "deepen 1".to_string(),
                "filter blob:none".to_string(),
                "0000".to_string(),
            ]
        );
    }

    #[test]
    fn test_have_more_round_without_pack() {
        let response = pkts(&[
            text("acknowledgments"),
            text(&format!("ACK {B}")),
            PktLine::Flush,
        ]);
        let (mut v2, transport) = protocol(&["fetch"], vec![response]);
        let mut request = FetchRequest::new([ObjectId::from_hex(A).unwrap()]);
        request.haves = vec![ObjectId::from_hex(B).unwrap()];
        request.have_more = true;
        let response = v2.negotiate(&Context::new(), request).unwrap();

        assert!(response.packfile.is_none());
        assert!(!response.ready);
        assert_eq!(response.acks[0].status, AckStatus::Common);
        assert!(!transport.request_lines(0).contains(&"done".to_string()));
    }

    #[test]
    fn test_missing_packfile_without_have_more() {
        let response = pkts(&[text("acknowledgments"), text("NAK"), PktLine::Flush]);
        let (mut v2, _) = protocol(&["fetch"], vec![response]);
        let request = FetchRequest::new([ObjectId::from_hex(A).unwrap()]);
        assert!(matches!(
            v2.negotiate(&Context::new(), request),
            Err(GitError::NoPackfile)
        ));
    }

    #[test]
    fn test_ready_then_packfile() {
        let response = pkts(&[
            text("acknowledgments"),
            text(&format!("ACK {B}")),
            text("ready"),
            PktLine::Delim,
            text("packfile"),
            PktLine::Flush,
        ]);
        let (mut v2, _) = protocol(&["fetch"], vec![response]);
        let mut request = FetchRequest::new([ObjectId::from_hex(A).unwrap()]);
        request.have_more = true;
        let response = v2.negotiate(&Context::new(), request).unwrap();
        assert!(response.ready);
        assert!(response.packfile.is_some());
    }

    #[test]
    fn test_unadvertised_feature_sends_nothing() {
        let (mut v2, transport) = protocol(&["fetch"], vec![]);
        let mut request = FetchRequest::new([ObjectId::from_hex(A).unwrap()]);
        request.filter = Some("blob:none".to_string());
        assert!(matches!(
            v2.negotiate(&Context::new(), request),
            Err(GitError::MissingCapability(c)) if c == "filter"
        ));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_fatal_sideband_message() {
        let response = pkts(&[
            text("packfile"),
            PktLine::from_string("\x03upload-pack: not our ref"),
            PktLine::Flush,
        ]);
        let (mut v2, _) = protocol(&["fetch"], vec![response]);
        let request = FetchRequest::new([ObjectId::from_hex(A).unwrap()]);
        let mut packfile = v2.negotiate(&Context::new(), request).unwrap().packfile.unwrap();
        let err = packfile.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(GitError::from(err).to_string(), "remote: upload-pack: not our ref");
    }
}
