//! Protocol v1 fetch over stateless exchanges.
//!
//! Every round resends the wants and capabilities, the way `git fetch`
//! talks to a `--stateless-rpc` upload-pack. Acknowledgements use
//! `multi_ack_detailed` when the server offers it.

use super::{parse_ack, read_packet, AckStatus, FetchProtocol, FetchRequest, FetchResponse, Packet, Packfile, ShallowUpdate};
use crate::advertisement::{Advertisement, ProtocolVersion, Ref};
use crate::capabilities::{Capabilities, Features};
use crate::config::ClientConfig;
use crate::context::Context;
use crate::pktline::{PktLineReader, PktLineWriter};
use crate::transport::Transport;
use crate::{GitError, Result};
use std::io::Write;
use std::sync::Arc;

pub(crate) struct ProtocolV1 {
    transport: Arc<dyn Transport>,
    advertisement: Arc<Advertisement>,
    agent: String,
}

impl ProtocolV1 {
    pub(crate) fn new(transport: Arc<dyn Transport>, advertisement: Arc<Advertisement>, config: &ClientConfig) -> Self {
        Self {
            transport,
            advertisement,
            agent: config.agent.clone(),
        }
    }

    /// Capabilities sent on the first want line.
    fn request_capabilities(&self, request: &FetchRequest) -> Result<Capabilities> {
        let server = &self.advertisement.capabilities;
        let side_band = if server.supports("side-band-64k") {
            "side-band-64k"
        } else if server.supports("side-band") {
            "side-band"
        } else {
            return Err(GitError::MissingCapability("side-band".to_string()));
        };

        let mut wanted = Capabilities::new();
        for cap in ["multi_ack_detailed", "no-done", "ofs-delta"] {
            wanted.insert(cap, None);
        }
        if request.thin_pack {
            wanted.insert("thin-pack", None);
        }
        if request.include_tag {
            wanted.insert("include-tag", None);
        }
        if request.depth.is_some() || !request.shallows.is_empty() {
            wanted.insert("shallow", None);
        }
        if request.since.is_some() {
            wanted.insert("deepen-since", None);
        }
        if !request.excludes.is_empty() {
            wanted.insert("deepen-not", None);
        }
        if request.deepen_relative {
            wanted.insert("deepen-relative", None);
        }
        if request.filter.is_some() {
            wanted.insert("filter", None);
        }
        if request.progress.is_none() {
            wanted.insert("no-progress", None);
        }
        wanted.insert("agent", Some(&self.agent));

        let mut caps = wanted.intersect(server);
        caps.insert(side_band, None);
        Ok(caps)
    }

    fn encode_request(&self, request: &FetchRequest, caps: &Capabilities) -> Result<Vec<u8>> {
        let mut out = PktLineWriter::new(Vec::new());
        for (i, want) in request.wants.iter().enumerate() {
            if i == 0 {
                out.write_line(&format!("want {want} {caps}"))?;
            } else {
                out.write_line(&format!("want {want}"))?;
            }
        }
        for shallow in &request.shallows {
            out.write_line(&format!("shallow {shallow}"))?;
        }
        if let Some(depth) = request.depth {
            out.write_line(&format!("deepen {depth}"))?;
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

        for have in &request.haves {
            out.write_line(&format!("have {have}"))?;
        }
        if request.have_more {
            out.flush_pkt()?;
        } else {
            out.write_line("done")?;
        }
        Ok(out.into_inner())
    }
}

impl FetchProtocol for ProtocolV1 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V1
    }

    fn capabilities(&self) -> &Capabilities {
        &self.advertisement.capabilities
    }

    fn features(&self) -> Features {
        self.advertisement.capabilities.features_v1()
    }

    fn list_refs(&mut self, ctx: &Context, prefixes: &[&str]) -> Result<Vec<Ref>> {
        ctx.check()?;
        // v1 servers advertise every ref up front.
        Ok(self
            .advertisement
            .refs
            .iter()
            .filter(|r| prefixes.is_empty() || prefixes.iter().any(|p| r.name.starts_with(p)))
            .cloned()
            .collect())
    }

    fn negotiate(&mut self, ctx: &Context, mut request: FetchRequest) -> Result<FetchResponse> {
        request.validate(ProtocolVersion::V1, self.features())?;
        let caps = self.request_capabilities(&request)?;
        let no_done = caps.supports("no-done");
        let body = self.encode_request(&request, &caps)?;
        tracing::debug!(
            wants = request.wants.len(),
            haves = request.haves.len(),
            done = !request.have_more,
            capabilities = %caps,
            "sending fetch request"
        );

        let mut conn = self.transport.upload_pack(ctx, ProtocolVersion::V1)?;
        conn.write_all(&body)?;
        conn.flush()?;
        conn.end_request()?;
        let mut reader = PktLineReader::new(conn);
        let mut response = FetchResponse::default();

        if request.deepens() || !request.shallows.is_empty() {
            loop {
                match read_packet(&mut reader)? {
                    Packet::Text(line) => match ShallowUpdate::parse(&line) {
                        Some(update) => response.shallow_updates.push(update?),
                        None => {
                            return Err(GitError::Protocol(format!("unexpected shallow line {line:?}")))
                        }
                    },
                    Packet::Flush => break,
                    Packet::Delim => {
                        return Err(GitError::Protocol("unexpected delimiter in shallow list".to_string()))
                    }
                }
            }
        }

        loop {
            let line = match read_packet(&mut reader)? {
                Packet::Text(line) => line,
                other => return Err(GitError::Protocol(format!("expected ACK or NAK, got {other:?}"))),
            };
            if line == "NAK" {
                if !request.have_more {
                    break;
                }
                if response.ready && no_done {
                    // The final ACK and the pack follow without a `done`.
                    continue;
                }
                reader.into_inner().close()?;
                tracing::debug!(acks = response.acks.len(), "negotiation round done");
                return Ok(response);
            }
            if let Some(message) = line.strip_prefix("ERR ") {
                return Err(GitError::Remote(message.to_string()));
            }
            let Some(ack) = parse_ack(&line)? else {
                return Err(GitError::Protocol(format!("expected ACK or NAK, got {line:?}")));
            };
            response.ready |= ack.status == AckStatus::Ready;
            response.acks.push(ack);
            if ack.status == AckStatus::Final {
                break;
            }
        }

        tracing::debug!(acks = response.acks.len(), "receiving packfile");
        response.packfile = Some(Packfile::new(reader, request.progress.take()));
        Ok(response)
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

    const A: &str = "1111111111111111111111111111111111111111";
    const B: &str = "2222222222222222222222222222222222222222";

    fn id(hex: &str) -> ObjectId {
        ObjectId::from_hex(hex).unwrap()
    }

    fn protocol(caps: &str, responses: Vec<Vec<u8>>) -> (ProtocolV1, Arc<Scripted>) {
        let transport = Arc::new(Scripted::new(responses));
        let advertisement = Arc::new(Advertisement {
            version: ProtocolVersion::V1,
            capabilities: Capabilities::parse(caps),
            refs: vec![
                Ref::new(id(A), "HEAD"),
                Ref::new(id(A), "refs/heads/main"),
                Ref::new(id(B), "refs/tags/v1"),
            ],
            shallows: Vec::new(),
        });
        let config = ClientConfig {
            agent: "gitwire/test".to_string(),
            ..ClientConfig::default()
        };
        let protocol = ProtocolV1::new(transport.clone(), advertisement, &config);
        (protocol, transport)
    }

    fn data(bytes: &[u8]) -> PktLine {
        let mut frame = vec![CHANNEL_DATA];
        frame.extend_from_slice(bytes);
        PktLine::Data(frame)
    }

    #[test]
    fn test_list_refs_filters_advertisement() {
        let (mut v1, transport) = protocol("side-band-64k", vec![]);
        let refs = v1.list_refs(&Context::new(), &["refs/heads/"]).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "refs/heads/main");
        assert_eq!(v1.list_refs(&Context::new(), &[]).unwrap().len(), 3);
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_clone_request() {
        let response = pkts(&[text("NAK"), data(b"PACK"), PktLine::Flush]);
        let (mut v1, transport) = protocol(
            "multi_ack_detailed side-band-64k ofs-delta thin-pack no-progress agent=git/2.45",
            vec![response],
        );
        let mut request = FetchRequest::new([id(A), id(B)]);
        request.thin_pack = true;
        let response = v1.negotiate(&Context::new(), request).unwrap();

        let mut pack = Vec::new();
        response.packfile.unwrap().read_to_end(&mut pack).unwrap();
        assert_eq!(pack, b"PACK");
        assert_eq!(
            transport.request_lines(0),
            vec![
                format!("want {A} agent=gitwire/test multi_ack_detailed no-progress ofs-delta side-band-64k thin-pack"),
                format!("want {B}"),
                "0000".to_string(),
                "done".to_string(),
            ]
        );
    }

    #[test]
    fn test_side_band_required() {
        let (mut v1, transport) = protocol("multi_ack_detailed ofs-delta", vec![]);
        let result = v1.negotiate(&Context::new(), FetchRequest::new([id(A)]));
        assert!(matches!(result, Err(GitError::MissingCapability(c)) if c == "side-band"));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_multi_ack_round_without_pack() {
        let response = pkts(&[
            text(&format!("ACK {B} common")),
            text(&format!("ACK {B} ready")),
            text("NAK"),
        ]);
        let (mut v1, transport) = protocol("multi_ack_detailed side-band-64k", vec![response]);
        let mut request = FetchRequest::new([id(A)]);
        request.haves = vec![id(B)];
        request.have_more = true;
        let response = v1.negotiate(&Context::new(), request).unwrap();

        assert!(response.packfile.is_none());
        assert!(response.ready);
        assert_eq!(response.acks.len(), 2);
        let lines = transport.request_lines(0);
        assert_eq!(lines[lines.len() - 2..], [format!("have {B}"), "0000".to_string()]);
    }

    #[test]
    fn test_no_done_pack_after_ready() {
        let response = pkts(&[
            text(&format!("ACK {B} ready")),
            text("NAK"),
            text(&format!("ACK {B}")),
            data(b"PACK"),
            PktLine::Flush,
        ]);
        let (mut v1, _) = protocol("multi_ack_detailed no-done side-band-64k", vec![response]);
        let mut request = FetchRequest::new([id(A)]);
        request.haves = vec![id(B)];
        request.have_more = true;
        let response = v1.negotiate(&Context::new(), request).unwrap();

        assert_eq!(response.acks.last().map(|a| a.status), Some(AckStatus::Final));
        assert!(response.packfile.is_some());
    }

    #[test]
    fn test_shallow_updates() {
        let response = pkts(&[
            text(&format!("shallow {A}")),
            PktLine::Flush,
            text("NAK"),
            data(b"PACK"),
            PktLine::Flush,
        ]);
        let (mut v1, transport) = protocol("shallow side-band deepen-relative", vec![response]);
        let mut request = FetchRequest::new([id(A)]);
        request.depth = Some(1);
        let response = v1.negotiate(&Context::new(), request).unwrap();

        assert_eq!(response.shallow_updates, vec![ShallowUpdate::Shallow(id(A))]);
        assert!(transport.request_lines(0).contains(&"deepen 1".to_string()));
    }

    #[test]
    fn test_missing_deepen_capability() {
        let (mut v1, transport) = protocol("side-band-64k shallow", vec![]);
        let mut request = FetchRequest::new([id(A)]);
        request.since = Some(1_700_000_000);
        let result = v1.negotiate(&Context::new(), request);
        assert!(matches!(result, Err(GitError::MissingCapability(c)) if c == "deepen-since"));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_err_line() {
        let response = pkts(&[text("ERR upload-pack: not our ref")]);
        let (mut v1, _) = protocol("side-band-64k", vec![response]);
        let err = v1.negotiate(&Context::new(), FetchRequest::new([id(A)])).unwrap_err();
        assert!(err.is_remote());
    }
}
