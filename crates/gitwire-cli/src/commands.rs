//! CLI command implementations.

use anyhow::{anyhow, bail, ensure, Context as _, Result};
use gitwire_object::ObjectId;
use gitwire_protocol::pack::IndexVersion;
use gitwire_protocol::{
    ClientConfig, Context, FetchRequest, PackIndex, PackReader, PushCommand, Ref, Remote, RefStatus,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Arguments of `gitwire fetch`.
#[derive(Debug)]
pub struct FetchArgs {
    pub url: String,
    pub refs: Vec<String>,
    pub haves: Vec<String>,
    pub depth: Option<u32>,
    pub filter: Option<String>,
    pub output: PathBuf,
    pub quiet: bool,
}

/// List the refs of a remote.
pub fn ls_remote(config: ClientConfig, url: &str, prefixes: &[String]) -> Result<()> {
    let ctx = Context::new();
    let remote = Remote::new(url, config)?;
    let prefixes: Vec<&str> = prefixes.iter().map(String::as_str).collect();
    let refs = remote.list_refs(&ctx, &prefixes)?;
    tracing::info!(url = %url, refs = refs.len(), "listed refs");

    for r in &refs {
        if let Some(target) = &r.symref_target {
            println!("ref: {target}\t{}", r.name);
        }
        println!("{}\t{}", r.id, r.name);
        if let Some(peeled) = r.peeled {
            println!("{peeled}\t{}^{{}}", r.name);
        }
    }
    Ok(())
}

/// Resolve the requested ref names against the remote's refs.
fn select_wants(refs: &[Ref], names: &[String]) -> Result<Vec<ObjectId>> {
    if names.is_empty() {
        let head = refs
            .iter()
            .find(|r| r.name == "HEAD")
            .ok_or_else(|| anyhow!("remote has no HEAD; name the refs to fetch"))?;
        ensure!(!head.id.is_null(), "remote HEAD is unborn");
        return Ok(vec![head.id]);
    }

    let mut wants = Vec::with_capacity(names.len());
    for name in names {
        let found = refs
            .iter()
            .find(|r| r.name == *name || r.name == format!("refs/heads/{name}") || r.name == format!("refs/tags/{name}"));
        match found {
            Some(r) => wants.push(r.id),
            None => match name.parse::<ObjectId>() {
                Ok(id) => wants.push(id),
                Err(_) => bail!("remote has no ref {name}"),
            },
        }
    }
    Ok(wants)
}

/// Fetch refs and store the pack with a v2 index.
pub fn fetch(config: ClientConfig, args: &FetchArgs) -> Result<()> {
    let ctx = Context::new();
    let remote = Remote::new(&args.url, config)?;
    let mut session = remote.start_fetch(&ctx)?;
    let refs = session.list_refs(&ctx, &[])?;

    let mut request = FetchRequest::new(select_wants(&refs, &args.refs)?);
    request.haves = args
        .haves
        .iter()
        .map(|h| h.parse().with_context(|| format!("invalid object id {h}")))
        .collect::<Result<_>>()?;
    request.depth = args.depth;
    request.filter.clone_from(&args.filter);
    if !args.quiet {
        request.progress = Some(Box::new(io::stderr()));
    }
    tracing::info!(url = %args.url, version = %session.version(), wants = request.wants.len(), "fetching");

    let response = session.negotiate(&ctx, request)?;
    for update in &response.shallow_updates {
        tracing::info!(?update, "shallow boundary changed");
    }
    let mut packfile = response
        .packfile
        .ok_or_else(|| anyhow!("remote did not send a packfile"))?;

    std::fs::create_dir_all(&args.output)?;
    let staging = args.output.join("incoming.pack");
    let mut out = BufWriter::new(File::create(&staging)?);
    io::copy(&mut packfile, &mut out)?;
    drop(out);
    packfile.close()?;

    let (objects, checksum) = PackReader::new(BufReader::new(File::open(&staging)?))?.read_all()?;
    let pack_path = args.output.join(format!("pack-{checksum}.pack"));
    std::fs::rename(&staging, &pack_path)?;
    let index = PackIndex::from_objects(&objects, checksum)?;
    let idx_path = pack_path.with_extension("idx");
    index.write(BufWriter::new(File::create(&idx_path)?), IndexVersion::V2)?;

    println!("{} objects in {}", objects.len(), pack_path.display());
    Ok(())
}

/// Parse `<old>:<new>:<ref>`, where an empty id means zero.
fn parse_command(arg: &str) -> Result<PushCommand> {
    let mut parts = arg.splitn(3, ':');
    let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        bail!("expected <old>:<new>:<ref>, got {arg:?}");
    };
    let id = |hex: &str| -> Result<ObjectId> {
        if hex.is_empty() {
            Ok(ObjectId::null())
        } else {
            hex.parse().with_context(|| format!("invalid object id {hex:?}"))
        }
    };
    Ok(PushCommand::new(name, id(old)?, id(new)?))
}

/// Send ref updates and an optional pack.
pub fn push(config: ClientConfig, url: &str, commands: &[String], pack: Option<&Path>) -> Result<()> {
    let commands = commands
        .iter()
        .map(|c| parse_command(c))
        .collect::<Result<Vec<_>>>()?;
    let ctx = Context::new();
    let remote = Remote::new(url, config)?;
    let mut session = remote.start_push(&ctx)?;
    session.write_commands(&commands)?;

    if let Some(pack) = pack {
        let mut file = BufReader::new(File::open(pack).with_context(|| format!("cannot open {}", pack.display()))?);
        io::copy(&mut file, &mut session)?;
    }

    match session.close()? {
        Some(report) => {
            for (name, status) in &report.refs {
                match status {
                    RefStatus::Ok => println!("ok {name}"),
                    RefStatus::Rejected(reason) => println!("rejected {name}: {reason}"),
                }
            }
        }
        None => println!("pushed {} commands", commands.len()),
    }
    Ok(())
}

/// Build an index for a pack.
pub fn index_pack(pack: &Path, output: Option<&Path>, version: u8) -> Result<()> {
    let version = match version {
        1 => IndexVersion::V1,
        2 => IndexVersion::V2,
        other => bail!("unsupported index version {other}"),
    };
    let file = File::open(pack).with_context(|| format!("cannot open {}", pack.display()))?;
    let (objects, checksum) = PackReader::new(BufReader::new(file))?.read_all()?;
    let index = PackIndex::from_objects(&objects, checksum)?;

    let idx_path = output.map_or_else(|| pack.with_extension("idx"), Path::to_path_buf);
    index.write(BufWriter::new(File::create(&idx_path)?), version)?;
    println!("{checksum}");
    tracing::info!(objects = objects.len(), index = %idx_path.display(), "pack indexed");
    Ok(())
}

/// Check a pack against its index.
pub fn verify_pack(index_path: &Path, verbose: bool) -> Result<()> {
    let data = std::fs::read(index_path).with_context(|| format!("cannot read {}", index_path.display()))?;
    let index = PackIndex::parse(&data)?;
    let pack_path = index_path.with_extension("pack");
    let file = File::open(&pack_path).with_context(|| format!("cannot open {}", pack_path.display()))?;
    let (objects, checksum) = PackReader::new(BufReader::new(file))?.read_all()?;

    ensure!(
        checksum == index.pack_checksum(),
        "index is for pack {}, not {checksum}",
        index.pack_checksum()
    );
    ensure!(
        objects.len() == index.len(),
        "index lists {} objects, pack has {}",
        index.len(),
        objects.len()
    );

    let by_id: HashMap<ObjectId, _> = objects.iter().map(|o| (o.object.id, o)).collect();
    for entry in index.entries() {
        let object = by_id
            .get(&entry.id)
            .ok_or_else(|| anyhow!("{} is indexed but not in the pack", entry.id))?;
        ensure!(object.offset == entry.offset, "{}: offset mismatch", entry.id);
        if let Some(crc) = entry.crc32 {
            ensure!(object.crc32 == crc, "{}: CRC mismatch", entry.id);
        }
        if verbose {
            println!(
                "{} {:6} {} {} {}",
                entry.id,
                object.object.object_type,
                object.object.data.len(),
                entry.offset,
                object.depth
            );
        }
    }
    println!("{}: ok", pack_path.display());
    Ok(())
}
