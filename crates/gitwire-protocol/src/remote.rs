//! Entry point for talking to one remote repository.

use crate::advertisement::{Advertisement, Ref};
use crate::config::ClientConfig;
use crate::context::Context;
use crate::error::ResultExt;
use crate::fetch::FetchSession;
use crate::pktline::PktLineReader;
use crate::push::PushSession;
use crate::transport::{self, Service, Transport};
use crate::Result;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A remote repository reachable through a [`Transport`].
///
/// The upload-pack advertisement is fetched on first use and cached, so
/// several fetch sessions share one handshake. Concurrent first callers
/// block until the advertisement is available.
pub struct Remote {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    advertisement: Mutex<Option<Arc<Advertisement>>>,
}

impl Remote {
    /// Creates a remote for `url`, picking the transport from its scheme.
    pub fn new(url: &str, config: ClientConfig) -> Result<Self> {
        let transport = transport::from_url(url, &config)?;
        Ok(Self::with_transport(transport, config))
    }

    /// Creates a remote on an existing transport.
    pub fn with_transport(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            advertisement: Mutex::new(None),
        }
    }

    /// The remote's URL.
    pub fn url(&self) -> &str {
        self.transport.url()
    }

    /// Configuration used for sessions on this remote.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the upload-pack advertisement, fetching it on first use.
    pub fn advertisement(&self, ctx: &Context) -> Result<Arc<Advertisement>> {
        let mut cached = self.advertisement.lock();
        if let Some(advertisement) = cached.as_ref() {
            return Ok(Arc::clone(advertisement));
        }

        let advertisement = self
            .read_advertisement(ctx)
            .with_session("advertise", self.url())?;
        let advertisement = Arc::new(advertisement);
        *cached = Some(Arc::clone(&advertisement));
        Ok(advertisement)
    }

    fn read_advertisement(&self, ctx: &Context) -> Result<Advertisement> {
        let version = self.config.protocol_version;
        tracing::debug!(remote = %self.url(), %version, "requesting advertisement");
        let stream = self
            .transport
            .advertise_refs(ctx, Service::UploadPack, version)?;
        Advertisement::read(&mut PktLineReader::new(stream))
    }

    /// Drops the cached advertisement, e.g. after a push changed the refs.
    pub fn clear_cache(&self) {
        self.advertisement.lock().take();
    }

    /// Starts a fetch session.
    pub fn start_fetch(&self, ctx: &Context) -> Result<FetchSession> {
        let advertisement = self.advertisement(ctx)?;
        Ok(FetchSession::new(
            Arc::clone(&self.transport),
            advertisement,
            &self.config,
        ))
    }

    /// Starts a push session.
    pub fn start_push(&self, ctx: &Context) -> Result<PushSession> {
        PushSession::open(ctx, Arc::clone(&self.transport), &self.config)
    }

    /// Lists the remote's refs, optionally restricted by name prefix.
    pub fn list_refs(&self, ctx: &Context, prefixes: &[&str]) -> Result<Vec<Ref>> {
        self.start_fetch(ctx)?.list_refs(ctx, prefixes)
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("url", &self.url())
            .field("cached", &self.advertisement.lock().is_some())
            .finish()
    }
}
