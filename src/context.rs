//! Explicitly constructed client context shared by every call.

use crate::config::{CallConfig, ConfigError};
use crate::error::{CallError, Result};
use crate::peer::media::MediaSource;
use crate::peer::transport::TransportFactory;
use crate::session::SessionDirectory;
use crate::signaling::SignallingChannel;
use crate::store::DocumentStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct ClientContext {
    config: CallConfig,
    signalling: SignallingChannel,
    media: Arc<dyn MediaSource>,
    transports: Arc<dyn TransportFactory>,
    open: AtomicBool,
}

impl ClientContext {
    pub fn initialize(
        config: CallConfig,
        store: Arc<dyn DocumentStore>,
        media: Arc<dyn MediaSource>,
        transports: Arc<dyn TransportFactory>,
    ) -> std::result::Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let directory = SessionDirectory::new(store, config.calls_collection.clone());
        info!(
            "client context ready: collection={}, {} ICE server(s)",
            config.calls_collection,
            config.ice_servers.len()
        );
        Ok(Arc::new(Self {
            signalling: SignallingChannel::new(directory),
            config,
            media,
            transports,
            open: AtomicBool::new(true),
        }))
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn signalling(&self) -> &SignallingChannel {
        &self.signalling
    }

    pub fn directory(&self) -> &SessionDirectory {
        self.signalling.directory()
    }

    pub fn media(&self) -> &Arc<dyn MediaSource> {
        &self.media
    }

    pub fn transports(&self) -> &Arc<dyn TransportFactory> {
        &self.transports
    }

    /// New calls are refused afterwards; running calls are left to hang up.
    pub fn shutdown(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            info!("client context shut down");
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CallError::channel("client context is shut down"))
        }
    }
}
