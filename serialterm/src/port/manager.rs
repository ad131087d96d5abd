//! Ownership and lifecycle of the single active port.
//!
//! [`PortManager`] is the only owner of the open [`PortHandle`]. Workers never
//! see the handle itself: while connected the supervisor borrows a
//! [`PortLease`] (independent reader and writer endpoints) and gives it back
//! with [`PortManager::reclaim`] before the handle may be closed, switched or
//! reconfigured. Every call takes `&mut self`, so purge-close-open sequences
//! can never interleave with another manager call.

use {
    crate::{
        error::{Error, PortError, Result},
        port::{Port, PortIdentity, PortOpener, SerialSettings},
    },
    log::{debug, info, warn},
    std::sync::Arc,
};

/// One open connection and the identity it was opened with.
pub struct PortHandle {
    port: Box<dyn Port>,
    identity: PortIdentity,
}

impl PortHandle {
    /// Identity (name and applied settings) of this connection.
    pub fn identity(&self) -> &PortIdentity {
        &self.identity
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.identity.name
    }
}

/// Endpoints lent to the workers for the duration of a connection.
pub struct PortLease {
    /// Endpoint for the download worker.
    pub reader: Box<dyn Port>,
    /// Endpoint for the transmit worker.
    pub writer: Box<dyn Port>,
}

/// Opens, closes, reconfigures and switches the active port.
pub struct PortManager {
    opener: Arc<dyn PortOpener>,
    handle: Option<PortHandle>,
    lent: bool,
}

impl PortManager {
    /// Create a manager using the given backend.
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            opener,
            handle: None,
            lent: false,
        }
    }

    /// The backend this manager opens ports with.
    pub fn opener(&self) -> &Arc<dyn PortOpener> {
        &self.opener
    }

    /// The open handle, if any.
    pub fn handle(&self) -> Option<&PortHandle> {
        self.handle.as_ref()
    }

    /// Whether a handle is open.
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether the open handle is currently lent to workers.
    pub fn is_lent(&self) -> bool {
        self.lent
    }

    /// Whether the open handle is on the named port.
    pub fn is_open_on(&self, name: &str) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.identity.name == name)
    }

    fn refuse_if_lent(&self, operation: &str) -> std::result::Result<(), PortError> {
        if self.lent {
            return Err(PortError::busy(format!(
                "cannot {operation} while connected; disconnect first"
            )));
        }
        Ok(())
    }

    /// Open `identity`, replacing any handle that is already open.
    ///
    /// Settings are validated before the device is touched, so a returned
    /// handle is always configured exactly as requested.
    pub fn open(&mut self, identity: &PortIdentity) -> std::result::Result<&PortHandle, PortError> {
        self.refuse_if_lent("open a port")?;
        identity.settings.validate(&identity.name)?;

        if self.handle.is_some() {
            self.close();
        }

        let port = self.opener.open(identity)?;
        info!("Opened {} at {}", identity.name, identity.settings);
        Ok(self.handle.insert(PortHandle {
            port,
            identity: identity.clone(),
        }))
    }

    /// Apply new line settings to the open handle.
    ///
    /// Without an open handle the settings are only validated; they take
    /// effect on the next open. On failure the previous settings are restored.
    pub fn configure(&mut self, settings: &SerialSettings) -> std::result::Result<(), PortError> {
        self.refuse_if_lent("reconfigure the port")?;

        let Some(handle) = self.handle.as_mut() else {
            return settings.validate("<unopened>");
        };
        settings.validate(&handle.identity.name)?;

        if let Err(e) = handle.port.apply_settings(settings) {
            let previous = handle.identity.settings.clone();
            if let Err(restore) = handle.port.apply_settings(&previous) {
                warn!(
                    "Could not restore {previous} on {}: {restore}",
                    handle.identity.name
                );
            }
            return Err(PortError::ConfigRejected {
                port: handle.identity.name.clone(),
                reason: e.to_string(),
            });
        }

        debug!("Reconfigured {} to {settings}", handle.identity.name);
        handle.identity.settings = settings.clone();
        Ok(())
    }

    /// Purge and close the current handle, then open `identity`.
    pub fn switch(
        &mut self,
        identity: &PortIdentity,
    ) -> std::result::Result<&PortHandle, PortError> {
        self.refuse_if_lent("switch ports")?;

        if let Some(mut old) = self.handle.take() {
            if let Err(e) = old.port.purge() {
                warn!("Purging {} before switch failed: {e}", old.identity.name);
            }
            debug!("Switching {} -> {}", old.identity.name, identity.name);
            drop(old);
        }
        self.open(identity)
    }

    /// Lend reader and writer endpoints to the workers.
    pub fn lend(&mut self, poll_interval: std::time::Duration) -> Result<PortLease> {
        self.refuse_if_lent("lend the port twice")?;
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| Error::Config("no port is open".into()))?;

        let mut reader = handle.port.try_clone_port()?;
        reader.set_timeout(poll_interval)?;
        let writer = handle.port.try_clone_port()?;

        self.lent = true;
        Ok(PortLease { reader, writer })
    }

    /// Record that every lent endpoint has been handed back or abandoned.
    pub fn reclaim(&mut self) {
        self.lent = false;
    }

    /// Close the handle. Closing when nothing is open is a no-op.
    pub fn close(&mut self) {
        if self.lent {
            warn!("Closing port while it is still lent; workers were detached");
            self.lent = false;
        }
        if let Some(handle) = self.handle.take() {
            info!("Closed {}", handle.identity.name);
        }
    }
}

impl Drop for PortManager {
    fn drop(&mut self) {
        self.close();
    }
}
