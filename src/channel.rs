//! Control channel to the transport engine
//!
//! A [`ControlChannel`] owns the one open handle to the engine together with
//! the bookkeeping for every session and connection created through it. All
//! other operations in this crate are methods on the channel, so closing it
//! (or dropping it) ends every use of the handle.

use crate::engine::{
    CallOutput, EngineConnection, EngineService, ReturnCode, Selector, ServiceRegistry,
};
use crate::error::{KernelError, KernelResult};
use crate::resources::ResourceRegistry;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// I/O Registry class name of the virtual HBA driver
pub const DEFAULT_SERVICE_NAME: &str = "com_NSinenian_iSCSIVirtualHBA";

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Class name used to locate the engine service
    pub service_name: String,
    /// Hex-dump every PDU header at trace level
    pub trace_pdus: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            trace_pdus: false,
        }
    }
}

/// Open handle to the transport engine
///
/// Operations take `&self` and never hold an internal lock across a call
/// into the engine. Callers serialize traffic on the same connection.
pub struct ControlChannel<S: EngineService> {
    // Held for the lifetime of the handle, released when the channel drops
    _service: S,
    connection: S::Connection,
    config: ChannelConfig,
    resources: Mutex<ResourceRegistry>,
    closed: bool,
}

impl<S: EngineService> ControlChannel<S> {
    /// Open a channel with the default configuration
    pub fn open<R>(registry: &R) -> KernelResult<Self>
    where
        R: ServiceRegistry<Service = S>,
    {
        ChannelBuilder::new().open(registry)
    }

    fn establish<R>(registry: &R, config: ChannelConfig) -> KernelResult<Self>
    where
        R: ServiceRegistry<Service = S>,
    {
        let service = registry.matching_service(&config.service_name).ok_or_else(|| {
            KernelError::ServiceUnavailable(format!(
                "no service matching {} (is the driver loaded?)",
                config.service_name
            ))
        })?;

        let mut connection = service.open().map_err(|rc| {
            KernelError::OpenFailed(format!(
                "could not open handle to {}: {}",
                config.service_name, rc
            ))
        })?;

        if let Err(rc) = connection.call_method(Selector::Open, &[], &[], &mut [], &mut []) {
            connection.close();
            return Err(KernelError::OpenFailed(format!(
                "engine rejected initialisation: {}",
                rc
            )));
        }

        log::info!("Opened control channel to {}", config.service_name);

        Ok(ControlChannel {
            _service: service,
            connection,
            config,
            resources: Mutex::new(ResourceRegistry::default()),
            closed: false,
        })
    }

    /// Shut the engine down and close the handle
    ///
    /// The handle is closed and the service released even when the engine
    /// fails the shutdown call; that failure is what gets returned.
    pub fn close(mut self) -> KernelResult<()> {
        self.shutdown().map_err(|code| KernelError::Engine {
            operation: "Close",
            code,
        })
    }

    fn shutdown(&mut self) -> Result<(), ReturnCode> {
        let result = self
            .connection
            .call_method(Selector::Close, &[], &[], &mut [], &mut [])
            .map(|_| ());
        self.connection.close();
        self.closed = true;

        match &result {
            Ok(()) => log::info!("Closed control channel to {}", self.config.service_name),
            Err(rc) => log::warn!(
                "Engine shutdown failed ({}), handle to {} closed anyway",
                rc,
                self.config.service_name
            ),
        }
        result
    }

    /// Configuration the channel was opened with
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// One privileged call, passed through unchanged
    pub(crate) fn call(
        &self,
        selector: Selector,
        scalar_in: &[u64],
        struct_in: &[u8],
        scalar_out: &mut [u64],
        struct_out: &mut [u8],
    ) -> Result<CallOutput, ReturnCode> {
        let result = self
            .connection
            .call_method(selector, scalar_in, struct_in, scalar_out, struct_out);
        if let Err(rc) = &result {
            log::debug!("{} {:?} returned {}", selector, scalar_in, rc);
        }
        result
    }

    /// One privileged call that must succeed and produce exactly as many
    /// scalars as `scalar_out` has room for
    pub(crate) fn invoke(
        &self,
        selector: Selector,
        scalar_in: &[u64],
        struct_in: &[u8],
        scalar_out: &mut [u64],
        struct_out: &mut [u8],
    ) -> KernelResult<CallOutput> {
        let expected = scalar_out.len();
        let output = self
            .call(selector, scalar_in, struct_in, scalar_out, struct_out)
            .map_err(|rc| KernelError::Io(format!("{} returned {}", selector, rc)))?;

        if output.scalar_count != expected {
            return Err(KernelError::Io(format!(
                "{} produced {} scalar outputs, expected {}",
                selector, output.scalar_count, expected
            )));
        }
        Ok(output)
    }

    pub(crate) fn resources(&self) -> MutexGuard<'_, ResourceRegistry> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: EngineService> Drop for ControlChannel<S> {
    fn drop(&mut self) {
        if !self.closed {
            log::debug!("Control channel dropped without close, shutting down");
            let _ = self.shutdown();
        }
    }
}

/// Builder for configuring a control channel
#[derive(Debug, Default)]
pub struct ChannelBuilder {
    service_name: Option<String>,
    trace_pdus: bool,
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the service class name (default: com_NSinenian_iSCSIVirtualHBA)
    pub fn service_name(mut self, name: &str) -> Self {
        self.service_name = Some(name.to_string());
        self
    }

    /// Hex-dump PDU headers at trace level
    pub fn trace_pdus(mut self, enabled: bool) -> Self {
        self.trace_pdus = enabled;
        self
    }

    /// Validate the configuration without opening anything
    pub fn build_config(self) -> KernelResult<ChannelConfig> {
        let service_name = self
            .service_name
            .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());

        if service_name.trim().is_empty() {
            return Err(KernelError::Config(
                "service_name must not be empty".to_string(),
            ));
        }

        Ok(ChannelConfig {
            service_name,
            trace_pdus: self.trace_pdus,
        })
    }

    /// Locate the engine, open a handle to it and initialise it
    pub fn open<R: ServiceRegistry>(
        self,
        registry: &R,
    ) -> KernelResult<ControlChannel<R::Service>> {
        let config = self.build_config()?;
        ControlChannel::<R::Service>::establish(registry, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackEngine;

    #[test]
    fn test_open_and_close() {
        let engine = LoopbackEngine::new();
        let channel = ControlChannel::open(&engine.registry()).unwrap();
        assert!(engine.is_initialized());
        assert_eq!(engine.handles_open(), 1);

        channel.close().unwrap();
        assert!(!engine.is_initialized());
        assert_eq!(engine.handles_open(), 0);
        assert_eq!(engine.call_count(Selector::Close), 1);
    }

    #[test]
    fn test_service_not_found() {
        let engine = LoopbackEngine::new();
        let result = ControlChannel::open(&engine.registry_named("com_example_OtherHBA"));
        assert!(matches!(result, Err(KernelError::ServiceUnavailable(_))));
        assert_eq!(engine.total_calls(), 0);
    }

    #[test]
    fn test_handle_open_failure() {
        let engine = LoopbackEngine::new();
        engine.fail_open(ReturnCode::NOT_OPEN);
        let result = ControlChannel::open(&engine.registry());
        assert!(matches!(result, Err(KernelError::OpenFailed(_))));
        assert_eq!(engine.total_calls(), 0);
    }

    #[test]
    fn test_initialisation_failure_closes_handle() {
        let engine = LoopbackEngine::new();
        engine.inject_fault(Selector::Open, crate::loopback::Fault::Return(ReturnCode::ERROR));
        let result = ControlChannel::open(&engine.registry());
        assert!(matches!(result, Err(KernelError::OpenFailed(_))));
        assert_eq!(engine.handles_open(), 0);
    }

    #[test]
    fn test_close_reports_shutdown_failure_but_releases_handle() {
        let engine = LoopbackEngine::new();
        let channel = ControlChannel::open(&engine.registry()).unwrap();
        engine.inject_fault(Selector::Close, crate::loopback::Fault::Return(ReturnCode::ERROR));

        let result = channel.close();
        assert!(matches!(
            result,
            Err(KernelError::Engine {
                code: ReturnCode::ERROR,
                ..
            })
        ));
        assert_eq!(engine.handles_open(), 0);
    }

    #[test]
    fn test_drop_shuts_down() {
        let engine = LoopbackEngine::new();
        {
            let _channel = ControlChannel::open(&engine.registry()).unwrap();
        }
        assert_eq!(engine.call_count(Selector::Close), 1);
        assert_eq!(engine.handles_open(), 0);
    }

    #[test]
    fn test_independent_channels() {
        let engine_a = LoopbackEngine::new();
        let engine_b = LoopbackEngine::new();
        let a = ControlChannel::open(&engine_a.registry()).unwrap();
        let b = ControlChannel::open(&engine_b.registry()).unwrap();

        a.create_session().unwrap();
        assert_eq!(engine_a.session_count(), 1);
        assert_eq!(engine_b.session_count(), 0);

        drop(b);
        assert!(engine_a.is_initialized());
        a.close().unwrap();
    }

    #[test]
    fn test_builder_rejects_empty_service_name() {
        let result = ChannelBuilder::new().service_name("  ").build_config();
        assert!(matches!(result, Err(KernelError::Config(_))));
    }

    #[test]
    fn test_builder_custom_service_name() {
        let engine = LoopbackEngine::new();
        let channel = ChannelBuilder::new()
            .service_name("com_example_TestHBA")
            .trace_pdus(true)
            .open(&engine.registry_named("com_example_TestHBA"))
            .unwrap();
        assert_eq!(channel.config().service_name, "com_example_TestHBA");
        assert!(channel.config().trace_pdus);
    }
}
