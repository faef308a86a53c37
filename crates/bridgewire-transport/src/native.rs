//! Boundary to the native transport process.
//!
//! The native side terminates TLS, parses HTTP/1, HTTP/2 and HTTP/3, and
//! forwards each request to the bridge either over a [`BridgeEndpoint`]
//! channel or through the direct call/poll interface described by
//! [`NativeTransport`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::endpoint::BridgeEndpoint;
use crate::error::{Result, TransportError};
use crate::tcp::BindOptions;

/// Native ABI version this build speaks.
pub const SUPPORTED_NATIVE_ABI_VERSION: i32 = 1;

/// Certificate material handed to the native listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// How the native listener hands requests to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendDescriptor {
    /// Forward over a framed byte-stream channel.
    Bridge(BridgeEndpoint),
    /// Exchange payloads through [`NativeTransport::poll_request`] and
    /// [`NativeTransport::push_response`].
    Direct,
}

/// One public address served by one handler pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerBinding {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    pub backend: BackendDescriptor,
}

/// Everything the native side needs to start one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeListenerConfig {
    pub binding: ListenerBinding,
    pub http2: bool,
    pub http3: bool,
    pub options: BindOptions,
}

impl NativeListenerConfig {
    pub fn new(binding: ListenerBinding) -> Self {
        Self {
            binding,
            http2: true,
            http3: false,
            options: BindOptions::default(),
        }
    }

    pub fn with_http2(mut self, enabled: bool) -> Self {
        self.http2 = enabled;
        self
    }

    pub fn with_http3(mut self, enabled: bool) -> Self {
        self.http3 = enabled;
        self
    }

    pub fn with_options(mut self, options: BindOptions) -> Self {
        self.options = options;
        self
    }
}

/// Opaque id of a listener started by the native side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeListenerHandle(pub u64);

/// One frame payload travelling through the direct interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectPayload {
    pub request_id: u64,
    pub payload: Bytes,
}

/// Call contract of the native transport.
///
/// Every method is synchronous and must not block for long: the direct
/// dispatcher calls [`poll_request`](Self::poll_request) in a loop.
pub trait NativeTransport: Send + Sync + 'static {
    /// ABI version of the native library.
    fn abi_version(&self) -> i32;

    fn start_listener(&self, config: &NativeListenerConfig) -> Result<NativeListenerHandle>;

    fn stop_listener(&self, handle: NativeListenerHandle) -> Result<()>;

    /// Next pending request frame, if any.
    fn poll_request(&self) -> Option<DirectPayload>;

    /// Deliver a response frame for `request_id`. Returns `false` when the
    /// native side no longer knows the request.
    fn push_response(&self, request_id: u64, payload: &[u8]) -> bool;
}

/// Check the native ABI version before anything else touches the library.
pub fn probe_abi(native: &dyn NativeTransport) -> Result<i32> {
    let found = native.abi_version();
    if found != SUPPORTED_NATIVE_ABI_VERSION {
        return Err(TransportError::UnsupportedAbi {
            found,
            expected: SUPPORTED_NATIVE_ABI_VERSION,
        });
    }
    debug!(abi = found, "native transport abi accepted");
    Ok(found)
}

/// Probe the ABI, then start a listener.
pub fn start_native_listener(
    native: &dyn NativeTransport,
    config: &NativeListenerConfig,
) -> Result<NativeListenerHandle> {
    probe_abi(native)?;
    let handle = native.start_listener(config)?;
    info!(
        host = %config.binding.host,
        port = config.binding.port,
        tls = config.binding.tls.is_some(),
        http2 = config.http2,
        http3 = config.http3,
        "native listener started"
    );
    Ok(handle)
}

/// A native transport living in this process.
///
/// Requests are queued with [`submit`](Self::submit); responses arrive on the
/// receiver returned by [`new`](Self::new). Used by embedders that accept
/// connections themselves and by tests.
pub struct InProcessNative {
    abi_version: i32,
    pending: Mutex<VecDeque<DirectPayload>>,
    responses: mpsc::UnboundedSender<DirectPayload>,
    listeners: Mutex<Vec<(NativeListenerHandle, NativeListenerConfig)>>,
    next_handle: AtomicU64,
}

impl InProcessNative {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DirectPayload>) {
        Self::with_abi_version(SUPPORTED_NATIVE_ABI_VERSION)
    }

    pub fn with_abi_version(abi_version: i32) -> (Self, mpsc::UnboundedReceiver<DirectPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let native = Self {
            abi_version,
            pending: Mutex::new(VecDeque::new()),
            responses: tx,
            listeners: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        };
        (native, rx)
    }

    /// Queue a request frame for the dispatcher to pick up.
    pub fn submit(&self, request_id: u64, payload: impl Into<Bytes>) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push_back(DirectPayload {
            request_id,
            payload: payload.into(),
        });
    }

    /// Configs of the listeners currently started.
    pub fn listeners(&self) -> Vec<NativeListenerConfig> {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, config)| config.clone())
            .collect()
    }
}

impl NativeTransport for InProcessNative {
    fn abi_version(&self) -> i32 {
        self.abi_version
    }

    fn start_listener(&self, config: &NativeListenerConfig) -> Result<NativeListenerHandle> {
        let handle = NativeListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((handle, config.clone()));
        Ok(handle)
    }

    fn stop_listener(&self, handle: NativeListenerHandle) -> Result<()> {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        if listeners.len() == before {
            return Err(TransportError::NativeStart(format!(
                "unknown listener handle {}",
                handle.0
            )));
        }
        Ok(())
    }

    fn poll_request(&self) -> Option<DirectPayload> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn push_response(&self, request_id: u64, payload: &[u8]) -> bool {
        self.responses
            .send(DirectPayload {
                request_id,
                payload: Bytes::copy_from_slice(payload),
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> ListenerBinding {
        ListenerBinding {
            host: "0.0.0.0".into(),
            port: 8443,
            tls: Some(TlsConfig {
                cert_path: "/etc/bridge/cert.pem".into(),
                key_path: "/etc/bridge/key.pem".into(),
            }),
            backend: BackendDescriptor::Direct,
        }
    }

    #[test]
    fn probe_accepts_supported_version() {
        let (native, _rx) = InProcessNative::new();
        assert_eq!(probe_abi(&native).unwrap(), SUPPORTED_NATIVE_ABI_VERSION);
    }

    #[test]
    fn start_refuses_unknown_abi() {
        let (native, _rx) = InProcessNative::with_abi_version(7);
        let err = start_native_listener(&native, &NativeListenerConfig::new(binding())).unwrap_err();
        assert!(matches!(
            err,
            TransportError::UnsupportedAbi {
                found: 7,
                expected: SUPPORTED_NATIVE_ABI_VERSION
            }
        ));
        assert!(native.listeners().is_empty());
    }

    #[test]
    fn listeners_start_and_stop() {
        let (native, _rx) = InProcessNative::new();
        let config = NativeListenerConfig::new(binding()).with_http3(true);
        let handle = start_native_listener(&native, &config).unwrap();
        assert_eq!(native.listeners(), vec![config]);

        native.stop_listener(handle).unwrap();
        assert!(native.listeners().is_empty());
        assert!(native.stop_listener(handle).is_err());
    }

    #[test]
    fn requests_and_responses_flow_in_order() {
        let (native, mut rx) = InProcessNative::new();
        native.submit(1, &b"first"[..]);
        native.submit(2, &b"second"[..]);

        assert_eq!(native.poll_request().unwrap().request_id, 1);
        assert_eq!(native.poll_request().unwrap().request_id, 2);
        assert!(native.poll_request().is_none());

        assert!(native.push_response(2, b"reply"));
        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.request_id, 2);
        assert_eq!(&delivered.payload[..], b"reply");

        drop(rx);
        assert!(!native.push_response(2, b"late"));
    }
}
