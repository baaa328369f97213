//! Backend receiving RTP-framed transport streams over UDP.
//!
//! Tuning binds the receive socket; every accepted datagram payload is
//! appended to all open recording files. Sources are channel names and a
//! device records one source at a time.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::FutureExt;
use log::{debug, error, info, trace, warn};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use tsrec_protocol::rtp;

use crate::device::backend::{Device, DeviceBackend};
use crate::device::queue::{Command, CommandFuture};
use crate::device::{DeviceError, DeviceFactory, RecordingDevice, StreamId};

/// Default receive port.
pub const DEFAULT_RTP_PORT: u16 = 35677;

/// Largest datagram read at once.
const RECEIVE_BUFFER_SIZE: usize = 10_000;

/// Write buffer per recording file.
const FILE_BUFFER_SIZE: usize = 1024 * 1024;

type Targets = Arc<tokio::sync::Mutex<HashMap<StreamId, BufWriter<File>>>>;

/// Default receive address, all interfaces.
pub fn default_bind() -> SocketAddr {
    SocketAddr::from((Ipv6Addr::UNSPECIFIED, DEFAULT_RTP_PORT))
}

struct Receiver {
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Device backend for an RTP/UDP transport stream feed.
pub struct RtpBackend {
    name: String,
    bind: SocketAddr,
    targets: Targets,
    receiver: Mutex<Option<Receiver>>,
    /// Payload bytes appended to target files.
    written: Arc<AtomicU64>,
}

impl RtpBackend {
    pub fn new(name: impl Into<String>, bind: SocketAddr) -> Self {
        Self {
            name: name.into(),
            bind,
            targets: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            receiver: Mutex::new(None),
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Address the receive socket is bound to, if tuned.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|receiver| receiver.local_addr)
    }

    /// Number of recording files currently open.
    pub async fn open_targets(&self) -> usize {
        self.targets.lock().await.len()
    }

    /// Total payload bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    async fn bind_receiver(&self) -> Result<(), DeviceError> {
        let socket = UdpSocket::bind(self.bind).await?;
        let local_addr = socket.local_addr()?;
        let task = tokio::spawn(receive(
            self.name.clone(),
            socket,
            Arc::clone(&self.targets),
            Arc::clone(&self.written),
        ));

        let previous = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Receiver { task, local_addr });
        if let Some(previous) = previous {
            previous.task.abort();
        }

        info!("[RTP {}] Receiving on {}", self.name, local_addr);
        Ok(())
    }

    async fn stop_receiver(&self) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            receiver.task.abort();
            let _ = receiver.task.await;
            info!("[RTP {}] Socket on {} closed", self.name, receiver.local_addr);
        }
    }
}

async fn receive(name: String, socket: UdpSocket, targets: Targets, written: Arc<AtomicU64>) {
    let mut buf = BytesMut::with_capacity(RECEIVE_BUFFER_SIZE);

    loop {
        buf.reserve(RECEIVE_BUFFER_SIZE);
        if let Err(e) = socket.recv_buf(&mut buf).await {
            error!("[RTP {}] Receive failed: {}", name, e);
            break;
        }

        let datagram = buf.split().freeze();
        let Some(payload) = rtp::ts_payload(&datagram) else {
            trace!("[RTP {}] Dropped datagram of {} bytes", name, datagram.len());
            continue;
        };
        if payload.is_empty() {
            continue;
        }

        let mut targets = targets.lock().await;
        for (stream, file) in targets.iter_mut() {
            match file.write_all(&payload).await {
                Ok(()) => {
                    written.fetch_add(payload.len() as u64, Ordering::SeqCst);
                }
                Err(e) => warn!("[RTP {}] Write to stream {} failed: {}", name, stream, e),
            }
        }
    }
}

async fn close_target(name: &str, stream: StreamId, mut file: BufWriter<File>) {
    if let Err(e) = file.shutdown().await {
        warn!("[RTP {}] Failed to close stream {}: {}", name, stream, e);
    }
}

fn done() -> Result<CommandFuture, DeviceError> {
    Ok(async { Ok(()) }.boxed())
}

#[async_trait]
impl DeviceBackend for RtpBackend {
    type Source = String;

    fn resolve_channel(&self, channel: &str) -> Vec<String> {
        vec![channel.to_string()]
    }

    fn co_recordable(&self, _: &String, _: &String) -> bool {
        false
    }

    async fn reserve(&self) -> Result<Option<Command>, DeviceError> {
        Ok(None)
    }

    fn tune(self: &Arc<Self>, source: &String) -> Command {
        let backend = Arc::clone(self);
        let source = source.clone();
        Box::new(move || -> Result<CommandFuture, DeviceError> {
            Ok(async move {
                debug!("[RTP {}] Tuning to {}", backend.name, source);
                backend.bind_receiver().await
            }
            .boxed())
        })
    }

    fn begin_record(self: &Arc<Self>, _: &String, stream: StreamId, path: &Path) -> Command {
        let targets = Arc::clone(&self.targets);
        let name = self.name.clone();
        let path = path.to_path_buf();
        Box::new(move || -> Result<CommandFuture, DeviceError> {
            Ok(async move {
                let file = File::create(&path).await?;
                targets
                    .lock()
                    .await
                    .insert(stream, BufWriter::with_capacity(FILE_BUFFER_SIZE, file));
                debug!("[RTP {}] Stream {} writing to {}", name, stream, path.display());
                Ok(())
            }
            .boxed())
        })
    }

    fn end_record(self: &Arc<Self>, _: &String, stream: StreamId) -> Command {
        let targets = Arc::clone(&self.targets);
        let name = self.name.clone();
        Box::new(move || -> Result<CommandFuture, DeviceError> {
            Ok(async move {
                let file = targets.lock().await.remove(&stream);
                if let Some(file) = file {
                    close_target(&name, stream, file).await;
                }
                Ok(())
            }
            .boxed())
        })
    }

    fn detune(self: &Arc<Self>) -> Command {
        Box::new(done)
    }

    async fn release(&self) {
        self.stop_receiver().await;
    }

    async fn dispose(&self) {
        self.stop_receiver().await;

        let open: Vec<_> = self.targets.lock().await.drain().collect();
        for (stream, file) in open {
            close_target(&self.name, stream, file).await;
        }
    }
}

/// Creates RTP devices that all listen on the same address.
pub struct RtpDeviceFactory {
    bind: SocketAddr,
}

impl RtpDeviceFactory {
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind }
    }
}

impl DeviceFactory for RtpDeviceFactory {
    fn create_device(
        &self,
        name: &str,
        priority: u32,
    ) -> Result<Arc<dyn RecordingDevice>, DeviceError> {
        let backend = RtpBackend::new(name, self.bind);
        Ok(Arc::new(Device::new(name, priority, Arc::new(backend))))
    }
}
