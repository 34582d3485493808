//! Circuit sub-protocol handlers.
//!
//! The opener registers its endpoint before sending the create, so the
//! receiver's ack always finds it. The receiver builds its mirror, binds the
//! local resource, registers, acks and only then starts the resource's
//! output driver.

use std::sync::Arc;

use super::Node;
use crate::error::{Error, Result};
use crate::id::{NodeId, StreamId};
use crate::message::{
    ErrorKind, Message, MessageType, StreamAck, StreamClose, StreamCreate, StreamData,
};
use crate::stream::binding::{self, LocalDriver};
use crate::stream::{CloseOrigin, StreamBinding, StreamHandle, StreamKind, StreamMeta};

/// Queue depth between a circuit and its local writer task
const WRITER_DEPTH: usize = 8;

type Bound = std::result::Result<(StreamBinding, Option<LocalDriver>), (ErrorKind, String)>;

impl Node {
    /// Open a circuit to `destination`.
    ///
    /// Resolves once the destination acknowledges the create. `binding`
    /// receives whatever the far end sends back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamClosed`] if the far end closes the circuit
    /// before acknowledging, or [`Error::Shutdown`] on a stopped node.
    pub async fn open_stream(
        &self,
        destination: NodeId,
        kind: StreamKind,
        context: impl Into<String>,
        binding: StreamBinding,
    ) -> Result<StreamHandle> {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        let context = context.into();

        let mut id = StreamId::random();
        while self.inner.streams.get(id).is_some() {
            id = StreamId::random();
        }
        let meta = self
            .register_stream(id, destination, kind, context.clone(), binding)
            .ok_or_else(|| Error::StreamBind(format!("stream id {id} taken")))?;

        meta.claim().await?;
        let create = StreamCreate {
            stream: id,
            kind,
            context,
        };
        if let Err(e) = self.send_payload(destination, &create) {
            meta.close(self, CloseOrigin::Local);
            return Err(e);
        }
        tracing::info!("Opened {:?} stream {} to {}", kind, id, destination);

        meta.flush().await?;
        Ok(StreamHandle::new(self.clone(), meta))
    }

    /// Register a circuit endpoint. Returns `None` if the id is taken.
    pub(crate) fn register_stream(
        &self,
        id: StreamId,
        remote: NodeId,
        kind: StreamKind,
        context: String,
        binding: StreamBinding,
    ) -> Option<Arc<StreamMeta>> {
        let meta = Arc::new(StreamMeta::new(id, remote, kind, context.clone(), binding));
        if !self.inner.streams.insert(Arc::clone(&meta)) {
            return None;
        }
        self.inner.info.add_stream(id, kind, context, remote);
        Some(meta)
    }

    /// Handle for an open circuit.
    #[must_use]
    pub fn stream(&self, id: StreamId) -> Option<StreamHandle> {
        self.inner
            .streams
            .get(id)
            .map(|meta| StreamHandle::new(self.clone(), meta))
    }

    pub(crate) async fn handle_stream_message(&self, msg: Message) {
        let result = match msg.kind {
            MessageType::StreamCreate => match msg.payload::<StreamCreate>() {
                Ok(create) => {
                    self.on_create(msg.source, create).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            MessageType::StreamData => match msg.payload::<StreamData>() {
                Ok(data) => {
                    self.on_data(data).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            MessageType::StreamAck => msg.payload::<StreamAck>().map(|ack| self.on_ack(ack)),
            MessageType::StreamClose => msg
                .payload::<StreamClose>()
                .map(|close| self.on_close(close)),
            other => {
                tracing::warn!("Not a stream message: {:?}", other);
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!("Rejecting {:?} from {}: {}", msg.kind, msg.source, e);
            self.report_to(msg.source, ErrorKind::DecodeError, e.to_string());
        }
    }

    async fn on_create(&self, source: NodeId, create: StreamCreate) {
        if self.inner.streams.get(create.stream).is_some() {
            tracing::debug!("Stream {} already open; ignoring create", create.stream);
            return;
        }

        let bound = self.bind_local(&create).await;
        let (binding, driver, failure) = match bound {
            Ok((binding, driver)) => (binding, driver, None),
            Err(failure) => (StreamBinding::Detached, None, Some(failure)),
        };

        let Some(meta) =
            self.register_stream(create.stream, source, create.kind, create.context, binding)
        else {
            tracing::debug!("Stream {} raced another create", create.stream);
            return;
        };
        let handle = StreamHandle::new(self.clone(), meta);

        if let Err(e) = self.send_payload(source, &StreamAck { stream: create.stream }) {
            tracing::warn!("Failed to ack stream {}: {}", create.stream, e);
        }

        match (driver, failure) {
            (_, Some((kind, context))) => {
                self.report(kind, context);
                handle.abort();
            }
            (Some(driver), None) => driver.start(handle),
            (None, None) => {}
        }
    }

    async fn bind_local(&self, create: &StreamCreate) -> Bound {
        let context = create.context.as_str();
        match create.kind {
            StreamKind::Command => binding::command(context, WRITER_DEPTH)
                .map(|(binding, driver)| (binding, Some(driver)))
                .map_err(|e| (ErrorKind::StreamBindFailed, e.to_string())),
            StreamKind::Shell => Ok((StreamBinding::Sink(Arc::clone(&self.inner.sink)), None)),
            StreamKind::FileDownload => binding::download_source(context)
                .await
                .map(|(binding, driver)| (binding, Some(driver)))
                .map_err(|e| (ErrorKind::FileOpenFailed, format!("{context}: {e}"))),
            StreamKind::FileUpload => binding::upload_target(self, context, WRITER_DEPTH)
                .await
                .map(|binding| (binding, None))
                .map_err(|e| (ErrorKind::FileOpenFailed, format!("{context}: {e}"))),
            StreamKind::PortForward => {
                match starling_transport::tcp::dial(context, &self.inner.config.transport).await {
                    Ok(socket) => {
                        let (binding, driver) = binding::socket(socket, WRITER_DEPTH);
                        Ok((binding, Some(driver)))
                    }
                    Err(e) => Err((ErrorKind::StreamBindFailed, format!("{context}: {e}"))),
                }
            }
            StreamKind::Socks5 | StreamKind::Unsupported(_) => Err((
                ErrorKind::UnsupportedStreamType,
                format!("{:?}", create.kind),
            )),
        }
    }

    async fn on_data(&self, data: StreamData) {
        let Some(meta) = self.inner.streams.get(data.stream) else {
            tracing::debug!("Data for unknown stream {}", data.stream);
            return;
        };

        if let Err(e) = meta.binding().deliver(&meta, &data.data).await {
            tracing::debug!("Delivery on stream {} failed: {}", data.stream, e);
            meta.close(self, CloseOrigin::Local);
            return;
        }

        if let Err(e) = self.send_payload(meta.remote(), &StreamAck { stream: data.stream }) {
            tracing::warn!("Failed to ack stream {}: {}", data.stream, e);
        }
    }

    fn on_ack(&self, ack: StreamAck) {
        match self.inner.streams.get(ack.stream) {
            Some(meta) => {
                if !meta.acknowledge() {
                    tracing::trace!("Spurious ack on stream {}", ack.stream);
                }
            }
            None => tracing::trace!("Ack for unknown stream {}", ack.stream),
        }
    }

    fn on_close(&self, close: StreamClose) {
        match self.inner.streams.get(close.stream) {
            Some(meta) => {
                meta.close(self, CloseOrigin::Remote);
            }
            None => tracing::debug!("Close for unknown stream {}", close.stream),
        }
    }
}
