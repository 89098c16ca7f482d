//! WebSocket endpoint for slave connections.

use std::{net::SocketAddr, ops::ControlFlow, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use fleet_core::{ModuleId, ModuleStream, ModuleVersionItem, SlaveCallback, TransportError};
use fleet_session::Master;
use futures::{SinkExt, StreamExt};
use tokio::{io::AsyncReadExt, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{MODULE_CHUNK_SIZE, MasterMessage, SlaveMessage};

/// Messages buffered between a connection and its writer task.
pub const OUTGOING_CAPACITY: usize = 32;

/// Master-side handle on one slave socket.
///
/// Calls are queued to the socket's writer task through a bounded
/// channel, so a module transfer advances only as fast as the socket
/// drains. `close` stops both the writer and the reader.
pub struct WsCallback {
    tx: mpsc::Sender<MasterMessage>,
    closed: CancellationToken,
}

impl WsCallback {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<MasterMessage>, closed: CancellationToken) -> Self {
        Self { tx, closed }
    }

    /// Queue a message for the slave, waiting for room in the writer queue.
    ///
    /// # Errors
    /// Returns `Closed` once the socket has been closed, including while
    /// waiting.
    pub async fn send(&self, msg: MasterMessage) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::Closed),
            sent = self.tx.send(msg) => sent.map_err(|_| TransportError::Closed),
        }
    }

    /// Queue a message without waiting.
    ///
    /// # Errors
    /// Returns `Closed` once the socket has been closed and `Send` if the
    /// writer queue is full.
    pub fn try_send(&self, msg: MasterMessage) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::Send("outgoing queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

#[async_trait]
impl SlaveCallback for WsCallback {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    // Teardown must not wait on a stalled socket.
    async fn abort_connection(&self) -> Result<(), TransportError> {
        self.try_send(MasterMessage::AbortConnection)
    }

    fn close(&self) {
        self.closed.cancel();
    }

    async fn push_module(
        &self,
        module: ModuleVersionItem,
        mut payload: ModuleStream,
    ) -> Result<(), TransportError> {
        self.send(MasterMessage::ModuleStart { module }).await?;

        let mut buf = vec![0u8; MODULE_CHUNK_SIZE];
        loop {
            let read = payload.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            self.send(MasterMessage::module_chunk(module.module_id, &buf[..read]))
                .await?;
        }

        self.send(MasterMessage::ModuleEnd {
            module_id: module.module_id,
        })
        .await
    }

    async fn undeploy_module(&self, module_id: ModuleId) -> Result<(), TransportError> {
        self.send(MasterMessage::UndeployModule { module_id }).await
    }

    async fn execute_script(&self, script: &str) -> Result<(), TransportError> {
        self.send(MasterMessage::ExecuteScript {
            script: script.to_string(),
        })
        .await
    }
}

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    pub master: Arc<Master>,
}

impl WsState {
    #[must_use]
    pub const fn new(master: Arc<Master>) -> Self {
        Self { master }
    }
}

/// WebSocket upgrade handler.
///
/// Requires the router to be served with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, peer, state))
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: WsState) {
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<MasterMessage>(OUTGOING_CAPACITY);
    let closed = CancellationToken::new();
    let callback = Arc::new(WsCallback::new(tx, closed.clone()));
    let send_task = tokio::spawn(forward_outgoing(sender, rx, closed.clone()));

    let master = state.master;
    let session_id = Uuid::new_v4().to_string();
    match master
        .on_connect(
            session_id.clone(),
            peer.ip(),
            Arc::clone(&callback) as Arc<dyn SlaveCallback>,
        )
        .await
    {
        Ok(configuration) => {
            let _ = callback
                .send(MasterMessage::Configuration {
                    session_id: session_id.clone(),
                    configuration,
                })
                .await;
        }
        Err(e) => {
            tracing::warn!(source = %peer, "Connect rejected: {e}");
            let _ = callback.send(MasterMessage::error(e.to_string())).await;
            closed.cancel();
            let _ = send_task.await;
            return;
        }
    }

    loop {
        let msg = tokio::select! {
            () = closed.cancelled() => break,
            msg = receiver.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!(session_id, "WebSocket error: {e}");
                break;
            }
        };

        let slave_msg: SlaveMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(session_id, "Invalid slave message: {e}");
                let _ = callback
                    .send(MasterMessage::error(format!("Invalid message: {e}")))
                    .await;
                continue;
            }
        };

        if dispatch(&master, &callback, &session_id, &slave_msg)
            .await
            .is_break()
        {
            break;
        }
    }

    closed.cancel();
    if master.abort_connection(&session_id).await.is_performed() {
        tracing::info!(session_id, source = %peer, "Transport dropped");
    }
    let _ = send_task.await;
}

/// Serialize queued messages onto the socket until the callback is closed.
///
/// Messages queued before the close are still written.
async fn forward_outgoing<S>(
    mut sender: S,
    rx: mpsc::Receiver<MasterMessage>,
    closed: CancellationToken,
) where
    S: futures::Sink<Message> + Unpin,
{
    let mut outgoing = ReceiverStream::new(rx);
    loop {
        let msg = tokio::select! {
            biased;
            Some(msg) = outgoing.next() => msg,
            () = closed.cancelled() => break,
            else => break,
        };
        let json = match serde_json::to_string(&msg) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {e}");
                continue;
            }
        };
        if sender.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
    let _ = sender.close().await;
}

/// Apply one slave message. `Break` ends the connection.
async fn dispatch(
    master: &Arc<Master>,
    callback: &Arc<WsCallback>,
    session_id: &str,
    msg: &SlaveMessage,
) -> ControlFlow<()> {
    match msg {
        SlaveMessage::Ping => {
            if let Err(e) = master.on_ping(session_id) {
                tracing::debug!(session_id, "Ping rejected: {e}");
                return ControlFlow::Break(());
            }
            tracing::trace!(session_id, "Ping");
            let _ = callback.send(MasterMessage::Pong).await;
        }
        SlaveMessage::Disconnect => {
            if let Err(e) = master.on_disconnect(session_id) {
                tracing::debug!(session_id, "Disconnect after teardown: {e}");
            }
            return ControlFlow::Break(());
        }
        SlaveMessage::GetModule { module_id } => {
            tokio::spawn(send_module(
                Arc::clone(master),
                Arc::clone(callback),
                session_id.to_string(),
                *module_id,
            ));
        }
        SlaveMessage::PushMessage { .. } => {
            let Some(payload) = msg.decode_push() else {
                let _ = callback
                    .send(MasterMessage::error("Invalid base64 payload"))
                    .await;
                return ControlFlow::Continue(());
            };
            if let Err(e) = master.on_message(session_id, payload) {
                tracing::debug!(session_id, "Message rejected: {e}");
                return ControlFlow::Break(());
            }
        }
    }
    ControlFlow::Continue(())
}

async fn send_module(
    master: Arc<Master>,
    callback: Arc<WsCallback>,
    session_id: String,
    module_id: ModuleId,
) {
    let payload = match master.get_module_stream(module_id, &session_id).await {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(session_id, module_id, "Module download refused: {e}");
            let _ = callback.send(MasterMessage::error(e.to_string())).await;
            return;
        }
    };

    let version = payload.version;
    match callback.push_module(version.item(), payload.stream).await {
        Ok(()) => {
            tracing::info!(session_id, module_id, version = %version, "Module downloaded");
        }
        Err(e) => {
            tracing::warn!(session_id, module_id, "Module download failed: {e}");
        }
    }
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = create_ws_router(master);
/// axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
/// ```
#[must_use]
pub fn create_ws_router(master: Arc<Master>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(WsState::new(master))
}

#[cfg(test)]
mod tests {
    use std::{net::IpAddr, path::PathBuf, time::Duration};

    use fleet_core::{MasterConfig, ModuleCatalog, ModuleVersion};
    use fleet_session::storage::{FsBlobStore, MemoryCatalog, MemoryDirectory};

    use super::*;

    fn callback_with_capacity(
        capacity: usize,
    ) -> (Arc<WsCallback>, mpsc::Receiver<MasterMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(WsCallback::new(tx, CancellationToken::new())), rx)
    }

    fn callback() -> (Arc<WsCallback>, mpsc::Receiver<MasterMessage>) {
        callback_with_capacity(OUTGOING_CAPACITY)
    }

    fn drain(rx: &mut mpsc::Receiver<MasterMessage>) -> Vec<MasterMessage> {
        let mut msgs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    #[tokio::test]
    async fn test_push_module_is_chunked() {
        let (cb, mut rx) = callback();
        let module = ModuleVersion::new(9, 1, 0, 0, 0).item();
        let package = vec![7u8; MODULE_CHUNK_SIZE + 10];

        cb.push_module(module, Box::pin(std::io::Cursor::new(package.clone())))
            .await
            .unwrap();

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0], MasterMessage::ModuleStart { module });
        assert_eq!(msgs[1].decode_chunk().unwrap().len(), MODULE_CHUNK_SIZE);
        assert_eq!(msgs[2].decode_chunk().unwrap().len(), 10);
        assert_eq!(msgs[3], MasterMessage::ModuleEnd { module_id: 9 });
    }

    #[tokio::test]
    async fn test_push_module_waits_for_writer() {
        let (cb, mut rx) = callback_with_capacity(1);
        let module = ModuleVersion::new(9, 1, 0, 0, 0).item();
        let package = vec![1u8; MODULE_CHUNK_SIZE * 3];

        let push = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move {
                cb.push_module(module, Box::pin(std::io::Cursor::new(package)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!push.is_finished());
        assert_eq!(rx.len(), 1);

        let mut received = Vec::new();
        while let Some(msg) = rx.recv().await {
            let end = matches!(msg, MasterMessage::ModuleEnd { .. });
            received.push(msg);
            if end {
                break;
            }
        }
        tokio_test::assert_ok!(push.await.unwrap());
        assert_eq!(received.len(), 5);
    }

    #[tokio::test]
    async fn test_stalled_writer_does_not_block_teardown() {
        let (cb, mut rx) = callback_with_capacity(1);
        cb.send(MasterMessage::Pong).await.unwrap();

        let blocked = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move { cb.execute_script("echo").await })
        };
        assert!(matches!(
            cb.abort_connection().await,
            Err(TransportError::Send(_))
        ));
        cb.close();

        assert!(matches!(blocked.await.unwrap(), Err(TransportError::Closed)));
        assert_eq!(drain(&mut rx), vec![MasterMessage::Pong]);
    }

    #[tokio::test]
    async fn test_closed_callback_rejects_sends() {
        let (cb, mut rx) = callback();
        assert!(cb.is_open());

        tokio_test::assert_ok!(cb.abort_connection().await);
        cb.close();
        cb.close();

        assert!(!cb.is_open());
        assert!(matches!(
            cb.execute_script("echo").await,
            Err(TransportError::Closed)
        ));
        assert_eq!(drain(&mut rx), vec![MasterMessage::AbortConnection]);
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_callback() {
        let (cb, rx) = callback();
        drop(rx);
        assert!(!cb.is_open());
        assert!(matches!(
            cb.undeploy_module(1).await,
            Err(TransportError::Closed)
        ));
    }

    struct Harness {
        master: Arc<Master>,
        catalog: Arc<MemoryCatalog>,
        root: PathBuf,
        cb: Arc<WsCallback>,
        rx: mpsc::Receiver<MasterMessage>,
    }

    async fn harness() -> Harness {
        let root = std::env::temp_dir().join(format!("fleet-ws-{}", Uuid::new_v4()));
        let catalog = Arc::new(MemoryCatalog::new());
        let master = Arc::new(Master::new(
            &MasterConfig::default(),
            Arc::new(MemoryDirectory::new()),
            Arc::clone(&catalog) as Arc<dyn ModuleCatalog>,
            Arc::new(FsBlobStore::new(&root)),
        ));
        let (cb, rx) = callback();
        master
            .on_connect(
                "s1".to_string(),
                IpAddr::from([10, 1, 1, 1]),
                Arc::clone(&cb) as Arc<dyn SlaveCallback>,
            )
            .await
            .unwrap();
        Harness {
            master,
            catalog,
            root,
            cb,
            rx,
        }
    }

    #[tokio::test]
    async fn test_dispatch_ping_and_push_message() {
        let mut h = harness().await;

        assert!(dispatch(&h.master, &h.cb, "s1", &SlaveMessage::Ping).await.is_continue());
        assert_eq!(drain(&mut h.rx), vec![MasterMessage::Pong]);

        let push = SlaveMessage::push_message(b"hello");
        assert!(dispatch(&h.master, &h.cb, "s1", &push).await.is_continue());
        let queued = h.master.drain_messages("s1").unwrap();
        assert_eq!(queued[0].payload.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_dispatch_disconnect_ends_connection() {
        let h = harness().await;

        assert!(dispatch(&h.master, &h.cb, "s1", &SlaveMessage::Disconnect).await.is_break());
        assert!(h.master.sessions().is_empty());
        assert!(dispatch(&h.master, &h.cb, "s1", &SlaveMessage::Ping).await.is_break());
    }

    #[tokio::test]
    async fn test_get_module_streams_assigned_package() {
        let mut h = harness().await;
        let slave_id = h.master.registry().get("s1").unwrap().slave_id();

        send_module(Arc::clone(&h.master), Arc::clone(&h.cb), "s1".to_string(), 5).await;
        let msgs = drain(&mut h.rx);
        assert!(matches!(msgs.as_slice(), [MasterMessage::Error { .. }]));

        let version = ModuleVersion::new(5, 1, 4, 0, 0);
        tokio::fs::create_dir_all(h.root.join("5")).await.unwrap();
        tokio::fs::write(h.root.join(&version.storage_locator), b"zpg")
            .await
            .unwrap();
        h.catalog.register_version(version.clone()).unwrap();
        h.catalog.assign(slave_id, 5).unwrap();

        send_module(Arc::clone(&h.master), Arc::clone(&h.cb), "s1".to_string(), 5).await;
        let msgs = drain(&mut h.rx);
        assert_eq!(msgs.len(), 3);
        assert_eq!(
            msgs[0],
            MasterMessage::ModuleStart {
                module: version.item()
            }
        );
        assert_eq!(msgs[1].decode_chunk().unwrap(), b"zpg");

        tokio::fs::remove_dir_all(&h.root).await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_outgoing_flushes_before_close() {
        let (tx, rx) = mpsc::channel(OUTGOING_CAPACITY);
        let closed = CancellationToken::new();
        let (sink, collected) = futures::channel::mpsc::unbounded::<Message>();

        tx.send(MasterMessage::Pong).await.unwrap();
        tx.send(MasterMessage::AbortConnection).await.unwrap();
        closed.cancel();
        forward_outgoing(sink, rx, closed).await;

        let frames: Vec<Message> = collected.collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[1],
            Message::Text(r#"{"type":"abort_connection"}"#.into())
        );
    }
}
