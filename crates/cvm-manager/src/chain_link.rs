//! Link to the chain core.
//!
//! The chain core connects to the manager's listener. Tx, contract lifecycle
//! and block-end requests go to the scheduler inbox; their answers are written
//! back on the connection the request arrived on. Ledger calls made while
//! serving a tx go out on that same connection and are matched to their
//! answer by `seq`.

use std::collections::HashMap;
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cvm_protocol::{
    read_frame, write_frame, BatchKey, BatchValue, Body, ConsumeIteratorRequest,
    ConsumeKeyHistoryIteratorResponse, ConsumeKvIteratorResponse, ContractRef,
    CreateKeyHistoryIteratorRequest, CreateKvIteratorRequest, DockerVmMessage, EmitEventRequest,
    GetBatchStateRequest, GetStateRequest, IteratorOp, PutStateRequest,
};
use cvm_scheduler::config::{ChainLinkConfig, Transport};
use cvm_scheduler::{ContractInfo, ContractKey, Conn, Ledger, TxContext};
use tracing::{debug, info, warn};

type PeerId = u64;

struct Peer {
    id: PeerId,
    writer: Mutex<Conn>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub enum ChainListener {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

impl ChainListener {
    pub fn bind(cfg: &ChainLinkConfig) -> Result<Self> {
        match cfg.transport {
            Transport::Uds => {
                let path = PathBuf::from(&cfg.listen);
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("create socket dir: {}", dir.display()))?;
                }
                if path.exists() {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("remove stale socket: {}", path.display()))?;
                }
                let l = UnixListener::bind(&path)
                    .with_context(|| format!("bind chain socket: {}", path.display()))?;
                Ok(ChainListener::Unix(l, path))
            }
            Transport::Tcp => {
                let addr = format!("{}:{}", cfg.listen, cfg.port);
                let l = TcpListener::bind(&addr)
                    .with_context(|| format!("bind chain listener: {addr}"))?;
                Ok(ChainListener::Tcp(l))
            }
        }
    }

    fn accept(&self) -> std::io::Result<Conn> {
        match self {
            ChainListener::Unix(l, _) => l.accept().map(|(s, _)| Conn::Unix(s)),
            ChainListener::Tcp(l) => l.accept().map(|(s, _)| Conn::Tcp(s)),
        }
    }

    pub fn local_addr(&self) -> String {
        match self {
            ChainListener::Unix(_, path) => path.display().to_string(),
            ChainListener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
        }
    }
}

impl Drop for ChainListener {
    fn drop(&mut self) {
        if let ChainListener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub struct ChainLink {
    peers: Mutex<Vec<Arc<Peer>>>,
    /// tx id of every in-flight original tx to the peer it came from.
    routes: Mutex<HashMap<String, PeerId>>,
    pending: Mutex<HashMap<u64, mpsc::Sender<DockerVmMessage>>>,
    next_seq: AtomicU64,
    next_peer: AtomicU64,
    call_timeout: Duration,
    max_connection: usize,
}

impl ChainLink {
    pub fn new(call_timeout: Duration, max_connection: usize) -> Arc<Self> {
        Arc::new(ChainLink {
            peers: Mutex::new(Vec::new()),
            routes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            next_peer: AtomicU64::new(0),
            call_timeout,
            max_connection: max_connection.max(1),
        })
    }

    pub fn peer_num(&self) -> usize {
        lock(&self.peers).len()
    }

    /// Accepts chain connections until the listener fails.
    pub fn serve(
        self: &Arc<Self>,
        listener: ChainListener,
        inbox: mpsc::Sender<DockerVmMessage>,
    ) -> Result<JoinHandle<()>> {
        let link = Arc::clone(self);
        thread::Builder::new()
            .name("cvm-chain-accept".to_string())
            .spawn(move || {
                info!(listen = %listener.local_addr(), "chain link listening");
                loop {
                    let conn = match listener.accept() {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!(error = %err, "chain accept failed");
                            return;
                        }
                    };
                    if link.peer_num() >= link.max_connection {
                        warn!(max = link.max_connection, "chain connection refused: limit reached");
                        conn.shutdown();
                        continue;
                    }
                    if let Err(err) = link.attach(conn, inbox.clone()) {
                        warn!(error = %format!("{err:#}"), "attach chain connection");
                    }
                }
            })
            .context("spawn chain accept loop")
    }

    /// Registers `conn` and starts reading frames from it.
    pub fn attach(self: &Arc<Self>, conn: Conn, inbox: mpsc::Sender<DockerVmMessage>) -> Result<()> {
        let reader = conn.try_clone().context("clone chain connection")?;
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        lock(&self.peers).push(Arc::new(Peer {
            id,
            writer: Mutex::new(conn),
        }));
        let link = Arc::clone(self);
        thread::Builder::new()
            .name(format!("cvm-chain-rx-{id}"))
            .spawn(move || link.read_loop(id, reader, &inbox))
            .context("spawn chain reader")?;
        info!(peer = id, "chain connection attached");
        Ok(())
    }

    fn read_loop(&self, id: PeerId, mut reader: Conn, inbox: &mpsc::Sender<DockerVmMessage>) {
        loop {
            let msg = match read_frame(&mut reader) {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(err) => {
                    warn!(peer = id, error = %err, "chain stream failed");
                    break;
                }
            };
            if is_chain_request(&msg.body) {
                lock(&self.routes).insert(msg.tx_id.clone(), id);
                if inbox.send(msg).is_err() {
                    warn!(peer = id, "scheduler inbox closed");
                    break;
                }
                continue;
            }
            let waiter = lock(&self.pending).remove(&msg.seq);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => {
                    debug!(peer = id, seq = msg.seq, msg_type = %msg.msg_type(), "dropping uncorrelated chain message");
                }
            }
        }
        lock(&self.peers).retain(|p| p.id != id);
        lock(&self.routes).retain(|_, peer| *peer != id);
        info!(peer = id, "chain connection closed");
    }

    /// The routed peer, or any peer when there is no route.
    fn peer(&self, route: Option<PeerId>) -> Option<Arc<Peer>> {
        let peers = lock(&self.peers);
        match route {
            Some(id) => peers.iter().find(|p| p.id == id).cloned(),
            None => peers.first().cloned(),
        }
    }

    fn write(&self, peer: &Peer, msg: &DockerVmMessage) -> Result<()> {
        let mut w = lock(&peer.writer);
        write_frame(&mut *w, msg).with_context(|| format!("write to chain peer {}", peer.id))
    }

    /// Writes every scheduler response back to the peer its tx came from.
    pub fn pump_responses(
        self: &Arc<Self>,
        responses: mpsc::Receiver<DockerVmMessage>,
    ) -> Result<JoinHandle<()>> {
        let link = Arc::clone(self);
        thread::Builder::new()
            .name("cvm-chain-tx".to_string())
            .spawn(move || {
                for msg in responses {
                    let route = lock(&link.routes).remove(&msg.tx_id);
                    let Some(peer) = link.peer(route) else {
                        warn!(tx_id = %msg.tx_id, "no chain peer for response");
                        continue;
                    };
                    if let Err(err) = link.write(&peer, &msg) {
                        warn!(tx_id = %msg.tx_id, error = %format!("{err:#}"), "send response");
                    }
                }
                debug!("response channel closed");
            })
            .context("spawn chain response pump")
    }

    /// Sends `body` for `tx` and waits for the answer with the same `seq`.
    fn call(&self, chain_id: &str, tx_id: &str, route: Option<&str>, body: Body) -> Result<Body> {
        let route = route.and_then(|t| lock(&self.routes).get(t).copied());
        let Some(peer) = self.peer(route) else {
            bail!("no chain connection");
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut msg = DockerVmMessage::new(chain_id, tx_id, body);
        msg.seq = seq;
        let what = msg.msg_type();

        let (tx, rx) = mpsc::channel();
        lock(&self.pending).insert(seq, tx);
        if let Err(err) = self.write(&peer, &msg) {
            lock(&self.pending).remove(&seq);
            return Err(err);
        }
        match rx.recv_timeout(self.call_timeout) {
            Ok(DockerVmMessage {
                body: Body::Error(e),
                ..
            }) => bail!("{what} failed: {:?}: {}", e.code, e.message),
            Ok(reply) => Ok(reply.body),
            Err(_) => {
                lock(&self.pending).remove(&seq);
                bail!("{what} unanswered after {}ms", self.call_timeout.as_millis())
            }
        }
    }
}

/// Frames the chain sends unprompted; everything else answers a ledger call.
fn is_chain_request(body: &Body) -> bool {
    matches!(
        body,
        Body::TxRequest(_)
            | Body::DeployContractRequest(_)
            | Body::UpgradeContractRequest(_)
            | Body::FinishBlockRequest(_)
    )
}

/// [`Ledger`] served by the chain core over the link.
pub struct RemoteLedger {
    link: Arc<ChainLink>,
}

impl RemoteLedger {
    pub fn new(link: Arc<ChainLink>) -> Self {
        RemoteLedger { link }
    }

    fn tx_call(&self, tx: &TxContext, body: Body) -> Result<Body> {
        self.link
            .call(&tx.chain_id, &tx.tx_id, Some(&tx.original_tx_id), body)
    }
}

fn unexpected<T>(want: &str, got: &Body) -> Result<T> {
    bail!("expected {want}, chain answered {}", got.msg_type())
}

impl Ledger for RemoteLedger {
    fn get_state(
        &self,
        tx: &TxContext,
        contract_name: &str,
        key: &str,
        field: &str,
    ) -> Result<Option<Vec<u8>>> {
        let body = Body::GetStateRequest(GetStateRequest {
            contract_name: contract_name.to_string(),
            key: key.to_string(),
            field: field.to_string(),
        });
        match self.tx_call(tx, body)? {
            Body::GetStateResponse(r) => Ok(r.value),
            other => unexpected("GET_STATE_RESPONSE", &other),
        }
    }

    fn get_batch_state(&self, tx: &TxContext, keys: &[BatchKey]) -> Result<Vec<BatchValue>> {
        let body = Body::GetBatchStateRequest(GetBatchStateRequest {
            keys: keys.to_vec(),
        });
        match self.tx_call(tx, body)? {
            Body::GetBatchStateResponse(r) => Ok(r.values),
            other => unexpected("GET_BATCH_STATE_RESPONSE", &other),
        }
    }

    fn put_state(&self, tx: &TxContext, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let body = Body::PutStateRequest(PutStateRequest {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_vec(),
        });
        match self.tx_call(tx, body)? {
            Body::PutStateResponse => Ok(()),
            other => unexpected("PUT_STATE_RESPONSE", &other),
        }
    }

    fn emit_event(&self, tx: &TxContext, topic: &str, data: &[String]) -> Result<()> {
        let body = Body::EmitEventRequest(EmitEventRequest {
            topic: topic.to_string(),
            data: data.to_vec(),
        });
        match self.tx_call(tx, body)? {
            Body::EmitEventResponse => Ok(()),
            other => unexpected("EMIT_EVENT_RESPONSE", &other),
        }
    }

    fn create_kv_iterator(&self, tx: &TxContext, req: &CreateKvIteratorRequest) -> Result<u32> {
        match self.tx_call(tx, Body::CreateKvIteratorRequest(req.clone()))? {
            Body::CreateKvIteratorResponse(r) => Ok(r.iterator_id),
            other => unexpected("CREATE_KV_ITERATOR_RESPONSE", &other),
        }
    }

    fn consume_kv_iterator(
        &self,
        tx: &TxContext,
        iterator_id: u32,
        op: IteratorOp,
    ) -> Result<ConsumeKvIteratorResponse> {
        let body = Body::ConsumeKvIteratorRequest(ConsumeIteratorRequest { iterator_id, op });
        match self.tx_call(tx, body)? {
            Body::ConsumeKvIteratorResponse(r) => Ok(r),
            other => unexpected("CONSUME_KV_ITERATOR_RESPONSE", &other),
        }
    }

    fn create_key_history_iterator(
        &self,
        tx: &TxContext,
        req: &CreateKeyHistoryIteratorRequest,
    ) -> Result<u32> {
        match self.tx_call(tx, Body::CreateKeyHistoryIteratorRequest(req.clone()))? {
            Body::CreateKeyHistoryIteratorResponse(r) => Ok(r.iterator_id),
            other => unexpected("CREATE_KEY_HISTORY_ITERATOR_RESPONSE", &other),
        }
    }

    fn consume_key_history_iterator(
        &self,
        tx: &TxContext,
        iterator_id: u32,
        op: IteratorOp,
    ) -> Result<ConsumeKeyHistoryIteratorResponse> {
        let body = Body::ConsumeKeyHistoryIteratorRequest(ConsumeIteratorRequest { iterator_id, op });
        match self.tx_call(tx, body)? {
            Body::ConsumeKeyHistoryIteratorResponse(r) => Ok(r),
            other => unexpected("CONSUME_KEY_HISTORY_ITERATOR_RESPONSE", &other),
        }
    }

    fn get_sender_address(&self, tx: &TxContext) -> Result<String> {
        match self.tx_call(tx, Body::GetSenderAddressRequest)? {
            Body::GetSenderAddressResponse(r) => Ok(r.address),
            other => unexpected("GET_SENDER_ADDRESS_RESPONSE", &other),
        }
    }

    fn get_bytecode(&self, key: &ContractKey) -> Result<Option<Vec<u8>>> {
        let body = Body::LoadBytecodeRequest(ContractRef {
            contract_name: key.contract_name.clone(),
            contract_version: key.contract_version.clone(),
            index: key.index,
        });
        match self.link.call(&key.chain_id, "", None, body)? {
            Body::LoadBytecodeResponse(r) => Ok(r.bytecode),
            other => unexpected("LOAD_BYTECODE_RESPONSE", &other),
        }
    }

    fn get_contract_info(&self, chain_id: &str, contract_name: &str) -> Result<Option<ContractInfo>> {
        let body = Body::GetContractInfoRequest(ContractRef {
            contract_name: contract_name.to_string(),
            ..Default::default()
        });
        match self.link.call(chain_id, "", None, body)? {
            Body::GetContractInfoResponse(r) => Ok(r.info.map(|m| ContractInfo {
                contract_name: m.contract_name,
                contract_version: m.contract_version,
                index: m.index,
                runtime: m.runtime,
            })),
            other => unexpected("GET_CONTRACT_INFO_RESPONSE", &other),
        }
    }
}
