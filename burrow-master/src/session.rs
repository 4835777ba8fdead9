//! Per-client control session on the server.
//!
//! Header/body read loop: one byte of message code, then the fixed body for
//! that code. The first message must be HELLO; everything afterwards is
//! rendezvous traffic dispatched to the directory. Any protocol error
//! closes the session.

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};

use burrow_core::{Error, NodeId, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use burrow_rendezvous::protocol::Message;
use burrow_transport::conn::Connection;
use burrow_transport::opwatch::OpWatch;

/// Callbacks a session raises towards the directory.
pub trait SessionSink: Send + Sync + 'static {
    fn on_hello(&self, session: &Arc<ClientSession>, node_id: NodeId, probe: SocketAddrV4);
    fn on_message(&self, session: &Arc<ClientSession>, msg: Message);
    fn on_error(&self, session: &Arc<ClientSession>, err: Error);
}

struct SessionState {
    node_id: Option<NodeId>,
    registered: bool,
    closed: bool,
}

pub struct ClientSession {
    conn: Arc<Connection>,
    peer: SocketAddrV4,
    sink: Arc<dyn SessionSink>,
    state: Mutex<SessionState>,
    watch: OpWatch,
}

impl ClientSession {
    pub fn new(conn: Arc<Connection>, peer: SocketAddrV4, sink: Arc<dyn SessionSink>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            peer,
            sink,
            state: Mutex::new(SessionState {
                node_id: None,
                registered: false,
                closed: false,
            }),
            watch: OpWatch::new(),
        })
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.state.lock().ok().and_then(|st| st.node_id)
    }

    pub fn start(self: &Arc<Self>) {
        self.read_header();
    }

    pub fn send(&self, msg: &Message) {
        let bytes = msg.to_bytes();
        trace!("-> {} msg {:#04x}", self.peer, msg.code());
        self.conn.write(bytes, |res| {
            if let Err(e) = res {
                if !e.is_closed() {
                    warn!("control send failed: {e}");
                }
            }
        });
    }

    pub fn close(&self) {
        let first = match self.state.lock() {
            Ok(mut st) => !std::mem::replace(&mut st.closed, true),
            Err(_) => false,
        };
        if first {
            self.watch.close();
            self.conn.close();
        }
    }

    fn read_header(self: &Arc<Self>) {
        let this = self.clone();
        self.conn.read(
            1,
            true,
            self.watch.wrap1(move |res: Result<Bytes>| {
                this.on_header(res);
            }),
        );
    }

    fn on_header(self: &Arc<Self>, res: Result<Bytes>) {
        let header = match res {
            Ok(h) if h.len() == 1 => h,
            Ok(_) => {
                self.fail(Error::Closed);
                return;
            }
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        let code = header[0];
        let Some(body_len) = Message::body_len(code) else {
            warn!("bad msg code {code:#04x} from {}", self.peer);
            self.fail(Error::protocol(format!("bad msg code: {code:#04x}")));
            return;
        };
        let this = self.clone();
        self.conn.read(
            body_len,
            true,
            self.watch.wrap1(move |res: Result<Bytes>| {
                this.on_body(code, res);
            }),
        );
    }

    fn on_body(self: &Arc<Self>, code: u8, res: Result<Bytes>) {
        let body = match res {
            Ok(b) => b,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        let mut buf = BytesMut::with_capacity(1 + body.len());
        buf.put_u8(code);
        buf.extend_from_slice(&body);
        let msg = match Message::decode(&mut buf) {
            Ok(Some(msg)) => msg,
            _ => {
                warn!("malformed msg {code:#04x} from {}", self.peer);
                self.fail(Error::protocol("malformed control message"));
                return;
            }
        };

        let registered = self
            .state
            .lock()
            .map(|st| st.registered)
            .unwrap_or(false);

        match msg {
            Message::Hello {
                node_id,
                probe_ip,
                probe_port,
            } => {
                if registered {
                    self.fail(Error::protocol("duplicate HELLO"));
                    return;
                }
                {
                    let Ok(mut st) = self.state.lock() else {
                        return;
                    };
                    st.node_id = Some(node_id);
                    st.registered = true;
                }
                self.sink
                    .on_hello(self, node_id, SocketAddrV4::new(probe_ip, probe_port));
            }
            msg if !registered => {
                warn!(
                    "{} sent {:#04x} before HELLO",
                    self.peer,
                    msg.code()
                );
                self.fail(Error::protocol("expected HELLO first"));
                return;
            }
            msg => {
                self.sink.on_message(self, msg);
            }
        }

        self.read_header();
    }

    fn fail(self: &Arc<Self>, err: Error) {
        let was_open = match self.state.lock() {
            Ok(mut st) => !std::mem::replace(&mut st.closed, true),
            Err(_) => false,
        };
        if !was_open {
            return;
        }
        self.conn.close();
        self.sink.on_error(self, err);
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("peer", &self.peer)
            .field("node_id", &self.node_id())
            .finish()
    }
}
