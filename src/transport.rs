//! Message-framed connection between exactly two peers.
//!
//! One byte stream carries three independently ordered lanes: the control
//! lane used for change-set exchange and conflict resolution, and two virtual
//! lanes used concurrently during file transfer. A reader task demultiplexes
//! incoming frames into per-lane queues; a writer task serializes outgoing
//! frames from every lane onto the stream.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::errors::SyncError;
use crate::protocol::frame;
use crate::protocol_core::{
    build_frame_header, parse_frame_header, validate_frame_size, HEADER_LEN,
};

/// Fixed asymmetric role assigned to each peer when the connection is made.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offer,
    Answer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offer => f.write_str("offer"),
            Role::Answer => f.write_str("answer"),
        }
    }
}

/// Best-effort connection state notifications. Informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Closed,
    Failed(String),
}

type Outgoing = mpsc::Sender<(u8, Vec<u8>)>;

/// Frames queued for the writer across all lanes. Senders wait once it is
/// full, so the stream's write rate paces every lane.
const OUTGOING_DEPTH: usize = 8;

/// One ordered message stream of a connection.
///
/// Cloning a lane hands out another handle to the same stream. Only one task
/// should receive on a lane at a time, or messages are split between them.
#[derive(Clone)]
pub struct Lane {
    frame_type: u8,
    outgoing: Outgoing,
    incoming: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl Lane {
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let payload = payload.into();
        validate_frame_size(payload.len())?;
        self.outgoing
            .send((self.frame_type, payload))
            .await
            .map_err(|_| SyncError::Connection("connection writer has shut down".into()))?;
        Ok(())
    }

    pub async fn recv(&self) -> Result<Vec<u8>> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(payload) => Ok(payload),
            None => Err(SyncError::Connection("connection closed by peer".into()).into()),
        }
    }
}

pub struct Connection {
    role: Role,
    control: Lane,
    lane_1: Lane,
    lane_2: Lane,
    outgoing: Outgoing,
    state: watch::Receiver<ConnectionState>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Start the reader and writer tasks over `stream`. Must be called from
    /// within a Tokio runtime.
    pub fn new<S>(stream: S, role: Role) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let state_tx = Arc::new(state_tx);
        let (out_tx, out_rx) = mpsc::channel(OUTGOING_DEPTH);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (lane1_tx, lane1_rx) = mpsc::unbounded_channel();
        let (lane2_tx, lane2_rx) = mpsc::unbounded_channel();

        let routes = Routes {
            control: control_tx,
            lane_1: lane1_tx,
            lane_2: lane2_tx,
        };
        tokio::spawn(read_loop(read_half, routes, state_tx.clone()));
        let writer = tokio::spawn(write_loop(write_half, out_rx, state_tx));

        let lane = |frame_type, rx| Lane {
            frame_type,
            outgoing: out_tx.clone(),
            incoming: Arc::new(Mutex::new(rx)),
        };

        Connection {
            role,
            control: lane(frame::CONTROL, control_rx),
            lane_1: lane(frame::LANE_1, lane1_rx),
            lane_2: lane(frame::LANE_2, lane2_rx),
            outgoing: out_tx,
            state: state_rx,
            writer,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The physical channel, used before the transfer phase.
    pub fn control(&self) -> Lane {
        self.control.clone()
    }

    /// The two virtual channels used by the transfer phase.
    pub fn split(&self) -> (Lane, Lane) {
        (self.lane_1.clone(), self.lane_2.clone())
    }

    pub fn states(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Flush everything queued so far, tell the peer we are done and shut
    /// down the write side of the stream.
    pub async fn close(self) -> Result<()> {
        // Ignored if the writer already died; its failure is in the state stream
        let _ = self.outgoing.send((frame::CLOSE, Vec::new())).await;
        drop(self.outgoing);
        self.writer
            .await
            .map_err(|e| SyncError::Connection(format!("writer task failed: {e}")))?;
        if let ConnectionState::Failed(msg) = &*self.state.borrow() {
            return Err(SyncError::Connection(msg.clone()).into());
        }
        Ok(())
    }
}

/// In-memory connected pair: the first connection is the offeror.
pub fn pair() -> (Connection, Connection) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (
        Connection::new(a, Role::Offer),
        Connection::new(b, Role::Answer),
    )
}

struct Routes {
    control: mpsc::UnboundedSender<Vec<u8>>,
    lane_1: mpsc::UnboundedSender<Vec<u8>>,
    lane_2: mpsc::UnboundedSender<Vec<u8>>,
}

async fn read_loop<R>(mut reader: R, routes: Routes, state: Arc<watch::Sender<ConnectionState>>)
where
    R: AsyncRead + Unpin,
{
    match read_frames(&mut reader, &routes).await {
        Ok(()) => {
            state.send_if_modified(|s| {
                if *s == ConnectionState::Connected {
                    *s = ConnectionState::Closed;
                    true
                } else {
                    false
                }
            });
        }
        Err(e) => {
            state.send_replace(ConnectionState::Failed(format!("read: {e:#}")));
        }
    }
    // Dropping the routes wakes every pending receiver with a closed error
}

async fn read_frames<R>(reader: &mut R, routes: &Routes) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut hdr = [0u8; HEADER_LEN];
        match reader.read_exact(&mut hdr).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(SyncError::Connection(format!("frame header: {e}")).into()),
        }
        let (typ, len) = parse_frame_header(&hdr)?;
        let len = len as usize;
        validate_frame_size(len)?;

        let mut payload = vec![0u8; len];
        if len > 0 {
            reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| SyncError::Connection(format!("frame payload: {e}")))?;
        }

        let route = match typ {
            frame::CONTROL => &routes.control,
            frame::LANE_1 => &routes.lane_1,
            frame::LANE_2 => &routes.lane_2,
            frame::CLOSE => return Ok(()),
            other => {
                return Err(SyncError::Connection(format!("unknown frame type {other}")).into())
            }
        };
        // The local side may have stopped listening on a lane; that is not fatal
        let _ = route.send(payload);
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outgoing: mpsc::Receiver<(u8, Vec<u8>)>,
    state: Arc<watch::Sender<ConnectionState>>,
) where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = write_frames(&mut writer, &mut outgoing).await {
        state.send_replace(ConnectionState::Failed(format!("write: {e:#}")));
    }
}

async fn write_frames<W>(
    writer: &mut W,
    outgoing: &mut mpsc::Receiver<(u8, Vec<u8>)>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some((typ, payload)) = outgoing.recv().await {
        let hdr = build_frame_header(typ, payload.len() as u32);
        writer
            .write_all(&hdr)
            .await
            .map_err(|e| SyncError::Connection(format!("frame header: {e}")))?;
        if !payload.is_empty() {
            writer
                .write_all(&payload)
                .await
                .map_err(|e| SyncError::Connection(format!("frame payload: {e}")))?;
        }
        if typ == frame::CLOSE {
            break;
        }
    }
    writer
        .flush()
        .await
        .map_err(|e| SyncError::Connection(format!("flush: {e}")))?;
    writer
        .shutdown()
        .await
        .map_err(|e| SyncError::Connection(format!("shutdown: {e}")))?;
    Ok(())
}
