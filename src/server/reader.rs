//! Per-connection frame pump.
//!
//! Each accepted connection is driven by exactly one reader task that owns
//! the socket, so reads on a connection are serialised by construction.
//! The task frames the byte stream, routes KEEP_ALIVE pulses to the
//! connection's liveness stamp, enqueues everything else, and tears the
//! connection down on error, disconnect, or shutdown. Teardown always
//! removes the connection from the table before the socket is closed.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use log::{debug, error, warn};
use tokio::net::TcpStream;
use tokio_util::{codec::FramedRead, sync::CancellationToken, task::TaskTracker};

use crate::{
    codec::{FramingError, JsonObjectCodec},
    ingress::{BufferItem, IngressQueue},
    message::{CONNECTION_CLOSED_REASON, DECODE_FAILURE_REASON, Message, decode_message},
    metrics,
    session::{Connection, ConnectionTable},
};

pub(super) struct ReaderContext {
    pub queue: Arc<IngressQueue>,
    pub table: Arc<ConnectionTable>,
    pub shutdown: CancellationToken,
    pub max_frame_length: usize,
}

/// Spawn the reader task for a freshly accepted connection, logging and
/// containing any panics.
pub(super) fn spawn_reader_task(
    stream: TcpStream,
    conn: Arc<Connection>,
    ctx: ReaderContext,
    tracker: &TaskTracker,
) {
    tracker.spawn(async move {
        let peer = conn.peer();
        let table = Arc::clone(&ctx.table);
        let fut = AssertUnwindSafe(read_frames(stream, Arc::clone(&conn), ctx)).catch_unwind();

        if let Err(panic) = fut.await {
            metrics::inc_connection_panics();
            let panic_msg = format_panic(panic.as_ref());
            error!("reader task panicked: panic={panic_msg}, peer_addr={peer}");
            // The connection must not outlive its reader.
            destroy_connection(&table, &conn);
        }
    });
}

fn format_panic(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string payload>".to_owned())
}

async fn read_frames(stream: TcpStream, conn: Arc<Connection>, ctx: ReaderContext) {
    let peer = conn.peer();
    let mut frames = FramedRead::new(stream, JsonObjectCodec::new(ctx.max_frame_length));

    loop {
        let next = tokio::select! {
            biased;

            () = ctx.shutdown.cancelled() => {
                destroy_connection(&ctx.table, &conn);
                return;
            }
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => route_frame(&frame, &conn, &ctx.queue),
            Some(Err(err)) => {
                match FramingError::from_io(&err) {
                    // A disconnect mid-frame is still a disconnect: the
                    // partial frame is discarded, the close is reported.
                    Some(FramingError::TruncatedFrame { have }) => {
                        debug!("peer={peer} disconnected mid-frame: have={have}");
                        metrics::inc_ingress_errors();
                        report_close(&conn, &ctx.queue);
                    }
                    // Protocol misuse; torn down without a synthetic item.
                    Some(framing) => {
                        debug!("framing error from peer={peer}: error={framing}");
                        metrics::inc_ingress_errors();
                    }
                    None => warn!("read error from peer={peer}: error={err}"),
                }
                destroy_connection(&ctx.table, &conn);
                return;
            }
            None => {
                debug!("peer={peer} closed the connection");
                report_close(&conn, &ctx.queue);
                destroy_connection(&ctx.table, &conn);
                return;
            }
        }
    }
}

/// Decode one frame and route it: KEEP_ALIVE refreshes the liveness stamp
/// and is discarded, everything else lands on the ingress queue.
fn route_frame(frame: &Bytes, conn: &Connection, queue: &IngressQueue) {
    match decode_message(frame) {
        Ok(Message::KeepAlive) => conn.refresh_keep_alive(),
        Ok(message) => {
            metrics::inc_frames_ingressed();
            enqueue(queue, BufferItem::new(message, conn.peer()));
        }
        Err(err) => {
            debug!("decode error from peer={}: error={err}", conn.peer());
            metrics::inc_ingress_errors();
            enqueue(
                queue,
                BufferItem::new(Message::software_error(DECODE_FAILURE_REASON), conn.peer()),
            );
        }
    }
}

fn enqueue(queue: &IngressQueue, item: BufferItem) {
    if let Err(err) = queue.push(item) {
        debug!("ingress item dropped: error={err}");
    }
}

fn report_close(conn: &Connection, queue: &IngressQueue) {
    enqueue(
        queue,
        BufferItem::new(
            Message::software_error(CONNECTION_CLOSED_REASON),
            conn.peer(),
        ),
    );
}

/// Tear a connection down: table removal first, then the state transitions.
/// The socket itself closes when the owning task drops its framed stream.
fn destroy_connection(table: &ConnectionTable, conn: &Connection) {
    if table.remove(conn.id()).is_some() {
        conn.begin_close();
        conn.mark_closed();
        metrics::dec_connections();
    }
}
