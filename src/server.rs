//! TCP listeners and per-connection loops for both protocols.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::connection::Protocol;
use crate::dispatch::Service;
use crate::error::KestrelResult;
use crate::mc_protocol;
use crate::resp::{self, RespFrame};
use crate::server_state::GlobalState;

pub async fn run_server(service: Arc<Service>) -> KestrelResult<()> {
    let addr = format!("{}:{}", service.config.bind, service.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("kestrel listening on {addr}");

    let mc_listener = if service.config.memcache_port > 0 {
        let mc_addr = format!("{}:{}", service.config.bind, service.config.memcache_port);
        let mc = TcpListener::bind(&mc_addr).await?;
        info!("memcached listener on {mc_addr}");
        Some(mc)
    } else {
        None
    };

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = result?;
                let service = service.clone();
                tokio::spawn(async move {
                    debug!("redis connection from {peer}");
                    if let Err(e) = handle_resp_connection(service, stream).await {
                        debug!("connection error from {peer}: {e}");
                    }
                    debug!("connection closed: {peer}");
                });
            }
            result = accept_opt(&mc_listener), if mc_listener.is_some() => {
                let (stream, peer) = result?;
                let service = service.clone();
                tokio::spawn(async move {
                    debug!("memcached connection from {peer}");
                    if let Err(e) = handle_mc_connection(service, stream).await {
                        debug!("connection error from {peer}: {e}");
                    }
                    debug!("connection closed: {peer}");
                });
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = service.shutdown.notified() => break,
        }
    }

    service.state.set_global_state(GlobalState::ShuttingDown);
    info!("shutting down");
    Ok(())
}

async fn accept_opt(listener: &Option<TcpListener>) -> io::Result<(TcpStream, std::net::SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

/// Multi-bulk frame -> argv. `None` marks a malformed command frame.
fn frame_to_args(frame: RespFrame) -> Option<Vec<Vec<u8>>> {
    match frame {
        RespFrame::Array(Some(items)) => items
            .into_iter()
            .map(|item| item.as_bytes().map(|b| b.to_vec()))
            .collect(),
        RespFrame::Array(None) => Some(Vec::new()),
        _ => None,
    }
}

async fn handle_resp_connection(service: Arc<Service>, mut stream: TcpStream) -> KestrelResult<()> {
    let mut ctx = service.new_conn_ctx(Protocol::Redis);
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        loop {
            match resp::decode(&mut buf) {
                Ok(Some(frame)) => {
                    let Some(args) = frame_to_args(frame) else {
                        stream
                            .write_all(b"-ERR Protocol error: expected bulk strings\r\n")
                            .await?;
                        return Ok(());
                    };
                    if args.is_empty() {
                        continue;
                    }
                    service.dispatch_command(args, &mut ctx);
                    let out = ctx.take_output();
                    if !out.is_empty() {
                        stream.write_all(&out).await?;
                    }
                    if ctx.should_close() {
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let line = format!("-{e}\r\n");
                    let _ = stream.write_all(line.as_bytes()).await;
                    return Ok(());
                }
            }
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

async fn handle_mc_connection(service: Arc<Service>, mut stream: TcpStream) -> KestrelResult<()> {
    let mut ctx = service.new_conn_ctx(Protocol::Memcache);
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        loop {
            match mc_protocol::parse(&mut buf) {
                Ok(Some(req)) => {
                    service.dispatch_mc(&req.cmd, &req.value, &mut ctx);
                    let out = ctx.take_output();
                    if req.cmd.noreply {
                        // Suppressed by protocol option; the reply was
                        // produced and discarded.
                    } else if !out.is_empty() {
                        stream.write_all(&out).await?;
                    }
                    if ctx.should_close() {
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    stream.write_all(e.to_string().as_bytes()).await?;
                    stream.write_all(b"\r\n").await?;
                }
            }
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}
