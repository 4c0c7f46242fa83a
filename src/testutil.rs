//! In-process scripted TCP peers for exercising session clients.
//!
//! A `ScriptedPeer` binds a loopback listener and replays a fixed script:
//! one entry per inbound frame. Connections are accepted forever, each
//! replaying the script from the start, which lets reconnect tests reuse
//! one peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::frame;

/// What the peer does after reading one inbound frame.
#[derive(Clone)]
pub(crate) enum Reply {
    /// Stay silent (the inbound frame was fire-and-forget).
    None,
    /// Answer with one frame.
    Send(u8, String),
    /// Answer with several frames at once.
    SendAll(Vec<(u8, String)>),
    /// Write raw bytes, bypassing the codec.
    Raw(Vec<u8>),
    /// Drop the connection.
    Hangup,
}

/// Shorthand for `Reply::Send`.
pub(crate) fn send(tag: u8, body: &str) -> Reply {
    Reply::Send(tag, body.to_string())
}

pub(crate) struct ScriptedPeer {
    pub addr: SocketAddr,
    frames_seen: Arc<AtomicUsize>,
}

impl ScriptedPeer {
    pub async fn spawn(script: Vec<Reply>) -> ScriptedPeer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frames_seen = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&frames_seen);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let script = script.clone();
                let seen = Arc::clone(&seen);
                tokio::spawn(async move { serve(stream, script, seen).await });
            }
        });

        ScriptedPeer { addr, frames_seen }
    }

    /// Total frames received across all connections to this peer.
    pub fn frames_seen(&self) -> usize {
        self.frames_seen.load(Ordering::SeqCst)
    }
}

async fn serve(mut stream: TcpStream, script: Vec<Reply>, seen: Arc<AtomicUsize>) {
    let mut buf = BytesMut::new();
    let mut next = 0usize;
    loop {
        while let Ok(Some(_)) = frame::decode(&mut buf) {
            seen.fetch_add(1, Ordering::SeqCst);
            let action = script.get(next).cloned().unwrap_or(Reply::None);
            next += 1;
            match action {
                Reply::None => {}
                Reply::Send(tag, body) => {
                    let bytes = frame::encode(tag, &body).unwrap();
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Reply::SendAll(frames) => {
                    for (tag, body) in frames {
                        let bytes = frame::encode(tag, &body).unwrap();
                        if stream.write_all(&bytes).await.is_err() {
                            return;
                        }
                    }
                }
                Reply::Raw(bytes) => {
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Reply::Hangup => return,
            }
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
