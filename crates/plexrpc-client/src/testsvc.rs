//! In-process Unix-socket service for client tests
//!
//! Listens on a scratch socket, publishes a lookup map pointing
//! `echo.r.1` at it, and answers every request according to its [`Mode`].

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use plexrpc_core::packet::ResponseHeader;
use plexrpc_core::{decode_request_packet, Attributes, DecodedPacket, NetStringWriter, OsThreading};
use plexrpc_lookup::LookupWriter;

use crate::registry::set_threading_provider;

/// Key every test request uses
pub const ECHO_KEY: &str = "echo.ping.1.r";

static THREADING: Once = Once::new();

/// Install OS threading once for the whole test binary
pub fn init_threading() {
    THREADING.call_once(|| set_threading_provider(Box::new(OsThreading)));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reply with the request payload after the delay
    Echo(Duration),
    /// Echo one request per connection, then close it
    EchoOnce,
    /// Close the first `n` connections on arrival, echo on the rest
    CloseFirst(usize),
    /// Accept then close without reading
    Close,
    /// Reply with bytes that are not a packet
    Garbage,
    /// Send half a response, then close
    Partial,
    /// Reply with a service fault
    Fault(i32),
    /// Reply for a request id that was never sent
    WrongId,
    /// Read the request and never answer
    Silent,
}

static NEXT: AtomicUsize = AtomicUsize::new(0);

fn scratch(tag: &str, ext: &str) -> PathBuf {
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("plexrpc-svc-{}-{}-{}.{}", tag, std::process::id(), n, ext))
}

pub struct TestService {
    socket: PathBuf,
    map: PathBuf,
    stop: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
    listener: Option<JoinHandle<()>>,
}

impl TestService {
    pub fn start(tag: &str, mode: Mode) -> Self {
        Self::start_as(tag, mode, "echo.r.1")
    }

    /// Publish the service under `search_key` instead of `echo.r.1`
    pub fn start_as(tag: &str, mode: Mode, search_key: &str) -> Self {
        let socket = scratch(tag, "sock");
        let map = scratch(tag, "map");
        let listener = UnixListener::bind(&socket).unwrap();

        let mut writer = LookupWriter::new(&map);
        writer
            .build_from_pairs([(search_key, socket.to_str().unwrap())])
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let accepted = Arc::new(AtomicUsize::new(0));
        let handle = {
            let stop = Arc::clone(&stop);
            let accepted = Arc::clone(&accepted);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    let index = accepted.fetch_add(1, Ordering::AcqRel);
                    thread::spawn(move || serve(stream, mode, index));
                }
            })
        };

        TestService { socket, map, stop, accepted, listener: Some(handle) }
    }

    pub fn map_path(&self) -> &Path {
        &self.map
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::Acquire)
    }
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Wake the accept loop
        let _ = UnixStream::connect(&self.socket);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.socket);
        let _ = std::fs::remove_file(&self.map);
    }
}

fn serve(mut stream: UnixStream, mode: Mode, index: usize) {
    match mode {
        Mode::Close => return,
        Mode::CloseFirst(n) if index < n => return,
        _ => {}
    }

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        while let Ok(Some((packet, used))) = decode_request_packet(&buf) {
            let data = buf[packet.data.clone()].to_vec();
            buf.drain(..used);
            if !respond(&mut stream, &packet, &data, mode) {
                return;
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn response(packet: &DecodedPacket, request_id: u64, fault_code: i32, data: &[u8]) -> Vec<u8> {
    let mut pre = NetStringWriter::new();
    let mut post = NetStringWriter::new();
    ResponseHeader {
        request_id,
        client_name: &packet.client_name,
        service_name: "echo-svc",
        fault_code,
        fault_text: if fault_code != 0 { "service says no" } else { "" },
        data_len: data.len(),
    }
    .assemble(&mut pre, &mut post);
    [pre.as_bytes(), data, post.as_bytes()].concat()
}

/// False once the connection should close
fn respond(stream: &mut UnixStream, packet: &DecodedPacket, data: &[u8], mode: Mode) -> bool {
    let reply = match mode {
        Mode::Echo(delay) => {
            thread::sleep(delay);
            if packet.attributes.contains(Attributes::NO_WAIT) {
                return true;
            }
            response(packet, packet.request_id, 0, data)
        }
        Mode::CloseFirst(_) | Mode::EchoOnce => response(packet, packet.request_id, 0, data),
        Mode::Garbage => b"this is not a netstring".to_vec(),
        Mode::Partial => {
            let full = response(packet, packet.request_id, 0, data);
            full[..full.len() / 2].to_vec()
        }
        Mode::Fault(code) => response(packet, packet.request_id, code, data),
        Mode::WrongId => response(packet, packet.request_id + 1, 0, data),
        Mode::Silent => return true,
        Mode::Close => return false,
    };
    if stream.write_all(&reply).is_err() {
        return false;
    }
    !matches!(mode, Mode::Garbage | Mode::Partial | Mode::EchoOnce)
}
