#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dushy_client::{Client, ClientConfig};

// ---- RESP framing helpers shared by the scripted and in-memory servers ----

pub fn read_command<R: BufRead>(reader: &mut R) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<()>> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    if data.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty"));
    }
    let mut value = 0usize;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    Ok(value)
}

pub fn resp_simple(msg: &str) -> Vec<u8> {
    format!("+{}\r\n", msg).into_bytes()
}

pub fn resp_error(msg: &str) -> Vec<u8> {
    format!("-{}\r\n", msg).into_bytes()
}

pub fn resp_integer(value: i64) -> Vec<u8> {
    format!(":{}\r\n", value).into_bytes()
}

pub fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = format!("${}\r\n", data.len()).into_bytes();
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn resp_aggregate(tag: u8, parts: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = vec![tag];
    buf.extend_from_slice(parts.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for part in parts {
        buf.extend_from_slice(part);
    }
    buf
}

pub fn write_frame(stream: &mut TcpStream, frame: &[u8]) {
    let _ = stream.write_all(frame);
    let _ = stream.flush();
}

// ---- scripted single-connection server ----

/// Serves one connection, handing each of the first `expected_commands`
/// commands to `handler`, then keeps the socket open until the client leaves.
pub fn spawn_server(
    expected_commands: usize,
    handler: fn(usize, Vec<Vec<u8>>, &mut TcpStream),
) -> (String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        for idx in 0..expected_commands {
            let args = match read_command(&mut reader) {
                Ok(args) => args,
                Err(_) => return,
            };
            handler(idx, args, &mut stream);
        }
        let mut rest = Vec::new();
        let _ = reader.read_to_end(&mut rest);
    });

    ("127.0.0.1".to_string(), port)
}

pub fn client_for(host: &str, port: u16) -> Client {
    let mut config = ClientConfig::new(host, port);
    config.connect_timeout = Some(Duration::from_secs(1));
    config.write_timeout = Some(Duration::from_secs(1));
    config.request_timeout = Some(Duration::from_secs(5));
    Client::with_config(config).expect("client")
}

/// Polls `condition` until it holds or two seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ---- in-memory server ----

#[derive(Default)]
struct Store {
    strings: HashMap<Vec<u8>, Vec<u8>>,
    lists: HashMap<Vec<u8>, VecDeque<Vec<u8>>>,
    sets: HashMap<Vec<u8>, HashSet<Vec<u8>>>,
    hashes: HashMap<Vec<u8>, HashMap<Vec<u8>, Vec<u8>>>,
}

#[derive(Clone)]
struct Subscriber {
    conn: usize,
    writer: Arc<Mutex<TcpStream>>,
    resp3: Arc<AtomicBool>,
}

#[derive(Default)]
struct ServerState {
    store: Mutex<Store>,
    channels: Mutex<HashMap<Vec<u8>, Vec<Subscriber>>>,
    next_conn: AtomicUsize,
}

/// Starts an in-memory server accepting any number of connections.
///
/// Like a stock server, a RESP2 connection in subscribed mode only accepts
/// SUBSCRIBE, UNSUBSCRIBE and PING; RESP3 connections accept everything.
pub fn spawn_store_server() -> (String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let state = Arc::new(ServerState::default());

    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(_) => return,
            };
            let state = state.clone();
            thread::spawn(move || serve(stream, state));
        }
    });

    ("127.0.0.1".to_string(), port)
}

fn serve(stream: TcpStream, state: Arc<ServerState>) {
    let conn = state.next_conn.fetch_add(1, Ordering::SeqCst);
    let writer = Arc::new(Mutex::new(stream.try_clone().expect("clone")));
    let resp3 = Arc::new(AtomicBool::new(false));
    let mut reader = BufReader::new(stream);

    while let Ok(args) = read_command(&mut reader) {
        let me = Subscriber {
            conn,
            writer: writer.clone(),
            resp3: resp3.clone(),
        };
        let reply = dispatch(&state, &me, &args);
        let mut out = writer.lock().unwrap();
        write_frame(&mut out, &reply);
    }

    let mut channels = state.channels.lock().unwrap();
    for subscribers in channels.values_mut() {
        subscribers.retain(|sub| sub.conn != conn);
    }
}

fn dispatch(state: &ServerState, me: &Subscriber, args: &[Vec<u8>]) -> Vec<u8> {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    let arity = |n: usize| args.len() >= n;
    let subscribed_mode = !me.resp3.load(Ordering::SeqCst)
        && subscription_count(&state.channels.lock().unwrap(), me.conn) > 0;
    if subscribed_mode {
        match name.as_str() {
            "SUBSCRIBE" | "UNSUBSCRIBE" => {}
            "PING" => return resp_aggregate(b'*', &[resp_bulk(b"pong"), resp_bulk(b"")]),
            _ => {
                return resp_error(&format!(
                    "ERR Can't execute '{}': only (P|S)SUBSCRIBE / (P|S)UNSUBSCRIBE / PING / QUIT / RESET are allowed in this context",
                    name.to_ascii_lowercase()
                ))
            }
        }
    }
    match name.as_str() {
        "PING" => resp_simple("PONG"),
        "HELLO" => {
            if args.get(1).map(|v| v.as_slice()) == Some(&b"3"[..]) {
                me.resp3.store(true, Ordering::SeqCst);
            }
            b"%1\r\n$5\r\nproto\r\n:3\r\n".to_vec()
        }
        "SET" if arity(3) => {
            let mut store = state.store.lock().unwrap();
            store.strings.insert(args[1].clone(), args[2].clone());
            resp_simple("OK")
        }
        "GET" if arity(2) => {
            let store = state.store.lock().unwrap();
            match store.strings.get(&args[1]) {
                Some(value) => resp_bulk(value),
                None => resp_null(),
            }
        }
        "LPUSH" | "RPUSH" if arity(3) => {
            let mut store = state.store.lock().unwrap();
            let list = store.lists.entry(args[1].clone()).or_default();
            for value in &args[2..] {
                if name == "LPUSH" {
                    list.push_front(value.clone());
                } else {
                    list.push_back(value.clone());
                }
            }
            resp_integer(list.len() as i64)
        }
        "LPOP" | "RPOP" if arity(2) => {
            let mut store = state.store.lock().unwrap();
            let popped = store.lists.get_mut(&args[1]).and_then(|list| {
                if name == "LPOP" {
                    list.pop_front()
                } else {
                    list.pop_back()
                }
            });
            match popped {
                Some(value) => resp_bulk(&value),
                None => resp_null(),
            }
        }
        "SADD" if arity(3) => {
            let mut store = state.store.lock().unwrap();
            let set = store.sets.entry(args[1].clone()).or_default();
            let added = args[2..].iter().filter(|m| set.insert((*m).clone())).count();
            resp_integer(added as i64)
        }
        "SMEMBERS" if arity(2) => {
            let store = state.store.lock().unwrap();
            let parts: Vec<Vec<u8>> = store
                .sets
                .get(&args[1])
                .map(|set| set.iter().map(|m| resp_bulk(m)).collect())
                .unwrap_or_default();
            resp_aggregate(b'*', &parts)
        }
        "HSET" if arity(4) => {
            let mut store = state.store.lock().unwrap();
            let hash = store.hashes.entry(args[1].clone()).or_default();
            let fresh = hash.insert(args[2].clone(), args[3].clone()).is_none();
            resp_integer(fresh as i64)
        }
        "HGET" if arity(3) => {
            let store = state.store.lock().unwrap();
            match store.hashes.get(&args[1]).and_then(|hash| hash.get(&args[2])) {
                Some(value) => resp_bulk(value),
                None => resp_null(),
            }
        }
        "SUBSCRIBE" if arity(2) => {
            let mut channels = state.channels.lock().unwrap();
            let subscribers = channels.entry(args[1].clone()).or_default();
            if !subscribers.iter().any(|sub| sub.conn == me.conn) {
                subscribers.push(me.clone());
            }
            let count = subscription_count(&channels, me.conn);
            ack(me, "subscribe", &args[1], count)
        }
        "UNSUBSCRIBE" if arity(2) => {
            let mut channels = state.channels.lock().unwrap();
            if let Some(subscribers) = channels.get_mut(&args[1]) {
                subscribers.retain(|sub| sub.conn != me.conn);
            }
            let count = subscription_count(&channels, me.conn);
            ack(me, "unsubscribe", &args[1], count)
        }
        "PUBLISH" if arity(3) => {
            let subscribers = state
                .channels
                .lock()
                .unwrap()
                .get(&args[1])
                .cloned()
                .unwrap_or_default();
            for sub in &subscribers {
                let tag = if sub.resp3.load(Ordering::SeqCst) { b'>' } else { b'*' };
                let frame = resp_aggregate(
                    tag,
                    &[resp_bulk(b"message"), resp_bulk(&args[1]), resp_bulk(&args[2])],
                );
                let mut out = sub.writer.lock().unwrap();
                write_frame(&mut out, &frame);
            }
            resp_integer(subscribers.len() as i64)
        }
        _ => resp_error("ERR unknown command or wrong number of arguments"),
    }
}

fn subscription_count(channels: &HashMap<Vec<u8>, Vec<Subscriber>>, conn: usize) -> i64 {
    channels
        .values()
        .filter(|subs| subs.iter().any(|sub| sub.conn == conn))
        .count() as i64
}

fn ack(me: &Subscriber, kind: &str, channel: &[u8], count: i64) -> Vec<u8> {
    let tag = if me.resp3.load(Ordering::SeqCst) { b'>' } else { b'*' };
    resp_aggregate(
        tag,
        &[resp_bulk(kind.as_bytes()), resp_bulk(channel), resp_integer(count)],
    )
}
