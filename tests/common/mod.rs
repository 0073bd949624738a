//! In-process RESP server for the store tests.
//!
//! Replies are written in two pieces with a short pause in between so the
//! client sees partial input. `KILL` closes the connection without a reply.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pluvio_bridge::executor::{clear_runtime, set_runtime, Runtime};

type Db = Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>;

pub struct TestServer {
    pub port: u16,
}

pub fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let db: Db = Arc::default();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                continue;
            };
            let db = db.clone();
            std::thread::spawn(move || serve(stream, db));
        }
    });
    TestServer { port }
}

pub fn block_on_runtime<F, T>(future: F) -> T
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    let runtime = Runtime::new(256);
    set_runtime(runtime.clone());
    let out = runtime.run(future);
    clear_runtime();
    out.expect("main task did not finish")
}

fn read_command(reader: &mut impl BufRead) -> Option<Vec<Vec<u8>>> {
    let mut line = String::new();
    if reader.read_line(&mut line).ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut data = vec![0; len + 2];
        reader.read_exact(&mut data).ok()?;
        data.truncate(len);
        args.push(data);
    }
    Some(args)
}

fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn execute(args: &[Vec<u8>], db: &Db) -> Option<Vec<u8>> {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    let reply = match (name.as_str(), args.len()) {
        ("KILL", _) => return None,
        ("PING", 1) => b"+PONG\r\n".to_vec(),
        ("ECHO", 2) => bulk(&args[1]),
        ("SET", 3) => {
            db.lock().unwrap().insert(args[1].clone(), args[2].clone());
            b"+OK\r\n".to_vec()
        }
        ("GET", 2) => match db.lock().unwrap().get(&args[1]) {
            Some(value) => bulk(value),
            None => b"$-1\r\n".to_vec(),
        },
        ("DEL", 2) => {
            let removed = db.lock().unwrap().remove(&args[1]).is_some() as i64;
            format!(":{}\r\n", removed).into_bytes()
        }
        ("INCR", 2) => {
            let mut db = db.lock().unwrap();
            let current = db
                .get(&args[1])
                .and_then(|v| std::str::from_utf8(v).ok()?.parse::<i64>().ok())
                .unwrap_or(0);
            db.insert(args[1].clone(), (current + 1).to_string().into_bytes());
            format!(":{}\r\n", current + 1).into_bytes()
        }
        ("TIME", 1) => {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
            let mut out = b"*2\r\n".to_vec();
            out.extend(bulk(now.as_secs().to_string().as_bytes()));
            out.extend(bulk(now.subsec_micros().to_string().as_bytes()));
            out
        }
        _ => format!("-ERR unknown command '{}'\r\n", name).into_bytes(),
    };
    Some(reply)
}

fn serve(stream: TcpStream, db: Db) {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    while let Some(args) = read_command(&mut reader) {
        if args.is_empty() {
            continue;
        }
        let Some(reply) = execute(&args, &db) else {
            return;
        };
        let (head, tail) = reply.split_at(reply.len() / 2);
        if writer.write_all(head).is_err() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
        if writer.write_all(tail).is_err() {
            return;
        }
    }
}
