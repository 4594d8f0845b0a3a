//! # TCP Server
//!
//! Accept RESP connections, parse commands, and dispatch them to
//! `hkv_engine::facade::Engine`. A second listener on the replication port
//! speaks the PSYNC handshake for replicas; both share the same `Engine`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use hkv_common::HkvError;
use hkv_engine::engine::TtlStatus;
use hkv_engine::replication::{encode_sync_header, PsyncRequest, SyncResponse};
use hkv_engine::Engine;

use crate::metrics::Metrics;
use crate::protocol::{RespError, RespParser};

/// Handles a single RESP client connection.
pub async fn handle_connection(
    stream: TcpStream,
    engine: Arc<Engine>,
    metrics: Arc<Metrics>,
) -> std::io::Result<()> {
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut parser = RespParser::new();

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) => {
                    metrics.record_request_start();
                    let start = Instant::now();
                    let response = dispatch_command(&args, engine.as_ref());
                    metrics.record_request_end(start.elapsed());
                    if response.starts_with(b"-") {
                        metrics.record_error();
                    }
                    stream.write_all(&response).await?;
                }
                Ok(None) => break,
                Err(RespError::Protocol) => {
                    stream.write_all(&resp_error("protocol error")).await?;
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

/// Handles a single replication connection: reads one `PSYNC` line, replies
/// with the handshake header and (for a partial resync) the missing backlog
/// records, then closes. Streaming live writes past the handshake is out of
/// scope for this front door.
pub async fn handle_replication_connection(
    stream: TcpStream,
    engine: Arc<Engine>,
) -> std::io::Result<()> {
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(256);

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            return Ok(());
        }
        if let Some(pos) = find_crlf(&buffer) {
            let line = String::from_utf8_lossy(&buffer[..pos]).to_string();
            buffer.clear();

            let request = match PsyncRequest::parse(&line) {
                Ok(request) => request,
                Err(_) => {
                    stream.write_all(b"-ERR invalid PSYNC request\r\n").await?;
                    return Ok(());
                }
            };

            let response = engine
                .replication()
                .handle_sync_request(&request.repl_id, request.offset);
            let header = encode_sync_header(&response);
            stream.write_all(header.as_bytes()).await?;

            if let SyncResponse::Continue { records, .. } = response {
                for record in records {
                    let line = serde_json::to_string(&record).unwrap_or_default();
                    stream.write_all(line.as_bytes()).await?;
                    stream.write_all(b"\n").await?;
                }
            }

            return Ok(());
        }
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n").map(|p| p + 2)
}

fn dispatch_command(args: &[Vec<u8>], engine: &Engine) -> Vec<u8> {
    if args.is_empty() {
        return resp_error("empty command");
    }

    let cmd = &args[0];
    if eq_ignore_ascii_case(cmd, b"PING") {
        return handle_ping(args);
    }
    if eq_ignore_ascii_case(cmd, b"ECHO") {
        return handle_echo(args);
    }
    if eq_ignore_ascii_case(cmd, b"GET") {
        return handle_get(args, engine);
    }
    if eq_ignore_ascii_case(cmd, b"SET") {
        return handle_set(args, engine);
    }
    if eq_ignore_ascii_case(cmd, b"DEL") {
        return handle_del(args, engine);
    }
    if eq_ignore_ascii_case(cmd, b"EXISTS") {
        return handle_exists(args, engine);
    }
    if eq_ignore_ascii_case(cmd, b"EXPIRE") {
        return handle_expire(args, engine);
    }
    if eq_ignore_ascii_case(cmd, b"TTL") {
        return handle_ttl(args, engine);
    }
    if eq_ignore_ascii_case(cmd, b"KEYS") {
        return handle_keys(args, engine);
    }
    if eq_ignore_ascii_case(cmd, b"DBSIZE") {
        return handle_dbsize(args, engine);
    }
    if eq_ignore_ascii_case(cmd, b"FLUSHDB") {
        return handle_flushdb(args, engine);
    }
    if eq_ignore_ascii_case(cmd, b"SAVE") {
        return handle_save(args, engine);
    }
    if eq_ignore_ascii_case(cmd, b"COMMAND") {
        return handle_command(args);
    }
    if eq_ignore_ascii_case(cmd, b"INFO") {
        return handle_info(engine);
    }
    if eq_ignore_ascii_case(cmd, b"SHUTDOWN") {
        return handle_shutdown();
    }

    resp_error("unknown command")
}

fn handle_ping(args: &[Vec<u8>]) -> Vec<u8> {
    match args.len() {
        1 => resp_simple("PONG"),
        2 => resp_bulk(&args[1]),
        _ => resp_error("wrong number of arguments for PING"),
    }
}

fn handle_echo(args: &[Vec<u8>]) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for ECHO");
    }
    resp_bulk(&args[1])
}

fn handle_get(args: &[Vec<u8>], engine: &Engine) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for GET");
    }
    match engine.get(&args[1]).0 {
        Ok(Some(value)) => resp_bulk(&value),
        Ok(None) => resp_null(),
        Err(err) => resp_error(&err.to_string()),
    }
}

fn handle_set(args: &[Vec<u8>], engine: &Engine) -> Vec<u8> {
    if args.len() < 3 {
        return resp_error("wrong number of arguments for SET");
    }

    let key = args[1].clone();
    let value = args[2].clone();

    if args.len() == 3 {
        return match engine.set(key, value, None).0 {
            Ok(()) => resp_simple("OK"),
            Err(err) => resp_error(&err.to_string()),
        };
    }

    if args.len() == 5 && eq_ignore_ascii_case(&args[3], b"EX") {
        let seconds = match parse_u64(&args[4]) {
            Ok(value) => value,
            Err(resp) => return resp,
        };

        return match engine.set(key, value, Some(Duration::from_secs(seconds))).0 {
            Ok(()) => resp_simple("OK"),
            Err(err) => resp_error(&err.to_string()),
        };
    }

    resp_error("unsupported SET options")
}

fn handle_del(args: &[Vec<u8>], engine: &Engine) -> Vec<u8> {
    if args.len() < 2 {
        return resp_error("wrong number of arguments for DEL");
    }

    let mut removed = 0i64;
    for key in &args[1..] {
        match engine.delete(key).0 {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(err) => return resp_error(&err.to_string()),
        }
    }

    resp_integer(removed)
}

fn handle_exists(args: &[Vec<u8>], engine: &Engine) -> Vec<u8> {
    if args.len() < 2 {
        return resp_error("wrong number of arguments for EXISTS");
    }

    let mut count = 0i64;
    for key in &args[1..] {
        match engine.exists(key).0 {
            Ok(true) => count += 1,
            Ok(false) => {}
            Err(err) => return resp_error(&err.to_string()),
        }
    }
    resp_integer(count)
}

fn handle_expire(args: &[Vec<u8>], engine: &Engine) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for EXPIRE");
    }

    let seconds = match parse_u64(&args[2]) {
        Ok(value) => value,
        Err(resp) => return resp,
    };

    match engine.expire(&args[1], Duration::from_secs(seconds)).0 {
        Ok(()) => resp_integer(1),
        Err(err) if err == HkvError::NotFound => resp_integer(0),
        Err(err) => resp_error(&err.to_string()),
    }
}

fn handle_ttl(args: &[Vec<u8>], engine: &Engine) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for TTL");
    }

    match engine.ttl(&args[1]).0 {
        Ok(TtlStatus::Missing) => resp_integer(-2),
        Ok(TtlStatus::NoExpiry) => resp_integer(-1),
        Ok(TtlStatus::ExpiresIn(remaining)) => resp_integer(remaining.as_secs() as i64),
        Err(err) => resp_error(&err.to_string()),
    }
}

fn handle_keys(args: &[Vec<u8>], engine: &Engine) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for KEYS");
    }
    let (keys, _) = engine.keys(&args[1]);
    resp_array(&keys)
}

fn handle_dbsize(args: &[Vec<u8>], engine: &Engine) -> Vec<u8> {
    if args.len() != 1 {
        return resp_error("wrong number of arguments for DBSIZE");
    }
    resp_integer(engine.dbsize().0 as i64)
}

fn handle_flushdb(args: &[Vec<u8>], engine: &Engine) -> Vec<u8> {
    if args.len() != 1 {
        return resp_error("wrong number of arguments for FLUSHDB");
    }
    match engine.flushdb() {
        Ok(()) => resp_simple("OK"),
        Err(err) => resp_error(&err.to_string()),
    }
}

fn handle_save(args: &[Vec<u8>], engine: &Engine) -> Vec<u8> {
    if args.len() != 1 {
        return resp_error("wrong number of arguments for SAVE");
    }
    match engine.save() {
        Ok(()) => resp_simple("OK"),
        Err(err) => resp_error(&err.to_string()),
    }
}

fn handle_command(args: &[Vec<u8>]) -> Vec<u8> {
    if args.len() == 1 {
        return resp_array_of_strs(&[
            "PING", "ECHO", "GET", "SET", "DEL", "EXISTS", "EXPIRE", "TTL", "KEYS", "DBSIZE",
            "FLUSHDB", "SAVE", "COMMAND", "INFO", "SHUTDOWN",
        ]);
    }
    resp_array_of_strs(&[])
}

fn handle_shutdown() -> Vec<u8> {
    // A real SHUTDOWN closes the connection without a reply, matching RESP
    // servers' convention; the listener loop in main.rs owns the actual
    // process exit and graceful drain.
    Vec::new()
}

fn handle_info(engine: &Engine) -> Vec<u8> {
    let mut info = String::new();
    info.push_str("# Server\r\nengine:hybridkv\r\n\r\n");

    info.push_str("# Replication\r\n");
    info.push_str("role:master\r\n");
    info.push_str(&format!("master_repl_id:{}\r\n", engine.replication().repl_id()));
    info.push_str(&format!("master_repl_offset:{}\r\n", engine.replication().offset()));
    info.push_str(&format!(
        "repl_backlog_bytes:{}\r\n\r\n",
        engine.replication().backlog_size_bytes()
    ));

    info.push_str("# Memory\r\n");
    info.push_str(&format!("used_memory:{}\r\n\r\n", engine.memory_usage()));

    info.push_str("# Persistence\r\n");
    info.push_str(&format!(
        "aof_corruption_skipped:{}\r\n\r\n",
        engine.wal_corruption_skipped()
    ));

    info.push_str("# Latency\r\n");
    for (op, stats) in engine.latency_stats() {
        info.push_str(&format!(
            "{}_p50_us:{:.1},{}_p95_us:{:.1},{}_p99_us:{:.1}\r\n",
            op.as_str(),
            stats.p50_us,
            op.as_str(),
            stats.p95_us,
            op.as_str(),
            stats.p99_us
        ));
    }

    resp_bulk(info.as_bytes())
}

fn resp_simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.extend_from_slice(b"+");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_error(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 6);
    buf.extend_from_slice(b"-ERR ");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_integer(value: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b":");
    buf.extend_from_slice(value.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"$");
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

fn resp_array(items: &[std::sync::Arc<[u8]>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"*");
    buf.extend_from_slice(items.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for item in items {
        buf.extend_from_slice(&resp_bulk(item));
    }
    buf
}

fn resp_array_of_strs(items: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"*");
    buf.extend_from_slice(items.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for item in items {
        buf.extend_from_slice(&resp_bulk(item.as_bytes()));
    }
    buf
}

fn eq_ignore_ascii_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

fn parse_u64(arg: &[u8]) -> Result<u64, Vec<u8>> {
    if arg.is_empty() {
        return Err(resp_error("invalid integer"));
    }
    let mut value: u64 = 0;
    for &b in arg {
        if !b.is_ascii_digit() {
            return Err(resp_error("invalid integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
    }
    Ok(value)
}
