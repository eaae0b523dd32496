//! Test doubles shared by the integration tests: a minimal SOCKS5 server,
//! a TCP echo server and a fake `ssh`.

#![allow(dead_code)]

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use claude_proxy::config::Profile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// No-auth SOCKS5 server that dials targets directly and records every
/// requested `host:port`.
pub struct SocksServer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl SocksServer {
    pub async fn start() -> Self {
        Self::serve(TcpListener::bind("127.0.0.1:0").await.unwrap())
    }

    pub fn serve(listener: TcpListener) -> Self {
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let _ = handle_socks(stream, log).await;
                });
            }
        });
        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for SocksServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_socks(mut client: TcpStream, log: Arc<Mutex<Vec<String>>>) -> io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    let mut head = [0u8; 4];
    client.read_exact(&mut head).await?;
    let host = match head[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            format!("[{}]", Ipv6Addr::from(ip))
        }
        _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "bad address type")),
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let target = format!("{host}:{}", u16::from_be_bytes(port));
    log.lock().unwrap().push(target.clone());

    match TcpStream::connect(&target).await {
        Ok(mut upstream) => {
            client.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        }
        Err(_) => {
            client.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
        }
    }
    Ok(())
}

/// Echoes every byte back on each accepted connection.
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// A loopback port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Send `CONNECT target` and return the response head plus the stream.
pub async fn connect_via(proxy: SocketAddr, target: &str) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    (String::from_utf8_lossy(&head).into_owned(), stream)
}

/// Write `payload` and read the same number of bytes back.
pub async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut back = vec![0u8; payload.len()];
    stream.read_exact(&mut back).await.unwrap();
    back
}

pub fn profile() -> Profile {
    Profile {
        id: "p-test".into(),
        name: "test".into(),
        host: "bastion.invalid".into(),
        port: 22,
        user: "dev".into(),
        ssh_args: Vec::new(),
        created_at: Utc::now(),
    }
}

#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// An `ssh` that records its arguments (one per line) in `args_file` and
/// then idles until killed.
#[cfg(unix)]
pub fn fake_ssh(dir: &Path, args_file: &Path) -> PathBuf {
    let path = dir.join("ssh");
    let tmp = args_file.with_extension("tmp");
    write_script(
        &path,
        &format!(
            "printf '%s\\n' \"$@\" > '{}' && mv '{}' '{}'\nexec sleep 30",
            tmp.display(),
            tmp.display(),
            args_file.display()
        ),
    );
    path
}

/// Wait for the fake ssh to record its arguments and return the SOCKS
/// port it was asked to open.
pub async fn wait_for_socks_port(args_file: &Path) -> u16 {
    for _ in 0..250 {
        if let Ok(text) = std::fs::read_to_string(args_file) {
            let args: Vec<&str> = text.lines().collect();
            if let Some(pos) = args.iter().position(|a| *a == "-D") {
                let forward = args[pos + 1];
                return forward.rsplit(':').next().unwrap().parse().unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("fake ssh never recorded its arguments");
}

/// Serve SOCKS on the port the fake ssh was asked for.
pub async fn serve_fake_forward(args_file: &Path) -> SocksServer {
    let port = wait_for_socks_port(args_file).await;
    SocksServer::serve(TcpListener::bind(("127.0.0.1", port)).await.unwrap())
}
