//! Minimal interactive RESP client for poking at a running server.

use std::io::{self, BufRead, Write};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use kestrel::resp::{self, RespFrame};

#[tokio::main]
async fn main() -> io::Result<()> {
    let mut host = "127.0.0.1".to_string();
    let mut port = 6379u16;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--host" | "-h" => {
                if i + 1 < args.len() {
                    host = args[i + 1].clone();
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    if let Ok(p) = args[i + 1].parse() {
                        port = p;
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    let addr = format!("{host}:{port}");
    let mut stream = TcpStream::connect(&addr).await?;
    eprintln!("Connected to {addr}");

    let stdin = io::stdin();
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        print!("{addr}> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        let frame = RespFrame::Array(Some(
            tokens
                .iter()
                .map(|t| RespFrame::Bulk(Some(t.as_bytes().to_vec())))
                .collect(),
        ));
        let mut request = Vec::new();
        frame.encode(&mut request);
        stream.write_all(&request).await?;

        let reply = loop {
            match resp::decode(&mut buf) {
                Ok(Some(frame)) => break frame,
                Ok(None) => {
                    if stream.read_buf(&mut buf).await? == 0 {
                        eprintln!("server closed connection");
                        return Ok(());
                    }
                }
                Err(e) => {
                    eprintln!("protocol error: {e}");
                    return Ok(());
                }
            }
        };
        print_frame(&reply, 0);

        if tokens[0].eq_ignore_ascii_case("quit") {
            return Ok(());
        }
    }
}

fn print_frame(frame: &RespFrame, indent: usize) {
    let pad = "  ".repeat(indent);
    match frame {
        RespFrame::Simple(s) => println!("{pad}{s}"),
        RespFrame::Error(s) => println!("{pad}(error) {s}"),
        RespFrame::Integer(n) => println!("{pad}(integer) {n}"),
        RespFrame::Bulk(None) => println!("{pad}(nil)"),
        RespFrame::Bulk(Some(data)) => println!("{pad}\"{}\"", String::from_utf8_lossy(data)),
        RespFrame::Array(None) => println!("{pad}(nil array)"),
        RespFrame::Array(Some(items)) => {
            for (i, item) in items.iter().enumerate() {
                print!("{pad}{}) ", i + 1);
                match item {
                    RespFrame::Array(_) => {
                        println!();
                        print_frame(item, indent + 1);
                    }
                    _ => print_frame(item, 0),
                }
            }
            if items.is_empty() {
                println!("{pad}(empty array)");
            }
        }
    }
}
