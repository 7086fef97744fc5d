// SPDX-License-Identifier: BSD-3-Clause

//! End-to-end FTP session tests driven over real loopback TCP sockets.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use ftpd::config::{self, Config};
use ftpd::Server;

/// Start a server on an ephemeral port in a background thread and return a
/// connected control-channel stream plus the greeting already drained.
fn start_server(user: &str, pass: &str) -> (TcpStream, u16) {
    let cfg = Config::new(user.to_string(), pass.to_string(), 0);
    let shared = config::shared(cfg);
    let mut server = Server::new(shared).expect("bind server");
    let port = server.local_port();

    thread::spawn(move || {
        let _ = server.run();
    });

    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            return (stream, port);
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server never accepted a connection");
}

fn send(stream: &mut TcpStream, line: &str) {
    write!(stream, "{line}\r\n").unwrap();
}

fn read_reply(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();

    // multi-line replies start "NNN-" and end with a final "NNN " line.
    if line.len() > 3 && line.as_bytes()[3] == b'-' {
        let code = line[..3].to_string();
        loop {
            let mut next = String::new();
            reader.read_line(&mut next).unwrap();
            line.push_str(&next);
            if next.starts_with(&code) && next.as_bytes().get(3) == Some(&b' ') {
                break;
            }
        }
    }
    line
}

fn login(reader: &mut BufReader<TcpStream>) {
    let greeting = read_reply(reader);
    assert!(greeting.starts_with("220"), "unexpected greeting: {greeting}");
    send(reader.get_mut(), "USER anon");
    let reply = read_reply(reader);
    assert!(reply.starts_with("230") || reply.starts_with("331"), "{reply}");
    if reply.starts_with("331") {
        send(reader.get_mut(), "PASS x");
        let reply = read_reply(reader);
        assert!(reply.starts_with("230"), "{reply}");
    }
}

#[test]
fn anonymous_login_pwd_cwd_quit() {
    let (stream, _port) = start_server("", "");
    let mut reader = BufReader::new(stream);
    login(&mut reader);

    send(reader.get_mut(), "PWD");
    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("257"), "{reply}");
    assert!(reply.contains("\"/\""), "{reply}");

    send(reader.get_mut(), "CWD /");
    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("200"), "{reply}");

    send(reader.get_mut(), "QUIT");
    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("221"), "{reply}");
}

#[test]
fn pasv_list_of_empty_directory() {
    let dir = tempfile::tempdir().unwrap();

    let (stream, _port) = start_server("", "");
    let mut reader = BufReader::new(stream);
    login(&mut reader);
    cwd(&mut reader, dir.path().to_str().unwrap());

    send(reader.get_mut(), "PASV");
    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("227"), "{reply}");
    let data_port = parse_pasv_port(&reply);

    let mut data = TcpStream::connect(("127.0.0.1", data_port)).unwrap();

    send(reader.get_mut(), "LIST");
    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("150"), "{reply}");

    let mut listing = Vec::new();
    data.read_to_end(&mut listing).unwrap();
    assert!(listing.is_empty());

    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("226"), "{reply}");
}

#[test]
fn rest_then_retr_resumes_partial_download() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.bin"), b"0123456789").unwrap();

    let (stream, _port) = start_server("", "");
    let mut reader = BufReader::new(stream);
    login(&mut reader);
    cwd(&mut reader, dir.path().to_str().unwrap());

    send(reader.get_mut(), "PASV");
    let reply = read_reply(&mut reader);
    let data_port = parse_pasv_port(&reply);
    let mut data = TcpStream::connect(("127.0.0.1", data_port)).unwrap();

    send(reader.get_mut(), "REST 5");
    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("200"), "{reply}");

    send(reader.get_mut(), "RETR data.bin");
    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("150"), "{reply}");

    let mut body = Vec::new();
    data.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"56789");

    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("226"), "{reply}");
}

#[test]
fn rnfr_rnto_renames_then_repeat_rnto_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"x").unwrap();

    let (stream, _port) = start_server("", "");
    let mut reader = BufReader::new(stream);
    login(&mut reader);
    cwd(&mut reader, dir.path().to_str().unwrap());

    send(reader.get_mut(), "RNFR a.txt");
    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("350"), "{reply}");

    send(reader.get_mut(), "RNTO b.txt");
    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("250"), "{reply}");
    assert!(dir.path().join("b.txt").exists());

    send(reader.get_mut(), "RNTO c.txt");
    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("503"), "{reply}");
}

#[test]
fn retr_without_pasv_or_port_is_bad_sequence() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"x").unwrap();

    let (stream, _port) = start_server("", "");
    let mut reader = BufReader::new(stream);
    login(&mut reader);
    cwd(&mut reader, dir.path().to_str().unwrap());

    send(reader.get_mut(), "RETR a.txt");
    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("503"), "{reply}");
}

#[test]
fn mlst_reports_single_entry_over_the_control_channel() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

    let (stream, _port) = start_server("", "");
    let mut reader = BufReader::new(stream);
    login(&mut reader);
    cwd(&mut reader, dir.path().to_str().unwrap());

    send(reader.get_mut(), "MLST a.txt");
    let reply = read_reply(&mut reader);
    assert!(reply.starts_with("250"), "{reply}");
    assert!(reply.contains("Type=file;"));
    assert!(reply.contains("Size=5;"));
    assert!(reply.contains("a.txt"));
}

fn cwd(reader: &mut BufReader<TcpStream>, path: &str) {
    send(reader.get_mut(), &format!("CWD {path}"));
    let reply = read_reply(reader);
    assert!(reply.starts_with("200"), "{reply}");
}

fn parse_pasv_port(reply: &str) -> u16 {
    let start = reply.find('(').unwrap() + 1;
    let end = reply.find(')').unwrap();
    let fields: Vec<u16> = reply[start..end]
        .split(',')
        .map(|f| f.trim().parse().unwrap())
        .collect();
    (fields[4] << 8) | fields[5]
}
