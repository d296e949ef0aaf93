//! Mock upstream servers for integration tests: a UDP socket and a TCP
//! listener on the same loopback port, answering through a shared responder.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use muninn::codec::{Message, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
}

/// Decides the reply for one decoded query; `None` swallows the query.
pub type Responder = Arc<dyn Fn(&Message, Proto) -> Option<Message> + Send + Sync>;

pub struct MockUpstream {
    pub addr: SocketAddr,
    udp_queries: Arc<AtomicUsize>,
    tcp_queries: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub fn udp_queries(&self) -> usize {
        self.udp_queries.load(Ordering::SeqCst)
    }

    pub fn tcp_queries(&self) -> usize {
        self.tcp_queries.load(Ordering::SeqCst)
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub fn udp_endpoint(&self) -> String {
        format!("udp://{}", self.addr)
    }

    pub fn tcp_endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

pub async fn spawn_upstream(responder: Responder) -> MockUpstream {
    let udp = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock UDP");
    let addr = udp.local_addr().expect("mock UDP addr");
    let tcp = TcpListener::bind(addr).await.expect("bind mock TCP");

    let udp_queries = Arc::new(AtomicUsize::new(0));
    let tcp_queries = Arc::new(AtomicUsize::new(0));

    {
        let responder = responder.clone();
        let udp_queries = udp_queries.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let Ok((len, peer)) = udp.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(query) = Message::decode(&buf[..len]) else {
                    continue;
                };
                udp_queries.fetch_add(1, Ordering::SeqCst);
                if let Some(response) = responder(&query, Proto::Udp) {
                    let bytes = response.encode().expect("encode mock response");
                    let _ = udp.send_to(&bytes, peer).await;
                }
            }
        });
    }

    {
        let responder = responder.clone();
        let tcp_queries = tcp_queries.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = tcp.accept().await else {
                    break;
                };
                let responder = responder.clone();
                let tcp_queries = tcp_queries.clone();
                tokio::spawn(async move {
                    loop {
                        let mut len_buf = [0u8; 2];
                        if stream.read_exact(&mut len_buf).await.is_err() {
                            break;
                        }
                        let len = u16::from_be_bytes(len_buf) as usize;
                        let mut frame = vec![0u8; len];
                        if stream.read_exact(&mut frame).await.is_err() {
                            break;
                        }
                        let Ok(query) = Message::decode(&frame) else {
                            break;
                        };
                        tcp_queries.fetch_add(1, Ordering::SeqCst);
                        if let Some(response) = responder(&query, Proto::Tcp) {
                            let bytes = response.encode().expect("encode mock response");
                            let mut out = Vec::with_capacity(bytes.len() + 2);
                            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                            out.extend_from_slice(&bytes);
                            let _ = stream.write_all(&out).await;
                        }
                    }
                });
            }
        });
    }

    MockUpstream {
        addr,
        udp_queries,
        tcp_queries,
    }
}

/// One-record answer echoing the query's name.
pub fn answer(query: &Message, rtype: RecordType, ttl: u32, data: &str) -> Message {
    let mut response = Message::response_to(query);
    let qname = query.questions[0].name();
    response
        .answers
        .push(Record::from_data(&qname, rtype, ttl, data).expect("build mock record"));
    response
}

pub fn nxdomain(query: &Message) -> Message {
    let mut response = Message::response_to(query);
    response.header.rcode = 3;
    response
}

pub fn truncated(query: &Message) -> Message {
    let mut response = Message::response_to(query);
    response.header.tc = true;
    response
}
