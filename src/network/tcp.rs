// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! TCP node channel.
//!
//! This module provides an implementation of the [`NodeChannel`] trait for TCP.
//! It uses [`tokio::net::TcpStream`] under the hood, with one connection per command.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::trace;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{ChannelError, Command, NodeChannel};
use crate::config::ChannelConfig;

/// Implementation of the node channel over short-lived TCP connections.
///
/// Every call connects, writes the command, reads one reply and closes.
/// No state is kept between calls.
#[derive(Clone, Debug)]
pub struct TcpChannel {
    connect_timeout: Duration,
    response_timeout: Duration,
    response_idle: Duration,
    max_command_bytes: usize,
    receive_buffer_bytes: usize,
}

impl TcpChannel {
    /// Creates a new `TcpChannel` with the given limits and timeouts.
    #[must_use]
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
            response_idle: config.response_idle(),
            max_command_bytes: config.max_command_bytes,
            receive_buffer_bytes: config.receive_buffer_bytes,
        }
    }

    async fn read_response(&self, stream: &mut TcpStream) -> Result<String, ChannelError> {
        let mut buf = vec![0; self.receive_buffer_bytes];
        let mut filled = 0;
        loop {
            // wait long for the first bytes, then only until the node goes quiet
            let wait = if filled == 0 {
                self.response_timeout
            } else {
                self.response_idle
            };
            if filled == buf.len() {
                // a full buffer is fine as long as nothing follows
                let mut scratch = [0; 1];
                match timeout(wait, stream.read(&mut scratch)).await {
                    Ok(Ok(0)) | Err(_) => break,
                    Ok(Ok(_)) => return Err(ChannelError::ResponseTooLarge { max: buf.len() }),
                    Ok(Err(err)) => return Err(err.into()),
                }
            }
            match timeout(wait, stream.read(&mut buf[filled..])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) if filled > 0 => break,
                Err(_) => return Err(ChannelError::Timeout),
            }
        }
        buf.truncate(filled);
        let response = String::from_utf8(buf).map_err(|_| ChannelError::InvalidUtf8)?;
        Ok(response
            .trim_end_matches(['\0', '\r', '\n'])
            .to_owned())
    }
}

impl Default for TcpChannel {
    fn default() -> Self {
        Self::new(&ChannelConfig::default())
    }
}

#[async_trait]
impl NodeChannel for TcpChannel {
    async fn send(&self, command: &Command, to: SocketAddr) -> Result<String, ChannelError> {
        let message = command.to_string();
        if message.len() > self.max_command_bytes {
            return Err(ChannelError::CommandTooLarge {
                len: message.len(),
                max: self.max_command_bytes,
            });
        }

        let mut stream = timeout(self.connect_timeout, TcpStream::connect(to))
            .await
            .map_err(|_| ChannelError::Timeout)??;
        stream.write_all(message.as_bytes()).await?;
        trace!("sent '{}' to {to}", command.name());

        let response = self.read_response(&mut stream).await?;
        // dropping the stream closes the connection
        drop(stream);
        Ok(response)
    }

    fn max_command_bytes(&self) -> usize {
        self.max_command_bytes
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::network::MAX_COMMAND_BYTES;

    /// Spawns a server answering a single connection with `reply`.
    ///
    /// Resolves to the command that was received.
    async fn one_shot_server(reply: Vec<u8>) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0; MAX_COMMAND_BYTES];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&reply).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8(buf[..n].to_vec()).unwrap()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn request_response() {
        let (addr, server) = one_shot_server(b"1".to_vec()).await;
        let channel = TcpChannel::default();
        let response = channel.send(&Command::GetBlockCount, addr).await.unwrap();
        assert_eq!(response, "1");
        assert_eq!(server.await.unwrap(), "getBlockCount");
    }

    #[tokio::test]
    async fn trailing_newline_stripped() {
        let (addr, _server) = one_shot_server(b"abcdef\n".to_vec()).await;
        let channel = TcpChannel::default();
        let response = channel.send(&Command::PrintAddress, addr).await.unwrap();
        assert_eq!(response, "abcdef");
    }

    #[tokio::test]
    async fn empty_reply_is_not_an_error() {
        let (addr, _server) = one_shot_server(Vec::new()).await;
        let channel = TcpChannel::default();
        let response = channel.send(&Command::Generate, addr).await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn connection_refused() {
        // grab a free port, then close it again
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let channel = TcpChannel::default();
        let res = channel.send(&Command::GetBlockCount, addr).await;
        assert!(matches!(res, Err(ChannelError::Io(_))));
    }

    #[tokio::test]
    async fn command_too_large() {
        let channel = TcpChannel::default();
        let txids = vec!["f".repeat(64); 100];
        let addr = "127.0.0.1:1".parse().unwrap();
        let res = channel.send(&Command::ProposeBlock { txids }, addr).await;
        assert!(matches!(res, Err(ChannelError::CommandTooLarge { .. })));
    }

    #[tokio::test]
    async fn response_too_large() {
        let config = ChannelConfig {
            receive_buffer_bytes: 16,
            ..ChannelConfig::default()
        };
        let (addr, _server) = one_shot_server(vec![b'x'; 64]).await;
        let channel = TcpChannel::new(&config);
        let res = channel.send(&Command::PrintBlockchain, addr).await;
        assert!(matches!(res, Err(ChannelError::ResponseTooLarge { max: 16 })));
    }

    #[tokio::test]
    async fn response_filling_buffer() {
        let config = ChannelConfig {
            receive_buffer_bytes: 16,
            ..ChannelConfig::default()
        };
        let channel = TcpChannel::new(&config);

        let (addr, _server) = one_shot_server(vec![b'x'; 16]).await;
        let response = channel.send(&Command::PrintBlockchain, addr).await.unwrap();
        assert_eq!(response, "x".repeat(16));

        let (addr, _server) = one_shot_server(vec![b'x'; 17]).await;
        let res = channel.send(&Command::PrintBlockchain, addr).await;
        assert!(matches!(res, Err(ChannelError::ResponseTooLarge { max: 16 })));
    }

    #[tokio::test]
    async fn configured_command_limit() {
        let config = ChannelConfig {
            max_command_bytes: 20,
            ..ChannelConfig::default()
        };
        let channel = TcpChannel::new(&config);
        assert_eq!(channel.max_command_bytes(), 20);

        let (addr, server) = one_shot_server(b"ok".to_vec()).await;
        let fits = Command::ProposeBlock {
            txids: vec!["abcd".into()],
        };
        assert_eq!(channel.send(&fits, addr).await.unwrap(), "ok");
        assert_eq!(server.await.unwrap(), "proposeBlock {abcd}");

        let addr = "127.0.0.1:1".parse().unwrap();
        let too_long = Command::ProposeBlock {
            txids: vec!["abcdef".into()],
        };
        let res = channel.send(&too_long, addr).await;
        assert!(matches!(
            res,
            Err(ChannelError::CommandTooLarge { len: 21, max: 20 })
        ));
    }
}
