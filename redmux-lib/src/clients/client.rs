//! Redis client implementation
//!
//! Provides an async connect and methods for issuing the supported commands,
//! all running over one multiplexed [`Connection`].

use crate::adapter::Collect;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, ErrorKind};
use crate::request::Request;
use crate::resp3::{Kind, OwnedNode};
use async_stream::try_stream;
use atoi::atoi;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, instrument};

/// Backed by a single multiplexed connection; cheap to share and safe to use
/// from concurrent tasks through [`Client::connection`].
pub struct Client {
    conn: Arc<Connection>,
    driver: JoinHandle<()>,
}

/// A client that has entered pub/sub mode.
///
/// Once clients subscribe to a channel, they may only perform pub/sub related
/// commands. The `Client` type is transitioned to a `Subscriber` type in order
/// to prevent non-pub/sub methods from being called.
pub struct Subscriber {
    client: Client,
    subscribed_channels: Vec<String>,
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone)]
pub struct Message {
    pub channel: String,
    pub content: Bytes,
}

impl Client {
    /// Establish a connection with the Redis server located at `host:port`.
    pub async fn connect(host: &str, port: u16) -> crate::Result<Client> {
        Client::connect_with(host, port, Config::default()).await
    }

    /// Like [`connect`](Client::connect), with explicit configuration.
    pub async fn connect_with(host: &str, port: u16, config: Config) -> crate::Result<Client> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|err| Error::io(ErrorKind::ConnectError, &err))?;
        let conn = Arc::new(Connection::with_config(config));

        let driver = {
            let conn = conn.clone();
            tokio::spawn(async move {
                if let Err(err) = conn.run_with(stream).await {
                    debug!(%err, "connection terminated");
                }
                // No reconnection at this level; whatever is still queued
                // must not wait for a handshake that will never come.
                conn.close();
            })
        };

        Ok(Client { conn, driver })
    }

    /// The underlying connection, for submitting raw [`Request`]s.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Ping the server, returning its echo.
    #[instrument(skip(self))]
    pub async fn ping(&mut self, msg: Option<Bytes>) -> crate::Result<Bytes> {
        let mut req = Request::new();
        match &msg {
            Some(msg) => req.push([b"PING".as_ref(), msg.as_ref()]),
            None => req.push([b"PING".as_ref()]),
        }

        let reply = self.exec_collect(&req).await?;
        match root(&reply)? {
            node if matches!(node.kind, Kind::SimpleString | Kind::BlobString) => {
                Ok(node.data.clone())
            }
            node => Err(unexpected(node)),
        }
    }

    /// Get the value of key.
    ///
    /// # return
    ///
    /// If the key does not exist the special value `None` is returned.
    #[instrument(skip(self))]
    pub async fn get(&mut self, key: &str) -> crate::Result<Option<Bytes>> {
        let mut req = Request::new();
        req.push([b"GET".as_ref(), key.as_bytes()]);
        debug!(request = ?req);

        let reply = self.exec_collect(&req).await?;
        match root(&reply)? {
            node if node.kind == Kind::Null => Ok(None),
            node if matches!(node.kind, Kind::SimpleString | Kind::BlobString) => {
                Ok(Some(node.data.clone()))
            }
            node => Err(unexpected(node)),
        }
    }

    /// Set `key` to hold the given `value`.
    ///
    /// If key already holds a value, it is overwritten. Any previous time to
    /// live associated with the key is discarded on successful SET operation.
    #[instrument(skip(self))]
    pub async fn set(&mut self, key: &str, value: Bytes) -> crate::Result<()> {
        self.set_cmd(key, value, None).await
    }

    /// Set `key` to hold the given `value`. The value expires after `expiration`.
    #[instrument(skip(self))]
    pub async fn set_expires(
        &mut self,
        key: &str,
        value: Bytes,
        expiration: Duration,
    ) -> crate::Result<()> {
        self.set_cmd(key, value, Some(expiration)).await
    }

    /// The core `SET` logic.
    async fn set_cmd(
        &mut self,
        key: &str,
        value: Bytes,
        expiration: Option<Duration>,
    ) -> crate::Result<()> {
        let mut req = Request::new();
        match expiration {
            Some(expiration) => {
                let ms = expiration.as_millis().to_string();
                req.push([
                    b"SET".as_ref(),
                    key.as_bytes(),
                    value.as_ref(),
                    b"PX".as_ref(),
                    ms.as_bytes(),
                ]);
            }
            None => req.push([b"SET".as_ref(), key.as_bytes(), value.as_ref()]),
        }

        let reply = self.exec_collect(&req).await?;
        match root(&reply)? {
            node if node.kind == Kind::SimpleString && &node.data[..] == b"OK" => Ok(()),
            node => Err(unexpected(node)),
        }
    }

    /// Publish `message` to the given `channel`.
    ///
    /// # Return
    ///
    /// Returns the number of subscribers currently listening on the channel.
    #[instrument(skip(self))]
    pub async fn publish(&mut self, channel: &str, message: Bytes) -> crate::Result<u64> {
        let mut req = Request::new();
        req.push([b"PUBLISH".as_ref(), channel.as_bytes(), message.as_ref()]);

        let reply = self.exec_collect(&req).await?;
        match root(&reply)? {
            node if node.kind == Kind::Number => {
                atoi::<u64>(&node.data).ok_or_else(|| unexpected(node))
            }
            node => Err(unexpected(node)),
        }
    }

    /// Subscribes the client to the given channels.
    ///
    /// Once a client issues a subscribe command, it may no longer issue any
    /// non-pub/sub commands. The function consumes `self` and returns a
    /// `Subscriber`.
    #[instrument(skip(self))]
    pub async fn subscribe(mut self, channels: Vec<String>) -> crate::Result<Subscriber> {
        self.do_subscribe(&channels).await?;

        Ok(Subscriber {
            client: self,
            subscribed_channels: channels,
        })
    }

    /// Issues `SUBSCRIBE` and waits for the per-channel confirmation pushes.
    async fn do_subscribe(&mut self, channels: &[String]) -> crate::Result<()> {
        let mut req = Request::new();
        let mut args: Vec<&[u8]> = vec![b"SUBSCRIBE"];
        args.extend(channels.iter().map(String::as_bytes));
        req.push(args);
        debug!(request = ?req);

        // The command itself produces no reply; the server confirms each
        // channel with a push.
        self.conn.exec(&req, Collect::new()).await?;
        for channel in channels {
            let (confirmation, _) = self.conn.receive_push(Collect::new()).await?;
            let nodes = confirmation.into_nodes();
            match push_parts(&nodes) {
                Some(("subscribe", confirmed, _)) if confirmed == channel.as_bytes() => {}
                _ => {
                    return Err(Error::with_detail(
                        ErrorKind::ProtocolError,
                        format!("unexpected subscribe confirmation for {channel}"),
                    ))
                }
            }
        }

        Ok(())
    }

    /// Closes the connection and waits for its driver task.
    pub async fn close(self) {
        self.conn.close();
        let _ = self.driver.await;
    }

    async fn exec_collect(&mut self, req: &Request) -> crate::Result<Vec<OwnedNode>> {
        let (reply, _) = self.conn.exec(req, Collect::new()).await?;
        Ok(reply.into_nodes())
    }
}

impl Subscriber {
    /// Returns the set of channels currently subscribed to.
    pub fn get_subscribed(&self) -> &[String] {
        &self.subscribed_channels
    }

    /// Receive the next message published on a subscribed channel, waiting if
    /// necessary.
    ///
    /// `None` indicates the subscription has been terminated.
    pub async fn next_message(&mut self) -> crate::Result<Option<Message>> {
        loop {
            let (push, _) = match self.client.conn.receive_push(Collect::new()).await {
                Ok(push) => push,
                Err(err) if err.kind() == ErrorKind::OperationAborted => return Ok(None),
                Err(err) => return Err(err),
            };
            let nodes = push.into_nodes();
            debug!(?nodes);

            match push_parts(&nodes) {
                Some(("message", channel, Some(content))) => {
                    return Ok(Some(Message {
                        channel: String::from_utf8_lossy(channel).into_owned(),
                        content: Bytes::copy_from_slice(content),
                    }));
                }
                // Late confirmations are bookkeeping, not messages.
                Some(("subscribe" | "unsubscribe", _, _)) => {}
                _ => {
                    return Err(Error::with_detail(
                        ErrorKind::ProtocolError,
                        "malformed pub/sub push",
                    ))
                }
            }
        }
    }

    /// Convert the subscriber into a `Stream` yielding new messages published
    /// on subscribed channels.
    pub fn into_stream(mut self) -> impl Stream<Item = crate::Result<Message>> {
        try_stream! {
            while let Some(message) = self.next_message().await? {
                yield message;
            }
        }
    }

    /// Subscribe to a list of new channels
    #[instrument(skip(self))]
    pub async fn subscribe(&mut self, channels: &[String]) -> crate::Result<()> {
        self.client.do_subscribe(channels).await?;

        self.subscribed_channels
            .extend(channels.iter().map(Clone::clone));

        Ok(())
    }

    /// Unsubscribe from a list of channels. An empty list unsubscribes from
    /// everything.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&mut self, channels: &[String]) -> crate::Result<()> {
        let mut req = Request::new();
        let mut args: Vec<&[u8]> = vec![b"UNSUBSCRIBE"];
        args.extend(channels.iter().map(String::as_bytes));
        req.push(args);

        self.client.conn.exec(&req, Collect::new()).await?;

        // The server acknowledges each removed channel with a push.
        let expected = if channels.is_empty() {
            self.subscribed_channels.len()
        } else {
            channels.len()
        };

        for _ in 0..expected {
            let (confirmation, _) = self.client.conn.receive_push(Collect::new()).await?;
            let nodes = confirmation.into_nodes();
            match push_parts(&nodes) {
                Some(("unsubscribe", channel, _)) => {
                    let len = self.subscribed_channels.len();
                    if len == 0 {
                        return Err(Error::with_detail(
                            ErrorKind::ProtocolError,
                            "unsubscribe confirmation without subscriptions",
                        ));
                    }
                    self.subscribed_channels
                        .retain(|subscribed| subscribed.as_bytes() != channel);
                    if self.subscribed_channels.len() != len - 1 {
                        return Err(Error::with_detail(
                            ErrorKind::ProtocolError,
                            "unsubscribe confirmation for an unknown channel",
                        ));
                    }
                }
                _ => {
                    return Err(Error::with_detail(
                        ErrorKind::ProtocolError,
                        "malformed unsubscribe confirmation",
                    ))
                }
            }
        }

        Ok(())
    }

    /// Closes the underlying connection.
    pub async fn close(self) {
        self.client.close().await;
    }
}

/// Splits a pub/sub push into `(kind, channel, payload)`.
///
/// The server shapes these as `[kind, channel, payload-or-count]` under a
/// push root.
fn push_parts<'a>(nodes: &'a [OwnedNode]) -> Option<(&'a str, &'a [u8], Option<&'a [u8]>)> {
    let root = nodes.first()?;
    if root.kind != Kind::Push || nodes.len() < 3 {
        return None;
    }
    let kind = std::str::from_utf8(&nodes[1].data).ok()?;
    let channel = &nodes[2].data[..];
    let payload = nodes.get(3).map(|node| &node.data[..]);
    Some((kind, channel, payload))
}

fn root(nodes: &[OwnedNode]) -> crate::Result<&OwnedNode> {
    nodes
        .first()
        .ok_or_else(|| Error::with_detail(ErrorKind::ProtocolError, "empty response"))
}

/// The response arrived, but not in a shape this command knows.
fn unexpected(node: &OwnedNode) -> Error {
    Error::with_detail(
        ErrorKind::ProtocolError,
        format!("unexpected {:?} response", node.kind),
    )
}
