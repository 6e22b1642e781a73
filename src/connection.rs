use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::message::Message;
use crate::protocol::ServerLine;
use crate::registry::Registry;
use crate::sink::{self, Sink, Slot};
use crate::types::ScreenName;

// Typestate: the session lifecycle encoded as types.
//
// Connection<Naming> → Connection<Active>
//
// Only an `Active` connection can dispatch chat lines, and it can only
// be produced by a successful handshake. There is no `Closed` type: a
// connection is closed when its value is dropped.

/// Marker: accepted, negotiating a screen name.
pub struct Naming;

/// State of a connection that holds a published name.
pub struct Active {
    membership: Membership,
}

/// A connection in a particular state.
///
/// The reader half is owned here; the write half belongs to the writer
/// task behind `sink`. Other sessions only ever see the sink.
pub struct Connection<S> {
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    sink: Sink,
    buf: Vec<u8>,
    line: String,
    max_line_len: usize,
    state: S,
}

impl<S> Connection<S> {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read the next line without its terminator. `None` means the peer
    /// closed the stream or the writer task has stopped.
    ///
    /// Bytes that are not UTF-8 are replaced with U+FFFD. A line longer
    /// than `max_line_len` is an error.
    async fn read_line(&mut self) -> Result<Option<&str>, ChatError> {
        self.buf.clear();
        // Room for the longest line plus "\r\n".
        let limit = self.max_line_len as u64 + 2;
        let mut limited = (&mut self.reader).take(limit);
        let bytes = tokio::select! {
            read = limited.read_until(b'\n', &mut self.buf) => read?,
            () = self.sink.closed() => return Ok(None),
        };
        if bytes == 0 {
            return Ok(None);
        }
        if bytes as u64 == limit && self.buf.last() != Some(&b'\n') {
            return Err(ChatError::LineTooLong(self.max_line_len));
        }

        let line = self.buf.as_slice();
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        self.line = String::from_utf8_lossy(line).into_owned();
        Ok(Some(self.line.as_str()))
    }

    /// Queue a line for this connection's own peer, waiting for room. A
    /// failure here means the session is dead.
    async fn send(&self, line: ServerLine) -> Result<(), ChatError> {
        self.sink.send(line).await?;
        Ok(())
    }
}

impl Connection<Naming> {
    /// Split the stream and start the writer task.
    pub fn new(stream: TcpStream, config: &ServerConfig) -> Result<Self, ChatError> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (sink, outlet) = Sink::channel(config.sink_capacity, config.write_timeout);
        sink::spawn_writer(outlet, writer, config.write_timeout, peer);

        Ok(Self {
            peer,
            reader: BufReader::new(reader),
            sink,
            buf: Vec::new(),
            line: String::new(),
            max_line_len: config.max_line_len,
            state: Naming,
        })
    }

    /// Prompt for names until one is claimed.
    ///
    /// Returns `Ok(None)` if the peer leaves first; such a session was
    /// never published and needs no registry cleanup.
    pub async fn negotiate(
        mut self,
        registry: &Arc<Registry>,
        max_name_len: usize,
    ) -> Result<Option<Connection<Active>>, ChatError> {
        loop {
            self.send(ServerLine::SubmitName).await?;

            let Some(proposed) = self.read_line().await? else {
                return Ok(None);
            };
            let name = match ScreenName::parse(proposed, max_name_len) {
                Ok(name) => name,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "name rejected");
                    continue;
                }
            };

            let slot = self.sink.reserve().await?;
            let Some(membership) = admit(registry, &name, &self.sink, slot) else {
                debug!(peer = %self.peer, %name, "name taken");
                continue;
            };

            info!(peer = %self.peer, %name, online = registry.len(), "name accepted");
            return Ok(Some(Connection {
                peer: self.peer,
                reader: self.reader,
                sink: self.sink,
                buf: self.buf,
                line: self.line,
                max_line_len: self.max_line_len,
                state: Active { membership },
            }));
        }
    }
}

/// Claim `name`, greet the new session and announce it, all while the
/// claim holds the registry lock.
///
/// The new session gets `NAMEACCEPTED` and one `ENTERCLIENT` per peer
/// already present, as one entry in the slot reserved beforehand. Each
/// peer gets a join notice and an `ENTERCLIENT` for the newcomer.
fn admit(
    registry: &Arc<Registry>,
    name: &ScreenName,
    sink: &Sink,
    slot: Slot<'_>,
) -> Option<Membership> {
    let claim = registry.try_claim(name)?;
    let peers = claim.peers();

    let mut greeting = Vec::with_capacity(peers.len() + 1);
    greeting.push(ServerLine::NameAccepted);
    greeting.extend(peers.iter().map(|peer| ServerLine::EnterClient(peer.name.clone())));
    slot.send_all(greeting);

    let notices = vec![ServerLine::joined(name), ServerLine::EnterClient(name.clone())];
    for peer in &peers {
        if let Err(e) = peer.sink.deliver_all(notices.clone()) {
            debug!(name = %peer.name, error = %e, "join notice not delivered");
        }
    }

    claim.publish(sink.clone());
    Some(Membership {
        registry: Arc::clone(registry),
        name: name.clone(),
    })
}

impl Connection<Active> {
    pub fn name(&self) -> &ScreenName {
        &self.state.membership.name
    }

    /// Route every line from the peer until it disconnects.
    ///
    /// Consuming `self` means the membership is released on every exit,
    /// error or not. Lines to the sender's own sink wait for room, so a
    /// burst from one client is paced by how fast it reads.
    pub async fn dispatch(mut self) -> Result<(), ChatError> {
        let registry = Arc::clone(&self.state.membership.registry);
        let name = self.name().clone();
        let own = self.sink.clone();

        while let Some(line) = self.read_line().await? {
            let message = Message::classify(&name, line);
            let rendered = message.render();
            match message {
                Message::Broadcast { .. } => {
                    let delivery = registry.broadcast(&rendered).await;
                    if let Some(err) = delivery.failure_for(&name) {
                        return Err(err.into());
                    }
                    debug!(%name, delivered = delivery.delivered, "broadcast");
                }
                Message::Private { receiver, .. } => match registry.lookup(receiver) {
                    Some(target) => {
                        debug!(%name, receiver, "private message");
                        if let Err(e) = target.send(rendered.clone()).await {
                            debug!(%name, receiver, error = %e, "private message not delivered");
                        }
                        own.send(rendered).await?;
                    }
                    None => {
                        debug!(%name, receiver, "private message to unknown name");
                        own.send(ServerLine::not_found(receiver)).await?;
                    }
                },
            }
        }
        Ok(())
    }
}

/// RAII: a published name. Dropping it releases the name and announces
/// the departure to the remaining sessions in one critical section.
/// Runs on normal exit, on error and on panic unwind alike.
struct Membership {
    registry: Arc<Registry>,
    name: ScreenName,
}

impl Drop for Membership {
    fn drop(&mut self) {
        let notices = [
            ServerLine::left(&self.name),
            ServerLine::LeaveClient(self.name.clone()),
        ];
        if self.registry.release(&self.name, &notices) {
            info!(name = %self.name, "left the chat");
        }
    }
}
