use std::future::Future;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::ChatError;
use crate::registry::Registry;

/// The listener side: owns the registry and hands each accepted stream
/// to its own task.
pub struct Server {
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn bind(&self) -> Result<TcpListener, ChatError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ChatError::Bind { addr, source })?;
        info!(addr = %listener.local_addr()?, "chat server listening");
        Ok(listener)
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Each connection runs in its own task, so a slow handshake never
    /// delays the next accept. An accept error ends the loop; errors
    /// inside a session are logged and stay inside that session.
    pub async fn run<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ChatError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!(online = self.registry.len(), "shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "accepted connection");

                    let registry = Arc::clone(&self.registry);
                    let config = Arc::clone(&self.config);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(registry, config, stream).await {
                            warn!(%peer, error = %e, "session ended with error");
                        }
                        debug!(%peer, "connection closed");
                    });
                }
            }
        }
    }
}

/// Handle a single client: handshake, then dispatch until disconnect.
pub async fn handle_client(
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
    stream: TcpStream,
) -> Result<(), ChatError> {
    let connection = Connection::new(stream, &config)?;
    let peer = connection.peer();

    let Some(active) = connection.negotiate(&registry, config.max_name_len).await? else {
        debug!(%peer, "left before choosing a name");
        return Ok(());
    };

    active.dispatch().await
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::config::ServerConfigBuilder;
    use crate::protocol::ServerLine;
    use crate::types::ScreenName;

    const READ_TIMEOUT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(200);

    struct TestServer {
        addr: SocketAddr,
        registry: Arc<Registry>,
        _stop: oneshot::Sender<()>,
    }

    async fn start() -> TestServer {
        start_with(ServerConfig::builder()).await
    }

    async fn start_with(builder: ServerConfigBuilder) -> TestServer {
        let config = builder.addr("127.0.0.1").port(0).build().unwrap();
        let server = Server::new(config);
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::clone(server.registry());
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(async move {
            server
                .run(listener, async {
                    let _ = stopped.await;
                })
                .await
        });
        TestServer {
            addr,
            registry,
            _stop: stop,
        }
    }

    struct Client {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        /// Connect and complete the handshake with `name`.
        async fn join(addr: SocketAddr, name: &str) -> Self {
            let mut client = Self::connect(addr).await;
            assert_eq!(client.recv().await, "SUBMITNAME");
            client.send(name).await;
            assert_eq!(client.recv().await, "NAMEACCEPTED");
            client
        }

        async fn send(&mut self, text: &str) {
            self.writer
                .write_all(format!("{text}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> String {
            timeout(READ_TIMEOUT, self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
                .expect("server closed the connection")
        }

        async fn recv_parsed(&mut self) -> ServerLine {
            self.recv().await.parse().unwrap()
        }

        /// The server has closed, or reset, this connection.
        async fn assert_closed(&mut self) {
            match timeout(READ_TIMEOUT, self.lines.next_line()).await {
                Ok(Ok(None)) | Ok(Err(_)) => {}
                Ok(Ok(Some(line))) => panic!("unexpected line: {line}"),
                Err(_) => panic!("connection still open"),
            }
        }

        async fn assert_quiet(&mut self) {
            if let Ok(line) = timeout(QUIET, self.lines.next_line()).await {
                panic!("unexpected line: {line:?}");
            }
        }
    }

    /// alice and bob, both through the join announcements.
    async fn alice_and_bob(addr: SocketAddr) -> (Client, Client) {
        let mut alice = Client::join(addr, "alice").await;
        let mut bob = Client::join(addr, "bob").await;
        assert_eq!(bob.recv().await, "ENTERCLIENTalice");
        assert_eq!(alice.recv().await, "MESSAGE bob has joined the Chat!");
        assert_eq!(alice.recv().await, "ENTERCLIENTbob");
        (alice, bob)
    }

    async fn wait_until_released(registry: &Registry, name: &str) {
        for _ in 0..100 {
            if !registry.contains(name) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("{name} was never released");
    }

    #[tokio::test]
    async fn duplicate_name_is_reprompted() {
        let server = start().await;
        let mut alice = Client::join(server.addr, "alice").await;

        let mut bob = Client::connect(server.addr).await;
        assert_eq!(bob.recv().await, "SUBMITNAME");
        bob.send("alice").await;
        assert_eq!(bob.recv().await, "SUBMITNAME");
        bob.send("bob").await;
        assert_eq!(bob.recv().await, "NAMEACCEPTED");
        assert_eq!(bob.recv().await, "ENTERCLIENTalice");

        assert_eq!(alice.recv().await, "MESSAGE bob has joined the Chat!");
        assert_eq!(alice.recv().await, "ENTERCLIENTbob");
        assert!(server.registry.is_consistent());
    }

    #[tokio::test]
    async fn invalid_names_are_reprompted() {
        let server = start().await;
        let mut client = Client::connect(server.addr).await;
        assert_eq!(client.recv().await, "SUBMITNAME");
        client.send("").await;
        assert_eq!(client.recv().await, "SUBMITNAME");
        client.send("a>>b").await;
        assert_eq!(client.recv().await, "SUBMITNAME");
        client.send("alice").await;
        assert_eq!(client.recv_parsed().await, ServerLine::NameAccepted);
    }

    #[tokio::test]
    async fn crlf_terminated_name_is_accepted() {
        let server = start().await;
        let mut client = Client::connect(server.addr).await;
        assert_eq!(client.recv().await, "SUBMITNAME");
        client.writer.write_all(b"alice\r\n").await.unwrap();
        assert_eq!(client.recv().await, "NAMEACCEPTED");
        assert!(server.registry.contains("alice"));
    }

    #[tokio::test]
    async fn abandoned_handshake_leaves_no_trace() {
        let server = start().await;
        let mut client = Client::connect(server.addr).await;
        assert_eq!(client.recv().await, "SUBMITNAME");
        drop(client);

        let mut alice = Client::join(server.addr, "alice").await;
        alice.assert_quiet().await;
        assert_eq!(server.registry.len(), 1);
    }

    #[tokio::test]
    async fn roster_replay_lists_everyone_but_the_newcomer() {
        let server = start().await;
        let (_alice, _bob) = alice_and_bob(server.addr).await;

        let mut carol = Client::join(server.addr, "carol").await;
        assert_eq!(carol.recv().await, "ENTERCLIENTalice");
        assert_eq!(carol.recv().await, "ENTERCLIENTbob");
        carol.assert_quiet().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_sender_and_peers() {
        let server = start().await;
        let (mut alice, mut bob) = alice_and_bob(server.addr).await;

        alice.send("hello").await;
        assert_eq!(alice.recv().await, "MESSAGE alice: hello");
        assert_eq!(bob.recv().await, "MESSAGE alice: hello");
    }

    #[tokio::test]
    async fn messages_from_one_sender_keep_their_order() {
        let server = start().await;
        let (mut alice, mut bob) = alice_and_bob(server.addr).await;

        for i in 0..20 {
            alice.send(&format!("line {i}")).await;
        }
        for i in 0..20 {
            assert_eq!(bob.recv().await, format!("MESSAGE alice: line {i}"));
        }
    }

    #[tokio::test]
    async fn burst_larger_than_the_queue_is_delivered_in_full() {
        let server = start().await;
        let (mut alice, mut bob) = alice_and_bob(server.addr).await;

        let burst: String = (0..200).map(|i| format!("line {i}\n")).collect();
        alice.writer.write_all(burst.as_bytes()).await.unwrap();

        for i in 0..200 {
            assert_eq!(alice.recv().await, format!("MESSAGE alice: line {i}"));
        }
        for i in 0..200 {
            assert_eq!(bob.recv().await, format!("MESSAGE alice: line {i}"));
        }
        alice.send("still here").await;
        assert_eq!(alice.recv().await, "MESSAGE alice: still here");
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let server = start().await;
        let (mut alice, mut bob) = alice_and_bob(server.addr).await;

        alice.writer.write_all(b"caf\xe9\n").await.unwrap();
        assert_eq!(alice.recv().await, "MESSAGE alice: caf\u{FFFD}");
        assert_eq!(bob.recv().await, "MESSAGE alice: caf\u{FFFD}");

        alice.send("still here").await;
        assert_eq!(bob.recv().await, "MESSAGE alice: still here");
    }

    #[tokio::test]
    async fn overlong_line_ends_only_that_session() {
        let server = start_with(ServerConfig::builder().max_name_len(8).max_line_len(16)).await;
        let (mut alice, mut bob) = alice_and_bob(server.addr).await;

        alice.send(&"x".repeat(40)).await;
        alice.assert_closed().await;
        assert_eq!(bob.recv().await, "MESSAGE alice has left the Chat!");
        assert_eq!(bob.recv().await, "LEAVECLIENTalice");

        bob.send("x".repeat(16).as_str()).await;
        assert_eq!(bob.recv().await, format!("MESSAGE bob: {}", "x".repeat(16)));
    }

    #[tokio::test]
    async fn private_message_reaches_receiver_and_echoes() {
        let server = start().await;
        let (mut alice, mut bob) = alice_and_bob(server.addr).await;
        let mut carol = Client::join(server.addr, "carol").await;
        carol.recv().await;
        carol.recv().await;
        for client in [&mut alice, &mut bob] {
            client.recv().await;
            client.recv().await;
        }

        alice.send("bob>>hi").await;
        assert_eq!(bob.recv().await, "MESSAGE  [Private]: bob>>hi");
        assert_eq!(alice.recv().await, "MESSAGE  [Private]: bob>>hi");
        carol.assert_quiet().await;
    }

    #[tokio::test]
    async fn private_message_to_self_is_delivered_as_receiver_and_echo() {
        let server = start().await;
        let (mut alice, mut bob) = alice_and_bob(server.addr).await;

        alice.send("alice>>note").await;
        assert_eq!(alice.recv().await, "MESSAGE  [Private]: alice>>note");
        assert_eq!(alice.recv().await, "MESSAGE  [Private]: alice>>note");
        alice.assert_quiet().await;
        bob.assert_quiet().await;
    }

    #[tokio::test]
    async fn unknown_receiver_only_notifies_sender() {
        let server = start().await;
        let (mut alice, mut bob) = alice_and_bob(server.addr).await;

        alice.send("carol>>hi").await;
        assert_eq!(alice.recv().await, "MESSAGE carol is not found");
        bob.assert_quiet().await;
    }

    #[tokio::test]
    async fn disconnect_is_announced_and_name_freed() {
        let server = start().await;
        let (mut alice, bob) = alice_and_bob(server.addr).await;

        drop(bob);
        assert_eq!(alice.recv().await, "MESSAGE bob has left the Chat!");
        assert_eq!(
            alice.recv_parsed().await,
            ServerLine::LeaveClient(ScreenName::parse("bob", 32).unwrap())
        );
        alice.assert_quiet().await;

        wait_until_released(&server.registry, "bob").await;
        let mut bob_again = Client::join(server.addr, "bob").await;
        assert_eq!(bob_again.recv().await, "ENTERCLIENTalice");
        assert!(server.registry.is_consistent());
    }

    #[tokio::test]
    async fn concurrent_handshakes_admit_one_owner_per_name() {
        let server = start().await;

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let addr = server.addr;
                tokio::spawn(async move {
                    let mut client = Client::connect(addr).await;
                    assert_eq!(client.recv().await, "SUBMITNAME");
                    client.send("alice").await;
                    let accepted = client.recv().await == "NAMEACCEPTED";
                    (accepted, client)
                })
            })
            .collect();

        let mut winners = 0;
        let mut clients = Vec::new();
        for attempt in attempts {
            let (accepted, client) = attempt.await.unwrap();
            if accepted {
                winners += 1;
            }
            clients.push(client);
        }
        assert_eq!(winners, 1);
        assert_eq!(server.registry.len(), 1);
    }
}
