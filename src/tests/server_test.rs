#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use parking_lot::Mutex;
    use tokio::{io::AsyncWriteExt, net::TcpStream};

    use crate::{
        tests::{peer_closed, read_exact, wait_until, EchoSession},
        OnCheckIp, TcpClient, TcpConfig, TcpConn, TcpServer, TcpSession, TcpSockError,
    };

    /// Server on an ephemeral port whose sessions echo, with counters for
    /// both callbacks.
    struct Fixture {
        server: TcpServer,
        connects: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
        peers: Arc<Mutex<Vec<(u64, SocketAddr)>>>,
        seen: Arc<Mutex<Vec<u8>>>,
    }

    impl Fixture {
        fn start(config: TcpConfig, on_check_ip: Option<OnCheckIp>, register: bool) -> Self {
            let connects = Arc::new(AtomicUsize::new(0));
            let disconnects = Arc::new(AtomicUsize::new(0));
            let peers = Arc::new(Mutex::new(Vec::new()));
            let seen = Arc::new(Mutex::new(Vec::new()));

            let (c, i, s) = (Arc::clone(&connects), Arc::clone(&peers), Arc::clone(&seen));
            let d = Arc::clone(&disconnects);
            let server = TcpServer::with_config(
                "127.0.0.1:0",
                config,
                move |conn: &Arc<TcpConn>| -> Option<Arc<dyn TcpSession>> {
                    c.fetch_add(1, Ordering::SeqCst);
                    if let Ok(peer) = conn.peer_addr() {
                        i.lock().push((conn.id(), peer));
                    }
                    register.then(|| EchoSession::shared(conn, true, Arc::clone(&s)))
                },
                move |_conn: &TcpConn| {
                    d.fetch_add(1, Ordering::SeqCst);
                },
                on_check_ip,
            );
            server.serve();

            Self {
                server,
                connects,
                disconnects,
                peers,
                seen,
            }
        }

        fn echo() -> Self {
            Self::start(TcpConfig::default(), None, true)
        }

        async fn dial(&self) -> TcpStream {
            TcpStream::connect(self.server.local_addr()).await.unwrap()
        }

        fn id_of(&self, stream: &TcpStream) -> u64 {
            let local = stream.local_addr().unwrap();
            self.peers
                .lock()
                .iter()
                .find(|(_, peer)| *peer == local)
                .map(|(id, _)| *id)
                .expect("stream should have been accepted")
        }

        fn registered(&self) -> usize {
            let mut n = 0;
            self.server.iterate(|_, _| n += 1);
            n
        }
    }

    #[tokio::test]
    async fn test_echo_round_trip_with_client() {
        let fx = Fixture::echo();

        let client_seen = Arc::new(Mutex::new(Vec::new()));
        let client_disconnects = Arc::new(AtomicUsize::new(0));
        let (cs, cd) = (Arc::clone(&client_seen), Arc::clone(&client_disconnects));
        let client = TcpClient::new(
            &fx.server.local_addr().to_string(),
            move |conn: &Arc<TcpConn>| Some(EchoSession::shared(conn, false, Arc::clone(&cs))),
            move |_conn: &TcpConn| {
                cd.fetch_add(1, Ordering::SeqCst);
            },
        );
        client.open().await.unwrap();

        assert_eq!(client.write(b"ping").unwrap(), 4);
        assert!(wait_until(|| client_seen.lock().as_slice() == b"ping").await);
        assert_eq!(fx.seen.lock().as_slice(), b"ping");
        assert_eq!(fx.connects.load(Ordering::SeqCst), 1);
        assert_eq!(fx.server.count(), 1);

        client.close().await;
        assert_eq!(client_disconnects.load(Ordering::SeqCst), 1);

        assert!(wait_until(|| fx.disconnects.load(Ordering::SeqCst) == 1).await);
        assert!(wait_until(|| fx.server.count() == 0).await);
        assert_eq!(fx.registered(), 0);

        fx.server.close().await;
        assert_eq!(fx.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ids_are_sequential_from_one() {
        let fx = Fixture::echo();

        let mut streams = Vec::new();
        for n in 1..=3 {
            streams.push(fx.dial().await);
            assert!(wait_until(|| fx.connects.load(Ordering::SeqCst) == n).await);
        }

        let ids: Vec<u64> = streams.iter().map(|s| fx.id_of(s)).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        for id in 1..=3 {
            let session = fx.server.session(id).expect("session should be registered");
            assert_eq!(session.sock_handle(), id);
        }

        fx.server.close().await;
    }

    #[tokio::test]
    async fn test_max_conn_rejects_without_callbacks() {
        let fx = Fixture::start(TcpConfig::default().with_max_conn(1), None, true);

        let _first = fx.dial().await;
        assert!(wait_until(|| fx.server.count() == 1).await);

        let mut second = fx.dial().await;
        assert!(peer_closed(&mut second).await);

        assert_eq!(fx.connects.load(Ordering::SeqCst), 1);
        assert_eq!(fx.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(fx.server.count(), 1);

        fx.server.close().await;
        assert_eq!(fx.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_clients_respect_max_conn() {
        let fx = Fixture::start(TcpConfig::default().with_max_conn(1), None, true);
        let addr = fx.server.local_addr().to_string();

        let make_client = || {
            TcpClient::new(&addr, |_conn: &Arc<TcpConn>| None, |_conn: &TcpConn| {})
        };
        let (a, b) = (make_client(), make_client());
        let (ra, rb) = tokio::join!(a.open(), b.open());
        ra.unwrap();
        rb.unwrap();

        assert!(wait_until(|| fx.connects.load(Ordering::SeqCst) == 1).await);
        // Give the rejected socket time to be accepted and dropped.
        assert!(wait_until(|| {
            let closed = |c: &TcpClient| c.conn().map(|c| c.is_closed()).unwrap_or(false);
            closed(&a) || closed(&b)
        })
        .await);
        assert_eq!(fx.connects.load(Ordering::SeqCst), 1);
        assert_eq!(fx.disconnects.load(Ordering::SeqCst), 0);
        assert!(fx.server.count() <= 1);

        a.close().await;
        b.close().await;
        fx.server.close().await;
    }

    #[tokio::test]
    async fn test_check_ip_filter_rejects_peer() {
        let checked = Arc::new(Mutex::new(Vec::<SocketAddr>::new()));
        let log = Arc::clone(&checked);
        let filter: OnCheckIp = Arc::new(move |peer: &SocketAddr| {
            log.lock().push(*peer);
            false
        });
        let fx = Fixture::start(TcpConfig::default(), Some(filter), true);

        let mut stream = fx.dial().await;
        assert!(peer_closed(&mut stream).await);

        assert_eq!(checked.lock().len(), 1);
        assert_eq!(checked.lock()[0], stream.local_addr().unwrap());
        assert_eq!(fx.connects.load(Ordering::SeqCst), 0);
        assert_eq!(fx.server.count(), 0);

        fx.server.close().await;
        assert_eq!(fx.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_broadcast_and_unknown_ids() {
        let fx = Fixture::echo();

        let mut a = fx.dial().await;
        let mut b = fx.dial().await;
        assert!(wait_until(|| fx.registered() == 2).await);

        let id_a = fx.id_of(&a);
        fx.server.send(id_a, b"hello");
        fx.server.send(99, b"nobody");
        fx.server.send(id_a, b"");
        assert_eq!(read_exact(&mut a, 5).await, b"hello");

        fx.server.broadcast(b"all");
        assert_eq!(read_exact(&mut a, 3).await, b"all");
        assert_eq!(read_exact(&mut b, 3).await, b"all");

        fx.server.close().await;
    }

    #[tokio::test]
    async fn test_kick_unregisters_but_keeps_connection() {
        let fx = Fixture::echo();

        let mut stream = fx.dial().await;
        assert!(wait_until(|| fx.server.session(1).is_some()).await);

        fx.server.kick(1);
        assert!(fx.server.session(1).is_none());
        assert_eq!(fx.registered(), 0);
        assert_eq!(fx.server.count(), 1);

        // The session is still wired into the connection.
        stream.write_all(b"echo").await.unwrap();
        assert_eq!(read_exact(&mut stream, 4).await, b"echo");

        drop(stream);
        assert!(wait_until(|| fx.server.count() == 0).await);
        assert_eq!(fx.disconnects.load(Ordering::SeqCst), 1);

        fx.server.close().await;
    }

    #[tokio::test]
    async fn test_iterate_callback_may_kick() {
        let fx = Fixture::echo();

        let _a = fx.dial().await;
        let _b = fx.dial().await;
        assert!(wait_until(|| fx.registered() == 2).await);

        let mut visited = Vec::new();
        fx.server.iterate(|id, session| {
            assert_eq!(session.sock_handle(), id);
            visited.push(id);
            fx.server.kick(id);
        });
        visited.sort_unstable();

        assert_eq!(visited, vec![1, 2]);
        assert_eq!(fx.registered(), 0);
        assert_eq!(fx.server.count(), 2);

        fx.server.close().await;
    }

    #[tokio::test]
    async fn test_connection_without_session_is_not_registered() {
        let fx = Fixture::start(TcpConfig::default(), None, false);

        let mut stream = fx.dial().await;
        assert!(wait_until(|| fx.server.count() == 1).await);
        assert_eq!(fx.registered(), 0);
        assert!(fx.server.session(1).is_none());

        stream.write_all(b"ignored").await.unwrap();
        fx.server.send(1, b"dropped");

        drop(stream);
        assert!(wait_until(|| fx.disconnects.load(Ordering::SeqCst) == 1).await);
        assert_eq!(fx.server.count(), 0);
        assert!(fx.seen.lock().is_empty());

        fx.server.close().await;
    }

    #[tokio::test]
    async fn test_close_joins_every_connection() {
        let fx = Fixture::echo();

        let mut streams = Vec::new();
        for _ in 0..3 {
            streams.push(fx.dial().await);
        }
        assert!(wait_until(|| fx.server.count() == 3).await);

        tokio::time::timeout(crate::tests::WAIT, fx.server.close())
            .await
            .expect("close should finish once every loop exits");

        assert_eq!(fx.server.count(), 0);
        assert_eq!(fx.registered(), 0);
        assert_eq!(fx.disconnects.load(Ordering::SeqCst), 3);
        for stream in &mut streams {
            assert!(peer_closed(stream).await);
        }

        // No accept loop is left behind.
        assert!(TcpStream::connect(fx.server.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_panicking_connect_callback_is_contained() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&disconnects);
        let server = TcpServer::new(
            "127.0.0.1:0",
            |_conn: &Arc<TcpConn>| -> Option<Arc<dyn TcpSession>> { panic!("bad setup") },
            move |_conn: &TcpConn| {
                d.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        server.serve();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        assert!(peer_closed(&mut stream).await);
        assert!(wait_until(|| server.count() == 0).await);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        server.close().await;
    }

    #[tokio::test]
    async fn test_serve_twice_is_noop() {
        let fx = Fixture::echo();
        fx.server.serve();

        let _stream = fx.dial().await;
        assert!(wait_until(|| fx.server.count() == 1).await);

        fx.server.close().await;
        fx.server.serve();
        assert_eq!(fx.server.count(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let result = TcpServer::try_new(
            &addr,
            TcpConfig::default(),
            |_conn: &Arc<TcpConn>| None,
            |_conn: &TcpConn| {},
            None,
        );
        assert!(matches!(result, Err(TcpSockError::Bind { .. })));
    }

    #[test]
    fn test_empty_address_is_rejected() {
        let result = TcpServer::try_new(
            "",
            TcpConfig::default(),
            |_conn: &Arc<TcpConn>| None,
            |_conn: &TcpConn| {},
            None,
        );
        assert!(matches!(result, Err(TcpSockError::InvalidAddress(_))));
    }

    #[test]
    fn test_invalid_config_is_rejected_before_bind() {
        let result = TcpServer::try_new(
            "127.0.0.1:0",
            TcpConfig::default().with_recv_buf_len(0),
            |_conn: &Arc<TcpConn>| None,
            |_conn: &TcpConn| {},
            None,
        );
        assert!(matches!(result, Err(TcpSockError::InvalidConfig(_))));
    }

    #[test]
    #[should_panic(expected = "invalid TcpServer setup")]
    fn test_new_panics_on_empty_address() {
        let _ = TcpServer::new("", |_conn: &Arc<TcpConn>| None, |_conn: &TcpConn| {}, None);
    }
}
