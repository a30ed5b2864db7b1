mod tests {
    use std::{sync::Arc, time::Duration};

    use proptest::{
        prelude::*,
        strategy::{Just, Strategy},
    };
    use rand::seq::SliceRandom;
    use sha2::{Digest, Sha256};

    use mpc_relay::{
        bus::{Bus, MemoryBus, RedisBus},
        cluster::LocalCluster,
        engine::verify_signature,
        orchestrator::INITIATOR,
        store::{FileKeyStore, KeyStore, MemoryKeyStore},
        types::{ParticipantId, ProtocolKind},
        ChannelRegistry, RelayError,
    };

    const DEADLINE: Duration = Duration::from_secs(10);

    fn ids(names: &[&str]) -> Vec<ParticipantId> {
        names.iter().map(|name| ParticipantId::from(*name)).collect()
    }

    fn hash(message: &str) -> Vec<u8> {
        Sha256::digest(message.as_bytes()).to_vec()
    }

    async fn cluster(bus: Arc<dyn Bus>, names: &[&str], deadline: Duration) -> LocalCluster {
        LocalCluster::start(bus, &ids(names), deadline, |_| {
            Arc::new(MemoryKeyStore::new()) as Arc<dyn KeyStore>
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn keygen_refresh_then_sign() {
        let bus = Arc::new(MemoryBus::new());
        let cluster = cluster(bus, &["alice", "bob", "carol"], DEADLINE).await;
        let orchestrator = cluster.orchestrator();
        let participants = cluster.participants();

        let key = orchestrator.generate_keys(&participants, 2).await.unwrap();
        assert!(key.address.starts_with("0x"));
        assert_eq!(orchestrator.recorded_key(&key.address), Some(key.public_key.clone()));

        let refreshed = orchestrator
            .refresh_keys(&participants, &key.address)
            .await
            .unwrap();
        assert_eq!(refreshed.address, key.address);
        assert_eq!(refreshed.public_key, key.public_key);

        // threshold 2 of 3 needs every share; the order signers are named in does not matter
        let mut quorum = participants.clone();
        quorum.shuffle(&mut rand::thread_rng());
        let signature = orchestrator
            .sign(&quorum, &key.address, &hash("hello"))
            .await
            .unwrap();
        dbg!(&quorum, &signature);
        assert!(verify_signature(
            &refreshed.public_key,
            &hash("hello"),
            &signature.signature
        ));
        assert!(!verify_signature(
            &refreshed.public_key,
            &hash("goodbye"),
            &signature.signature
        ));

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn presignatures_are_single_use() {
        let bus = Arc::new(MemoryBus::new());
        let cluster = cluster(bus, &["alice", "bob", "carol"], DEADLINE).await;
        let orchestrator = cluster.orchestrator();
        let key = orchestrator
            .generate_keys(&cluster.participants(), 1)
            .await
            .unwrap();
        let signers = ids(&["bob", "carol"]);

        let presignature = orchestrator.pre_sign(&signers, &key.address).await.unwrap();
        assert_eq!(presignature.signers, signers);
        assert_eq!(presignature.address, key.address);

        let signature = orchestrator
            .sign_online(&signers, &key.address, &hash("later"))
            .await
            .unwrap();
        assert!(verify_signature(
            &key.public_key,
            &hash("later"),
            &signature.signature
        ));

        let reuse = orchestrator
            .sign_online(&signers, &key.address, &hash("again"))
            .await;
        match reuse {
            Err(RelayError::ParticipantFailed { reason, .. }) => {
                assert!(reason.contains("no pre-signature"), "{}", reason)
            }
            other => panic!("expected a participant failure, got {:?}", other),
        }

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_keys_fail_the_session() {
        let cluster = cluster(Arc::new(MemoryBus::new()), &["alice", "bob"], DEADLINE).await;
        let orchestrator = cluster.orchestrator();

        let err = orchestrator
            .sign(&cluster.participants(), "0xdeadbeef", &hash("hello"))
            .await
            .unwrap_err();
        match err {
            RelayError::ParticipantFailed {
                participant,
                reason,
                ..
            } => {
                assert!(ids(&["alice", "bob"]).contains(&participant));
                assert!(reason.contains("Unknown key handle 0xdeadbeef"), "{}", reason);
            }
            other => panic!("unexpected error {:?}", other),
        }

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_requests_are_refused_up_front() {
        let cluster = cluster(Arc::new(MemoryBus::new()), &["alice", "bob"], DEADLINE).await;
        let orchestrator = cluster.orchestrator();

        assert!(matches!(
            orchestrator.generate_keys(&[], 1).await,
            Err(RelayError::InvalidRequest(_))
        ));
        assert!(matches!(
            orchestrator.generate_keys(&cluster.participants(), 2).await,
            Err(RelayError::InvalidRequest(_))
        ));
        assert!(matches!(
            orchestrator.sign(&cluster.participants(), "", b"m").await,
            Err(RelayError::InvalidRequest(_))
        ));

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn absent_participant_times_out() {
        let deadline = Duration::from_millis(300);
        let cluster = cluster(Arc::new(MemoryBus::new()), &["alice", "bob"], deadline).await;
        let orchestrator = cluster.orchestrator();

        let err = orchestrator
            .generate_keys(&ids(&["alice", "bob", "carol"]), 1)
            .await
            .unwrap_err();
        match err {
            RelayError::Timeout { missing, .. } => {
                assert!(missing.contains(&ParticipantId::from("carol")))
            }
            other => panic!("expected a timeout, got {:?}", other),
        }

        // the others gave up on their own and keep serving
        tokio::time::sleep(deadline).await;
        let online = orchestrator
            .get_online(&ids(&["alice", "bob", "carol"]))
            .await
            .unwrap();
        assert!(online[&ParticipantId::from("alice")]);
        assert!(online[&ParticipantId::from("bob")]);
        assert!(!online[&ParticipantId::from("carol")]);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn configs_need_every_holder_to_report() {
        let bus = Arc::new(MemoryBus::new());
        let cluster = cluster(bus, &["alice", "bob", "carol"], DEADLINE).await;
        let orchestrator = cluster.orchestrator();
        let key = orchestrator
            .generate_keys(&cluster.participants(), 1)
            .await
            .unwrap();

        let configs = orchestrator
            .get_configs(&cluster.participants())
            .await
            .unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].address, key.address);
        assert_eq!(configs[0].session_id, key.session_id);
        assert_eq!(configs[0].participants, cluster.participants());

        // carol is not asked, so the key is not confirmed
        let partial = orchestrator
            .get_configs(&ids(&["alice", "bob"]))
            .await
            .unwrap();
        assert!(partial.is_empty());

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn keys_survive_a_restart() {
        let root = tempfile::tempdir().unwrap();
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let participants = ids(&["alice", "bob"]);
        let stores = |id: &ParticipantId| {
            Arc::new(FileKeyStore::new(root.path(), id).unwrap()) as Arc<dyn KeyStore>
        };

        let first = LocalCluster::start(bus.clone(), &participants, DEADLINE, stores)
            .await
            .unwrap();
        let key = first
            .orchestrator()
            .generate_keys(&participants, 1)
            .await
            .unwrap();
        first.shutdown().await.unwrap();

        let second = LocalCluster::start(bus, &participants, DEADLINE, stores)
            .await
            .unwrap();
        let signature = second
            .orchestrator()
            .sign(&participants, &key.address, &hash("after restart"))
            .await
            .unwrap();
        assert!(verify_signature(
            &key.public_key,
            &hash("after restart"),
            &signature.signature
        ));
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn lost_share_fails_the_session_before_the_deadline() {
        let deadline = Duration::from_secs(2);
        let root = tempfile::tempdir().unwrap();
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let participants = ids(&["alice", "bob"]);
        let stores = |id: &ParticipantId| {
            Arc::new(FileKeyStore::new(root.path(), id).unwrap()) as Arc<dyn KeyStore>
        };

        let first = LocalCluster::start(bus.clone(), &participants, deadline, stores)
            .await
            .unwrap();
        let key = first
            .orchestrator()
            .generate_keys(&participants, 1)
            .await
            .unwrap();
        first.shutdown().await.unwrap();

        // bob comes back without his share
        let bob = FileKeyStore::new(root.path(), &ParticipantId::from("bob")).unwrap();
        std::fs::remove_file(bob.dir().join(&key.address)).unwrap();

        let second = LocalCluster::start(bus, &participants, deadline, stores)
            .await
            .unwrap();
        let started = tokio::time::Instant::now();
        let err = second
            .orchestrator()
            .sign(&participants, &key.address, &hash("hello"))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        dbg!(elapsed, &err);

        match err {
            RelayError::ParticipantFailed {
                participant,
                reason,
                ..
            } => {
                assert_eq!(participant, ParticipantId::from("bob"));
                assert!(reason.contains("Unknown key handle"), "{}", reason);
            }
            other => panic!("expected bob's failure, got {:?}", other),
        }
        assert!(elapsed < deadline / 2, "waited {:?}", elapsed);

        // alice gives up on her own once the deadline passes
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn sessions_are_audited() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let observer = ChannelRegistry::new(bus.clone());
        let audit = observer.audit_inbox().await.unwrap();
        let cluster = cluster(bus, &["alice", "bob"], DEADLINE).await;

        let key = cluster
            .orchestrator()
            .generate_keys(&cluster.participants(), 1)
            .await
            .unwrap();
        cluster.shutdown().await.unwrap();

        let mut events = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), audit.recv()).await
        {
            events.push(event);
        }
        assert!(events.iter().all(|e| e.session_id == key.session_id));
        assert!(events.iter().all(|e| e.protocol == ProtocolKind::Keygen));
        let initiator: Vec<_> = events
            .iter()
            .filter(|e| e.participant == INITIATOR)
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(
            initiator,
            vec!["started protocol initialization", "protocol successfully completed"]
        );
        for name in ["alice", "bob"] {
            let mine: Vec<_> = events
                .iter()
                .filter(|e| e.participant == name)
                .map(|e| e.message.as_str())
                .collect();
            assert_eq!(mine.first(), Some(&"protocol initialized"));
            assert_eq!(mine.last(), Some(&"all rounds completed"));
            assert!(mine.iter().any(|m| m.starts_with("sending message to: ")));
            assert!(mine.iter().any(|m| m.starts_with("received message from: ")));
        }
        observer.shutdown().await;
    }

    #[tokio::test]
    async fn relays_over_redis() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(mini_redis::server::run(
            listener,
            std::future::pending::<()>(),
        ));

        let bus = Arc::new(RedisBus::new(addr));
        let cluster = cluster(bus, &["alice", "bob", "carol"], DEADLINE).await;
        let orchestrator = cluster.orchestrator();
        let key = orchestrator
            .generate_keys(&cluster.participants(), 1)
            .await
            .unwrap();
        let signature = orchestrator
            .sign(&ids(&["alice", "carol"]), &key.address, &hash("hello"))
            .await
            .unwrap();
        assert!(verify_signature(
            &key.public_key,
            &hash("hello"),
            &signature.signature
        ));

        cluster.shutdown().await.unwrap();
        server.abort();
    }

    fn t_of_n(threshold: usize, n_parties: usize) {
        println!("Testing {}-of-{}:", threshold + 1, n_parties);
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let names: Vec<String> = (0..n_parties).map(|i| format!("p{}", i)).collect();
            let participants: Vec<ParticipantId> =
                names.iter().map(ParticipantId::new).collect();
            let cluster = LocalCluster::start(
                Arc::new(MemoryBus::new()),
                &participants,
                DEADLINE,
                |_| Arc::new(MemoryKeyStore::new()) as Arc<dyn KeyStore>,
            )
            .await
            .unwrap();
            let orchestrator = cluster.orchestrator();
            let key = orchestrator
                .generate_keys(&participants, threshold)
                .await
                .unwrap();

            let mut quorum = participants.clone();
            quorum.shuffle(&mut rand::thread_rng());
            quorum.truncate(threshold + 1);
            let signature = orchestrator
                .sign(&quorum, &key.address, &hash("test"))
                .await
                .unwrap();
            assert!(verify_signature(
                &key.public_key,
                &hash("test"),
                &signature.signature
            ));

            // one signer short of the threshold cannot sign
            quorum.truncate(threshold);
            let short = orchestrator.sign(&quorum, &key.address, &hash("test")).await;
            assert!(matches!(short, Err(RelayError::ParticipantFailed { .. })));

            cluster.shutdown().await.unwrap();
        });
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn proptest_t_of_n(
            (n_parties, threshold) in (2usize..6).prop_flat_map(|n| (Just(n), 1usize..n))
        ) {
            t_of_n(threshold, n_parties);
        }
    }
}
