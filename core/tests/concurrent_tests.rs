use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stompbox::destination::{
    DeliveryError, DestinationError, DestinationRegistry, Message, Subscriber, SubscriberId,
};
use stompbox::protocol::{Command, Frame, StompCodec};
use stompbox::session::{AckMode, SessionSubscriber};
use stompbox::{BrokerConfig, BrokerServer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::codec::Framed;

#[derive(Debug)]
struct CountingSubscriber {
    id: SubscriberId,
    received: AtomicUsize,
}

impl CountingSubscriber {
    fn new(id: SubscriberId) -> Arc<Self> {
        Arc::new(Self {
            id,
            received: AtomicUsize::new(0),
        })
    }

    fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

impl Subscriber for CountingSubscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn deliver(&self, _message: &Message) -> Result<(), DeliveryError> {
        self.received.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn send_frame(destination: &str, body: String) -> Frame {
    Frame::new(Command::Send)
        .header("destination", destination)
        .with_body(body)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishers() {
    let registry = Arc::new(DestinationRegistry::new());
    registry.register_broadcast("/topic/load").unwrap();

    let subscribers: Vec<_> = (0..5)
        .map(|_| CountingSubscriber::new(registry.next_subscriber_id()))
        .collect();
    for subscriber in &subscribers {
        registry
            .subscribe("/topic/load", subscriber.clone())
            .unwrap();
    }

    let num_publishers = 8;
    let messages_per_publisher = 250;
    let mut tasks = JoinSet::new();
    for publisher in 0..num_publishers {
        let registry = Arc::clone(&registry);
        tasks.spawn(async move {
            for n in 0..messages_per_publisher {
                let report = registry
                    .publish("/topic/load", send_frame("/topic/load", format!("{}-{}", publisher, n)))
                    .expect("Failed to publish");
                assert_eq!(report.delivered, 5);
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.expect("Publisher task failed");
    }

    for subscriber in &subscribers {
        assert_eq!(subscriber.received(), num_publishers * messages_per_publisher);
    }
    let snapshot = registry.metrics().snapshot();
    assert_eq!(
        snapshot.messages_published,
        (num_publishers * messages_per_publisher) as u64
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_registration_succeeds_once() {
    let registry = Arc::new(DestinationRegistry::new());
    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let registry = Arc::clone(&registry);
        tasks.spawn(async move { registry.register_broadcast("/topic/race") });
    }

    let mut won = 0;
    let mut lost = 0;
    while let Some(result) = tasks.join_next().await {
        match result.expect("Registration task failed") {
            Ok(()) => won += 1,
            Err(DestinationError::AlreadyExists(id)) => {
                assert_eq!(id, "/topic/race");
                lost += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(lost, 15);
    assert_eq!(registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscription_churn_during_publish() {
    let registry = Arc::new(DestinationRegistry::new());
    registry.register_broadcast("/topic/churn").unwrap();
    let steady = CountingSubscriber::new(registry.next_subscriber_id());
    registry.subscribe("/topic/churn", steady.clone()).unwrap();

    let mut tasks = JoinSet::new();
    for _ in 0..4 {
        let registry = Arc::clone(&registry);
        tasks.spawn(async move {
            for _ in 0..200 {
                let subscriber = CountingSubscriber::new(registry.next_subscriber_id());
                registry
                    .subscribe("/topic/churn", subscriber.clone())
                    .unwrap();
                tokio::task::yield_now().await;
                registry
                    .unsubscribe("/topic/churn", subscriber.id())
                    .unwrap();
            }
        });
    }
    let publisher = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for n in 0..500 {
                registry
                    .publish("/topic/churn", send_frame("/topic/churn", n.to_string()))
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    while let Some(result) = tasks.join_next().await {
        result.expect("Churn task failed");
    }
    publisher.await.expect("Publisher task failed");

    assert_eq!(steady.received(), 500);
    assert_eq!(
        registry.get("/topic/churn").unwrap().subscriber_count(),
        1
    );
}

#[tokio::test]
async fn test_full_inbox_drops_instead_of_blocking() {
    let registry = DestinationRegistry::new();
    registry.register_broadcast("/topic/slow").unwrap();

    // Nobody drains this inbox.
    let (inbox, _inbox_rx) = mpsc::channel(2);
    let slow = SessionSubscriber::new(
        registry.next_subscriber_id(),
        Arc::from("slow"),
        AckMode::Auto,
        inbox,
    );
    let fast = CountingSubscriber::new(registry.next_subscriber_id());
    registry.subscribe("/topic/slow", Arc::new(slow)).unwrap();
    registry.subscribe("/topic/slow", fast.clone()).unwrap();

    for n in 0..5 {
        registry
            .publish("/topic/slow", send_frame("/topic/slow", n.to_string()))
            .unwrap();
    }

    assert_eq!(fast.received(), 5);
    let snapshot = registry.metrics().snapshot();
    assert_eq!(snapshot.messages_delivered, 7);
    assert_eq!(snapshot.messages_dropped, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fan_out_to_many_tcp_clients() {
    let server = Arc::new(BrokerServer::new(BrokerConfig::default()).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve(listener).await });

    async fn connect(addr: std::net::SocketAddr) -> Framed<TcpStream, StompCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, StompCodec::new());
        framed
            .send(Frame::new(Command::Connect).header("accept-version", "1.2"))
            .await
            .unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        assert_eq!(reply.command, Command::Connected);
        framed
    }

    let num_subscribers = 10;
    let num_messages = 20;

    let mut subscribers = Vec::new();
    for i in 0..num_subscribers {
        let mut framed = connect(addr).await;
        framed
            .send(
                Frame::new(Command::Subscribe)
                    .header("id", i.to_string())
                    .header("destination", "/topic/all")
                    .header("receipt", "ready"),
            )
            .await
            .unwrap();
        let receipt = framed.next().await.unwrap().unwrap();
        assert_eq!(receipt.command, Command::Receipt);
        subscribers.push(framed);
    }

    let mut publisher = connect(addr).await;
    for n in 0..num_messages {
        publisher
            .send(send_frame("/topic/all", format!("message {}", n)))
            .await
            .unwrap();
    }

    let mut readers = JoinSet::new();
    for (i, mut framed) in subscribers.into_iter().enumerate() {
        readers.spawn(async move {
            for n in 0..num_messages {
                let message = timeout(Duration::from_secs(5), framed.next())
                    .await
                    .expect("Timed out waiting for MESSAGE")
                    .unwrap()
                    .unwrap();
                assert_eq!(message.command, Command::Message);
                assert_eq!(message.headers.get("subscription"), Some(i.to_string().as_str()));
                // One publisher, so every subscriber sees its order.
                assert_eq!(message.body, bytes::Bytes::from(format!("message {}", n)));
            }
        });
    }
    while let Some(result) = readers.join_next().await {
        result.expect("Subscriber task failed");
    }

    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.messages_published, num_messages as u64);
    assert_eq!(
        snapshot.messages_delivered,
        (num_messages * num_subscribers) as u64
    );
}
