//! Channel behaviour across socket patterns and transports.

use odin_common::{ChannelType, IpcChannel, IpcError, IpcMessage, MsgType, MsgVal};
use serial_test::serial;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_pub_sub_topic_filter() {
    let endpoint = "inproc://odin-common-test-pubsub";
    let mut publisher = IpcChannel::new(ChannelType::Pub).unwrap();
    publisher.bind(endpoint).unwrap();

    let mut subscriber = IpcChannel::new(ChannelType::Sub).unwrap();
    subscriber.connect(endpoint).unwrap();
    subscriber.subscribe("frame").unwrap();

    // Subscriptions propagate asynchronously; publish until one arrives.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = None;
    while Instant::now() < deadline {
        publisher.send("other topic").unwrap();
        publisher.send("frame ready").unwrap();
        if subscriber.poll(50).unwrap() {
            received = Some(subscriber.recv().unwrap());
            break;
        }
    }
    assert_eq!(received.as_deref(), Some("frame ready"));

    // Anything still queued matches the filter.
    while subscriber.poll(20).unwrap() {
        assert!(subscriber.recv().unwrap().starts_with("frame"));
    }
}

#[test]
fn test_poll_times_out() {
    let mut channel = IpcChannel::new(ChannelType::Pair).unwrap();
    channel.bind("inproc://odin-common-test-timeout").unwrap();

    let started = Instant::now();
    assert!(!channel.poll(100).unwrap());
    assert!(started.elapsed() >= Duration::from_millis(90));
}

#[test]
fn test_message_over_dealer_router() {
    let endpoint = "inproc://odin-common-test-dealer";
    let mut router = IpcChannel::new(ChannelType::Router).unwrap();
    router.bind(endpoint).unwrap();

    let handle = thread::spawn(move || {
        let mut dealer = IpcChannel::new(ChannelType::Dealer).unwrap();
        dealer.connect(endpoint).unwrap();
        let mut request = IpcMessage::new(MsgType::Cmd, MsgVal::Status);
        request.set_id(11);
        request.set_param("count", 5);
        dealer.send(&request.encode()).unwrap();

        assert!(dealer.poll(2000).unwrap());
        IpcMessage::parse(&dealer.recv().unwrap()).unwrap()
    });

    assert!(router.poll(2000).unwrap());
    let (identity, body) = router.recv_from().unwrap();
    let request = IpcMessage::parse(&body).unwrap();
    let mut reply = IpcMessage::reply_to(&request, MsgType::Ack);
    reply.merge_params("", request.params());
    router.send_to(&identity, &reply.encode()).unwrap();

    let reply = handle.join().unwrap();
    assert_eq!(reply.msg_type(), MsgType::Ack);
    assert_eq!(reply.id(), 11);
    assert_eq!(reply.get_param::<i32>("count").unwrap(), 5);
}

#[test]
fn test_multipart_header_and_payload() {
    let endpoint = "inproc://odin-common-test-multipart";
    let mut server = IpcChannel::new(ChannelType::Pair).unwrap();
    server.bind(endpoint).unwrap();
    let mut client = IpcChannel::new(ChannelType::Pair).unwrap();
    client.connect(endpoint).unwrap();

    let payload = [1u8, 2, 3, 4];
    client
        .send_multipart(&[&b"{\"dsize\":4}"[..], &payload[..]])
        .unwrap();

    assert!(server.poll(1000).unwrap());
    let parts = server.recv_multipart().unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0], b"{\"dsize\":4}");
    assert_eq!(parts[1], payload);
}

#[test]
#[serial]
fn test_tcp_wildcard_bind_resolves_port() {
    let mut server = IpcChannel::new(ChannelType::Pair).unwrap();
    let resolved = server.bind("tcp://127.0.0.1:*").unwrap();
    assert!(resolved.starts_with("tcp://127.0.0.1:"));
    assert!(server.has_bound_endpoint(&resolved));

    let mut client = IpcChannel::new(ChannelType::Pair).unwrap();
    client.connect(&resolved).unwrap();
    client.send("over tcp").unwrap();
    assert!(server.poll(2000).unwrap());
    assert_eq!(server.recv().unwrap(), "over tcp");

    server.unbind(&resolved).unwrap();
    assert!(!server.has_bound_endpoint(&resolved));
}

#[test]
#[serial]
fn test_bind_conflict_reports_reason() {
    let mut first = IpcChannel::new(ChannelType::Pub).unwrap();
    let resolved = first.bind("tcp://127.0.0.1:*").unwrap();

    let mut second = IpcChannel::new(ChannelType::Pub).unwrap();
    match second.bind(&resolved) {
        Err(IpcError::Bind { endpoint, reason }) => {
            assert_eq!(endpoint, resolved);
            assert!(!reason.is_empty());
        }
        other => panic!("expected bind failure, got {other:?}"),
    }
}
