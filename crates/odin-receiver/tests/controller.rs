//! End-to-end tests of the frame receiver controller.

use odin_common::shared_buffer::HEADER_SIZE;
use odin_common::{ChannelType, IpcChannel, IpcMessage, MsgType, MsgVal, PacketHeader, PacketLayout};
use odin_receiver::{FrameReceiverController, ReceiverError};
use std::net::{SocketAddr, UdpSocket};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn unique(name: &str) -> String {
    format!("{name}-{}", rand::random::<u32>())
}

fn small_layout() -> PacketLayout {
    PacketLayout {
        primary_packet_size: 16,
        num_primary_packets: 3,
        tail_packet_size: 4,
        num_tail_packets: 1,
        num_subframes: 2,
        num_data_types: 2,
        packet_header_size: 22,
        frame_info_size: 14,
    }
}

struct Endpoints {
    ctrl: String,
    ready: String,
    release: String,
}

fn configure_message(endpoints: &Endpoints, layout: &PacketLayout) -> IpcMessage {
    let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
    msg.set_param("ctrl_endpoint", endpoints.ctrl.clone());
    msg.set_param("rx_endpoint", format!("inproc://{}", unique("rx")));
    msg.set_param("frame_ready_endpoint", endpoints.ready.clone());
    msg.set_param("frame_release_endpoint", endpoints.release.clone());
    msg.set_param("shared_buffer_name", unique("odin-receiver-test"));
    msg.set_param("max_buffer_mem", HEADER_SIZE + 4 * layout.frame_buffer_size());
    msg.set_param("rx_address", "127.0.0.1");
    msg.set_param("rx_ports", vec![0u16]);
    msg.set_param("tick_period_ms", 10u64);
    msg.set_param("deferred_action_delay_ms", 200u64);
    msg.set_param("decoder_config/layout", serde_json::to_value(layout).unwrap());
    msg
}

struct Running {
    handle: JoinHandle<odin_receiver::Result<()>>,
    client: IpcChannel,
    rx_addr: SocketAddr,
}

fn start_controller(endpoints: &Endpoints, layout: &PacketLayout) -> Running {
    let mut controller = FrameReceiverController::new().unwrap();
    let msg = configure_message(endpoints, layout);
    let mut reply = IpcMessage::reply_to(&msg, MsgType::Ack);
    controller.configure(&msg, &mut reply).unwrap();
    assert!(reply.get_param::<bool>("configured/rx_thread").unwrap());
    assert!(controller.configuration_complete());

    let rx_addr = controller.rx_addrs()[0];
    let handle = thread::spawn(move || controller.run());

    let mut client = IpcChannel::new(ChannelType::Dealer).unwrap();
    client.connect(&endpoints.ctrl).unwrap();
    Running {
        handle,
        client,
        rx_addr,
    }
}

fn request(client: &IpcChannel, msg: &IpcMessage) -> IpcMessage {
    client.send(&msg.encode()).unwrap();
    assert!(client.poll(2000).unwrap(), "no reply to {}", msg.msg_val());
    IpcMessage::parse(&client.recv().unwrap()).unwrap()
}

fn status(client: &IpcChannel) -> IpcMessage {
    request(client, &IpcMessage::new(MsgType::Cmd, MsgVal::Status))
}

fn send_frame(target: SocketAddr, layout: &PacketLayout, frame_number: u32) {
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for packet_type in 0..layout.num_data_types as u8 {
        for subframe in 0..layout.num_subframes as u8 {
            for packet_number in 0..layout.packets_per_subframe() as u16 {
                let header = PacketHeader {
                    packet_type,
                    subframe,
                    frame_number,
                    packet_number,
                };
                let mut datagram = header.to_bytes(layout);
                datagram.extend(vec![0x5A; layout.payload_size(usize::from(packet_number))]);
                sender.send_to(&datagram, target).unwrap();
            }
        }
    }
}

fn wait_for(sub: &IpcChannel, val: MsgVal, timeout: Duration) -> Option<IpcMessage> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if sub.poll(50).unwrap() {
            let msg = IpcMessage::parse(&sub.recv().unwrap()).unwrap();
            if msg.msg_val() == val {
                return Some(msg);
            }
        }
    }
    None
}

fn shutdown(running: Running) {
    let reply = request(
        &running.client,
        &IpcMessage::new(MsgType::Cmd, MsgVal::Shutdown),
    );
    assert_eq!(reply.msg_type(), MsgType::Ack);
    running.handle.join().unwrap().unwrap();
}

fn endpoints() -> Endpoints {
    Endpoints {
        ctrl: format!("inproc://{}", unique("ctrl")),
        ready: format!("inproc://{}", unique("ready")),
        release: format!("inproc://{}", unique("release")),
    }
}

#[test]
fn test_status_round_trip() {
    let layout = small_layout();
    let endpoints = endpoints();
    let running = start_controller(&endpoints, &layout);

    let mut request_msg = IpcMessage::new(MsgType::Cmd, MsgVal::Status);
    request_msg.set_id(99);
    let reply = request(&running.client, &request_msg);
    assert_eq!(reply.msg_type(), MsgType::Ack);
    assert_eq!(reply.id(), 99);
    assert!(reply.get_param::<bool>("status/configuration_complete").unwrap());
    assert_eq!(reply.get_param::<u64>("buffers/total").unwrap(), 4);
    assert_eq!(reply.get_param::<u64>("frames/received").unwrap(), 0);

    let version = request(
        &running.client,
        &IpcMessage::new(MsgType::Cmd, MsgVal::RequestVersion),
    );
    assert!(version.has_param("version/odin-data/short"));

    let config = request(
        &running.client,
        &IpcMessage::new(MsgType::Cmd, MsgVal::RequestConfiguration),
    );
    assert_eq!(config.get_param::<String>("rx_address").unwrap(), "127.0.0.1");
    assert_eq!(
        config
            .get_param::<u64>("decoder_config/layout/primary_packet_size")
            .unwrap(),
        16
    );

    shutdown(running);
}

#[test]
fn test_frame_ready_and_release_cycle() {
    let layout = small_layout();
    let endpoints = endpoints();

    let mut ready_sub = IpcChannel::new(ChannelType::Sub).unwrap();
    ready_sub.subscribe("").unwrap();
    let running = start_controller(&endpoints, &layout);
    ready_sub.connect(&endpoints.ready).unwrap();

    let buffer_config = wait_for(&ready_sub, MsgVal::BufferConfig, Duration::from_secs(2))
        .expect("deferred buffer_config notification");
    assert!(buffer_config.has_param("shared_buffer_name"));

    send_frame(running.rx_addr, &layout, 3);
    let ready = wait_for(&ready_sub, MsgVal::FrameReady, Duration::from_secs(2))
        .expect("frame_ready notification");
    assert_eq!(ready.get_param::<u32>("frame").unwrap(), 3);
    let buffer_id: u64 = ready.get_param("buffer_id").unwrap();

    let mut release_pub = IpcChannel::new(ChannelType::Pub).unwrap();
    release_pub.connect(&endpoints.release).unwrap();
    thread::sleep(Duration::from_millis(200));

    let mut release = IpcMessage::new(MsgType::Notify, MsgVal::FrameRelease);
    release.set_param("frame", 3u32);
    release.set_param("buffer_id", buffer_id);
    release_pub.send(&release.encode()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let reply = status(&running.client);
        if reply.get_param::<u64>("frames/released").unwrap() == 1 {
            assert_eq!(reply.get_param::<u64>("frames/received").unwrap(), 1);
            break;
        }
        assert!(Instant::now() < deadline, "release not counted");
        thread::sleep(Duration::from_millis(20));
    }

    shutdown(running);
}

#[test]
fn test_relayed_command_reply_keeps_client_id() {
    let layout = small_layout();
    let endpoints = endpoints();
    let running = start_controller(&endpoints, &layout);

    let mut execute = IpcMessage::new(MsgType::Cmd, MsgVal::Execute);
    execute.set_id(1234);
    execute.set_param("command", "calibrate");

    // The RX thread identifies itself asynchronously after startup.
    let deadline = Instant::now() + Duration::from_secs(2);
    let reply = loop {
        let reply = request(&running.client, &execute);
        let error: String = reply.get_param_or("error", String::new()).unwrap();
        if !error.contains("has not identified") {
            break reply;
        }
        assert!(Instant::now() < deadline, "RX thread never identified");
        thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(reply.msg_type(), MsgType::Nack);
    assert_eq!(reply.id(), 1234);
    assert_eq!(
        reply.get_param::<String>("error").unwrap(),
        "Submitted command not supported: calibrate"
    );

    shutdown(running);
}

#[test]
fn test_buffer_too_small_fails_configuration() {
    let layout = small_layout();
    let endpoints = endpoints();
    let mut controller = FrameReceiverController::new().unwrap();
    let mut msg = configure_message(&endpoints, &layout);
    msg.set_param("max_buffer_mem", HEADER_SIZE + layout.frame_buffer_size() / 2);

    let mut reply = IpcMessage::reply_to(&msg, MsgType::Ack);
    let result = controller.configure(&msg, &mut reply);
    assert!(matches!(result, Err(ReceiverError::Shm(_))));
    assert!(reply.get_param::<bool>("configured/decoder").unwrap());
    assert!(!reply.get_param::<bool>("configured/buffer_manager").unwrap());
}
