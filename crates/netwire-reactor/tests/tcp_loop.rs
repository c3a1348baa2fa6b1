//! End-to-end TCP test: a listener and its accepted sessions dispatched
//! through one `DeviceGroup`, talking to a plain blocking client socket.

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use netwire_reactor::{DeviceGroup, Mode, Pollable, Socket, TriggerMode};

#[test]
fn test_echo_through_reactor() {
    let mut group: DeviceGroup<Socket> = DeviceGroup::new();
    assert!(group.set_trigger_mode(TriggerMode::LevelTriggered));

    let mut listener = Socket::new();
    listener.set_reuse_addr(true);
    listener
        .bind("127.0.0.1".parse().expect("parse failed"), 0)
        .expect("bind failed");
    listener.listen(8).expect("listen failed");
    listener.set_nonblocking(true).expect("nonblocking failed");
    listener.device_mut().set_mode(Mode::READ);
    // Bounds every wait so a regression fails instead of hanging.
    listener.device_mut().set_timeout(1_000);
    let port = listener.port();

    let listener_id = group.append(listener).ok().expect("append failed");

    // Blocking client outside the group.
    let mut client = Socket::new();
    client.connect("127.0.0.1", port).expect("connect failed");
    assert_eq!(client.write(b"echo me").expect("client write failed"), 7);

    let mut session_id = None;
    let mut echoed = false;
    let deadline = Instant::now() + Duration::from_secs(5);

    while !echoed && Instant::now() < deadline {
        let Some(event) = group.wait() else {
            continue;
        };

        if event.id == listener_id {
            assert!(event.readable);
            let accepted = {
                let mut listener = group.get_mut(listener_id).expect("listener vanished");
                listener.accept().expect("accept errored")
            };
            if let Some(mut session) = accepted {
                assert_ne!(session.port(), 0);
                session.set_nonblocking(true).expect("nonblocking failed");
                session.device_mut().set_mode(Mode::READ);
                session_id = Some(group.append(session).ok().expect("append failed"));
            }
        } else if Some(event.id) == session_id && event.readable {
            let mut session = group.get_mut(event.id).expect("session vanished");
            let mut buf = [0u8; 64];
            match session.read(&mut buf) {
                Ok(0) => panic!("peer closed unexpectedly"),
                Ok(n) => {
                    assert_eq!(&buf[..n], b"echo me");
                    assert_eq!(session.rx(), n as u64);
                    session.write(&buf[..n]).expect("session write failed");
                    echoed = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => panic!("session read failed: {e}"),
            }
        }
    }
    assert!(echoed, "echo did not complete in time");

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).expect("client read failed");
    assert_eq!(&buf[..n], b"echo me");

    // Session teardown: remove both devices and verify the count drains.
    if let Some(id) = session_id {
        let mut session = group.remove(id).expect("session vanished");
        session.close();
    }
    assert!(group.remove(listener_id).is_some());
    assert_eq!(group.count(), 0);
}

#[test]
fn test_client_observes_connect_completion_as_writability() {
    let mut group: DeviceGroup<Socket> = DeviceGroup::new();

    let mut listener = Socket::new();
    listener.set_reuse_addr(true);
    listener
        .bind("127.0.0.1".parse().expect("parse failed"), 0)
        .expect("bind failed");
    listener.listen(8).expect("listen failed");
    let port = listener.port();

    // Non-blocking connect: success means "in progress".
    let mut client = Socket::new();
    client.set_nonblocking(true).expect("nonblocking failed");
    client.connect("127.0.0.1", port).expect("connect failed");
    client.device_mut().set_mode(Mode::WRITE);
    client.device_mut().set_timeout(1_000);

    let client_id = group.append(client).ok().expect("append failed");

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut connected = false;
    while !connected && Instant::now() < deadline {
        if let Some(event) = group.wait() {
            if event.id == client_id && event.writable {
                connected = true;
            }
        }
    }
    assert!(connected, "connect completion never reported");
}
