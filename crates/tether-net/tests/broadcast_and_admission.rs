//! E2 (broadcast with ignore), E5 (dead-client sweep), E6 (monotonic id
//! assignment) from the design notes.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use tether_net::{Client, ClientConfig, ConnectionHandle, Message, MessageKind, Server};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemoKind {
    MessageAll,
    ServerMessage,
}

impl MessageKind for DemoKind {
    fn to_u32(self) -> u32 {
        match self {
            DemoKind::MessageAll => 1,
            DemoKind::ServerMessage => 2,
        }
    }

    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(DemoKind::MessageAll),
            2 => Some(DemoKind::ServerMessage),
            _ => None,
        }
    }
}

fn wait_for<F: FnMut() -> bool>(mut pred: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn connect_client(port: u16) -> Client<DemoKind> {
    let mut client = Client::<DemoKind>::new(ClientConfig::default());
    client.connect("127.0.0.1", port).expect("client connects");
    assert!(wait_for(|| client.is_connected(), Duration::from_secs(1)));
    client
}

#[test]
fn broadcast_excludes_the_sender_and_reaches_everyone_else() {
    let senders: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let senders_hook = senders.clone();

    let mut server = Server::<DemoKind>::builder()
        .on_message(move |source, _msg| senders_hook.lock().unwrap().push(source.id()))
        .start(0)
        .expect("server binds");
    let addr = server.local_addr();

    let a = connect_client(addr.port());
    let b = connect_client(addr.port());
    let c = connect_client(addr.port());
    assert!(wait_for(|| server.connections().len() == 3, Duration::from_secs(2)));

    a.send(Message::new(DemoKind::MessageAll));
    assert!(wait_for(
        || {
            server.update(16, false);
            !senders.lock().unwrap().is_empty()
        },
        Duration::from_secs(2),
    ));

    let sender_id = senders.lock().unwrap()[0];
    let conns = server.connections();
    let sender_handle: Arc<ConnectionHandle<DemoKind>> =
        Arc::clone(conns.iter().find(|h| h.id() == sender_id).expect("sender handle present"));

    let mut announce = Message::new(DemoKind::ServerMessage);
    announce.push(sender_id);
    server.message_all_clients(&announce, Some(&sender_handle));

    assert!(wait_for(|| !b.incoming().empty(), Duration::from_secs(2)));
    assert!(wait_for(|| !c.incoming().empty(), Duration::from_secs(2)));
    // give the sender every chance to (wrongly) receive its own broadcast
    thread::sleep(Duration::from_millis(200));
    assert!(a.incoming().empty());

    server.stop();
}

#[test]
fn ids_are_assigned_in_admission_order_starting_at_10000() {
    let mut server = Server::<DemoKind>::builder().start(0).expect("server binds");
    let addr = server.local_addr();

    let first = connect_client(addr.port());
    assert!(wait_for(|| server.connections().len() == 1, Duration::from_secs(1)));
    let second = connect_client(addr.port());
    assert!(wait_for(|| server.connections().len() == 2, Duration::from_secs(1)));

    let mut ids: Vec<u32> = server.connections().iter().map(|h| h.id()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![10000, 10001]);

    drop(first);
    drop(second);
    server.stop();
}

#[test]
fn dead_client_sweep_fires_disconnect_hook_and_shrinks_registry() {
    let disconnects: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let disconnects_hook = disconnects.clone();

    let mut server = Server::<DemoKind>::builder()
        .on_client_disconnect(move |_| *disconnects_hook.lock().unwrap() += 1)
        .start(0)
        .expect("server binds");
    let addr = server.local_addr();

    let mut clients: Vec<_> = (0..5).map(|_| connect_client(addr.port())).collect();
    assert!(wait_for(|| server.registry_len() == 5, Duration::from_secs(2)));

    // Drop two clients outright: their reactor threads shut the sockets
    // down, the server's read pumps see EOF and mark those handles dead,
    // but nothing prunes the registry until the next sweep call.
    let killed: Vec<_> = clients.drain(0..2).collect();
    drop(killed);
    assert!(wait_for(|| server.connections().len() == 3, Duration::from_secs(2)));
    assert_eq!(server.registry_len(), 5, "registry isn't pruned until a sweep runs");

    server.message_all_clients(&Message::new(DemoKind::ServerMessage), None);

    assert_eq!(*disconnects.lock().unwrap(), 2);
    assert_eq!(server.registry_len(), 3);

    server.stop();
}
