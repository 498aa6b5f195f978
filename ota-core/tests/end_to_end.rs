//! Sender and receiver cores wired back to back, as the daemon wires them over a link.

use ota_core::protocol::Frame;
use ota_core::{
    decode_frame, Action, Config, DeliveryStatus, Event, FileValidityStore, FsPayloadStore,
    MemoryPayloadStore, MemoryValidityStore, OtaCore, PayloadStore, RestartReason, Role,
    ValidityStore,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ADDER: &str = r#"(module
    (func (export "calcWasm") (param i32 i32) (result i32)
        local.get 0
        local.get 1
        i32.add))"#;

const MULTIPLIER: &str = r#"(module
    (func (export "calcWasm") (param i32 i32) (result i32)
        local.get 0
        local.get 1
        i32.mul))"#;

fn config(mtu: usize) -> Config {
    let mut c = Config::default();
    c.transfer.mtu = mtu;
    c
}

fn frames(actions: &[Action]) -> Vec<Vec<u8>> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Send(f) => Some(f.clone()),
            _ => None,
        })
        .collect()
}

/// Run one link session. `loss` decides per frame whether it is dropped (and reported failed).
/// Returns every frame the receiver accepted, in order, and the receiver's final actions.
fn transfer<P1, V1, P2, V2>(
    tx: &mut OtaCore<P1, V1>,
    rx: &mut OtaCore<P2, V2>,
    version: u8,
    mut loss: impl FnMut() -> bool,
) -> (Vec<Frame>, Vec<Action>)
where
    P1: PayloadStore,
    V1: ValidityStore,
    P2: PayloadStore,
    V2: ValidityStore,
{
    // A sender that already has `version` on offer announces it as soon as the peer connects.
    let mut outbox = frames(&tx.on_event(Event::Connected));
    rx.on_event(Event::Connected);
    outbox.extend(frames(&tx.publish(version)));
    let mut seen = Vec::new();
    for _ in 0..100_000 {
        let Some(frame) = outbox.pop() else {
            return (seen, Vec::new());
        };
        let status = if loss() {
            DeliveryStatus::Failed
        } else {
            seen.push(decode_frame(&frame).unwrap());
            let actions = rx.on_event(Event::FrameReceived(frame));
            if !actions.is_empty() {
                tx.on_event(Event::Delivery(DeliveryStatus::Delivered));
                return (seen, actions);
            }
            DeliveryStatus::Delivered
        };
        outbox.extend(frames(&tx.on_event(Event::Delivery(status))));
    }
    panic!("transfer did not finish");
}

#[test]
fn hundred_byte_binary_in_forty_byte_frames() {
    let binary: Vec<u8> = (0..100u8).collect();
    let (mut tx, _) = OtaCore::boot(
        Role::Sender,
        config(43),
        MemoryPayloadStore::with_bytes(binary.clone()),
        MemoryValidityStore::new(),
    );
    let (mut rx, _) = OtaCore::boot(
        Role::Receiver,
        config(43),
        MemoryPayloadStore::new(),
        MemoryValidityStore::new(),
    );

    let (seen, actions) = transfer(&mut tx, &mut rx, 9, || false);
    assert_eq!(
        seen[0],
        Frame::Announce {
            total_packets: 3,
            version: 9
        }
    );
    let data: Vec<(u16, usize)> = seen[1..]
        .iter()
        .map(|f| match f {
            Frame::Data { sequence, payload } => (*sequence, payload.len()),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(data, vec![(1, 40), (2, 40), (3, 20)]);
    assert_eq!(
        actions,
        vec![Action::Restart(RestartReason::Committed { version: 9 })]
    );

    let (payload, validity) = rx.into_stores();
    assert_eq!(payload.bytes(), Some(binary.as_slice()));
    let stored = validity.read_validity().unwrap();
    assert!(stored.is_executable());
    assert_eq!(stored.version, 9);
    assert_eq!(validity.valid_writes(), 1);
}

#[test]
fn lossy_link_still_delivers_exact_binary() {
    let binary = wat::parse_str(ADDER).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let (mut tx, _) = OtaCore::boot(
        Role::Sender,
        Config::default(),
        MemoryPayloadStore::with_bytes(binary.clone()),
        MemoryValidityStore::new(),
    );
    let (mut rx, _) = OtaCore::boot(
        Role::Receiver,
        Config::default(),
        MemoryPayloadStore::new(),
        MemoryValidityStore::new(),
    );

    let (_, actions) = transfer(&mut tx, &mut rx, 1, || rng.gen_bool(0.3));
    assert_eq!(
        actions,
        vec![Action::Restart(RestartReason::Committed { version: 1 })]
    );
    let (payload, validity) = rx.into_stores();
    assert_eq!(payload.bytes(), Some(binary.as_slice()));

    let (mut rx, boot_actions) =
        OtaCore::boot(Role::Receiver, Config::default(), payload, validity);
    assert!(boot_actions.is_empty());
    assert_eq!(
        rx.on_event(Event::InvokeTick),
        vec![Action::Invoked {
            args: (1, 2),
            result: 3
        }]
    );
}

#[test]
fn file_backed_update_replaces_running_binary() {
    let tx_dir = tempfile::tempdir().unwrap();
    let rx_dir = tempfile::tempdir().unwrap();

    let mut tx_slot = FsPayloadStore::in_dir(tx_dir.path());
    tx_slot.replace(&wat::parse_str(ADDER).unwrap()).unwrap();
    let (mut tx, _) = OtaCore::boot(
        Role::Sender,
        Config::default(),
        tx_slot,
        MemoryValidityStore::new(),
    );

    let open_rx = || {
        OtaCore::boot(
            Role::Receiver,
            Config::default(),
            FsPayloadStore::in_dir(rx_dir.path()),
            FileValidityStore::in_dir(rx_dir.path()).unwrap(),
        )
    };

    let (mut rx, _) = open_rx();
    let (_, actions) = transfer(&mut tx, &mut rx, 1, || false);
    assert_eq!(
        actions,
        vec![Action::Restart(RestartReason::Committed { version: 1 })]
    );
    drop(rx);

    let (mut rx, _) = open_rx();
    rx.set_invoke_args((6, 7));
    assert_eq!(
        rx.on_event(Event::InvokeTick),
        vec![Action::Invoked {
            args: (6, 7),
            result: 13
        }]
    );

    // Same version again is a no-op for the receiver.
    let (seen, actions) = transfer(&mut tx, &mut rx, 1, || false);
    assert!(actions.is_empty());
    assert!(seen.len() > 1);
    assert!(rx.execution().is_some());

    // A new version replaces it.
    tx.on_event(Event::Disconnected);
    rx.on_event(Event::Disconnected);
    let (mut tx_slot, tx_validity) = tx.into_stores();
    tx_slot.replace(&wat::parse_str(MULTIPLIER).unwrap()).unwrap();
    let (mut tx, _) = OtaCore::boot(Role::Sender, Config::default(), tx_slot, tx_validity);
    let (_, actions) = transfer(&mut tx, &mut rx, 2, || false);
    assert_eq!(
        actions,
        vec![Action::Restart(RestartReason::Committed { version: 2 })]
    );
    drop(rx);

    let (mut rx, _) = open_rx();
    rx.set_invoke_args((6, 7));
    assert_eq!(
        rx.on_event(Event::InvokeTick),
        vec![Action::Invoked {
            args: (6, 7),
            result: 42
        }]
    );
    assert_eq!(rx.execution().map(|e| e.version()), Some(2));
}

#[test]
fn corrupted_commit_falls_back_to_waiting() {
    let rx_dir = tempfile::tempdir().unwrap();
    {
        let mut slot = FsPayloadStore::in_dir(rx_dir.path());
        slot.replace(b"\0asm\x01\0\0\0garbage").unwrap();
        let mut validity = FileValidityStore::in_dir(rx_dir.path()).unwrap();
        validity.write_valid(4).unwrap();
    }

    let (rx, actions) = OtaCore::boot(
        Role::Receiver,
        Config::default(),
        FsPayloadStore::in_dir(rx_dir.path()),
        FileValidityStore::in_dir(rx_dir.path()).unwrap(),
    );
    assert!(matches!(
        actions.as_slice(),
        [Action::Restart(RestartReason::BootFailed(_))]
    ));
    drop(rx);

    let validity = FileValidityStore::in_dir(rx_dir.path()).unwrap();
    let stored = validity.read_validity().unwrap();
    assert!(stored.invalid);
    assert_eq!(stored.version, 4);

    let (rx, actions) = OtaCore::boot(
        Role::Receiver,
        Config::default(),
        FsPayloadStore::in_dir(rx_dir.path()),
        validity,
    );
    assert!(actions.is_empty());
    assert!(rx.execution().is_none());
}
